//! Differ - Compare desired state with current state to generate a Plan
//!
//! Compares the "desired state" declared in configuration with the "current
//! state" fetched from the Provider, and generates a list of required
//! Effects (Plan).

use std::collections::{HashMap, HashSet};

use crate::effect::Effect;
use crate::plan::Plan;
use crate::reference::Bindings;
use crate::resource::{Resource, ResourceId, State, Value};
use crate::schema::ResourceSchema;

/// Result of a diff operation
#[derive(Debug, Clone, PartialEq)]
pub enum Diff {
    /// Resource does not exist -> needs creation
    Create(Resource),
    /// Resource exists with differences -> needs update
    Update {
        id: ResourceId,
        from: State,
        to: Resource,
        changed_attributes: Vec<String>,
    },
    /// Resource exists but an attribute that can't change in place differs
    Replace {
        from: State,
        to: Resource,
        forced_by: Vec<String>,
    },
    /// Resource exists with no differences -> no action needed
    NoChange(ResourceId),
}

impl Diff {
    /// Returns whether this Diff involves a change
    pub fn is_change(&self) -> bool {
        !matches!(self, Diff::NoChange(_))
    }
}

/// Compare desired state with current state to compute a Diff
pub fn diff(desired: &Resource, current: &State, schema: Option<&ResourceSchema>) -> Diff {
    if !current.exists {
        return Diff::Create(desired.clone());
    }

    let changed = find_changed_attributes(&desired.attributes, &current.attributes);
    if changed.is_empty() {
        return Diff::NoChange(desired.id.clone());
    }

    let forced_by: Vec<String> = match schema {
        Some(schema) => {
            let force_new = schema.force_new_attributes();
            changed
                .iter()
                .filter(|name| force_new.contains(&name.as_str()))
                .cloned()
                .collect()
        }
        None => Vec::new(),
    };

    if !forced_by.is_empty() {
        return Diff::Replace {
            from: current.clone(),
            to: desired.clone(),
            forced_by,
        };
    }

    Diff::Update {
        id: desired.id.clone(),
        from: current.clone(),
        to: desired.clone(),
        changed_attributes: changed,
    }
}

/// Find changed attributes between desired and current state.
/// Only attributes the configuration declares are compared; computed
/// attributes reported by the cloud are ignored.
fn find_changed_attributes(
    desired: &HashMap<String, Value>,
    current: &HashMap<String, Value>,
) -> Vec<String> {
    let mut changed = Vec::new();

    for (key, desired_value) in desired {
        // Skip internal attributes (starting with _)
        if key.starts_with('_') {
            continue;
        }

        match current.get(key) {
            Some(current_value) if values_equal(desired_value, current_value) => {}
            _ => changed.push(key.clone()),
        }
    }

    changed.sort();
    changed
}

/// Structural equality where whole floats match ints (`2` == `2.0`).
/// An unresolved reference never equals anything: its value is unknown
/// until apply.
fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::ResourceRef(..), _) | (_, Value::ResourceRef(..)) => false,
        (Value::Int(i), Value::Float(f)) | (Value::Float(f), Value::Int(i)) => *f == *i as f64,
        (Value::List(x), Value::List(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(a, b)| values_equal(a, b))
        }
        (Value::Map(x), Value::Map(y)) => {
            x.len() == y.len()
                && x
                    .iter()
                    .all(|(k, v)| y.get(k).is_some_and(|other| values_equal(v, other)))
        }
        _ => a == b,
    }
}

/// Compute Diff for multiple resources and generate a Plan.
///
/// `desired` must already be in dependency order. References are resolved
/// against the current states first, so a subnet pointing at an existing
/// VPC compares by the VPC's real id. Resources present in `current_states`
/// but no longer declared are deleted, last and in reverse order.
pub fn create_plan(
    desired: &[Resource],
    current_states: &HashMap<ResourceId, State>,
    schemas: &HashMap<String, ResourceSchema>,
) -> Plan {
    let mut plan = Plan::new();
    let mut bindings = Bindings::new();
    for state in current_states.values() {
        bindings.insert_state(state);
    }

    for resource in desired {
        if resource.is_data_source() {
            plan.add(Effect::Read(bindings.resolve_resource(resource)));
            continue;
        }

        let resolved = bindings.resolve_resource(resource);
        let current = current_states
            .get(&resource.id)
            .cloned()
            .unwrap_or_else(|| State::not_found(resource.id.clone()));

        match diff(&resolved, &current, schemas.get(&resource.id.resource_type)) {
            Diff::Create(r) => plan.add(Effect::Create(r)),
            Diff::Update {
                id,
                from,
                to,
                changed_attributes,
            } => plan.add(Effect::Update {
                id,
                from,
                to,
                changed_attributes,
            }),
            Diff::Replace {
                from,
                to,
                forced_by,
            } => plan.add(Effect::Replace {
                from,
                to,
                forced_by,
            }),
            Diff::NoChange(_) => {}
        }
    }

    let declared: HashSet<&ResourceId> = desired.iter().map(|r| &r.id).collect();
    let mut orphans: Vec<&State> = current_states
        .values()
        .filter(|s| s.exists && !declared.contains(&s.id))
        .collect();
    orphans.sort_by(|a, b| b.id.cmp(&a.id));
    for state in orphans {
        if let Some(ref identifier) = state.identifier {
            plan.add(Effect::Delete {
                id: state.id.clone(),
                identifier: identifier.clone(),
            });
        }
    }

    plan
}

/// Plan deleting every existing resource. `states` must be in dependency
/// order (dependencies first); deletion runs in reverse.
pub fn destroy_plan(states: &[State]) -> Plan {
    let mut plan = Plan::new();
    for state in states.iter().rev() {
        if let (true, Some(identifier)) = (state.exists, state.identifier.as_ref()) {
            plan.add(Effect::Delete {
                id: state.id.clone(),
                identifier: identifier.clone(),
            });
        }
    }
    plan
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{AttributeSchema, AttributeType};

    fn subnet_schema() -> ResourceSchema {
        ResourceSchema::new("vpc_subnet")
            .attribute(AttributeSchema::new("name", AttributeType::String).required())
            .attribute(
                AttributeSchema::new("cidr", AttributeType::String)
                    .required()
                    .force_new(),
            )
    }

    fn existing(resource_type: &str, name: &str, attrs: &[(&str, Value)]) -> State {
        let attrs = attrs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect();
        State::existing(ResourceId::new(resource_type, name), attrs)
            .with_identifier(format!("{}-id", name))
    }

    #[test]
    fn diff_create_when_not_exists() {
        let desired = Resource::new("vpc", "main");
        let current = State::not_found(ResourceId::new("vpc", "main"));

        let result = diff(&desired, &current, None);
        assert!(matches!(result, Diff::Create(_)));
    }

    #[test]
    fn diff_no_change_ignores_computed_attributes() {
        let desired =
            Resource::new("vpc", "main").with_attribute("cidr", Value::String("10.0.0.0/16".into()));
        let current = existing(
            "vpc",
            "main",
            &[
                ("cidr", Value::String("10.0.0.0/16".into())),
                ("status", Value::String("OK".into())),
            ],
        );

        let result = diff(&desired, &current, None);
        assert!(!result.is_change());
    }

    #[test]
    fn diff_update_when_different() {
        let desired =
            Resource::new("vpc_subnet", "web").with_attribute("name", Value::String("web-2".into()));
        let current = existing("vpc_subnet", "web", &[("name", Value::String("web".into()))]);

        match diff(&desired, &current, Some(&subnet_schema())) {
            Diff::Update {
                changed_attributes, ..
            } => assert_eq!(changed_attributes, vec!["name".to_string()]),
            other => panic!("Expected Update, got {:?}", other),
        }
    }

    #[test]
    fn diff_replace_when_force_new_changes() {
        let desired = Resource::new("vpc_subnet", "web")
            .with_attribute("name", Value::String("web-2".into()))
            .with_attribute("cidr", Value::String("10.0.2.0/24".into()));
        let current = existing(
            "vpc_subnet",
            "web",
            &[
                ("name", Value::String("web".into())),
                ("cidr", Value::String("10.0.1.0/24".into())),
            ],
        );

        match diff(&desired, &current, Some(&subnet_schema())) {
            Diff::Replace { forced_by, .. } => assert_eq!(forced_by, vec!["cidr".to_string()]),
            other => panic!("Expected Replace, got {:?}", other),
        }
    }

    #[test]
    fn whole_float_equals_int() {
        let desired = Resource::new("kafka_instance", "mq").with_attribute("partition_num", Value::Int(300));
        let current = existing("kafka_instance", "mq", &[("partition_num", Value::Float(300.0))]);
        assert!(!diff(&desired, &current, None).is_change());
    }

    #[test]
    fn create_plan_resolves_references_against_current_state() {
        let resources = vec![
            Resource::new("vpc", "main").with_attribute("cidr", Value::String("10.0.0.0/16".into())),
            Resource::new("vpc_subnet", "web")
                .with_attribute("name", Value::String("web".into()))
                .with_attribute(
                    "vpc_id",
                    Value::ResourceRef("vpc.main".to_string(), "id".to_string()),
                ),
        ];

        let mut current_states = HashMap::new();
        current_states.insert(
            ResourceId::new("vpc", "main"),
            existing("vpc", "main", &[("cidr", Value::String("10.0.0.0/16".into()))]),
        );
        current_states.insert(
            ResourceId::new("vpc_subnet", "web"),
            existing(
                "vpc_subnet",
                "web",
                &[
                    ("name", Value::String("web".into())),
                    ("vpc_id", Value::String("main-id".into())),
                ],
            ),
        );

        let plan = create_plan(&resources, &current_states, &HashMap::new());
        assert!(plan.is_empty());
    }

    #[test]
    fn create_plan_reads_data_sources_and_deletes_orphans() {
        let resources = vec![
            Resource::new("availability_zones", "all").with_read_only(true),
            Resource::new("vpc", "new"),
        ];

        let mut current_states = HashMap::new();
        current_states.insert(ResourceId::new("vpc", "old"), existing("vpc", "old", &[]));

        let plan = create_plan(&resources, &current_states, &HashMap::new());

        assert_eq!(plan.effects().len(), 3);
        assert!(matches!(plan.effects()[0], Effect::Read(_)));
        assert!(matches!(plan.effects()[1], Effect::Create(_)));
        assert_eq!(
            plan.effects()[2],
            Effect::Delete {
                id: ResourceId::new("vpc", "old"),
                identifier: "old-id".to_string(),
            }
        );
    }

    #[test]
    fn destroy_plan_runs_in_reverse() {
        let states = vec![
            existing("vpc", "main", &[]),
            existing("vpc_subnet", "web", &[]),
            State::not_found(ResourceId::new("security_group", "gone")),
        ];

        let plan = destroy_plan(&states);
        let ids: Vec<String> = plan.effects().iter().map(|e| e.resource_id().to_string()).collect();
        assert_eq!(ids, vec!["vpc_subnet.web", "vpc.main"]);
    }
}
