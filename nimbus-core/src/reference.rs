//! Reference - Resolve `${type.name.attr}` references between resources

use std::collections::HashMap;

use crate::resource::{Resource, State, Value};

/// Known attributes of resources by binding (`type.name`)
#[derive(Debug, Clone, Default)]
pub struct Bindings {
    values: HashMap<String, HashMap<String, Value>>,
}

impl Bindings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record what is known about a resource from its observed state
    pub fn insert_state(&mut self, state: &State) {
        if !state.exists {
            return;
        }
        let mut attrs = state.attributes.clone();
        if let Some(ref identifier) = state.identifier {
            attrs
                .entry("id".to_string())
                .or_insert_with(|| Value::String(identifier.clone()));
        }
        self.values.insert(state.id.binding(), attrs);
    }

    pub fn get(&self, binding: &str, attribute: &str) -> Option<&Value> {
        self.values.get(binding).and_then(|attrs| attrs.get(attribute))
    }

    pub fn contains(&self, binding: &str) -> bool {
        self.values.contains_key(binding)
    }

    /// Resolve references in a value. Unknown references are left in place.
    pub fn resolve_value(&self, value: &Value) -> Value {
        match value {
            Value::ResourceRef(binding, attr) => match self.get(binding, attr) {
                Some(resolved) => resolved.clone(),
                None => value.clone(),
            },
            Value::List(items) => Value::List(items.iter().map(|v| self.resolve_value(v)).collect()),
            Value::Map(map) => Value::Map(
                map.iter()
                    .map(|(k, v)| (k.clone(), self.resolve_value(v)))
                    .collect(),
            ),
            other => other.clone(),
        }
    }

    /// Resolve references in every attribute of a resource
    pub fn resolve_resource(&self, resource: &Resource) -> Resource {
        let mut resolved = resource.clone();
        for value in resolved.attributes.values_mut() {
            *value = self.resolve_value(value);
        }
        resolved
    }
}

/// First reference in the resource that can't be resolved, as `binding.attr`
pub fn unresolved_reference(resource: &Resource) -> Option<String> {
    fn find(value: &Value) -> Option<String> {
        match value {
            Value::ResourceRef(binding, attr) => Some(format!("{}.{}", binding, attr)),
            Value::List(items) => items.iter().find_map(find),
            Value::Map(map) => map.values().find_map(find),
            _ => None,
        }
    }
    let mut keys: Vec<&String> = resource.attributes.keys().collect();
    keys.sort();
    keys.into_iter().find_map(|k| find(&resource.attributes[k]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::ResourceId;

    #[test]
    fn resolves_id_from_identifier() {
        let mut bindings = Bindings::new();
        bindings.insert_state(
            &State::existing(ResourceId::new("vpc", "main"), HashMap::new()).with_identifier("vpc-1"),
        );

        let subnet = Resource::new("vpc_subnet", "web").with_attribute(
            "vpc_id",
            Value::ResourceRef("vpc.main".to_string(), "id".to_string()),
        );
        let resolved = bindings.resolve_resource(&subnet);
        assert_eq!(
            resolved.attributes.get("vpc_id"),
            Some(&Value::String("vpc-1".to_string()))
        );
        assert_eq!(unresolved_reference(&resolved), None);
    }

    #[test]
    fn unknown_reference_is_kept() {
        let bindings = Bindings::new();
        let value = Value::List(vec![Value::ResourceRef(
            "security_group.web".to_string(),
            "id".to_string(),
        )]);
        assert_eq!(bindings.resolve_value(&value), value);

        let resource = Resource::new("compute_instance", "web").with_attribute("security_groups", value);
        assert_eq!(
            unresolved_reference(&resource),
            Some("security_group.web.id".to_string())
        );
    }

    #[test]
    fn missing_state_is_not_bound() {
        let mut bindings = Bindings::new();
        bindings.insert_state(&State::not_found(ResourceId::new("vpc", "gone")));
        assert!(!bindings.contains("vpc.gone"));
    }
}
