//! Interpreter - Execute Effects using a Provider
//!
//! The Interpreter executes Effects contained in a Plan in order,
//! collecting the results. This is where side effects actually occur.
//! Attributes produced by earlier Effects (ids assigned by the cloud) are
//! substituted into references of later ones.

use log::{debug, info};

use crate::effect::Effect;
use crate::plan::Plan;
use crate::provider::{Provider, ProviderError, ProviderResult};
use crate::reference::{Bindings, unresolved_reference};
use crate::resource::{Resource, ResourceId, State};

/// Result of executing each Effect
#[derive(Debug)]
pub enum EffectOutcome {
    /// Read succeeded
    Read { state: State },
    /// Create succeeded
    Created { state: State },
    /// Update succeeded
    Updated { state: State },
    /// Delete and re-create succeeded
    Replaced { state: State },
    /// Delete succeeded
    Deleted { id: ResourceId },
    /// Skipped (e.g., dry-run)
    Skipped { reason: String },
}

impl EffectOutcome {
    /// The resulting state, if the Effect produced one
    pub fn state(&self) -> Option<&State> {
        match self {
            EffectOutcome::Read { state }
            | EffectOutcome::Created { state }
            | EffectOutcome::Updated { state }
            | EffectOutcome::Replaced { state } => Some(state),
            EffectOutcome::Deleted { .. } | EffectOutcome::Skipped { .. } => None,
        }
    }
}

/// Result of executing the entire Plan
#[derive(Debug)]
pub struct ApplyResult {
    pub outcomes: Vec<Result<EffectOutcome, ProviderError>>,
    pub success_count: usize,
    pub failure_count: usize,
}

impl ApplyResult {
    pub fn is_success(&self) -> bool {
        self.failure_count == 0
    }
}

/// Interpreter configuration
#[derive(Debug, Clone, Default)]
pub struct InterpreterConfig {
    /// If true, skip actual side effects
    pub dry_run: bool,
    /// Continue on error
    pub continue_on_error: bool,
}

/// Interpreter that executes Effects using a Provider
pub struct Interpreter<P: Provider> {
    provider: P,
    config: InterpreterConfig,
}

impl<P: Provider> Interpreter<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            config: InterpreterConfig::default(),
        }
    }

    pub fn with_config(mut self, config: InterpreterConfig) -> Self {
        self.config = config;
        self
    }

    /// Execute a Plan, interpreting all Effects and causing side effects.
    ///
    /// `known` are states of resources the plan doesn't touch, used to
    /// resolve references to them.
    pub async fn apply(&self, plan: &Plan, known: &[State]) -> ApplyResult {
        let mut bindings = Bindings::new();
        for state in known {
            bindings.insert_state(state);
        }

        let mut outcomes = Vec::new();
        let mut success_count = 0;
        let mut failure_count = 0;

        for effect in plan.effects() {
            debug!("executing {}", effect);
            let result = self.execute_effect(effect, &bindings).await;

            match &result {
                Ok(outcome) => {
                    success_count += 1;
                    if let Some(state) = outcome.state() {
                        bindings.insert_state(state);
                    }
                }
                Err(_) => failure_count += 1,
            }

            let stop = result.is_err() && !self.config.continue_on_error;
            outcomes.push(result);
            if stop {
                break;
            }
        }

        ApplyResult {
            outcomes,
            success_count,
            failure_count,
        }
    }

    /// Execute a single Effect
    async fn execute_effect(
        &self,
        effect: &Effect,
        bindings: &Bindings,
    ) -> ProviderResult<EffectOutcome> {
        if self.config.dry_run {
            return Ok(EffectOutcome::Skipped {
                reason: "dry-run mode".to_string(),
            });
        }

        match effect {
            Effect::Read(resource) => {
                let resource = resolve(resource, bindings)?;
                let state = self.provider.read_data_source(&resource).await?;
                Ok(EffectOutcome::Read { state })
            }
            Effect::Create(resource) => {
                let resource = resolve(resource, bindings)?;
                let state = self.provider.create(&resource).await?;
                info!("created {}", resource.id);
                Ok(EffectOutcome::Created { state })
            }
            Effect::Update { id, from, to, .. } => {
                let to = resolve(to, bindings)?;
                let identifier = from.identifier.as_deref().ok_or_else(|| {
                    ProviderError::config("no identifier recorded in state").for_resource(id.clone())
                })?;
                let state = self.provider.update(id, identifier, from, &to).await?;
                info!("updated {}", id);
                Ok(EffectOutcome::Updated { state })
            }
            Effect::Replace { from, to, .. } => {
                let to = resolve(to, bindings)?;
                if let Some(ref identifier) = from.identifier {
                    self.provider.delete(&from.id, identifier).await?;
                }
                let state = self.provider.create(&to).await?;
                info!("replaced {}", to.id);
                Ok(EffectOutcome::Replaced { state })
            }
            Effect::Delete { id, identifier } => {
                self.provider.delete(id, identifier).await?;
                info!("deleted {}", id);
                Ok(EffectOutcome::Deleted { id: id.clone() })
            }
        }
    }
}

fn resolve(resource: &Resource, bindings: &Bindings) -> ProviderResult<Resource> {
    let resolved = bindings.resolve_resource(resource);
    match unresolved_reference(&resolved) {
        Some(reference) => Err(ProviderError::config(format!(
            "unresolved reference ${{{}}}",
            reference
        ))
        .for_resource(resource.id.clone())),
        None => Ok(resolved),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::BoxFuture;
    use crate::resource::Value;
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestProvider {
        calls: Mutex<Vec<String>>,
        fail_create: Option<&'static str>,
    }

    impl TestProvider {
        fn record(&self, call: String) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Provider for TestProvider {
        fn name(&self) -> &'static str {
            "test"
        }

        fn resource_types(&self) -> Vec<Box<dyn crate::provider::ResourceType>> {
            vec![]
        }

        fn read(
            &self,
            id: &ResourceId,
            _identifier: Option<&str>,
        ) -> BoxFuture<'_, ProviderResult<State>> {
            let id = id.clone();
            Box::pin(async move { Ok(State::not_found(id)) })
        }

        fn read_data_source(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
            self.record(format!("read {}", resource.id));
            let state = State::existing(resource.id.clone(), resource.attributes.clone())
                .with_identifier("az-1");
            Box::pin(async move { Ok(state) })
        }

        fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
            self.record(format!("create {}", resource.id));
            if self.fail_create == Some(resource.id.name.as_str()) {
                let id = resource.id.clone();
                return Box::pin(async move {
                    Err(ProviderError::new("quota exceeded").for_resource(id))
                });
            }
            let state = State::existing(resource.id.clone(), resource.attributes.clone())
                .with_identifier(format!("{}-id", resource.id.name));
            Box::pin(async move { Ok(state) })
        }

        fn update(
            &self,
            id: &ResourceId,
            identifier: &str,
            _from: &State,
            to: &Resource,
        ) -> BoxFuture<'_, ProviderResult<State>> {
            self.record(format!("update {} {}", id, identifier));
            let state = State::existing(id.clone(), to.attributes.clone()).with_identifier(identifier);
            Box::pin(async move { Ok(state) })
        }

        fn delete(&self, id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
            self.record(format!("delete {} {}", id, identifier));
            Box::pin(async { Ok(()) })
        }
    }

    fn vpc_ref() -> Value {
        Value::ResourceRef("vpc.main".to_string(), "id".to_string())
    }

    #[tokio::test]
    async fn apply_empty_plan() {
        let interpreter = Interpreter::new(TestProvider::default());
        let plan = Plan::new();
        let result = interpreter.apply(&plan, &[]).await;

        assert!(result.is_success());
        assert_eq!(result.success_count, 0);
    }

    #[tokio::test]
    async fn created_ids_flow_into_later_effects() {
        let interpreter = Interpreter::new(TestProvider::default());
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("vpc", "main")));
        plan.add(Effect::Create(
            Resource::new("vpc_subnet", "web").with_attribute("vpc_id", vpc_ref()),
        ));

        let result = interpreter.apply(&plan, &[]).await;

        assert!(result.is_success());
        let subnet = result.outcomes[1].as_ref().unwrap().state().unwrap();
        assert_eq!(
            subnet.attributes.get("vpc_id"),
            Some(&Value::String("main-id".to_string()))
        );
    }

    #[tokio::test]
    async fn stops_at_first_failure() {
        let provider = TestProvider {
            fail_create: Some("main"),
            ..Default::default()
        };
        let interpreter = Interpreter::new(provider);
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("vpc", "main")));
        plan.add(Effect::Create(Resource::new("vpc", "other")));

        let result = interpreter.apply(&plan, &[]).await;

        assert_eq!(result.outcomes.len(), 1);
        assert_eq!(result.failure_count, 1);
        assert_eq!(interpreter.provider.calls(), vec!["create vpc.main"]);
    }

    #[tokio::test]
    async fn continue_on_error_reports_unresolved_dependents() {
        let provider = TestProvider {
            fail_create: Some("main"),
            ..Default::default()
        };
        let interpreter = Interpreter::new(provider).with_config(InterpreterConfig {
            continue_on_error: true,
            ..Default::default()
        });
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("vpc", "main")));
        plan.add(Effect::Create(
            Resource::new("vpc_subnet", "web").with_attribute("vpc_id", vpc_ref()),
        ));

        let result = interpreter.apply(&plan, &[]).await;

        assert_eq!(result.failure_count, 2);
        let err = result.outcomes[1].as_ref().unwrap_err();
        assert_eq!(err.to_string(), "[vpc_subnet.web] unresolved reference ${vpc.main.id}");
    }

    #[tokio::test]
    async fn replace_deletes_then_creates() {
        let interpreter = Interpreter::new(TestProvider::default());
        let from = State::existing(ResourceId::new("vpc_subnet", "web"), Default::default())
            .with_identifier("subnet-old");
        let mut plan = Plan::new();
        plan.add(Effect::Replace {
            from,
            to: Resource::new("vpc_subnet", "web").with_attribute("vpc_id", vpc_ref()),
            forced_by: vec!["cidr".to_string()],
        });

        let known = vec![
            State::existing(ResourceId::new("vpc", "main"), Default::default())
                .with_identifier("vpc-9"),
        ];
        let result = interpreter.apply(&plan, &known).await;

        assert!(result.is_success());
        assert_eq!(
            interpreter.provider.calls(),
            vec!["delete vpc_subnet.web subnet-old", "create vpc_subnet.web"]
        );
    }

    #[tokio::test]
    async fn update_and_delete_use_identifiers() {
        let interpreter = Interpreter::new(TestProvider::default());
        let from = State::existing(ResourceId::new("vpc", "main"), Default::default())
            .with_identifier("vpc-1");
        let mut plan = Plan::new();
        plan.add(Effect::Read(
            Resource::new("availability_zones", "all").with_read_only(true),
        ));
        plan.add(Effect::Update {
            id: ResourceId::new("vpc", "main"),
            from,
            to: Resource::new("vpc", "main"),
            changed_attributes: vec!["name".to_string()],
        });
        plan.add(Effect::Delete {
            id: ResourceId::new("vpc", "old"),
            identifier: "vpc-2".to_string(),
        });

        let result = interpreter.apply(&plan, &[]).await;

        assert_eq!(result.success_count, 3);
        assert_eq!(
            interpreter.provider.calls(),
            vec![
                "read availability_zones.all",
                "update vpc.main vpc-1",
                "delete vpc.old vpc-2"
            ]
        );
    }

    #[tokio::test]
    async fn dry_run_skips_everything() {
        let interpreter = Interpreter::new(TestProvider::default()).with_config(InterpreterConfig {
            dry_run: true,
            ..Default::default()
        });
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("vpc", "main")));

        let result = interpreter.apply(&plan, &[]).await;

        assert!(matches!(
            result.outcomes[0],
            Ok(EffectOutcome::Skipped { .. })
        ));
        assert!(interpreter.provider.calls().is_empty());
    }
}
