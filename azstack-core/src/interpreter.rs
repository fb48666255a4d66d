//! Interpreter - Execute Effects using a Provider
//!
//! The Interpreter executes Effects contained in a Plan in order,
//! collecting the results. This is where side effects actually occur.
//! References are resolved against the states produced so far, so an
//! effect always sees the remote identifiers of the resources it depends on.

use log::{debug, info};

use crate::effect::Effect;
use crate::graph::Bindings;
use crate::plan::Plan;
use crate::provider::{Provider, ProviderError, ProviderResult};
use crate::resource::{Resource, State};

/// Result of executing each Effect
#[derive(Debug)]
pub enum EffectOutcome {
    /// Create succeeded
    Created { state: State },
    /// Update succeeded
    Updated { state: State },
    /// Delete then create succeeded
    Replaced { state: State },
    /// Delete succeeded
    Deleted,
    /// Skipped (e.g., dry-run)
    Skipped { reason: String },
}

impl EffectOutcome {
    /// State produced by the effect, if any
    pub fn state(&self) -> Option<&State> {
        match self {
            EffectOutcome::Created { state }
            | EffectOutcome::Updated { state }
            | EffectOutcome::Replaced { state } => Some(state),
            EffectOutcome::Deleted | EffectOutcome::Skipped { .. } => None,
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
    bindings: Bindings,
}

impl<P: Provider> Interpreter<P> {
    pub fn new(provider: P) -> Self {
        Self {
            provider,
            config: InterpreterConfig::default(),
            bindings: Bindings::new(),
        }
    }

    pub fn with_config(mut self, config: InterpreterConfig) -> Self {
        self.config = config;
        self
    }

    /// Seed the values references resolve against
    pub fn with_bindings(mut self, bindings: Bindings) -> Self {
        self.bindings = bindings;
        self
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Execute a Plan, interpreting all Effects and causing side effects
    pub async fn apply(&mut self, plan: &Plan) -> ApplyResult {
        let mut outcomes = Vec::new();
        let mut success_count = 0;
        let mut failure_count = 0;

        for effect in plan.effects() {
            let result = self.execute(effect).await;

            match &result {
                Ok(_) => success_count += 1,
                Err(_) => {
                    failure_count += 1;
                    if !self.config.continue_on_error {
                        outcomes.push(result);
                        break;
                    }
                }
            }

            outcomes.push(result);
        }

        ApplyResult {
            outcomes,
            success_count,
            failure_count,
        }
    }

    /// Execute a single Effect
    pub async fn execute(&mut self, effect: &Effect) -> ProviderResult<EffectOutcome> {
        if self.config.dry_run {
            return Ok(EffectOutcome::Skipped {
                reason: "dry-run mode".to_string(),
            });
        }

        match effect {
            Effect::Create(resource) => {
                let resource = self.resolve(resource)?;
                info!("creating {}", resource.id);
                let state = self.provider.create(&resource).await?;
                self.bindings.insert_state(&state);
                Ok(EffectOutcome::Created { state })
            }
            Effect::Update { id, from, to, .. } => {
                let to = self.resolve(to)?;
                let identifier = from.identifier.as_deref().ok_or_else(|| {
                    ProviderError::new("Cannot update a resource without a remote identifier")
                        .for_resource(id.clone())
                })?;
                info!("updating {} ({})", id, identifier);
                let state = self.provider.update(id, identifier, from, &to).await?;
                self.bindings.insert_state(&state);
                Ok(EffectOutcome::Updated { state })
            }
            Effect::Replace { id, from, to, .. } => {
                let to = self.resolve(to)?;
                if let Some(identifier) = from.identifier.as_deref() {
                    info!("replacing {}: deleting {}", id, identifier);
                    self.provider.delete(id, identifier).await?;
                }
                self.bindings.remove(id);
                let state = self.provider.create(&to).await?;
                self.bindings.insert_state(&state);
                Ok(EffectOutcome::Replaced { state })
            }
            Effect::Delete { id, identifier } => {
                info!("deleting {} ({})", id, identifier);
                self.provider.delete(id, identifier).await?;
                self.bindings.remove(id);
                Ok(EffectOutcome::Deleted)
            }
        }
    }

    fn resolve(&self, resource: &Resource) -> ProviderResult<Resource> {
        debug!("resolving references of {}", resource.id);
        self.bindings.resolve_resource(resource).map_err(|e| {
            ProviderError::validation(e.to_string())
                .for_resource(resource.id.clone())
                .with_cause(e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{BoxFuture, ResourceType};
    use crate::resource::{ResourceId, Value};
    use std::sync::Mutex;

    #[derive(Default)]
    struct TestProvider {
        calls: Mutex<Vec<String>>,
    }

    impl TestProvider {
        fn record(&self, call: String) {
            if let Ok(mut calls) = self.calls.lock() {
                calls.push(call);
            }
        }
    }

    impl Provider for TestProvider {
        fn name(&self) -> &'static str {
            "test"
        }

        fn resource_types(&self) -> Vec<Box<dyn ResourceType>> {
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

        fn create(&self, resource: &Resource) -> BoxFuture<'_, ProviderResult<State>> {
            self.record(format!("create {}", resource.id));
            if resource.id.name == "broken" {
                return Box::pin(async { Err(ProviderError::new("boom")) });
            }
            let state = State::existing(resource.id.clone(), resource.attributes.clone())
                .with_identifier(format!("/ids/{}", resource.id.name));
            Box::pin(async move { Ok(state) })
        }

        fn update(
            &self,
            id: &ResourceId,
            identifier: &str,
            _from: &State,
            to: &Resource,
        ) -> BoxFuture<'_, ProviderResult<State>> {
            self.record(format!("update {}", identifier));
            let state = State::existing(id.clone(), to.attributes.clone()).with_identifier(identifier);
            Box::pin(async move { Ok(state) })
        }

        fn delete(&self, _id: &ResourceId, identifier: &str) -> BoxFuture<'_, ProviderResult<()>> {
            self.record(format!("delete {}", identifier));
            Box::pin(async { Ok(()) })
        }
    }

    #[tokio::test]
    async fn apply_empty_plan() {
        let mut interpreter = Interpreter::new(TestProvider::default());
        let plan = Plan::new();
        let result = interpreter.apply(&plan).await;

        assert!(result.is_success());
        assert_eq!(result.success_count, 0);
    }

    #[tokio::test]
    async fn apply_resolves_references_from_created_states() {
        let mut interpreter = Interpreter::new(TestProvider::default());
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("azurestack_linux_virtual_machine", "vm")));
        plan.add(Effect::Create(
            Resource::new("azurestack_virtual_machine_extension", "ext").with_attribute(
                "virtual_machine_id",
                Value::ResourceRef(
                    ResourceId::new("azurestack_linux_virtual_machine", "vm"),
                    "id".to_string(),
                ),
            ),
        ));

        let result = interpreter.apply(&plan).await;

        assert!(result.is_success());
        let ext = result.outcomes[1].as_ref().unwrap().state().unwrap();
        assert_eq!(ext.attributes["virtual_machine_id"], Value::from("/ids/vm"));
    }

    #[tokio::test]
    async fn unresolved_reference_fails_the_effect() {
        let mut interpreter = Interpreter::new(TestProvider::default());
        let mut plan = Plan::new();
        plan.add(Effect::Create(
            Resource::new("azurestack_virtual_machine_extension", "ext").with_attribute(
                "virtual_machine_id",
                Value::ResourceRef(
                    ResourceId::new("azurestack_linux_virtual_machine", "missing"),
                    "id".to_string(),
                ),
            ),
        ));

        let result = interpreter.apply(&plan).await;
        assert_eq!(result.failure_count, 1);
        assert!(interpreter.provider().calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_deletes_before_creating() {
        let mut interpreter = Interpreter::new(TestProvider::default());
        let id = ResourceId::new("azurestack_image", "golden");
        let mut plan = Plan::new();
        plan.add(Effect::Replace {
            id: id.clone(),
            from: State::existing(id.clone(), Default::default()).with_identifier("/ids/old"),
            to: Resource::new("azurestack_image", "golden"),
            changed_attributes: vec!["location".to_string()],
        });

        let result = interpreter.apply(&plan).await;

        assert!(result.is_success());
        let calls = interpreter.provider().calls.lock().unwrap().clone();
        assert_eq!(calls, vec!["delete /ids/old", "create azurestack_image.golden"]);
    }

    #[tokio::test]
    async fn stops_on_first_error_by_default() {
        let mut interpreter = Interpreter::new(TestProvider::default());
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("t", "broken")));
        plan.add(Effect::Create(Resource::new("t", "fine")));

        let result = interpreter.apply(&plan).await;
        assert_eq!(result.failure_count, 1);
        assert_eq!(result.outcomes.len(), 1);

        let mut interpreter = Interpreter::new(TestProvider::default()).with_config(InterpreterConfig {
            continue_on_error: true,
            ..Default::default()
        });
        let result = interpreter.apply(&plan).await;
        assert_eq!(result.success_count, 1);
        assert_eq!(result.failure_count, 1);
    }

    #[tokio::test]
    async fn dry_run_skips_effects() {
        let config = InterpreterConfig {
            dry_run: true,
            ..Default::default()
        };
        let mut interpreter = Interpreter::new(TestProvider::default()).with_config(config);
        let mut plan = Plan::new();
        plan.add(Effect::Create(Resource::new("test", "example")));

        let result = interpreter.apply(&plan).await;

        assert!(result.is_success());
        assert!(matches!(
            result.outcomes[0],
            Ok(EffectOutcome::Skipped { .. })
        ));
    }
}
