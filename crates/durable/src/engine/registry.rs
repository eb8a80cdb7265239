//! Workflow type lookup
//!
//! Executions are stored with a type name and JSON input. The registry turns
//! that pair back into runnable workflow code on every advance.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;

use crate::workflow::{error_codes, Workflow, WorkflowContext, WorkflowError, WorkflowInterrupt};

/// Workflow code with its input and output erased to JSON
pub trait AnyWorkflow: Send + Sync {
    fn workflow_type(&self) -> &'static str;

    fn run(&self, ctx: &mut WorkflowContext) -> Result<Value, WorkflowInterrupt>;
}

struct Typed<W>(W);

impl<W: Workflow> AnyWorkflow for Typed<W> {
    fn workflow_type(&self) -> &'static str {
        W::TYPE
    }

    fn run(&self, ctx: &mut WorkflowContext) -> Result<Value, WorkflowInterrupt> {
        let output = self.0.run(ctx)?;
        serde_json::to_value(output).map_err(|e| {
            let error = WorkflowError::new(format!("cannot encode {} output: {e}", W::TYPE))
                .with_code(error_codes::SERIALIZATION);
            WorkflowInterrupt::Failed(error)
        })
    }
}

/// Builds a workflow instance from stored input
pub type WorkflowFactory =
    Box<dyn Fn(Value) -> Result<Box<dyn AnyWorkflow>, serde_json::Error> + Send + Sync>;

#[derive(Default)]
pub struct WorkflowRegistry {
    factories: BTreeMap<&'static str, WorkflowFactory>,
}

impl WorkflowRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `W` startable and replayable under `W::TYPE`
    ///
    /// Registering the same type twice keeps the later factory.
    pub fn register<W: Workflow>(&mut self) {
        self.factories.insert(
            W::TYPE,
            Box::new(|input| {
                let input: W::Input = serde_json::from_value(input)?;
                Ok(Box::new(Typed(W::new(input))) as Box<dyn AnyWorkflow>)
            }),
        );
    }

    pub fn contains(&self, workflow_type: &str) -> bool {
        self.factories.contains_key(workflow_type)
    }

    /// Instantiate `workflow_type` with `input`
    pub fn create(
        &self,
        workflow_type: &str,
        input: Value,
    ) -> Result<Box<dyn AnyWorkflow>, RegistryError> {
        match self.factories.get(workflow_type) {
            Some(factory) => factory(input).map_err(RegistryError::Deserialization),
            None => Err(RegistryError::UnknownWorkflowType(workflow_type.to_string())),
        }
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Registered type names in sorted order
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> + '_ {
        self.factories.keys().copied()
    }
}

impl fmt::Debug for WorkflowRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    /// Stored input does not match the workflow's input type
    #[error("invalid workflow input: {0}")]
    Deserialization(#[source] serde_json::Error),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::{ActivityOptions, WorkflowAction, WorkflowEvent};
    use serde::{Deserialize, Serialize};
    use serde_json::json;
    use uuid::Uuid;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    struct GreetInput {
        name: String,
    }

    struct GreetWorkflow {
        input: GreetInput,
    }

    impl Workflow for GreetWorkflow {
        const TYPE: &'static str = "greet";
        type Input = GreetInput;
        type Output = String;

        fn new(input: Self::Input) -> Self {
            Self { input }
        }

        fn run(&self, ctx: &mut WorkflowContext) -> Result<String, WorkflowInterrupt> {
            let greeting = ctx
                .execute_activity("lookup_greeting", &self.input, ActivityOptions::default())?
                .map_err(|f| WorkflowError::new(f.to_string()))?;
            Ok(format!("{} {}", greeting.as_str().unwrap_or("hello"), self.input.name))
        }
    }

    struct NoopWorkflow;

    impl Workflow for NoopWorkflow {
        const TYPE: &'static str = "noop";
        type Input = ();
        type Output = ();

        fn new(_: ()) -> Self {
            Self
        }

        fn run(&self, _: &mut WorkflowContext) -> Result<(), WorkflowInterrupt> {
            Ok(())
        }
    }

    fn registry() -> WorkflowRegistry {
        let mut registry = WorkflowRegistry::new();
        registry.register::<NoopWorkflow>();
        registry.register::<GreetWorkflow>();
        registry
    }

    fn started(input: Value) -> (i64, WorkflowEvent) {
        (
            0,
            WorkflowEvent::WorkflowStarted {
                workflow_type: "greet".into(),
                input,
            },
        )
    }

    #[test]
    fn test_lookup() {
        let registry = registry();

        assert_eq!(registry.len(), 2);
        assert!(registry.contains("greet"));
        assert!(!registry.contains("Greet"));
        assert_eq!(registry.workflow_types().collect::<Vec<_>>(), vec!["greet", "noop"]);
        assert_eq!(format!("{:?}", registry), r#"{"greet", "noop"}"#);

        let workflow = registry.create("greet", json!({ "name": "ada" })).unwrap();
        assert_eq!(workflow.workflow_type(), "greet");
    }

    #[test]
    fn test_create_errors() {
        let registry = registry();

        assert!(matches!(
            registry.create("missing", json!({})),
            Err(RegistryError::UnknownWorkflowType(t)) if t == "missing"
        ));
        assert!(matches!(
            registry.create("greet", json!({ "name": 3 })),
            Err(RegistryError::Deserialization(_))
        ));
    }

    #[test]
    fn test_erased_run_suspends_then_completes() {
        let registry = registry();
        let input = json!({ "name": "ada" });
        let workflow = registry.create("greet", input.clone()).unwrap();

        let mut ctx =
            WorkflowContext::from_history("wf", Uuid::now_v7(), &[started(input.clone())]).unwrap();
        assert_eq!(workflow.run(&mut ctx), Err(WorkflowInterrupt::Suspended));
        assert!(matches!(
            ctx.into_actions().as_slice(),
            [WorkflowAction::ScheduleActivity { activity_id, .. }] if activity_id == "lookup_greeting-0"
        ));

        let history = vec![
            started(input.clone()),
            (
                1,
                WorkflowEvent::ActivityScheduled {
                    activity_id: "lookup_greeting-0".into(),
                    activity_type: "lookup_greeting".into(),
                    input,
                    options: ActivityOptions::default(),
                },
            ),
            (
                2,
                WorkflowEvent::ActivityCompleted {
                    activity_id: "lookup_greeting-0".into(),
                    attempt: 1,
                    result: json!("hi"),
                },
            ),
        ];
        let mut ctx = WorkflowContext::from_history("wf", Uuid::now_v7(), &history).unwrap();
        assert_eq!(workflow.run(&mut ctx), Ok(json!("hi ada")));
    }

    #[test]
    fn test_unit_output_is_null() {
        let workflow = registry().create("noop", Value::Null).unwrap();
        let mut ctx = WorkflowContext::from_history(
            "wf",
            Uuid::now_v7(),
            &[(
                0,
                WorkflowEvent::WorkflowStarted {
                    workflow_type: "noop".into(),
                    input: Value::Null,
                },
            )],
        )
        .unwrap();

        assert_eq!(workflow.run(&mut ctx), Ok(Value::Null));
    }
}
