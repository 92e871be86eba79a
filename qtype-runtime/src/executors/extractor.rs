//! JSONPath projection out of a structured variable.

use crate::context::RunContext;
use crate::executor::{per_message, FlowStream, StepExecutor};
use crate::message::FlowMessage;
use qtype_core::{codes, Value};
use qtype_semantics::{JsonPath, StepIr};
use std::sync::Arc;

pub struct FieldExtractorExecutor {
    step: Arc<StepIr>,
    path: JsonPath,
}

impl FieldExtractorExecutor {
    #[must_use]
    pub fn new(step: Arc<StepIr>, path: JsonPath) -> Self {
        Self { step, path }
    }

    fn extract(&self, message: &FlowMessage) -> FlowMessage {
        let Some(input) = self.step.inputs.first() else {
            return message.clone();
        };
        let Some(output) = self.step.outputs.first() else {
            return message.clone();
        };
        let Some(value) = message.get(&input.id) else {
            return message.failed(
                codes::EXTRACTION_ERROR,
                format!("input variable '{}' has no value", input.id),
                Some(&self.step.id),
            );
        };
        match self.path.evaluate(value) {
            Some(found) => message.with_variable(output.id.clone(), found),
            None if output.ty.is_optional() => {
                message.with_variable(output.id.clone(), Value::Null)
            }
            None => message.failed(
                codes::EXTRACTION_ERROR,
                format!("path '{}' matched nothing in '{}'", self.path, input.id),
                Some(&self.step.id),
            ),
        }
    }
}

impl StepExecutor for FieldExtractorExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let step = Arc::clone(&self.step);
        per_message(input, ctx, step, move |message| {
            let this = Arc::clone(&self);
            async move { this.extract(&message) }
        })
    }
}
