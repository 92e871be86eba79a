//! Build a custom-typed value from named inputs.

use crate::context::RunContext;
use crate::executor::{per_message, FlowStream, StepExecutor};
use crate::message::FlowMessage;
use qtype_core::{codes, Value};
use qtype_semantics::{CustomTypeIr, StepIr};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct ConstructExecutor {
    step: Arc<StepIr>,
    ty: Arc<CustomTypeIr>,
    field_bindings: BTreeMap<String, String>,
}

impl ConstructExecutor {
    #[must_use]
    pub fn new(
        step: Arc<StepIr>,
        ty: Arc<CustomTypeIr>,
        field_bindings: BTreeMap<String, String>,
    ) -> Self {
        Self {
            step,
            ty,
            field_bindings,
        }
    }

    fn build(&self, message: &FlowMessage) -> FlowMessage {
        let Some(output) = self.step.outputs.first() else {
            return message.clone();
        };
        let value = match self.ty.as_ref() {
            CustomTypeIr::Object { id, fields } => {
                let mut object = BTreeMap::new();
                for (field, field_ty) in fields {
                    let source = self
                        .field_bindings
                        .get(field)
                        .map_or(field.as_str(), String::as_str);
                    match message.get(source) {
                        Some(found) if !found.is_null() => {
                            object.insert(field.clone(), found.clone());
                        }
                        _ if field_ty.is_optional() => {}
                        _ => {
                            return message.failed(
                                codes::CONSTRUCT_ERROR,
                                format!("required field '{field}' of '{id}' has no value"),
                                Some(&self.step.id),
                            );
                        }
                    }
                }
                Value::Object(object)
            }
            CustomTypeIr::Array { .. } => match self.step.inputs.first() {
                Some(input) => match message.get(&input.id) {
                    Some(value) => value.clone(),
                    None => {
                        return message.failed(
                            codes::CONSTRUCT_ERROR,
                            format!("input variable '{}' has no value", input.id),
                            Some(&self.step.id),
                        )
                    }
                },
                None => Value::List(Vec::new()),
            },
        };
        message.with_variable(output.id.clone(), value)
    }
}

impl StepExecutor for ConstructExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let step = Arc::clone(&self.step);
        per_message(input, ctx, step, move |message| {
            let this = Arc::clone(&self);
            async move { this.build(&message) }
        })
    }
}
