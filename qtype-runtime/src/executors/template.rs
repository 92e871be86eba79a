//! Prompt template substitution.

use crate::context::RunContext;
use crate::executor::{per_message, FlowStream, StepExecutor};
use crate::message::FlowMessage;
use qtype_core::{codes, Value};
use qtype_semantics::StepIr;
use regex::Regex;
use std::sync::{Arc, LazyLock};

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{([A-Za-z_][A-Za-z0-9_.\-]*)\}").expect("placeholder pattern"));

pub struct PromptTemplateExecutor {
    step: Arc<StepIr>,
    template: String,
}

impl PromptTemplateExecutor {
    #[must_use]
    pub fn new(step: Arc<StepIr>, template: String) -> Self {
        Self { step, template }
    }

    fn render(&self, message: &FlowMessage) -> FlowMessage {
        let mut missing: Option<String> = None;
        let rendered = PLACEHOLDER.replace_all(&self.template, |caps: &regex::Captures<'_>| {
            let key = &caps[1];
            match message.get(key) {
                Some(value) => value.render(),
                None => {
                    if missing.is_none() {
                        missing = Some(key.to_string());
                    }
                    String::new()
                }
            }
        });
        if let Some(key) = missing {
            return message.failed(
                codes::TEMPLATE_ERROR,
                format!("no value for template placeholder '{{{key}}}'"),
                Some(&self.step.id),
            );
        }
        match self.step.outputs.first() {
            Some(output) => message.with_variable(output.id.clone(), Value::Text(rendered.into_owned())),
            None => message.clone(),
        }
    }
}

impl StepExecutor for PromptTemplateExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let step = Arc::clone(&self.step);
        per_message(input, ctx, step, move |message| {
            let this = Arc::clone(&self);
            async move { this.render(&message) }
        })
    }
}
