//! Drive an inner flow's executor chain to completion per message.

use crate::context::RunContext;
use crate::executor::{per_message, FlowStream, StepExecutor};
use crate::message::FlowMessage;
use futures::{stream, StreamExt};
use qtype_core::codes;
use qtype_semantics::{FlowIr, StepIr};
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct InvokeFlowExecutor {
    step: Arc<StepIr>,
    flow: Arc<FlowIr>,
    /// Inner flow executors in topological order, built at construction.
    chain: Vec<Arc<dyn StepExecutor>>,
    input_bindings: BTreeMap<String, String>,
    output_bindings: BTreeMap<String, String>,
}

impl InvokeFlowExecutor {
    #[must_use]
    pub fn new(
        step: Arc<StepIr>,
        flow: Arc<FlowIr>,
        chain: Vec<Arc<dyn StepExecutor>>,
        input_bindings: BTreeMap<String, String>,
        output_bindings: BTreeMap<String, String>,
    ) -> Self {
        Self {
            step,
            flow,
            chain,
            input_bindings,
            output_bindings,
        }
    }

    async fn run_inner(&self, ctx: Arc<RunContext>, message: FlowMessage) -> FlowMessage {
        // The sub-capsule carries only the bound inputs.
        let mut inner_vars = std::collections::BTreeMap::new();
        for (inner_input, outer_var) in &self.input_bindings {
            if let Some(value) = message.get(outer_var) {
                inner_vars.insert(inner_input.clone(), value.clone());
            }
        }
        let inner_seed = FlowMessage::with_variables(message.session_id(), inner_vars);

        let mut stream: FlowStream = stream::iter(vec![inner_seed]).boxed();
        for executor in &self.chain {
            stream = Arc::clone(executor).execute(stream, Arc::clone(&ctx));
        }
        let results: Vec<FlowMessage> = stream.collect().await;

        let Some(last) = results.last() else {
            return message.failed(
                codes::FATAL_RUNTIME_ERROR,
                format!("inner flow '{}' produced no result", self.flow.id),
                Some(&self.step.id),
            );
        };
        if let Some(error) = last.error() {
            let code = error.code.clone();
            let detail = format!("inner flow '{}' failed: {}", self.flow.id, error.message);
            return message.failed(&code, detail, Some(&self.step.id));
        }

        let mut updated = message;
        for (inner_output, outer_var) in &self.output_bindings {
            if let Some(value) = last.get(inner_output) {
                updated = updated.with_variable(outer_var.clone(), value.clone());
            }
        }
        updated
    }
}

impl StepExecutor for InvokeFlowExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let step = Arc::clone(&self.step);
        let ctx_outer = Arc::clone(&ctx);
        per_message(input, ctx_outer, step, move |message| {
            let this = Arc::clone(&self);
            let ctx = Arc::clone(&ctx);
            async move { this.run_inner(ctx, message).await }
        })
    }
}
