//! Equality-routed branching between two inline steps.

use crate::context::RunContext;
use crate::executor::{per_message, FlowStream, StepExecutor};
use crate::message::FlowMessage;
use futures::{stream, StreamExt};
use qtype_semantics::{StepIr, VariableIr};
use std::sync::Arc;

pub struct ConditionExecutor {
    step: Arc<StepIr>,
    equals: Arc<VariableIr>,
    then_branch: Arc<dyn StepExecutor>,
    else_branch: Option<Arc<dyn StepExecutor>>,
}

impl ConditionExecutor {
    #[must_use]
    pub fn new(
        step: Arc<StepIr>,
        equals: Arc<VariableIr>,
        then_branch: Arc<dyn StepExecutor>,
        else_branch: Option<Arc<dyn StepExecutor>>,
    ) -> Self {
        Self {
            step,
            equals,
            then_branch,
            else_branch,
        }
    }

    async fn route(&self, ctx: Arc<RunContext>, message: FlowMessage) -> FlowMessage {
        let input_value = self
            .step
            .inputs
            .first()
            .and_then(|input| message.get(&input.id));
        let expected = message.get(&self.equals.id);
        let matches = match (input_value, expected) {
            (Some(actual), Some(expected)) => actual == expected,
            _ => false,
        };

        let branch = if matches {
            Some(Arc::clone(&self.then_branch))
        } else {
            self.else_branch.as_ref().map(Arc::clone)
        };
        let Some(branch) = branch else {
            // No branch for this side; the message passes through untouched.
            return message;
        };

        let single = stream::iter(vec![message.clone()]).boxed();
        let mut output = branch.execute(single, ctx);
        match output.next().await {
            Some(result) => result,
            None => message,
        }
    }
}

impl StepExecutor for ConditionExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let step = Arc::clone(&self.step);
        let ctx_outer = Arc::clone(&ctx);
        per_message(input, ctx_outer, step, move |message| {
            let this = Arc::clone(&self);
            let ctx = Arc::clone(&ctx);
            async move { this.route(ctx, message).await }
        })
    }
}
