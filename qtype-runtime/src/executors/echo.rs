//! Identity step; optionally delayed, which tests use to exercise
//! cancellation deterministically.

use crate::context::RunContext;
use crate::executor::{per_message, FlowStream, StepExecutor};
use qtype_semantics::StepIr;
use std::sync::Arc;
use std::time::Duration;

pub struct EchoExecutor {
    step: Arc<StepIr>,
    delay: Option<Duration>,
}

impl EchoExecutor {
    #[must_use]
    pub fn new(step: Arc<StepIr>, delay_ms: Option<u64>) -> Self {
        Self {
            step,
            delay: delay_ms.map(Duration::from_millis),
        }
    }
}

impl StepExecutor for EchoExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let step = Arc::clone(&self.step);
        let cancel = ctx.cancel.clone();
        per_message(input, ctx, step, move |message| {
            let this = Arc::clone(&self);
            let cancel = cancel.clone();
            async move {
                if let Some(delay) = this.delay {
                    tokio::select! {
                        () = cancel.cancelled() => return message,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                // Forward positionally: input i lands in output i.
                let pairs: Vec<_> = this
                    .step
                    .inputs
                    .iter()
                    .zip(this.step.outputs.iter())
                    .filter(|(input_var, output_var)| input_var.id != output_var.id)
                    .map(|(input_var, output_var)| (input_var.id.clone(), output_var.id.clone()))
                    .collect();
                let mut result = message;
                for (from, to) in pairs {
                    if let Some(value) = result.get(&from).cloned() {
                        result = result.with_variable(to, value);
                    }
                }
                result
            }
        })
    }
}
