//! ABOUTME: Stream-cardinality transforms: Explode (1→N), Collect (N→1), Aggregate (N→1)
//! ABOUTME: Aggregate emits exactly one stats capsule, even over an empty stream

use crate::context::RunContext;
use crate::executor::{FlowStream, StepExecutor};
use crate::message::FlowMessage;
use futures::{stream, StreamExt};
use qtype_core::types::rag::AggregateStats;
use qtype_core::{codes, QTypeError, Value};
use qtype_dsl::document::steps::{Reduction, ReductionOp};
use qtype_semantics::StepIr;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

/// Emit one message per element of a list-typed input variable.
pub struct ExplodeExecutor {
    step: Arc<StepIr>,
}

impl ExplodeExecutor {
    #[must_use]
    pub fn new(step: Arc<StepIr>) -> Self {
        Self { step }
    }

    fn expand(&self, ctx: &RunContext, message: FlowMessage) -> Vec<FlowMessage> {
        if message.is_failed() {
            return vec![message];
        }
        let (Some(input), Some(output)) = (self.step.inputs.first(), self.step.outputs.first())
        else {
            return vec![message];
        };
        let Some(Value::List(items)) = message.get(&input.id).cloned() else {
            // The checker guaranteed a list; anything else is an invariant
            // violation and takes the whole flow down.
            ctx.abort(QTypeError::fatal(format!(
                "explode '{}' received a non-list value for '{}'",
                self.step.id, input.id
            )));
            return vec![message.failed(
                codes::FATAL_RUNTIME_ERROR,
                format!("'{}' is not a list", input.id),
                Some(&self.step.id),
            )];
        };
        items
            .into_iter()
            .map(|element| message.with_variable(output.id.clone(), element))
            .collect()
    }
}

impl StepExecutor for ExplodeExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        input
            .flat_map(move |message| {
                let this = Arc::clone(&self);
                let ctx = Arc::clone(&ctx);
                stream::iter(this.expand(&ctx, message))
            })
            .boxed()
    }
}

/// Gather scalars back into a list variable.
///
/// With a declared batch size, every `n` messages yield one collected
/// capsule; otherwise the whole upstream collects into one. Failed messages
/// pass through uncollected.
pub struct CollectExecutor {
    step: Arc<StepIr>,
}

impl CollectExecutor {
    #[must_use]
    pub fn new(step: Arc<StepIr>) -> Self {
        Self { step }
    }

    fn collapse(&self, batch: Vec<FlowMessage>) -> Vec<FlowMessage> {
        let (Some(input), Some(output)) = (self.step.inputs.first(), self.step.outputs.first())
        else {
            return batch;
        };
        let mut passthrough = Vec::new();
        let mut values = Vec::new();
        let mut base: Option<FlowMessage> = None;
        for message in batch {
            if message.is_failed() {
                passthrough.push(message);
                continue;
            }
            if let Some(value) = message.get(&input.id) {
                values.push(value.clone());
            }
            base = Some(message);
        }
        if let Some(base) = base {
            passthrough.push(base.with_variable(output.id.clone(), Value::List(values)));
        }
        passthrough
    }
}

impl StepExecutor for CollectExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, _ctx: Arc<RunContext>) -> FlowStream {
        match self.step.batch_size {
            Some(batch_size) => input
                .chunks(batch_size.max(1))
                .flat_map(move |batch| {
                    let this = Arc::clone(&self);
                    stream::iter(this.collapse(batch))
                })
                .boxed(),
            None => {
                let this = self;
                Box::pin(
                    stream::once(async move { input.collect::<Vec<_>>().await })
                        .flat_map(move |all| stream::iter(this.collapse(all))),
                )
            }
        }
    }
}

/// Consume the whole stream and emit one capsule of `AggregateStats` plus
/// any declared reductions. An empty stream still emits one capsule with
/// `num_total = 0`.
pub struct AggregateExecutor {
    step: Arc<StepIr>,
    reductions: BTreeMap<String, Reduction>,
}

impl AggregateExecutor {
    #[must_use]
    pub fn new(step: Arc<StepIr>, reductions: BTreeMap<String, Reduction>) -> Self {
        Self { step, reductions }
    }

    fn summarize(&self, ctx: &RunContext, all: Vec<FlowMessage>) -> FlowMessage {
        let mut stats = AggregateStats::default();
        let mut sums: BTreeMap<String, f64> = BTreeMap::new();
        let mut collected: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        let mut base: Option<FlowMessage> = None;

        for message in all {
            stats.record(message.is_failed());
            if message.is_failed() {
                continue;
            }
            for (target, reduction) in &self.reductions {
                let value = message.get(&reduction.over);
                match reduction.op {
                    ReductionOp::Count => {
                        *sums.entry(target.clone()).or_default() += 1.0;
                    }
                    ReductionOp::Sum => {
                        let add = match value {
                            Some(Value::Int(i)) => *i as f64,
                            Some(Value::Float(f)) => *f,
                            _ => 0.0,
                        };
                        *sums.entry(target.clone()).or_default() += add;
                    }
                    ReductionOp::Collect => {
                        if let Some(value) = value {
                            collected.entry(target.clone()).or_default().push(value.clone());
                        }
                    }
                }
            }
            base = Some(message);
        }

        debug!(
            step = %self.step.id,
            total = stats.num_total,
            failed = stats.num_failed,
            "aggregate complete"
        );

        // The stats capsule itself is healthy; upstream failures are data.
        let base = base.unwrap_or_else(|| ctx.seed());
        let mut result = base;
        if let Some(output) = self.step.outputs.first() {
            result = result.with_variable(output.id.clone(), Value::from_serialize(&stats));
        }
        for (target, reduction) in &self.reductions {
            let value = match reduction.op {
                ReductionOp::Count | ReductionOp::Sum => {
                    let sum = sums.get(target).copied().unwrap_or(0.0);
                    if matches!(reduction.op, ReductionOp::Count) {
                        Value::Int(sum as i64)
                    } else {
                        Value::Float(sum)
                    }
                }
                ReductionOp::Collect => {
                    Value::List(collected.remove(target).unwrap_or_default())
                }
            };
            result = result.with_variable(target.clone(), value);
        }
        result
    }
}

impl StepExecutor for AggregateExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let this = self;
        Box::pin(stream::once(async move {
            let all = input.collect::<Vec<_>>().await;
            this.summarize(&ctx, all)
        }))
    }
}
