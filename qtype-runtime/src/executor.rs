//! ABOUTME: Step executor contract and the ordered per-message dispatch helper
//! ABOUTME: Executors are async stream transforms from FlowMessages to FlowMessages

use crate::context::RunContext;
use crate::events::StreamEvent;
use crate::message::FlowMessage;
use futures::stream::BoxStream;
use futures::StreamExt;
use qtype_core::codes;
use qtype_core::traits::telemetry::SpanStatus;
use qtype_semantics::StepIr;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// The stream of capsules flowing between executors.
pub type FlowStream = BoxStream<'static, FlowMessage>;

/// A step executor: consumes an asynchronous stream of FlowMessages and
/// produces one.
///
/// Executors are composed in the flow's topological order. Fan-out and
/// fan-in executors alter stream cardinality; everything else is expected
/// to preserve input order.
pub trait StepExecutor: Send + Sync {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream;
}

/// Order-preserving concurrent dispatch for one-to-one steps.
///
/// Up to `concurrency` messages are in flight inside the step; results
/// re-emit in input order. Failed messages skip the handler and forward
/// unchanged. Start/finish step events and the per-step deadline are
/// applied here so individual executors stay small.
pub fn per_message<F, Fut>(
    input: FlowStream,
    ctx: Arc<RunContext>,
    step: Arc<StepIr>,
    handler: F,
) -> FlowStream
where
    F: Fn(FlowMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = FlowMessage> + Send + 'static,
{
    let concurrency = ctx.options.concurrency_for(step.concurrency);
    let handler = Arc::new(handler);
    input
        .map(move |message| {
            let ctx = Arc::clone(&ctx);
            let step = Arc::clone(&step);
            let handler = Arc::clone(&handler);
            async move {
                if message.is_failed() {
                    return message;
                }
                if ctx.is_cancelled() {
                    return message.failed(codes::CANCELLED, "run cancelled", Some(&step.id));
                }
                ctx.events.emit(StreamEvent::StartStep {
                    step_id: step.id.clone(),
                });
                let span = ctx
                    .telemetry
                    .start_span("step.execute", &[("step", step.id.clone())]);
                let message = message.at_step(&step.id);
                let work = handler(message.clone());
                let result = match ctx.options.step_timeout_ms {
                    Some(deadline) => {
                        match tokio::time::timeout(Duration::from_millis(deadline), work).await {
                            Ok(done) => done,
                            Err(_) => message.failed(
                                codes::CANCELLED,
                                "step deadline exceeded",
                                Some(&step.id),
                            ),
                        }
                    }
                    None => work.await,
                };
                let status = if result.is_failed() {
                    SpanStatus::Error
                } else {
                    SpanStatus::Ok
                };
                ctx.telemetry.end_span(span, status);
                ctx.events.emit(StreamEvent::MessageMetadata {
                    metadata: result.metadata().clone(),
                });
                ctx.events.emit(StreamEvent::FinishStep {
                    step_id: step.id.clone(),
                });
                result
            }
        })
        .buffered(concurrency)
        .boxed()
}
