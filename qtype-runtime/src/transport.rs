//! ABOUTME: Bounded inter-executor transport with backpressure
//! ABOUTME: Producers block on full buffers; cancellation closes every bridge

use crate::executor::FlowStream;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Decouple two executors with a bounded buffer.
///
/// The upstream stream is driven by a spawned task that blocks when the
/// buffer fills, which is how backpressure propagates from the slowest
/// stage all the way to the head. Cancellation stops the pump; downstream
/// then observes end-of-stream.
#[must_use]
pub fn bounded_bridge(
    upstream: FlowStream,
    capacity: usize,
    cancel: CancellationToken,
) -> FlowStream {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    tokio::spawn(async move {
        let mut upstream = upstream;
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("transport bridge cancelled");
                    break;
                }
                next = upstream.next() => match next {
                    Some(message) => {
                        if tx.send(message).await.is_err() {
                            // Downstream hung up; stop pulling upstream.
                            break;
                        }
                    }
                    None => break,
                },
            }
        }
    });
    ReceiverStream::new(rx).boxed()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::FlowMessage;
    use futures::stream;

    #[tokio::test]
    async fn bridge_preserves_order() {
        let input: Vec<FlowMessage> = (0..10)
            .map(|i| FlowMessage::new("s").with_variable("i", qtype_core::Value::Int(i)))
            .collect();
        let bridged = bounded_bridge(
            stream::iter(input).boxed(),
            2,
            CancellationToken::new(),
        );
        let output: Vec<FlowMessage> = bridged.collect().await;
        let indices: Vec<i64> = output
            .iter()
            .map(|m| match m.get("i") {
                Some(qtype_core::Value::Int(i)) => *i,
                _ => panic!("missing index"),
            })
            .collect();
        assert_eq!(indices, (0..10).collect::<Vec<i64>>());
    }

    #[tokio::test]
    async fn cancellation_ends_the_stream() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let bridged = bounded_bridge(
            stream::iter(vec![FlowMessage::new("s")]).boxed(),
            1,
            cancel,
        );
        let output: Vec<FlowMessage> = bridged.collect().await;
        assert!(output.len() <= 1);
    }
}
