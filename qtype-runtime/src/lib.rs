//! ABOUTME: Streaming interpreter for QType flows
//! ABOUTME: Transports FlowMessage capsules through per-step executors with
//! bounded concurrency, memory, retry, and cancellation

pub mod clients;
pub mod context;
pub mod events;
pub mod executor;
pub mod executors;
pub mod factory;
pub mod memory;
pub mod message;
pub mod options;
pub mod retry;
pub mod runner;
pub mod transport;

pub use clients::{ClientCache, ProviderFactory};
pub use context::RunContext;
pub use events::{EventHub, StreamEvent};
pub use executor::{FlowStream, StepExecutor};
pub use factory::ExecutorFactory;
pub use memory::{MemoryStore, MemoryRecord};
pub use message::{FlowMessage, MessageError, MessageMetadata};
pub use options::{RetryOptions, RuntimeOptions};
pub use runner::{FlowRunner, RunnerDeps};
