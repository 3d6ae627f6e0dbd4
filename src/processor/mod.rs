//! Asynchronous processing layer: bounded queue, worker fan-out, and
//! the handler that drives the aggregator (spec.md §4.4).

pub mod handler;
pub mod queue;
pub mod worker;

pub use handler::PipelineHandler;
pub use queue::{EventHandler, MessageQueue, QUEUE_CAPACITY, WORKER_COUNT};
pub use worker::{drain, spawn_workers};
