//! Deferred task queue: durable batches, runtime, background worker.
//!
//! ## Design
//!
//! - A batch is the ordered task list built for one submission or resend
//! - Tasks of a batch run strictly in order, one per runtime invocation
//! - Every task gets 3 attempts (initial + 2 retries) by default
//! - A permanently failing unrecoverable task cancels the rest of its batch
//!
//! ## Components
//!
//! - `Task` / `TaskKind`: closed set of callbacks with id-only arguments
//! - `DurableStore`: persistence for dispatched batches (in-memory or durable)
//! - `QueueRuntime`: executes a batch with retry and cancellation policy
//! - `QueueWorker`: periodic invoker draining dispatched batches

pub mod runtime;
pub mod store;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
pub mod worker;

pub use runtime::{DrainReport, QueueRuntime, Step, StepOutcome, TaskHandler, TaskResolution};
pub use store::{DurableStore, InMemoryDurableStore, StoreError};
pub use types::{
    BackoffStrategy, Batch, BatchKey, PersistedBatch, RetryPolicy, Task, TaskId, TaskKind,
};
pub use worker::{QueueWorker, WorkerConfig, WorkerHandle, WorkerStats};
