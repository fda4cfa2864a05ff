//! `docqueue-deferral`: producer side of deferred document delivery.
//!
//! Decides which notifications to withhold while an entry's documents are
//! produced in the background, builds the task batch and hands it to the
//! durable queue.
//!
//! Flow: `NotificationSource` → `DecisionEngine` → `TaskBuilder` →
//! `QueueStore` → dispatch. Consumption lives in `docqueue_infra::queue`.

pub mod accumulator;
pub mod builder;
pub mod decision;
pub mod queue_store;
pub mod service;
pub mod source;

pub use accumulator::Accumulator;
pub use builder::{BuildHooks, NoHooks, TaskBuilder};
pub use decision::{Candidate, DecisionEngine};
pub use queue_store::QueueStore;
pub use service::{Deferral, DeferredDelivery};
pub use source::{InMemoryNotificationSource, NotificationSource};
