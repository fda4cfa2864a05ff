//! Queue Store: the in-memory batch for the current triggering event and its
//! hand-off to the durable store.

use docqueue_infra::queue::{Batch, BatchKey, DurableStore, PersistedBatch, StoreError, Task};
use tracing::{debug, info, warn};

pub struct QueueStore<S: DurableStore> {
    store: S,
    batch: Batch,
}

impl<S: DurableStore> QueueStore<S> {
    pub fn new(store: S) -> Self {
        Self {
            store,
            batch: Batch::new(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Append tasks to the current batch, preserving order.
    pub fn push(&mut self, tasks: impl IntoIterator<Item = Task>) {
        self.batch.extend(tasks);
    }

    /// Persist and dispatch the current batch, then start a fresh one.
    ///
    /// An empty batch is a no-op: nothing is written and `None` is returned.
    /// The in-memory batch is discarded even when persistence fails. A batch
    /// saved but not dispatched is deleted again so no undispatched record
    /// is left behind.
    pub fn dispatch(&mut self) -> Result<Option<BatchKey>, StoreError> {
        if self.batch.is_empty() {
            debug!("empty batch; nothing to dispatch");
            return Ok(None);
        }

        let batch = std::mem::take(&mut self.batch);
        let tasks = batch.len();
        let key = BatchKey::new();

        self.store.save(&key, &PersistedBatch::new(batch))?;
        if let Err(e) = self.store.dispatch(&key) {
            if let Err(cleanup) = self.store.delete(&key) {
                warn!(batch = %key, error = %cleanup, "failed to remove undispatched batch");
            }
            return Err(e);
        }

        info!(batch = %key, tasks, "dispatched task batch");
        Ok(Some(key))
    }

    /// Discard the current batch without persisting it.
    pub fn reset(&mut self) {
        self.batch = Batch::new();
    }

    pub fn is_empty(&self) -> bool {
        self.batch.is_empty()
    }

    pub fn len(&self) -> usize {
        self.batch.len()
    }
}
