//! Durable batch storage.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use super::types::{BatchKey, PersistedBatch};

/// Durable key/value store holding dispatched batches.
///
/// `save`, `dispatch` and `is_empty` are all the producer side needs; the
/// remaining operations serve the runtime and the periodic invoker.
pub trait DurableStore: Send + Sync {
    /// Create or overwrite the batch stored under `key`.
    fn save(&self, key: &BatchKey, batch: &PersistedBatch) -> Result<(), StoreError>;

    /// Signal the invoker that the batch under `key` may be consumed.
    fn dispatch(&self, key: &BatchKey) -> Result<(), StoreError>;

    /// True when no batches are stored.
    fn is_empty(&self) -> Result<bool, StoreError>;

    /// Load the batch stored under `key`.
    fn load(&self, key: &BatchKey) -> Result<Option<PersistedBatch>, StoreError>;

    /// Remove the batch under `key`. Removing a missing batch is not an error.
    fn delete(&self, key: &BatchKey) -> Result<(), StoreError>;

    /// Lease the oldest dispatched batch nobody is processing.
    /// Returns None if no batches are available.
    fn claim_next(&self) -> Result<Option<BatchKey>, StoreError>;

    /// Give up the lease on `key` so another invocation may claim it.
    fn release(&self, key: &BatchKey) -> Result<(), StoreError>;

    /// Number of dispatched batches (claimed or not).
    fn pending(&self) -> Result<usize, StoreError>;
}

/// Durable store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("batch not found: {0}")]
    NotFound(BatchKey),
    #[error("store lock poisoned")]
    Poisoned,
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("storage error: {0}")]
    Storage(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

#[derive(Debug)]
struct StoredBatch {
    /// Serialized `PersistedBatch`, exactly as a durable backend would hold it.
    payload: String,
    dispatched: bool,
    claimed: bool,
}

/// In-memory durable store for tests/dev and single-process hosts.
#[derive(Debug, Default)]
pub struct InMemoryDurableStore {
    batches: RwLock<BTreeMap<BatchKey, StoredBatch>>,
}

impl InMemoryDurableStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Keys of all stored batches, oldest first.
    pub fn keys(&self) -> Result<Vec<BatchKey>, StoreError> {
        let batches = self.batches.read().map_err(|_| StoreError::Poisoned)?;
        Ok(batches.keys().cloned().collect())
    }
}

impl DurableStore for InMemoryDurableStore {
    fn save(&self, key: &BatchKey, batch: &PersistedBatch) -> Result<(), StoreError> {
        let payload = serde_json::to_string(batch)?;
        let mut batches = self.batches.write().map_err(|_| StoreError::Poisoned)?;

        match batches.get_mut(key) {
            Some(existing) => existing.payload = payload,
            None => {
                batches.insert(
                    key.clone(),
                    StoredBatch {
                        payload,
                        dispatched: false,
                        claimed: false,
                    },
                );
            }
        }
        Ok(())
    }

    fn dispatch(&self, key: &BatchKey) -> Result<(), StoreError> {
        let mut batches = self.batches.write().map_err(|_| StoreError::Poisoned)?;
        let stored = batches
            .get_mut(key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        stored.dispatched = true;
        Ok(())
    }

    fn is_empty(&self) -> Result<bool, StoreError> {
        let batches = self.batches.read().map_err(|_| StoreError::Poisoned)?;
        Ok(batches.is_empty())
    }

    fn load(&self, key: &BatchKey) -> Result<Option<PersistedBatch>, StoreError> {
        let batches = self.batches.read().map_err(|_| StoreError::Poisoned)?;
        match batches.get(key) {
            Some(stored) => Ok(Some(serde_json::from_str(&stored.payload)?)),
            None => Ok(None),
        }
    }

    fn delete(&self, key: &BatchKey) -> Result<(), StoreError> {
        let mut batches = self.batches.write().map_err(|_| StoreError::Poisoned)?;
        batches.remove(key);
        Ok(())
    }

    fn claim_next(&self) -> Result<Option<BatchKey>, StoreError> {
        let mut batches = self.batches.write().map_err(|_| StoreError::Poisoned)?;

        // BTreeMap order is key order, and keys are time-ordered.
        let next = batches
            .iter_mut()
            .find(|(_, stored)| stored.dispatched && !stored.claimed);

        match next {
            Some((key, stored)) => {
                stored.claimed = true;
                Ok(Some(key.clone()))
            }
            None => Ok(None),
        }
    }

    fn release(&self, key: &BatchKey) -> Result<(), StoreError> {
        let mut batches = self.batches.write().map_err(|_| StoreError::Poisoned)?;
        if let Some(stored) = batches.get_mut(key) {
            stored.claimed = false;
        }
        Ok(())
    }

    fn pending(&self) -> Result<usize, StoreError> {
        let batches = self.batches.read().map_err(|_| StoreError::Poisoned)?;
        Ok(batches.values().filter(|s| s.dispatched).count())
    }
}

impl<S: DurableStore + ?Sized> DurableStore for Arc<S> {
    fn save(&self, key: &BatchKey, batch: &PersistedBatch) -> Result<(), StoreError> {
        (**self).save(key, batch)
    }

    fn dispatch(&self, key: &BatchKey) -> Result<(), StoreError> {
        (**self).dispatch(key)
    }

    fn is_empty(&self) -> Result<bool, StoreError> {
        (**self).is_empty()
    }

    fn load(&self, key: &BatchKey) -> Result<Option<PersistedBatch>, StoreError> {
        (**self).load(key)
    }

    fn delete(&self, key: &BatchKey) -> Result<(), StoreError> {
        (**self).delete(key)
    }

    fn claim_next(&self) -> Result<Option<BatchKey>, StoreError> {
        (**self).claim_next()
    }

    fn release(&self, key: &BatchKey) -> Result<(), StoreError> {
        (**self).release(key)
    }

    fn pending(&self) -> Result<usize, StoreError> {
        (**self).pending()
    }
}
