//! Test doubles for the queue runtime.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::bail;

use docqueue_core::{DocumentId, EntryId, FormId, NotificationId};

use super::runtime::TaskHandler;
use super::store::{DurableStore, InMemoryDurableStore};
use super::types::BatchKey;

#[derive(Debug, Clone, Copy)]
enum Failure {
    Times(u32),
    Always,
    Panic,
}

/// `TaskHandler` that records every call and fails on demand.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<&'static str>>,
    notifications: Mutex<Vec<NotificationId>>,
    documents: Mutex<Vec<DocumentId>>,
    failures: Mutex<HashMap<&'static str, Failure>>,
    observer: Option<(Arc<InMemoryDurableStore>, BatchKey)>,
    observed: Mutex<Vec<usize>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the first `times` calls of `callback`.
    pub fn fail_times(self, callback: &'static str, times: u32) -> Self {
        self.script(callback, Failure::Times(times))
    }

    pub fn always_fail(self, callback: &'static str) -> Self {
        self.script(callback, Failure::Always)
    }

    pub fn panic_on(self, callback: &'static str) -> Self {
        self.script(callback, Failure::Panic)
    }

    /// Record the stored task count of `key` whenever a callback runs.
    pub fn observe_store(mut self, store: Arc<InMemoryDurableStore>, key: BatchKey) -> Self {
        self.observer = Some((store, key));
        self
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn count(&self, callback: &str) -> usize {
        self.calls().iter().filter(|c| **c == callback).count()
    }

    /// Notifications whose send callback succeeded.
    pub fn sent_notifications(&self) -> Vec<NotificationId> {
        self.notifications.lock().map(|n| n.clone()).unwrap_or_default()
    }

    /// Documents whose produce callback succeeded.
    pub fn produced_documents(&self) -> Vec<DocumentId> {
        self.documents.lock().map(|d| d.clone()).unwrap_or_default()
    }

    pub fn observed_lengths(&self) -> Vec<usize> {
        self.observed.lock().map(|o| o.clone()).unwrap_or_default()
    }

    fn script(self, callback: &'static str, failure: Failure) -> Self {
        if let Ok(mut failures) = self.failures.lock() {
            failures.insert(callback, failure);
        }
        self
    }

    fn record(&self, callback: &'static str) -> anyhow::Result<()> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(callback);
        }

        if let Some((store, key)) = &self.observer {
            let len = store.load(key)?.map_or(0, |b| b.tasks.len());
            if let Ok(mut observed) = self.observed.lock() {
                observed.push(len);
            }
        }

        let failure = match self.failures.lock() {
            Ok(mut failures) => match failures.get_mut(callback) {
                Some(Failure::Times(0)) | None => None,
                Some(Failure::Times(n)) => {
                    *n -= 1;
                    Some(Failure::Times(*n))
                }
                Some(other) => Some(*other),
            },
            Err(_) => None,
        };

        match failure {
            None => Ok(()),
            Some(Failure::Panic) => panic!("{callback} blew up"),
            Some(_) => bail!("{callback} failed"),
        }
    }
}

impl TaskHandler for RecordingHandler {
    fn produce_document(
        &self,
        _form_id: FormId,
        document_id: &DocumentId,
        _entry_id: EntryId,
    ) -> anyhow::Result<()> {
        self.record("produce_document")?;
        if let Ok(mut documents) = self.documents.lock() {
            documents.push(document_id.clone());
        }
        Ok(())
    }

    fn send_notification(
        &self,
        _form_id: FormId,
        _entry_id: EntryId,
        notification_id: &NotificationId,
    ) -> anyhow::Result<()> {
        self.record("send_notification")?;
        if let Ok(mut notifications) = self.notifications.lock() {
            notifications.push(notification_id.clone());
        }
        Ok(())
    }

    fn cleanup(&self, _form_id: FormId, _entry_id: EntryId) -> anyhow::Result<()> {
        self.record("cleanup")
    }
}
