//! Task Builder: turns withheld notifications and active documents into an
//! ordered, de-duplicated batch.

use docqueue_core::{DocumentConfig, Entry, Form, NotificationRef};
use docqueue_infra::queue::{Batch, Task, TaskKind};
use tracing::{debug, warn};

use crate::accumulator::Accumulator;
use crate::source::NotificationSource;

/// Host customization points around batch construction.
///
/// Hooks may add or remove tasks. Duplicate task ids are removed after each
/// hook (first occurrence kept), so uniqueness holds whatever a hook does.
pub trait BuildHooks: Send + Sync {
    fn before_documents(&self, _batch: &mut Batch, _form: &Form, _entry: &Entry) {}

    fn after_documents(&self, _batch: &mut Batch, _form: &Form, _entry: &Entry) {}

    fn after_notifications(&self, _batch: &mut Batch, _form: &Form, _entry: &Entry) {}
}

/// No customization.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHooks;

impl BuildHooks for NoHooks {}

pub struct TaskBuilder<N: NotificationSource> {
    source: N,
    hooks: Box<dyn BuildHooks>,
}

impl<N: NotificationSource> TaskBuilder<N> {
    pub fn new(source: N) -> Self {
        Self {
            source,
            hooks: Box::new(NoHooks),
        }
    }

    pub fn with_hooks(mut self, hooks: impl BuildHooks + 'static) -> Self {
        self.hooks = Box::new(hooks);
        self
    }

    /// Build the batch for one triggering event.
    ///
    /// Deterministic for identical inputs. A failed document lookup yields an
    /// empty batch.
    pub fn build_batch(&self, accumulator: &Accumulator, form: &Form, entry: &Entry) -> Batch {
        let mut batch = Batch::new();

        let documents = match self.source.active_documents(form, entry) {
            Ok(documents) => documents,
            Err(e) => {
                warn!(
                    form_id = %form.id,
                    entry_id = %entry.id,
                    error = %e,
                    "active document lookup failed; queueing nothing"
                );
                return batch;
            }
        };

        self.hooks.before_documents(&mut batch, form, entry);
        batch.dedup_by_id();

        for document in &documents {
            if self.needs_production(accumulator, document, form, entry) {
                batch.push(Task::produce_document(form.id, entry.id, document.id.clone()));
            }
        }

        self.hooks.after_documents(&mut batch, form, entry);
        batch.dedup_by_id();

        for notification in accumulator.iter() {
            // First matching document wins.
            if let Some(document) = documents
                .iter()
                .find(|d| self.requires(notification, d, form, entry))
            {
                batch.push(Task::send_notification(
                    form.id,
                    entry.id,
                    &document.id,
                    notification.id.clone(),
                ));
            }
        }

        self.hooks.after_notifications(&mut batch, form, entry);
        batch.dedup_by_id();

        let has_work = batch
            .iter()
            .any(|t| !matches!(t.kind, TaskKind::Cleanup { .. }));
        if has_work {
            batch.retain(|t| !matches!(t.kind, TaskKind::Cleanup { .. }));
            batch.push(Task::cleanup(form.id, entry.id));
        }

        debug!(
            form_id = %form.id,
            entry_id = %entry.id,
            tasks = batch.len(),
            "built task batch"
        );
        batch
    }

    fn needs_production(
        &self,
        accumulator: &Accumulator,
        document: &DocumentConfig,
        form: &Form,
        entry: &Entry,
    ) -> bool {
        self.source.should_always_produce(document, form.id)
            || accumulator
                .iter()
                .any(|notification| self.requires(notification, document, form, entry))
    }

    fn requires(
        &self,
        notification: &NotificationRef,
        document: &DocumentConfig,
        form: &Form,
        entry: &Entry,
    ) -> bool {
        self.source
            .requires_attachment(notification, document, entry, form)
            .unwrap_or_else(|e| {
                warn!(
                    notification_id = %notification.id,
                    document_id = %document.id,
                    error = %e,
                    "attachment check failed"
                );
                false
            })
    }
}
