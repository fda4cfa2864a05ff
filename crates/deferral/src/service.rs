//! Host-facing entry points: the notification filter, "submission completed"
//! and "resend requested".

use std::sync::Arc;

use docqueue_core::{Entry, EntryId, Form, NotificationId, NotificationRef, TriggerEvent};
use docqueue_infra::QueueConfig;
use docqueue_infra::queue::{BatchKey, DurableStore};
use serde::Serialize;
use tracing::{error, info};

use crate::accumulator::Accumulator;
use crate::builder::{BuildHooks, TaskBuilder};
use crate::decision::{Candidate, DecisionEngine};
use crate::queue_store::QueueStore;
use crate::source::NotificationSource;

/// What was deferred for one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Deferral {
    pub entry_id: EntryId,
    /// Notifications the host must not send synchronously.
    pub withheld: Vec<NotificationId>,
    /// Dispatched batch, if any tasks were queued.
    pub batch: Option<BatchKey>,
}

/// Producer side of deferred delivery, wired to one notification source and
/// one durable store.
pub struct DeferredDelivery<N: NotificationSource, S: DurableStore> {
    engine: DecisionEngine<Arc<N>>,
    builder: TaskBuilder<Arc<N>>,
    queue: QueueStore<S>,
    enabled: bool,
}

impl<N: NotificationSource, S: DurableStore> DeferredDelivery<N, S> {
    pub fn new(source: N, store: S, config: &QueueConfig) -> Self {
        let source = Arc::new(source);
        Self {
            engine: DecisionEngine::new(source.clone())
                .with_background_processing(config.background_processing),
            builder: TaskBuilder::new(source),
            queue: QueueStore::new(store),
            enabled: config.background_processing,
        }
    }

    pub fn with_hooks(mut self, hooks: impl BuildHooks + 'static) -> Self {
        self.builder = self.builder.with_hooks(hooks);
        self
    }

    pub fn store(&self) -> &S {
        self.queue.store()
    }

    /// Host notification filter. See `DecisionEngine::should_withhold`.
    pub fn should_withhold(&self, accumulator: &mut Accumulator, candidate: Candidate<'_>) -> bool {
        self.engine.should_withhold(accumulator, candidate)
    }

    /// Build and dispatch the batch for an entry whose notifications were
    /// filtered into `accumulator`. Persistence errors are logged, never
    /// returned.
    pub fn on_submission_completed(
        &mut self,
        accumulator: Accumulator,
        form: &Form,
        entry: &Entry,
    ) -> Option<BatchKey> {
        if !self.enabled {
            return None;
        }

        let batch = self.builder.build_batch(&accumulator, form, entry);
        self.queue.push(batch);

        match self.queue.dispatch() {
            Ok(key) => key,
            Err(e) => {
                error!(
                    form_id = %form.id,
                    entry_id = %entry.id,
                    error = %e,
                    "failed to dispatch task batch"
                );
                None
            }
        }
    }

    /// Filter every submission notification of `form` for `entry`, then
    /// dispatch. Returns the notifications the host must not send now.
    pub fn process_submission(&mut self, form: &Form, entry: &Entry) -> Vec<NotificationId> {
        self.defer_submission(form, entry).withheld
    }

    /// Like `process_submission`, also reporting the dispatched batch.
    pub fn defer_submission(&mut self, form: &Form, entry: &Entry) -> Deferral {
        self.defer(form, entry, TriggerEvent::FormSubmission, |n| {
            n.is_submission_notification()
        })
    }

    /// Resend `notification_ids` for each entry, one independent batch per
    /// entry. Unknown notification ids are ignored.
    pub fn on_resend_requested(
        &mut self,
        form: &Form,
        entries: &[Entry],
        notification_ids: &[NotificationId],
    ) -> Vec<Deferral> {
        let deferrals: Vec<Deferral> = entries
            .iter()
            .map(|entry| {
                self.queue.reset();
                self.defer(form, entry, TriggerEvent::Resend, |n| {
                    notification_ids.contains(&n.id)
                })
            })
            .collect();

        info!(
            form_id = %form.id,
            entries = entries.len(),
            batches = deferrals.iter().filter(|d| d.batch.is_some()).count(),
            "resend processed"
        );
        deferrals
    }

    fn defer(
        &mut self,
        form: &Form,
        entry: &Entry,
        trigger: TriggerEvent,
        selected: impl Fn(&NotificationRef) -> bool,
    ) -> Deferral {
        let mut accumulator = Accumulator::new();
        for notification in form.notifications.iter().filter(|n| selected(n)) {
            let candidate = Candidate::new(notification, form, entry, trigger);
            self.engine.should_withhold(&mut accumulator, candidate);
        }

        let withheld = accumulator.ids();
        let batch = self.on_submission_completed(accumulator, form, entry);

        Deferral {
            entry_id: entry.id,
            withheld,
            batch,
        }
    }
}
