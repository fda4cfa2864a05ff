//! Queue runtime: executes a persisted batch one task per invocation.
//!
//! Each invocation pops the head task, runs its callback inside an isolated
//! error boundary and applies the retry/cancellation policy:
//!
//! - failure with retries left: retry count bumped, task goes back to the front
//! - recoverable task out of retries: only that task is dropped
//! - unrecoverable task out of retries: the whole remaining batch is discarded
//!
//! Tasks of one batch never run concurrently; later tasks rely on files the
//! earlier ones wrote.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use docqueue_core::{DocumentId, EntryId, FormId, NotificationId};

use super::store::{DurableStore, StoreError};
use super::types::{BatchKey, PersistedBatch, RetryPolicy, Task, TaskId, TaskKind};

/// Callbacks the runtime dispatches to. Implemented by the host.
pub trait TaskHandler: Send + Sync {
    /// Render the document and persist it under a location keyed by
    /// `(form_id, entry_id)`.
    fn produce_document(
        &self,
        form_id: FormId,
        document_id: &DocumentId,
        entry_id: EntryId,
    ) -> anyhow::Result<()>;

    /// Send the notification, attaching any document produced for the entry.
    fn send_notification(
        &self,
        form_id: FormId,
        entry_id: EntryId,
        notification_id: &NotificationId,
    ) -> anyhow::Result<()>;

    /// Delete every document produced for the entry.
    fn cleanup(&self, form_id: FormId, entry_id: EntryId) -> anyhow::Result<()>;
}

impl<H: TaskHandler + ?Sized> TaskHandler for Arc<H> {
    fn produce_document(
        &self,
        form_id: FormId,
        document_id: &DocumentId,
        entry_id: EntryId,
    ) -> anyhow::Result<()> {
        (**self).produce_document(form_id, document_id, entry_id)
    }

    fn send_notification(
        &self,
        form_id: FormId,
        entry_id: EntryId,
        notification_id: &NotificationId,
    ) -> anyhow::Result<()> {
        (**self).send_notification(form_id, entry_id, notification_id)
    }

    fn cleanup(&self, form_id: FormId, entry_id: EntryId) -> anyhow::Result<()> {
        (**self).cleanup(form_id, entry_id)
    }
}

/// State of the batch after one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOutcome {
    /// Tasks remain; invoke again.
    Pending { remaining: usize },
    /// The head task is scheduled for later.
    Waiting,
    /// Every task ran (or was dropped).
    Complete,
    /// An unrecoverable task failed for good; the rest was discarded.
    Cancelled,
}

/// What happened to the task executed during one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResolution {
    Succeeded,
    Retrying { retry_count: u32 },
    Dropped,
    BatchCancelled,
}

/// Result of a single runtime invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Step {
    pub outcome: StepOutcome,
    /// The executed task, if any ran.
    pub task: Option<(TaskId, TaskResolution)>,
}

impl Step {
    fn idle(outcome: StepOutcome) -> Self {
        Self {
            outcome,
            task: None,
        }
    }
}

/// Totals for one `drain` call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    pub invocations: u32,
    pub succeeded: u32,
    pub retried: u32,
    pub dropped: u32,
    pub cancelled: bool,
    /// Batch still stored and scheduled for later.
    pub waiting: bool,
}

impl DrainReport {
    fn record(&mut self, step: &Step) {
        self.invocations += 1;
        if let Some((_, resolution)) = step.task {
            match resolution {
                TaskResolution::Succeeded => self.succeeded += 1,
                TaskResolution::Retrying { .. } => self.retried += 1,
                TaskResolution::Dropped => self.dropped += 1,
                TaskResolution::BatchCancelled => {}
            }
        }
        match step.outcome {
            StepOutcome::Cancelled => self.cancelled = true,
            StepOutcome::Waiting => self.waiting = true,
            _ => {}
        }
    }

    /// Attempts that failed, including the final one of dropped/cancelling tasks.
    pub fn failed_attempts(&self) -> u32 {
        self.retried + self.dropped + u32::from(self.cancelled)
    }
}

enum Popped {
    Empty,
    Waiting,
    Task(Task),
}

/// Executes persisted batches against a `TaskHandler`.
pub struct QueueRuntime<H: TaskHandler> {
    handler: H,
    policy: RetryPolicy,
}

impl<H: TaskHandler> QueueRuntime<H> {
    /// Create a runtime with the default policy (2 retries, no delay).
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn handler(&self) -> &H {
        &self.handler
    }

    /// Run one invocation against an in-memory batch.
    pub fn step(&self, batch: &mut PersistedBatch) -> Step {
        let now = Utc::now();
        match self.pop(batch, now) {
            Popped::Empty => Step::idle(StepOutcome::Complete),
            Popped::Waiting => Step::idle(StepOutcome::Waiting),
            Popped::Task(task) => {
                let result = self.execute(&task);
                self.resolve(batch, task, result, Utc::now())
            }
        }
    }

    /// Run one invocation against the batch stored under `key`.
    ///
    /// The popped state is persisted before the callback runs, so a crash
    /// mid-task never replays it. Finished and cancelled batches are deleted.
    pub fn process<S: DurableStore + ?Sized>(
        &self,
        store: &S,
        key: &BatchKey,
    ) -> Result<Step, StoreError> {
        let Some(mut batch) = store.load(key)? else {
            debug!(batch = %key, "batch no longer stored");
            return Ok(Step::idle(StepOutcome::Complete));
        };

        let task = match self.pop(&mut batch, Utc::now()) {
            Popped::Empty => {
                store.delete(key)?;
                info!(batch = %key, age_ms = batch_age_ms(&batch), "batch complete");
                return Ok(Step::idle(StepOutcome::Complete));
            }
            Popped::Waiting => {
                debug!(batch = %key, "head task not due yet");
                return Ok(Step::idle(StepOutcome::Waiting));
            }
            Popped::Task(task) => task,
        };

        store.save(key, &batch)?;

        let result = self.execute(&task);
        let step = self.resolve(&mut batch, task, result, Utc::now());

        match step.outcome {
            StepOutcome::Complete => {
                store.delete(key)?;
                info!(
                    batch = %key,
                    completed = batch.completed.len(),
                    age_ms = batch_age_ms(&batch),
                    "batch complete"
                );
            }
            StepOutcome::Cancelled => {
                store.delete(key)?;
            }
            StepOutcome::Pending { .. } | StepOutcome::Waiting => {
                store.save(key, &batch)?;
            }
        }

        Ok(step)
    }

    /// Invoke `process` until the batch completes, is cancelled, or waits.
    pub fn drain<S: DurableStore + ?Sized>(
        &self,
        store: &S,
        key: &BatchKey,
    ) -> Result<DrainReport, StoreError> {
        let mut report = DrainReport::default();
        loop {
            let step = self.process(store, key)?;
            report.record(&step);
            if !matches!(step.outcome, StepOutcome::Pending { .. }) {
                return Ok(report);
            }
        }
    }

    /// Take the next runnable task off the front of the batch.
    ///
    /// A notification whose document task is still queued behind it is moved
    /// after that task and after any notifications already waiting on it, so
    /// sibling notifications keep their order.
    fn pop(&self, batch: &mut PersistedBatch, now: DateTime<Utc>) -> Popped {
        // Every reorder moves a task behind its (dependency-free) document
        // task, so this terminates well within len + 1 rounds.
        for _ in 0..=batch.tasks.len() {
            let Some(head) = batch.tasks.first() else {
                return Popped::Empty;
            };
            if !head.is_ready(now) {
                return Popped::Waiting;
            }

            let task = batch.tasks.remove(0);
            let Some(dependency) = task.kind.depends_on().copied() else {
                return Popped::Task(task);
            };

            if batch.completed.contains(&dependency) {
                return Popped::Task(task);
            }

            match batch.tasks.iter().position(|t| t.id == dependency) {
                Some(pos) => {
                    warn!(
                        task_id = %task.id,
                        depends_on = %dependency,
                        "dependency still queued; moving task behind it"
                    );
                    let mut at = pos + 1;
                    while batch
                        .tasks
                        .get(at)
                        .is_some_and(|t| t.kind.depends_on() == Some(&dependency))
                    {
                        at += 1;
                    }
                    batch.tasks.insert(at, task);
                }
                None => {
                    error!(
                        task_id = %task.id,
                        depends_on = %dependency,
                        "dependency is not part of this batch; running without it"
                    );
                    return Popped::Task(task);
                }
            }
        }

        match batch.tasks.first() {
            Some(_) => Popped::Task(batch.tasks.remove(0)),
            None => Popped::Empty,
        }
    }

    /// Run the task callback; panics are turned into failures.
    fn execute(&self, task: &Task) -> anyhow::Result<()> {
        debug!(
            task_id = %task.id,
            callback = task.callback_name(),
            attempt = task.retry_count + 1,
            "task started"
        );

        match panic::catch_unwind(AssertUnwindSafe(|| self.run_callback(&task.kind))) {
            Ok(result) => result,
            Err(payload) => Err(anyhow!("task panicked: {}", panic_message(payload.as_ref()))),
        }
    }

    fn run_callback(&self, kind: &TaskKind) -> anyhow::Result<()> {
        match kind {
            TaskKind::ProduceDocument {
                form_id,
                document_id,
                entry_id,
            } => self.handler.produce_document(*form_id, document_id, *entry_id),
            TaskKind::SendNotification {
                form_id,
                entry_id,
                notification_id,
                ..
            } => self
                .handler
                .send_notification(*form_id, *entry_id, notification_id),
            TaskKind::Cleanup { form_id, entry_id } => self.handler.cleanup(*form_id, *entry_id),
        }
    }

    fn resolve(
        &self,
        batch: &mut PersistedBatch,
        mut task: Task,
        result: anyhow::Result<()>,
        now: DateTime<Utc>,
    ) -> Step {
        let task_id = task.id;

        let (outcome, resolution) = match result {
            Ok(()) => {
                info!(task_id = %task_id, callback = task.callback_name(), "task succeeded");
                batch.completed.push(task_id);
                (remaining_outcome(batch), TaskResolution::Succeeded)
            }
            Err(err) => {
                warn!(
                    task_id = %task_id,
                    callback = task.callback_name(),
                    args = ?task.kind,
                    attempt = task.retry_count + 1,
                    error = %format!("{err:#}"),
                    "task failed"
                );

                if self.policy.should_retry(task.retry_count) {
                    task.mark_retry(&self.policy, now);
                    let retry_count = task.retry_count;
                    info!(task_id = %task_id, retry_count, "task scheduled for retry");
                    batch.tasks.insert(0, task);
                    (remaining_outcome(batch), TaskResolution::Retrying { retry_count })
                } else if !task.unrecoverable {
                    error!(
                        task_id = %task_id,
                        args = ?task.kind,
                        attempts = task.retry_count + 1,
                        "task dropped after exhausting retries"
                    );
                    (remaining_outcome(batch), TaskResolution::Dropped)
                } else {
                    let discarded = batch.tasks.len();
                    batch.tasks.clear();
                    error!(
                        task_id = %task_id,
                        args = ?task.kind,
                        attempts = task.retry_count + 1,
                        discarded,
                        "batch cancelled after unrecoverable task failure"
                    );
                    (StepOutcome::Cancelled, TaskResolution::BatchCancelled)
                }
            }
        };

        Step {
            outcome,
            task: Some((task_id, resolution)),
        }
    }
}

fn remaining_outcome(batch: &PersistedBatch) -> StepOutcome {
    if batch.tasks.is_empty() {
        StepOutcome::Complete
    } else {
        StepOutcome::Pending {
            remaining: batch.tasks.len(),
        }
    }
}

/// Time since the batch was dispatched.
fn batch_age_ms(batch: &PersistedBatch) -> i64 {
    (Utc::now() - batch.dispatched_at).num_milliseconds()
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::queue::store::InMemoryDurableStore;
    use crate::queue::testing::RecordingHandler;
    use crate::queue::types::Batch;

    fn form() -> FormId {
        FormId::new(2)
    }

    fn entry() -> EntryId {
        EntryId::new(40)
    }

    fn doc() -> DocumentId {
        DocumentId::new("6a1f").unwrap()
    }

    fn admin() -> NotificationId {
        NotificationId::new("admin").unwrap()
    }

    fn standard_batch() -> PersistedBatch {
        let mut batch = Batch::new();
        batch.push(Task::produce_document(form(), entry(), doc()));
        batch.push(Task::send_notification(form(), entry(), &doc(), admin()));
        batch.push(Task::cleanup(form(), entry()));
        PersistedBatch::new(batch)
    }

    fn run_to_end<H: TaskHandler>(runtime: &QueueRuntime<H>, batch: &mut PersistedBatch) -> StepOutcome {
        loop {
            let step = runtime.step(batch);
            if !matches!(step.outcome, StepOutcome::Pending { .. }) {
                return step.outcome;
            }
        }
    }

    #[test]
    fn executes_tasks_in_order() {
        let runtime = QueueRuntime::new(RecordingHandler::new());
        let mut batch = standard_batch();

        let first = runtime.step(&mut batch);
        assert_eq!(first.outcome, StepOutcome::Pending { remaining: 2 });
        assert_eq!(
            first.task,
            Some((TaskId::for_document(form(), entry(), &doc()), TaskResolution::Succeeded))
        );

        assert_eq!(run_to_end(&runtime, &mut batch), StepOutcome::Complete);
        assert_eq!(
            runtime.handler().calls(),
            vec!["produce_document", "send_notification", "cleanup"]
        );
        assert_eq!(batch.completed.len(), 3);
    }

    #[test]
    fn transient_failure_is_retried_immediately_at_front() {
        let handler = RecordingHandler::new().fail_times("produce_document", 1);
        let runtime = QueueRuntime::new(handler);
        let mut batch = standard_batch();

        let step = runtime.step(&mut batch);
        assert_eq!(step.outcome, StepOutcome::Pending { remaining: 3 });
        assert!(matches!(
            step.task,
            Some((_, TaskResolution::Retrying { retry_count: 1 }))
        ));
        assert_eq!(batch.tasks[0].retry_count, 1);
        assert!(batch.tasks[0].not_before.is_none());

        assert_eq!(run_to_end(&runtime, &mut batch), StepOutcome::Complete);
        assert_eq!(
            runtime.handler().calls(),
            vec![
                "produce_document",
                "produce_document",
                "send_notification",
                "cleanup"
            ]
        );
    }

    #[test]
    fn unrecoverable_failure_cancels_remaining_batch() {
        let handler = RecordingHandler::new().always_fail("produce_document");
        let runtime = QueueRuntime::new(handler);
        let mut batch = standard_batch();

        assert_eq!(run_to_end(&runtime, &mut batch), StepOutcome::Cancelled);
        assert_eq!(runtime.handler().count("produce_document"), 3);
        assert_eq!(runtime.handler().count("send_notification"), 0);
        assert_eq!(runtime.handler().count("cleanup"), 0);
        assert!(batch.tasks.is_empty());
    }

    #[test]
    fn recoverable_failure_drops_only_that_task() {
        let handler = RecordingHandler::new().always_fail("send_notification");
        let runtime = QueueRuntime::new(handler);
        let mut batch = standard_batch();

        assert_eq!(run_to_end(&runtime, &mut batch), StepOutcome::Complete);
        assert_eq!(runtime.handler().count("send_notification"), 3);
        assert_eq!(runtime.handler().count("cleanup"), 1);
    }

    #[test]
    fn panicking_callback_counts_as_failure() {
        let handler = RecordingHandler::new().panic_on("cleanup");
        let runtime = QueueRuntime::new(handler);
        let mut batch = standard_batch();

        assert_eq!(run_to_end(&runtime, &mut batch), StepOutcome::Complete);
        assert_eq!(runtime.handler().count("cleanup"), 3);
    }

    #[test]
    fn notification_is_moved_behind_its_queued_document() {
        let runtime = QueueRuntime::new(RecordingHandler::new());
        let mut batch = PersistedBatch::new(Batch::from(vec![
            Task::send_notification(form(), entry(), &doc(), admin()),
            Task::produce_document(form(), entry(), doc()),
            Task::cleanup(form(), entry()),
        ]));

        assert_eq!(run_to_end(&runtime, &mut batch), StepOutcome::Complete);
        assert_eq!(
            runtime.handler().calls(),
            vec!["produce_document", "send_notification", "cleanup"]
        );
    }

    #[test]
    fn notifications_sharing_a_queued_document_keep_their_order() {
        let user = NotificationId::new("user").unwrap();
        let runtime = QueueRuntime::new(RecordingHandler::new());
        let mut batch = PersistedBatch::new(Batch::from(vec![
            Task::send_notification(form(), entry(), &doc(), admin()),
            Task::send_notification(form(), entry(), &doc(), user.clone()),
            Task::produce_document(form(), entry(), doc()),
            Task::cleanup(form(), entry()),
        ]));

        assert_eq!(run_to_end(&runtime, &mut batch), StepOutcome::Complete);
        assert_eq!(
            runtime.handler().calls(),
            vec![
                "produce_document",
                "send_notification",
                "send_notification",
                "cleanup"
            ]
        );
        assert_eq!(runtime.handler().sent_notifications(), vec![admin(), user]);
    }

    /// Collects formatted log output for assertions.
    #[derive(Clone, Default)]
    struct LogCapture(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogCapture {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl LogCapture {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    #[test]
    fn notification_without_queued_document_runs_and_logs_an_error() {
        let logs = LogCapture::default();
        let writer = logs.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::ERROR)
            .finish();

        let runtime = QueueRuntime::new(RecordingHandler::new());
        let mut batch = PersistedBatch::new(Batch::from(vec![Task::send_notification(
            form(),
            entry(),
            &doc(),
            admin(),
        )]));

        let outcome = tracing::subscriber::with_default(subscriber, || run_to_end(&runtime, &mut batch));

        assert_eq!(outcome, StepOutcome::Complete);
        assert_eq!(runtime.handler().calls(), vec!["send_notification"]);
        let output = logs.contents();
        assert!(output.contains("ERROR"));
        assert!(output.contains("dependency is not part of this batch"));
    }

    #[test]
    fn retry_delay_keeps_attempt_count() {
        let handler = RecordingHandler::new().always_fail("cleanup");
        let runtime = QueueRuntime::new(handler).with_policy(RetryPolicy::fixed(2, Duration::from_secs(60)));
        let mut batch = PersistedBatch::new(Batch::from(vec![Task::cleanup(form(), entry())]));

        let step = runtime.step(&mut batch);
        assert!(matches!(step.task, Some((_, TaskResolution::Retrying { .. }))));
        assert_eq!(runtime.step(&mut batch).outcome, StepOutcome::Waiting);

        // Pretend the delay elapsed.
        for _ in 0..2 {
            batch.tasks[0].not_before = None;
            runtime.step(&mut batch);
        }
        assert!(batch.tasks.is_empty());
        assert_eq!(runtime.handler().count("cleanup"), 3);
    }

    #[test]
    fn process_persists_popped_state_before_executing() {
        let store = InMemoryDurableStore::arc();
        let key = BatchKey::new();
        store.save(&key, &standard_batch()).unwrap();
        store.dispatch(&key).unwrap();

        let handler = RecordingHandler::new().observe_store(store.clone(), key.clone());
        let runtime = QueueRuntime::new(handler);

        let step = runtime.process(&store, &key).unwrap();
        assert_eq!(step.outcome, StepOutcome::Pending { remaining: 2 });

        // While produce_document ran, the durable copy held only the two later tasks.
        assert_eq!(runtime.handler().observed_lengths(), vec![2]);
        let stored = store.load(&key).unwrap().unwrap();
        assert_eq!(stored.tasks.len(), 2);
        assert_eq!(stored.completed.len(), 1);
    }

    #[test]
    fn drain_deletes_finished_batch() {
        let store = InMemoryDurableStore::new();
        let key = BatchKey::new();
        store.save(&key, &standard_batch()).unwrap();

        let runtime = QueueRuntime::new(RecordingHandler::new().fail_times("cleanup", 1));
        let report = runtime.drain(&store, &key).unwrap();

        assert_eq!(report.succeeded, 3);
        assert_eq!(report.retried, 1);
        assert_eq!(report.invocations, 4);
        assert!(!report.cancelled);
        assert!(store.is_empty().unwrap());
    }

    #[test]
    fn drain_deletes_cancelled_batch() {
        let store = InMemoryDurableStore::new();
        let key = BatchKey::new();
        store.save(&key, &standard_batch()).unwrap();

        let runtime = QueueRuntime::new(RecordingHandler::new().always_fail("produce_document"));
        let report = runtime.drain(&store, &key).unwrap();

        assert!(report.cancelled);
        assert_eq!(report.failed_attempts(), 3);
        assert!(store.load(&key).unwrap().is_none());
    }

    #[test]
    fn processing_missing_batch_reports_complete() {
        let store = InMemoryDurableStore::new();
        let runtime = QueueRuntime::new(RecordingHandler::new());

        let step = runtime.process(&store, &BatchKey::new()).unwrap();
        assert_eq!(step.outcome, StepOutcome::Complete);
        assert!(runtime.handler().calls().is_empty());
    }

    mod proptest_tests {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig {
                cases: 64,
                ..ProptestConfig::default()
            })]

            /// Property: an always-failing task is attempted exactly
            /// `max_retries + 1` times, whatever its recoverability.
            #[test]
            fn failing_task_attempts_are_bounded(max_retries in 0u32..6, unrecoverable in any::<bool>()) {
                let runtime = QueueRuntime::new(RecordingHandler::new().always_fail("cleanup"))
                    .with_policy(RetryPolicy { max_retries, ..RetryPolicy::default() });

                let mut task = Task::cleanup(form(), entry());
                task.unrecoverable = unrecoverable;
                let mut batch = PersistedBatch::new(Batch::from(vec![
                    task,
                    Task::produce_document(form(), EntryId::new(41), doc()),
                ]));

                let outcome = run_to_end(&runtime, &mut batch);

                prop_assert_eq!(runtime.handler().count("cleanup"), max_retries as usize + 1);
                if unrecoverable {
                    prop_assert_eq!(outcome, StepOutcome::Cancelled);
                    prop_assert_eq!(runtime.handler().count("produce_document"), 0);
                } else {
                    prop_assert_eq!(outcome, StepOutcome::Complete);
                    prop_assert_eq!(runtime.handler().count("produce_document"), 1);
                }
            }
        }
    }
}
