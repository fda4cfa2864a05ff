//! Core task types and retry policy.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use docqueue_core::{DocumentId, EntryId, FormId, NotificationId};

/// Namespace for name-based task ids. Changing it changes every task id.
const TASK_NAMESPACE: Uuid = Uuid::from_u128(0x9a4e51c2_7d3b_4f0e_8c61_2b5d0e47a913);

/// Deterministic task identifier (idempotency key).
///
/// Derived from `(form, entry, document[, notification])`, so building the
/// same batch twice yields the same ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    pub fn for_document(form_id: FormId, entry_id: EntryId, document_id: &DocumentId) -> Self {
        Self::from_name(&format!("{form_id}:{entry_id}:{document_id}"))
    }

    pub fn for_notification(
        form_id: FormId,
        entry_id: EntryId,
        document_id: &DocumentId,
        notification_id: &NotificationId,
    ) -> Self {
        Self::from_name(&format!(
            "{form_id}:{entry_id}:{document_id}:{notification_id}"
        ))
    }

    pub fn for_cleanup(form_id: FormId, entry_id: EntryId) -> Self {
        Self::from_name(&format!("cleanup:{form_id}:{entry_id}"))
    }

    fn from_name(name: &str) -> Self {
        Self(Uuid::new_v5(&TASK_NAMESPACE, name.as_bytes()))
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Key under which a dispatched batch is persisted.
///
/// Backed by a UUIDv7, so lexical order is creation order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchKey(String);

impl BatchKey {
    pub fn new() -> Self {
        Self(format!("batch_{}", Uuid::now_v7().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BatchKey {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// The three task callbacks, each with its positional arguments (ids only).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "callback", content = "args", rename_all = "snake_case")]
pub enum TaskKind {
    /// Render and persist a document for an entry.
    ProduceDocument {
        form_id: FormId,
        document_id: DocumentId,
        entry_id: EntryId,
    },
    /// Send a withheld notification, attaching the produced document.
    SendNotification {
        form_id: FormId,
        entry_id: EntryId,
        notification_id: NotificationId,
        /// ProduceDocument task that must complete first.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        depends_on: Option<TaskId>,
    },
    /// Remove every document produced for the entry.
    Cleanup { form_id: FormId, entry_id: EntryId },
}

impl TaskKind {
    pub fn callback_name(&self) -> &'static str {
        match self {
            TaskKind::ProduceDocument { .. } => "produce_document",
            TaskKind::SendNotification { .. } => "send_notification",
            TaskKind::Cleanup { .. } => "cleanup",
        }
    }

    pub fn depends_on(&self) -> Option<&TaskId> {
        match self {
            TaskKind::SendNotification { depends_on, .. } => depends_on.as_ref(),
            _ => None,
        }
    }
}

/// A deferred unit of work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub kind: TaskKind,
    /// Retries already consumed (0 on the first attempt).
    #[serde(default)]
    pub retry_count: u32,
    /// Permanent failure cancels the rest of the batch.
    pub unrecoverable: bool,
    /// Earliest time the next attempt may run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
}

impl Task {
    /// Document production is unrecoverable: nothing after it may run
    /// against a document that was never written.
    pub fn produce_document(form_id: FormId, entry_id: EntryId, document_id: DocumentId) -> Self {
        Self {
            id: TaskId::for_document(form_id, entry_id, &document_id),
            kind: TaskKind::ProduceDocument {
                form_id,
                document_id,
                entry_id,
            },
            retry_count: 0,
            unrecoverable: true,
            not_before: None,
        }
    }

    pub fn send_notification(
        form_id: FormId,
        entry_id: EntryId,
        document_id: &DocumentId,
        notification_id: NotificationId,
    ) -> Self {
        Self {
            id: TaskId::for_notification(form_id, entry_id, document_id, &notification_id),
            kind: TaskKind::SendNotification {
                form_id,
                entry_id,
                notification_id,
                depends_on: Some(TaskId::for_document(form_id, entry_id, document_id)),
            },
            retry_count: 0,
            unrecoverable: false,
            not_before: None,
        }
    }

    pub fn cleanup(form_id: FormId, entry_id: EntryId) -> Self {
        Self {
            id: TaskId::for_cleanup(form_id, entry_id),
            kind: TaskKind::Cleanup { form_id, entry_id },
            retry_count: 0,
            unrecoverable: false,
            not_before: None,
        }
    }

    pub fn callback_name(&self) -> &'static str {
        self.kind.callback_name()
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |at| now >= at)
    }

    /// Consume one retry and schedule the next attempt per `policy`.
    pub fn mark_retry(&mut self, policy: &RetryPolicy, now: DateTime<Utc>) {
        self.retry_count += 1;
        let delay = policy.delay_for_retry(self.retry_count);
        self.not_before = if delay.is_zero() {
            None
        } else {
            Some(now + chrono::Duration::from_std(delay).unwrap_or_default())
        };
    }
}

/// Ordered task list built for one submission or resend event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch {
    tasks: Vec<Task>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task: Task) {
        self.tasks.push(task);
    }

    pub fn extend(&mut self, tasks: impl IntoIterator<Item = Task>) {
        self.tasks.extend(tasks);
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Task> {
        self.tasks.iter()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.id).collect()
    }

    pub fn retain(&mut self, f: impl FnMut(&Task) -> bool) {
        self.tasks.retain(f);
    }

    /// Drop later tasks sharing an id with an earlier one.
    pub fn dedup_by_id(&mut self) {
        let mut seen = std::collections::HashSet::new();
        self.tasks.retain(|t| seen.insert(t.id));
    }

    pub fn into_tasks(self) -> Vec<Task> {
        self.tasks
    }
}

impl From<Vec<Task>> for Batch {
    fn from(tasks: Vec<Task>) -> Self {
        Self { tasks }
    }
}

impl IntoIterator for Batch {
    type Item = Task;
    type IntoIter = std::vec::IntoIter<Task>;

    fn into_iter(self) -> Self::IntoIter {
        self.tasks.into_iter()
    }
}

/// Durable record of a dispatched batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedBatch {
    pub tasks: Vec<Task>,
    /// Tasks of this batch that already succeeded.
    #[serde(default)]
    pub completed: Vec<TaskId>,
    pub dispatched_at: DateTime<Utc>,
}

impl PersistedBatch {
    pub fn new(batch: Batch) -> Self {
        Self {
            tasks: batch.into_tasks(),
            completed: Vec::new(),
            dispatched_at: Utc::now(),
        }
    }
}

/// Backoff strategy for retries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay before every retry
    #[default]
    Fixed,
    /// base * retry
    Linear,
    /// base * 2^(retry - 1)
    Exponential,
}

impl std::str::FromStr for BackoffStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fixed" => Ok(Self::Fixed),
            "linear" => Ok(Self::Linear),
            "exponential" => Ok(Self::Exponential),
            other => Err(format!(
                "unknown backoff '{other}' (expected fixed, linear or exponential)"
            )),
        }
    }
}

/// Retry policy applied by the runtime.
///
/// The delay only decides *when* a retry runs; the attempt count is fixed by
/// `max_retries` (initial attempt + `max_retries`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the initial attempt
    pub max_retries: u32,
    /// Delay before a retry (zero = next invocation)
    pub base_delay: Duration,
    /// Maximum delay cap
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::ZERO,
            max_delay: Duration::from_secs(300),
            strategy: BackoffStrategy::Fixed,
        }
    }
}

impl RetryPolicy {
    /// Create a policy with fixed delays.
    pub fn fixed(max_retries: u32, delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
        }
    }

    /// Scale the delay per retry with `strategy`, capped at `max_delay`.
    pub fn with_backoff(mut self, strategy: BackoffStrategy, max_delay: Duration) -> Self {
        self.strategy = strategy;
        self.max_delay = max_delay;
        self
    }

    /// Delay before the given retry (1-indexed).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        if retry == 0 || self.base_delay.is_zero() {
            return Duration::ZERO;
        }

        let delay = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(retry),
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(retry - 1);
                self.base_delay.saturating_mul(factor)
            }
        };

        delay.min(self.max_delay)
    }

    /// Check if another retry is allowed after `retry_count` retries.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> (FormId, EntryId, DocumentId, NotificationId) {
        (
            FormId::new(4),
            EntryId::new(81),
            DocumentId::new("5f2a90c1").unwrap(),
            NotificationId::new("admin").unwrap(),
        )
    }

    #[test]
    fn task_ids_are_deterministic_and_scoped() {
        let (form, entry, doc, notification) = ids();

        assert_eq!(
            TaskId::for_document(form, entry, &doc),
            TaskId::for_document(form, entry, &doc)
        );
        assert_ne!(
            TaskId::for_document(form, entry, &doc),
            TaskId::for_document(form, EntryId::new(82), &doc)
        );
        assert_ne!(
            TaskId::for_document(form, entry, &doc),
            TaskId::for_notification(form, entry, &doc, &notification)
        );
    }

    #[test]
    fn constructors_set_recoverability() {
        let (form, entry, doc, notification) = ids();

        assert!(Task::produce_document(form, entry, doc.clone()).unrecoverable);
        assert!(!Task::send_notification(form, entry, &doc, notification).unrecoverable);
        assert!(!Task::cleanup(form, entry).unrecoverable);
    }

    #[test]
    fn send_notification_depends_on_its_document() {
        let (form, entry, doc, notification) = ids();
        let send = Task::send_notification(form, entry, &doc, notification);

        assert_eq!(
            send.kind.depends_on(),
            Some(&TaskId::for_document(form, entry, &doc))
        );
    }

    #[test]
    fn persisted_layout_names_the_callback() {
        let (form, entry, doc, _) = ids();
        let task = Task::produce_document(form, entry, doc);
        let value = serde_json::to_value(&task).unwrap();

        assert_eq!(value["kind"]["callback"], "produce_document");
        assert_eq!(value["kind"]["args"]["entry_id"], 81);
        assert_eq!(value["retry_count"], 0);
        assert_eq!(value["unrecoverable"], true);
        assert!(value.get("not_before").is_none());
    }

    #[test]
    fn dedup_keeps_first_occurrence() {
        let (form, entry, doc, _) = ids();
        let mut batch = Batch::new();
        batch.push(Task::produce_document(form, entry, doc.clone()));
        batch.push(Task::cleanup(form, entry));
        let mut dup = Task::produce_document(form, entry, doc);
        dup.unrecoverable = false;
        batch.push(dup);

        batch.dedup_by_id();

        assert_eq!(batch.len(), 2);
        assert!(batch.iter().next().unwrap().unrecoverable);
    }

    #[test]
    fn default_policy_allows_two_retries() {
        let policy = RetryPolicy::default();

        assert!(policy.should_retry(0));
        assert!(policy.should_retry(1));
        assert!(!policy.should_retry(2));
        assert_eq!(policy.total_attempts(), 3);
        assert_eq!(policy.delay_for_retry(1), Duration::ZERO);
    }

    #[test]
    fn backoff_strategies_scale_delay() {
        let mut policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            strategy: BackoffStrategy::Exponential,
        };
        assert_eq!(policy.delay_for_retry(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(400));

        policy.strategy = BackoffStrategy::Linear;
        assert_eq!(policy.delay_for_retry(3), Duration::from_millis(300));

        let fixed = RetryPolicy::fixed(2, Duration::from_millis(50));
        assert_eq!(fixed.delay_for_retry(2), Duration::from_millis(50));

        let capped = RetryPolicy::fixed(5, Duration::from_millis(100))
            .with_backoff(BackoffStrategy::Exponential, Duration::from_millis(250));
        assert_eq!(capped.delay_for_retry(2), Duration::from_millis(200));
        assert_eq!(capped.delay_for_retry(4), Duration::from_millis(250));
    }

    #[test]
    fn mark_retry_schedules_next_attempt() {
        let (form, entry, doc, _) = ids();
        let now = Utc::now();

        let mut task = Task::produce_document(form, entry, doc);
        task.mark_retry(&RetryPolicy::default(), now);
        assert_eq!(task.retry_count, 1);
        assert!(task.is_ready(now));

        task.mark_retry(&RetryPolicy::fixed(2, Duration::from_secs(30)), now);
        assert_eq!(task.retry_count, 2);
        assert!(!task.is_ready(now));
        assert!(task.is_ready(now + chrono::Duration::seconds(31)));
    }
}
