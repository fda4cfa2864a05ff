//! Read-only view of the host's forms, entries, notifications and document
//! configurations.
//!
//! These types are owned by the host form-processing system. The deferral
//! subsystem only reads them; nothing here performs IO.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::id::{DocumentId, EntryId, FormId, NotificationId};

/// Host event name for notifications sent when an entry is submitted.
pub const FORM_SUBMISSION_EVENT: &str = "form_submission";

/// The host action that triggered notification delivery.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerEvent {
    /// A new entry was submitted.
    FormSubmission,
    /// An operator asked to resend notifications for an existing entry.
    Resend,
}

/// An outbound notification definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRef {
    pub id: NotificationId,
    #[serde(default)]
    pub name: String,
    /// Host event this notification is configured for.
    pub event: String,
    #[serde(default = "default_true")]
    pub is_active: bool,
    #[serde(default)]
    pub conditional_logic: Option<ConditionalLogic>,
}

impl NotificationRef {
    pub fn new(id: NotificationId, event: impl Into<String>) -> Self {
        Self {
            name: id.to_string(),
            id,
            event: event.into(),
            is_active: true,
            conditional_logic: None,
        }
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.is_active = active;
        self
    }

    pub fn with_conditional_logic(mut self, logic: ConditionalLogic) -> Self {
        self.conditional_logic = Some(logic);
        self
    }

    pub fn is_submission_notification(&self) -> bool {
        self.event == FORM_SUBMISSION_EVENT
    }

    /// Whether the notification's own conditional logic passes for `entry`.
    /// No logic configured means it always passes.
    pub fn conditions_met(&self, entry: &Entry) -> bool {
        self.conditional_logic
            .as_ref()
            .map_or(true, |logic| logic.evaluate(entry))
    }
}

/// Persisted settings describing one document to produce for a form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentConfig {
    pub id: DocumentId,
    #[serde(default)]
    pub name: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub conditional_logic: Option<ConditionalLogic>,
    /// Produce and keep the document even when no notification needs it.
    #[serde(default)]
    pub always_save: bool,
    /// Notifications this document is attached to.
    #[serde(default)]
    pub notifications: Vec<NotificationId>,
}

impl DocumentConfig {
    pub fn new(id: DocumentId) -> Self {
        Self {
            name: id.to_string(),
            id,
            active: true,
            conditional_logic: None,
            always_save: false,
            notifications: Vec::new(),
        }
    }

    pub fn attached_to(mut self, notification: NotificationId) -> Self {
        self.notifications.push(notification);
        self
    }

    pub fn with_always_save(mut self, always_save: bool) -> Self {
        self.always_save = always_save;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn with_conditional_logic(mut self, logic: ConditionalLogic) -> Self {
        self.conditional_logic = Some(logic);
        self
    }

    /// Active and conditional logic (if any) passes for `entry`.
    pub fn is_active_for(&self, entry: &Entry) -> bool {
        self.active
            && self
                .conditional_logic
                .as_ref()
                .map_or(true, |logic| logic.evaluate(entry))
    }
}

/// A form together with the notifications and documents configured on it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Form {
    pub id: FormId,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub notifications: Vec<NotificationRef>,
    #[serde(default)]
    pub documents: Vec<DocumentConfig>,
}

impl Form {
    pub fn new(id: FormId) -> Self {
        Self {
            id,
            title: String::new(),
            notifications: Vec::new(),
            documents: Vec::new(),
        }
    }

    pub fn with_notification(mut self, notification: NotificationRef) -> Self {
        self.notifications.push(notification);
        self
    }

    pub fn with_document(mut self, document: DocumentConfig) -> Self {
        self.documents.push(document);
        self
    }
}

/// A submitted entry. Field values are keyed by the host's field id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub id: EntryId,
    pub form_id: FormId,
    #[serde(default)]
    pub fields: BTreeMap<String, String>,
}

impl Entry {
    pub fn new(id: EntryId, form_id: FormId) -> Self {
        Self {
            id,
            form_id,
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, field_id: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(field_id.into(), value.into());
        self
    }

    pub fn field(&self, field_id: &str) -> &str {
        self.fields.get(field_id).map(String::as_str).unwrap_or("")
    }
}

/// How rule results are combined.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicType {
    All,
    Any,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleOperator {
    Is,
    IsNot,
    Contains,
    StartsWith,
    EndsWith,
    GreaterThan,
    LessThan,
}

/// A single comparison against one entry field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub field_id: String,
    pub operator: RuleOperator,
    pub value: String,
}

impl Rule {
    pub fn new(field_id: impl Into<String>, operator: RuleOperator, value: impl Into<String>) -> Self {
        Self {
            field_id: field_id.into(),
            operator,
            value: value.into(),
        }
    }

    /// Text comparisons are case-insensitive; numeric ones never match a
    /// non-numeric operand.
    pub fn matches(&self, entry: &Entry) -> bool {
        let actual = entry.field(&self.field_id).to_lowercase();
        let expected = self.value.to_lowercase();

        match self.operator {
            RuleOperator::Is => actual == expected,
            RuleOperator::IsNot => actual != expected,
            RuleOperator::Contains => actual.contains(&expected),
            RuleOperator::StartsWith => actual.starts_with(&expected),
            RuleOperator::EndsWith => actual.ends_with(&expected),
            RuleOperator::GreaterThan => compare_numeric(&actual, &expected, |a, b| a > b),
            RuleOperator::LessThan => compare_numeric(&actual, &expected, |a, b| a < b),
        }
    }
}

fn compare_numeric(actual: &str, expected: &str, cmp: impl Fn(f64, f64) -> bool) -> bool {
    match (actual.trim().parse::<f64>(), expected.trim().parse::<f64>()) {
        (Ok(a), Ok(b)) => cmp(a, b),
        _ => false,
    }
}

/// Conditional logic attached to a notification or document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConditionalLogic {
    pub logic_type: LogicType,
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl ConditionalLogic {
    pub fn all(rules: Vec<Rule>) -> Self {
        Self {
            logic_type: LogicType::All,
            rules,
        }
    }

    pub fn any(rules: Vec<Rule>) -> Self {
        Self {
            logic_type: LogicType::Any,
            rules,
        }
    }

    /// An empty rule set always passes.
    pub fn evaluate(&self, entry: &Entry) -> bool {
        if self.rules.is_empty() {
            return true;
        }
        match self.logic_type {
            LogicType::All => self.rules.iter().all(|r| r.matches(entry)),
            LogicType::Any => self.rules.iter().any(|r| r.matches(entry)),
        }
    }
}

fn default_true() -> bool {
    true
}
