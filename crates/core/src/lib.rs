//! `docqueue-core`: domain building blocks for deferred document delivery.
//!
//! This crate contains **pure domain** types (no infrastructure concerns):
//! identifiers, the domain error and the host's form/entry model.

pub mod error;
pub mod id;
pub mod model;

pub use error::{DomainError, DomainResult};
pub use id::{DocumentId, EntryId, FormId, NotificationId};
pub use model::{
    ConditionalLogic, DocumentConfig, Entry, Form, LogicType, NotificationRef, Rule, RuleOperator,
    TriggerEvent, FORM_SUBMISSION_EVENT,
};
