//! Notification Source port: what the host tells us about documents and
//! notifications for an entry.

use std::collections::HashSet;
use std::sync::Arc;

use docqueue_core::{
    DocumentConfig, DomainError, DomainResult, Entry, Form, FormId, NotificationId,
    NotificationRef, TriggerEvent,
};

/// Read-only queries answered by the host form-processing system.
///
/// Every lookup may fail; callers in this crate degrade failures to
/// "do not withhold" / "queue nothing".
pub trait NotificationSource: Send + Sync {
    /// Document configs of `form` whose activation and conditional logic pass
    /// for `entry`, in configuration order.
    fn active_documents(&self, form: &Form, entry: &Entry) -> DomainResult<Vec<DocumentConfig>>;

    /// Whether some other mechanism already delivers these notifications
    /// asynchronously.
    fn async_notifications_handled(
        &self,
        notification_ids: &[NotificationId],
        form: &Form,
        entry: &Entry,
        trigger: TriggerEvent,
    ) -> DomainResult<bool>;

    /// Whether `document` must be attached to `notification` for this entry.
    fn requires_attachment(
        &self,
        notification: &NotificationRef,
        document: &DocumentConfig,
        entry: &Entry,
        form: &Form,
    ) -> DomainResult<bool>;

    /// Produce the document even if no notification needs it.
    fn should_always_produce(&self, document: &DocumentConfig, _form_id: FormId) -> bool {
        document.always_save
    }
}

impl<N: NotificationSource + ?Sized> NotificationSource for Arc<N> {
    fn active_documents(&self, form: &Form, entry: &Entry) -> DomainResult<Vec<DocumentConfig>> {
        (**self).active_documents(form, entry)
    }

    fn async_notifications_handled(
        &self,
        notification_ids: &[NotificationId],
        form: &Form,
        entry: &Entry,
        trigger: TriggerEvent,
    ) -> DomainResult<bool> {
        (**self).async_notifications_handled(notification_ids, form, entry, trigger)
    }

    fn requires_attachment(
        &self,
        notification: &NotificationRef,
        document: &DocumentConfig,
        entry: &Entry,
        form: &Form,
    ) -> DomainResult<bool> {
        (**self).requires_attachment(notification, document, entry, form)
    }

    fn should_always_produce(&self, document: &DocumentConfig, form_id: FormId) -> bool {
        (**self).should_always_produce(document, form_id)
    }
}

/// Source backed by the documents configured on the `Form` itself.
///
/// A document requires attachment when the notification is listed in its
/// `notifications`. Entries belonging to another form are a lookup failure.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationSource {
    async_handled: HashSet<NotificationId>,
}

impl InMemoryNotificationSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a notification as already delivered asynchronously by the host.
    pub fn with_async_notification(mut self, id: NotificationId) -> Self {
        self.async_handled.insert(id);
        self
    }

    fn check_entry(form: &Form, entry: &Entry) -> DomainResult<()> {
        if entry.form_id != form.id {
            return Err(DomainError::not_found(format!(
                "entry {} on form {}",
                entry.id, form.id
            )));
        }
        Ok(())
    }
}

impl NotificationSource for InMemoryNotificationSource {
    fn active_documents(&self, form: &Form, entry: &Entry) -> DomainResult<Vec<DocumentConfig>> {
        Self::check_entry(form, entry)?;
        Ok(form
            .documents
            .iter()
            .filter(|d| d.is_active_for(entry))
            .cloned()
            .collect())
    }

    fn async_notifications_handled(
        &self,
        notification_ids: &[NotificationId],
        form: &Form,
        entry: &Entry,
        _trigger: TriggerEvent,
    ) -> DomainResult<bool> {
        Self::check_entry(form, entry)?;
        Ok(notification_ids
            .iter()
            .any(|id| self.async_handled.contains(id)))
    }

    fn requires_attachment(
        &self,
        notification: &NotificationRef,
        document: &DocumentConfig,
        entry: &Entry,
        form: &Form,
    ) -> DomainResult<bool> {
        Self::check_entry(form, entry)?;
        Ok(document.notifications.contains(&notification.id))
    }
}
