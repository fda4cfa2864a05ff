//! Decision Engine: should a notification's synchronous delivery be withheld?

use docqueue_core::{Entry, Form, NotificationRef, TriggerEvent};
use tracing::{debug, warn};

use crate::accumulator::Accumulator;
use crate::source::NotificationSource;

/// One notification the host is about to send.
#[derive(Debug, Clone, Copy)]
pub struct Candidate<'a> {
    pub notification: &'a NotificationRef,
    pub form: &'a Form,
    pub entry: &'a Entry,
    pub trigger: TriggerEvent,
    /// Another component already withheld this notification.
    pub already_withheld: bool,
}

impl<'a> Candidate<'a> {
    pub fn new(
        notification: &'a NotificationRef,
        form: &'a Form,
        entry: &'a Entry,
        trigger: TriggerEvent,
    ) -> Self {
        Self {
            notification,
            form,
            entry,
            trigger,
            already_withheld: false,
        }
    }

    pub fn with_already_withheld(mut self, already_withheld: bool) -> Self {
        self.already_withheld = already_withheld;
        self
    }
}

pub struct DecisionEngine<N: NotificationSource> {
    source: N,
    background_processing: bool,
}

impl<N: NotificationSource> DecisionEngine<N> {
    pub fn new(source: N) -> Self {
        Self {
            source,
            background_processing: true,
        }
    }

    pub fn with_background_processing(mut self, enabled: bool) -> Self {
        self.background_processing = enabled;
        self
    }

    /// Decide whether to withhold `candidate.notification`, recording it in
    /// `accumulator` when the answer is yes.
    ///
    /// Never fails: lookup errors are logged and answered with `false`.
    pub fn should_withhold(&self, accumulator: &mut Accumulator, candidate: Candidate<'_>) -> bool {
        if !self.background_processing || candidate.already_withheld {
            return false;
        }

        let Candidate {
            notification,
            form,
            entry,
            trigger,
            ..
        } = candidate;

        // Resends are not re-validated against activation or conditional logic.
        if trigger == TriggerEvent::FormSubmission
            && (!notification.is_active || !notification.conditions_met(entry))
        {
            debug!(
                notification_id = %notification.id,
                entry_id = %entry.id,
                "notification inactive or conditions not met"
            );
            return false;
        }

        match self.source.async_notifications_handled(
            std::slice::from_ref(&notification.id),
            form,
            entry,
            trigger,
        ) {
            Ok(false) => {}
            Ok(true) => {
                debug!(
                    notification_id = %notification.id,
                    entry_id = %entry.id,
                    "asynchronous delivery already handled by host"
                );
                return false;
            }
            Err(e) => {
                warn!(
                    notification_id = %notification.id,
                    entry_id = %entry.id,
                    error = %e,
                    "async notification check failed; not withholding"
                );
                return false;
            }
        }

        let documents = match self.source.active_documents(form, entry) {
            Ok(documents) => documents,
            Err(e) => {
                warn!(
                    notification_id = %notification.id,
                    entry_id = %entry.id,
                    error = %e,
                    "active document lookup failed; not withholding"
                );
                return false;
            }
        };

        for document in &documents {
            match self
                .source
                .requires_attachment(notification, document, entry, form)
            {
                Ok(true) => {
                    accumulator.record(notification);
                    debug!(
                        notification_id = %notification.id,
                        document_id = %document.id,
                        entry_id = %entry.id,
                        "withholding notification until document is produced"
                    );
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        notification_id = %notification.id,
                        document_id = %document.id,
                        error = %e,
                        "attachment check failed"
                    );
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::InMemoryNotificationSource;
    use docqueue_core::{
        ConditionalLogic, DocumentConfig, DocumentId, EntryId, FormId, NotificationId, Rule,
        RuleOperator, FORM_SUBMISSION_EVENT,
    };

    fn nid(id: &str) -> NotificationId {
        NotificationId::new(id).unwrap()
    }

    fn form_with(notification: NotificationRef) -> Form {
        let id = notification.id.clone();
        Form::new(FormId::new(3))
            .with_notification(notification)
            .with_document(DocumentConfig::new(DocumentId::new("invoice").unwrap()).attached_to(id))
    }

    fn engine() -> DecisionEngine<InMemoryNotificationSource> {
        DecisionEngine::new(InMemoryNotificationSource::new())
    }

    #[test]
    fn withholds_notification_needing_an_attachment() {
        let form = form_with(NotificationRef::new(nid("admin"), FORM_SUBMISSION_EVENT));
        let entry = Entry::new(EntryId::new(10), form.id);
        let mut acc = Accumulator::new();

        let candidate = Candidate::new(&form.notifications[0], &form, &entry, TriggerEvent::FormSubmission);
        assert!(engine().should_withhold(&mut acc, candidate));
        assert_eq!(acc.ids(), vec![nid("admin")]);
    }

    #[test]
    fn first_decision_wins() {
        let form = form_with(NotificationRef::new(nid("admin"), FORM_SUBMISSION_EVENT));
        let entry = Entry::new(EntryId::new(10), form.id);
        let mut acc = Accumulator::new();

        let candidate = Candidate::new(&form.notifications[0], &form, &entry, TriggerEvent::FormSubmission)
            .with_already_withheld(true);
        assert!(!engine().should_withhold(&mut acc, candidate));
        assert!(acc.is_empty());
    }

    #[test]
    fn inactive_notification_is_only_checked_on_submission() {
        let form = form_with(NotificationRef::new(nid("admin"), FORM_SUBMISSION_EVENT).with_active(false));
        let entry = Entry::new(EntryId::new(10), form.id);
        let engine = engine();

        let mut acc = Accumulator::new();
        let submission = Candidate::new(&form.notifications[0], &form, &entry, TriggerEvent::FormSubmission);
        assert!(!engine.should_withhold(&mut acc, submission));

        let resend = Candidate::new(&form.notifications[0], &form, &entry, TriggerEvent::Resend);
        assert!(engine.should_withhold(&mut acc, resend));
    }

    #[test]
    fn failed_notification_conditions_are_not_withheld() {
        let logic = ConditionalLogic::all(vec![Rule::new("2", RuleOperator::Is, "send")]);
        let form = form_with(NotificationRef::new(nid("admin"), FORM_SUBMISSION_EVENT).with_conditional_logic(logic));
        let engine = engine();
        let mut acc = Accumulator::new();

        let entry = Entry::new(EntryId::new(10), form.id).with_field("2", "skip");
        let candidate = Candidate::new(&form.notifications[0], &form, &entry, TriggerEvent::FormSubmission);
        assert!(!engine.should_withhold(&mut acc, candidate));

        let entry = Entry::new(EntryId::new(11), form.id).with_field("2", "send");
        let candidate = Candidate::new(&form.notifications[0], &form, &entry, TriggerEvent::FormSubmission);
        assert!(engine.should_withhold(&mut acc, candidate));
    }

    #[test]
    fn no_attached_document_means_no_withholding() {
        let form = Form::new(FormId::new(3))
            .with_notification(NotificationRef::new(nid("user"), FORM_SUBMISSION_EVENT))
            .with_document(DocumentConfig::new(DocumentId::new("invoice").unwrap()).attached_to(nid("admin")));
        let entry = Entry::new(EntryId::new(10), form.id);
        let mut acc = Accumulator::new();

        let candidate = Candidate::new(&form.notifications[0], &form, &entry, TriggerEvent::FormSubmission);
        assert!(!engine().should_withhold(&mut acc, candidate));
        assert!(acc.is_empty());
    }

    #[test]
    fn lookup_failure_degrades_to_not_withholding() {
        let form = form_with(NotificationRef::new(nid("admin"), FORM_SUBMISSION_EVENT));
        let stray = Entry::new(EntryId::new(10), FormId::new(404));
        let mut acc = Accumulator::new();

        let candidate = Candidate::new(&form.notifications[0], &form, &stray, TriggerEvent::FormSubmission);
        assert!(!engine().should_withhold(&mut acc, candidate));
        assert!(acc.is_empty());
    }

    #[test]
    fn disabled_background_processing_withholds_nothing() {
        let form = form_with(NotificationRef::new(nid("admin"), FORM_SUBMISSION_EVENT));
        let entry = Entry::new(EntryId::new(10), form.id);
        let mut acc = Accumulator::new();

        let candidate = Candidate::new(&form.notifications[0], &form, &entry, TriggerEvent::FormSubmission);
        assert!(!engine().with_background_processing(false).should_withhold(&mut acc, candidate));
    }
}
