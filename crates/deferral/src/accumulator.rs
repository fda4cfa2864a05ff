//! Request-scoped record of withheld notifications.

use docqueue_core::{NotificationId, NotificationRef};

/// Notifications the decision engine withheld during the current request.
///
/// Created per triggering event, filled by `DecisionEngine::should_withhold`
/// and consumed once by `TaskBuilder::build_batch`. Keeps first-seen order
/// and holds each notification id at most once.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Accumulator {
    withheld: Vec<NotificationRef>,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the notification was already recorded.
    pub fn record(&mut self, notification: &NotificationRef) -> bool {
        if self.contains(&notification.id) {
            return false;
        }
        self.withheld.push(notification.clone());
        true
    }

    pub fn contains(&self, id: &NotificationId) -> bool {
        self.withheld.iter().any(|n| &n.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.withheld.is_empty()
    }

    pub fn len(&self) -> usize {
        self.withheld.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, NotificationRef> {
        self.withheld.iter()
    }

    pub fn ids(&self) -> Vec<NotificationId> {
        self.withheld.iter().map(|n| n.id.clone()).collect()
    }

    pub fn clear(&mut self) {
        self.withheld.clear();
    }
}
