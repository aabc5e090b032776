//! Notification outbox
//!
//! The ledger only records notifications; delivery happens elsewhere. Writes
//! are best effort: a failed insert is logged and never undoes or fails the
//! ledger operation that produced it.

use std::sync::Arc;

use uuid::Uuid;

use crate::clock::Clock;
use crate::error::LedgerResult;
use crate::store::LedgerStore;
use crate::types::{Notification, NotificationKind};

/// Optional links carried by a notification
#[derive(Debug, Clone, Copy, Default)]
pub struct NotificationRefs {
    pub commission_id: Option<Uuid>,
    pub withdrawal_id: Option<Uuid>,
}

impl NotificationRefs {
    pub fn commission(id: Uuid) -> Self {
        Self {
            commission_id: Some(id),
            withdrawal_id: None,
        }
    }

    pub fn withdrawal(id: Uuid) -> Self {
        Self {
            commission_id: None,
            withdrawal_id: Some(id),
        }
    }
}

#[derive(Clone)]
pub struct NotificationOutbox {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl NotificationOutbox {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Record a notification, logging instead of failing
    pub async fn notify(
        &self,
        influencer_id: Uuid,
        kind: NotificationKind,
        title: impl Into<String>,
        message: impl Into<String>,
        refs: NotificationRefs,
    ) {
        let notification = Notification {
            id: Uuid::new_v4(),
            influencer_id,
            kind,
            title: title.into(),
            message: message.into(),
            commission_id: refs.commission_id,
            withdrawal_id: refs.withdrawal_id,
            created_at: self.clock.now(),
            delivered_at: None,
        };

        if let Err(e) = self.store.insert_notification(&notification).await {
            tracing::error!(
                influencer_id = %influencer_id,
                kind = %kind,
                error = %e,
                "Failed to write notification"
            );
        }
    }

    /// Undelivered notifications, oldest first, for the delivery pipeline
    pub async fn pending(&self, limit: i64) -> LedgerResult<Vec<Notification>> {
        self.store.list_undelivered_notifications(limit).await
    }

    /// Returns false when the notification was already delivered
    pub async fn mark_delivered(&self, id: Uuid) -> LedgerResult<bool> {
        self.store
            .mark_notification_delivered(id, self.clock.now())
            .await
    }

    pub async fn list_for_influencer(
        &self,
        influencer_id: Uuid,
    ) -> LedgerResult<Vec<Notification>> {
        self.store.list_notifications(influencer_id).await
    }
}

/// Cents as a `12.34` string for notification copy
pub(crate) fn format_cents(cents: i64) -> String {
    let sign = if cents < 0 { "-" } else { "" };
    let abs = cents.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use time::macros::datetime;

    #[test]
    fn test_format_cents() {
        assert_eq!(format_cents(0), "0.00");
        assert_eq!(format_cents(1800), "18.00");
        assert_eq!(format_cents(5), "0.05");
        assert_eq!(format_cents(-250), "-2.50");
    }

    #[tokio::test]
    async fn test_outbox_delivery_cycle() {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(datetime!(2026-06-01 09:00 UTC)));
        let outbox = NotificationOutbox::new(store, clock);
        let influencer_id = Uuid::new_v4();

        outbox
            .notify(
                influencer_id,
                NotificationKind::RankAchieved,
                "Top 3!",
                "You finished #1",
                NotificationRefs::default(),
            )
            .await;

        let pending = outbox.pending(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].kind, NotificationKind::RankAchieved);

        assert!(outbox.mark_delivered(pending[0].id).await.unwrap());
        assert!(!outbox.mark_delivered(pending[0].id).await.unwrap());
        assert!(outbox.pending(10).await.unwrap().is_empty());
        assert_eq!(outbox.list_for_influencer(influencer_id).await.unwrap().len(), 1);
    }
}
