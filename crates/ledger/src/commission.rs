//! Commission ledger
//!
//! Creates commissions and advances them through
//! `pending -> validated -> available` (or `cancelled`).
//!
//! ## Lifecycle
//!
//! - **Create**: priced from the influencer's captured rules, bonused for
//!   client referrals, credited to `pending_balance` in the same write
//! - **Validate**: hourly batch, `pending -> validated` once the hold delay passed
//! - **Release**: hourly batch, `validated -> available` after the release delay
//! - **Cancel**: refunds and admin actions, only before funds become available

use std::sync::Arc;

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::bonus::{compute_bonus, BonusBreakdown};
use crate::clock::{month_key, Clock};
use crate::config::{ConfigProvider, LedgerConfig};
use crate::error::{LedgerError, LedgerResult};
use crate::notifications::{format_cents, NotificationOutbox, NotificationRefs};
use crate::rates::{resolve_rule, RuleKind};
use crate::recruitment::{RecruitmentOutcome, RecruitmentService};
use crate::store::{ActivityStamp, LedgerStore};
use crate::types::{
    Commission, CommissionSource, CommissionStatus, CommissionType, Influencer, NotificationKind,
    SourceKind, DEFAULT_CURRENCY,
};

/// Default page size for the validation and release batches
pub const DEFAULT_BATCH_SIZE: i64 = 100;

/// Request to create a commission
#[derive(Debug, Clone)]
pub struct NewCommission {
    pub influencer_id: Uuid,
    pub commission_type: CommissionType,
    pub source: CommissionSource,
    /// Transaction amount in cents that percentage rules are applied to
    pub transaction_amount: i64,
    pub description: Option<String>,
}

/// Counts reported by a batch run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub processed: usize,
    pub transitioned: usize,
    /// Already moved by another run
    pub skipped: usize,
    pub errors: usize,
}

/// Counts reported by a cancel-by-source run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CancelResult {
    pub cancelled: usize,
    /// Already available or cancelled
    pub skipped: usize,
    pub errors: usize,
}

/// Price a commission for `influencer` under `config`
///
/// Only client referrals are bonused; everything else is paid flat.
pub(crate) fn price_commission(
    influencer: &Influencer,
    config: &LedgerConfig,
    commission_type: CommissionType,
    rule_kind: RuleKind,
    transaction_amount: i64,
    now: OffsetDateTime,
) -> BonusBreakdown {
    let rule = resolve_rule(influencer.captured_rates.as_ref(), config, rule_kind);
    let base_amount = rule.base_amount(transaction_amount);

    match commission_type {
        CommissionType::ClientReferral => {
            compute_bonus(base_amount, influencer, config, now.date(), &month_key(now))
        }
        CommissionType::Recruitment => BonusBreakdown::flat(base_amount),
    }
}

/// Assemble a pending commission record
pub(crate) fn pending_commission(
    influencer_id: Uuid,
    commission_type: CommissionType,
    source: CommissionSource,
    bonus: BonusBreakdown,
    description: String,
    now: OffsetDateTime,
) -> Commission {
    Commission {
        id: Uuid::new_v4(),
        influencer_id,
        commission_type,
        status: CommissionStatus::Pending,
        amount: bonus.amount,
        base_amount: bonus.base_amount,
        level_multiplier: bonus.level_multiplier,
        streak_multiplier: bonus.streak_multiplier,
        top_multiplier: bonus.top_multiplier,
        currency: DEFAULT_CURRENCY.to_string(),
        source,
        description,
        created_at: now,
        validated_at: None,
        available_at: None,
        cancelled_at: None,
        cancellation_reason: None,
        updated_at: now,
    }
}

fn default_description(commission_type: CommissionType, source: &CommissionSource) -> String {
    match (commission_type, source.kind) {
        (CommissionType::ClientReferral, _) => "Client referral commission".to_string(),
        (CommissionType::Recruitment, SourceKind::CallSession) => {
            "Provider recruitment commission".to_string()
        }
        (CommissionType::Recruitment, _) => "Recruitment commission".to_string(),
    }
}

#[derive(Clone)]
pub struct CommissionService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: Arc<ConfigProvider>,
    outbox: NotificationOutbox,
    recruitment: RecruitmentService,
    batch_size: i64,
}

impl CommissionService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        config: Arc<ConfigProvider>,
    ) -> Self {
        Self {
            outbox: NotificationOutbox::new(store.clone(), clock.clone()),
            recruitment: RecruitmentService::new(store.clone(), clock.clone(), config.clone()),
            store,
            clock,
            config,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    /// Override the batch page size
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Create a pending commission priced with the rule matching its type
    pub async fn create_commission(&self, input: NewCommission) -> LedgerResult<Commission> {
        let rule_kind = match input.commission_type {
            CommissionType::ClientReferral => RuleKind::ClientReferral,
            CommissionType::Recruitment => RuleKind::Recruitment,
        };
        self.create_priced(input, rule_kind, None).await
    }

    /// Create a pending commission priced with an explicit rule
    ///
    /// `provider_referral` is credited in the same write as the commission.
    pub(crate) async fn create_priced(
        &self,
        input: NewCommission,
        rule_kind: RuleKind,
        provider_referral: Option<Uuid>,
    ) -> LedgerResult<Commission> {
        let config = self.config.current().await?;
        if !config.is_system_active {
            return Err(LedgerError::SystemDisabled);
        }

        let influencer = self
            .store
            .get_influencer(input.influencer_id)
            .await?
            .ok_or(LedgerError::InfluencerNotFound(input.influencer_id))?;
        if !influencer.is_active() {
            return Err(LedgerError::InfluencerNotActive {
                id: influencer.id,
                status: influencer.status.to_string(),
            });
        }

        let now = self.clock.now();
        let bonus = price_commission(
            &influencer,
            &config,
            input.commission_type,
            rule_kind,
            input.transaction_amount,
            now,
        );
        if bonus.amount <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "commission amount must be positive, got {}",
                bonus.amount
            )));
        }

        let description = input
            .description
            .unwrap_or_else(|| default_description(input.commission_type, &input.source));
        let commission = pending_commission(
            influencer.id,
            input.commission_type,
            input.source,
            bonus,
            description,
            now,
        );

        let month = month_key(now);
        self.store
            .insert_commission(
                &commission,
                ActivityStamp {
                    date: now.date(),
                    month: &month,
                    provider_referral,
                },
            )
            .await?;

        tracing::info!(
            influencer_id = %influencer.id,
            commission_id = %commission.id,
            commission_type = %commission.commission_type,
            base_amount = commission.base_amount,
            amount = commission.amount,
            level = bonus.level,
            "Commission created"
        );

        self.outbox
            .notify(
                influencer.id,
                NotificationKind::CommissionEarned,
                "New commission",
                format!(
                    "You earned ${} ({}).",
                    format_cents(commission.amount),
                    commission.description
                ),
                NotificationRefs::commission(commission.id),
            )
            .await;

        if commission.commission_type == CommissionType::ClientReferral {
            self.run_recruitment_check(influencer.id).await;
        }

        Ok(commission)
    }

    async fn run_recruitment_check(&self, recruit_id: Uuid) {
        match self
            .recruitment
            .check_and_pay_recruitment_commission(recruit_id)
            .await
        {
            Ok(RecruitmentOutcome::Paid {
                commission_id,
                amount,
            }) => {
                tracing::info!(
                    recruit_id = %recruit_id,
                    commission_id = %commission_id,
                    amount,
                    "Recruitment threshold reached"
                );
            }
            Ok(outcome) => {
                tracing::debug!(recruit_id = %recruit_id, outcome = ?outcome, "Recruitment check");
            }
            Err(e) => {
                tracing::warn!(
                    recruit_id = %recruit_id,
                    error = %e,
                    "Recruitment check failed"
                );
            }
        }
    }

    pub async fn get_commission(&self, id: Uuid) -> LedgerResult<Commission> {
        self.store
            .get_commission(id)
            .await?
            .ok_or(LedgerError::CommissionNotFound(id))
    }

    pub async fn list_for_influencer(&self, influencer_id: Uuid) -> LedgerResult<Vec<Commission>> {
        self.store.list_commissions_for_influencer(influencer_id).await
    }

    /// Move pending commissions past the hold delay to validated
    pub async fn validate_pending_commissions(&self) -> LedgerResult<BatchResult> {
        let config = self.config.current().await?;
        let now = self.clock.now();
        let cutoff = now - config.hold_delay();

        let due = self
            .store
            .list_due_commissions(CommissionStatus::Pending, cutoff, self.batch_size)
            .await?;

        let result = self
            .advance_batch(
                due,
                CommissionStatus::Pending,
                CommissionStatus::Validated,
                now,
            )
            .await;

        tracing::info!(
            processed = result.processed,
            transitioned = result.transitioned,
            skipped = result.skipped,
            errors = result.errors,
            "Commission validation complete"
        );
        Ok(result)
    }

    /// Move validated commissions past the release delay to available
    pub async fn release_validated_commissions(&self) -> LedgerResult<BatchResult> {
        let config = self.config.current().await?;
        let now = self.clock.now();
        let cutoff = now - config.release_delay();

        let due = self
            .store
            .list_due_commissions(CommissionStatus::Validated, cutoff, self.batch_size)
            .await?;

        let result = self
            .advance_batch(
                due,
                CommissionStatus::Validated,
                CommissionStatus::Available,
                now,
            )
            .await;

        tracing::info!(
            processed = result.processed,
            transitioned = result.transitioned,
            skipped = result.skipped,
            errors = result.errors,
            "Commission release complete"
        );
        Ok(result)
    }

    async fn advance_batch(
        &self,
        due: Vec<Commission>,
        from: CommissionStatus,
        to: CommissionStatus,
        now: OffsetDateTime,
    ) -> BatchResult {
        let mut result = BatchResult::default();

        for commission in due {
            result.processed += 1;
            match self
                .store
                .transition_commission(commission.id, from, to, now, None)
                .await
            {
                Ok(Some(moved)) => {
                    result.transitioned += 1;
                    self.notify_transition(&moved).await;
                }
                Ok(None) => result.skipped += 1,
                Err(e) => {
                    result.errors += 1;
                    tracing::error!(
                        commission_id = %commission.id,
                        from = %from,
                        to = %to,
                        error = %e,
                        "Failed to advance commission"
                    );
                }
            }
        }

        result
    }

    async fn notify_transition(&self, commission: &Commission) {
        let (kind, title, message) = match commission.status {
            CommissionStatus::Validated => (
                NotificationKind::CommissionValidated,
                "Commission validated",
                format!(
                    "Your ${} commission passed the hold period.",
                    format_cents(commission.amount)
                ),
            ),
            CommissionStatus::Available => (
                NotificationKind::CommissionAvailable,
                "Commission available",
                format!(
                    "${} is now available for withdrawal.",
                    format_cents(commission.amount)
                ),
            ),
            _ => return,
        };
        self.outbox
            .notify(
                commission.influencer_id,
                kind,
                title,
                message,
                NotificationRefs::commission(commission.id),
            )
            .await;
    }

    /// Cancel a pending or validated commission and reverse its balance
    pub async fn cancel_commission(&self, id: Uuid, reason: &str) -> LedgerResult<Commission> {
        let commission = self.get_commission(id).await?;
        let from = commission.status;
        if !from.can_transition_to(CommissionStatus::Cancelled) {
            return Err(LedgerError::InvalidTransition {
                entity: "commission",
                from: from.to_string(),
                to: CommissionStatus::Cancelled.to_string(),
            });
        }

        let now = self.clock.now();
        match self
            .store
            .transition_commission(id, from, CommissionStatus::Cancelled, now, Some(reason))
            .await?
        {
            Some(cancelled) => {
                tracing::info!(
                    commission_id = %id,
                    influencer_id = %cancelled.influencer_id,
                    amount = cancelled.amount,
                    from = %from,
                    reason,
                    "Commission cancelled"
                );
                Ok(cancelled)
            }
            None => {
                // Moved underneath us; report against the status it moved to
                let current = self.get_commission(id).await?;
                Err(LedgerError::InvalidTransition {
                    entity: "commission",
                    from: current.status.to_string(),
                    to: CommissionStatus::Cancelled.to_string(),
                })
            }
        }
    }

    /// Cancel every cancellable commission produced by one source event
    pub async fn cancel_commissions_for_source(
        &self,
        source_kind: SourceKind,
        source_id: &str,
        reason: &str,
    ) -> LedgerResult<CancelResult> {
        let commissions = self
            .store
            .list_commissions_by_source(source_kind, source_id)
            .await?;
        let now = self.clock.now();
        let mut result = CancelResult::default();

        for commission in commissions {
            if !commission.status.can_transition_to(CommissionStatus::Cancelled) {
                result.skipped += 1;
                continue;
            }
            match self
                .store
                .transition_commission(
                    commission.id,
                    commission.status,
                    CommissionStatus::Cancelled,
                    now,
                    Some(reason),
                )
                .await
            {
                Ok(Some(_)) => result.cancelled += 1,
                Ok(None) => result.skipped += 1,
                Err(e) => {
                    result.errors += 1;
                    tracing::error!(
                        commission_id = %commission.id,
                        error = %e,
                        "Failed to cancel commission"
                    );
                }
            }
        }

        tracing::info!(
            source_kind = %source_kind,
            source_id,
            cancelled = result.cancelled,
            skipped = result.skipped,
            errors = result.errors,
            "Cancelled commissions for source"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use crate::types::InfluencerStatus;

    fn call(id: &str) -> CommissionSource {
        CommissionSource::new(SourceKind::CallSession, id)
    }

    fn client_referral(influencer_id: Uuid, session: &str) -> NewCommission {
        NewCommission {
            influencer_id,
            commission_type: CommissionType::ClientReferral,
            source: call(session),
            transaction_amount: 4900,
            description: None,
        }
    }

    #[tokio::test]
    async fn test_create_credits_pending_balance() {
        let h = Harness::new().await;
        let influencer = h.influencer("Ada").await;

        let commission = h
            .ledger
            .commissions
            .create_commission(client_referral(influencer.id, "call-1"))
            .await
            .unwrap();
        assert_eq!(commission.status, CommissionStatus::Pending);
        assert_eq!(commission.amount, 1000);

        let stored = h.reload(influencer.id).await;
        assert_eq!(stored.balances.pending, 1000);
        assert_eq!(stored.total_commissions, 1);
        assert_eq!(stored.total_clients, 1);
        assert_eq!(stored.month_stats.earnings, 1000);
        assert_eq!(stored.current_streak, 1);

        let notes = h.store.list_notifications(influencer.id).await.unwrap();
        assert_eq!(notes[0].kind, NotificationKind::CommissionEarned);
    }

    #[tokio::test]
    async fn test_duplicate_source_rejected() {
        let h = Harness::new().await;
        let influencer = h.influencer("Ada").await;
        let service = &h.ledger.commissions;

        service
            .create_commission(client_referral(influencer.id, "call-1"))
            .await
            .unwrap();
        let err = service
            .create_commission(client_referral(influencer.id, "call-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateCommission));
        assert_eq!(h.reload(influencer.id).await.balances.pending, 1000);
    }

    #[tokio::test]
    async fn test_inactive_influencer_and_disabled_system() {
        let h = Harness::new().await;
        let influencer = h.influencer("Ada").await;
        h.store
            .set_influencer_status(influencer.id, InfluencerStatus::Suspended)
            .await
            .unwrap();

        let err = h
            .ledger
            .commissions
            .create_commission(client_referral(influencer.id, "call-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InfluencerNotActive { .. }));

        let missing = h
            .ledger
            .commissions
            .create_commission(client_referral(Uuid::new_v4(), "call-2"))
            .await
            .unwrap_err();
        assert!(matches!(missing, LedgerError::InfluencerNotFound(_)));

        h.update_config(|c| c.is_system_active = false).await;
        let err = h
            .ledger
            .commissions
            .create_commission(client_referral(influencer.id, "call-3"))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::SystemDisabled));
        assert_eq!(h.reload(influencer.id).await.total_commissions, 0);
    }

    #[tokio::test]
    async fn test_validate_then_release() {
        let h = Harness::new().await;
        let influencer = h.influencer("Ada").await;
        let service = &h.ledger.commissions;
        service
            .create_commission(client_referral(influencer.id, "call-1"))
            .await
            .unwrap();

        // Hold not yet elapsed
        h.clock.advance(time::Duration::days(6));
        let early = service.validate_pending_commissions().await.unwrap();
        assert_eq!(early.transitioned, 0);

        h.clock.advance(time::Duration::days(1));
        let validated = service.validate_pending_commissions().await.unwrap();
        assert_eq!(validated.transitioned, 1);
        let stored = h.reload(influencer.id).await;
        assert_eq!(stored.balances.pending, 0);
        assert_eq!(stored.balances.validated, 1000);

        let too_soon = service.release_validated_commissions().await.unwrap();
        assert_eq!(too_soon.processed, 0);

        h.clock.advance(time::Duration::hours(24));
        let released = service.release_validated_commissions().await.unwrap();
        assert_eq!(released.transitioned, 1);
        let stored = h.reload(influencer.id).await;
        assert_eq!(stored.balances.validated, 0);
        assert_eq!(stored.balances.available, 1000);
        assert_eq!(stored.balances.total_earned, 1000);
    }

    #[tokio::test]
    async fn test_cancel_reverses_matching_bucket() {
        let h = Harness::new().await;
        let influencer = h.influencer("Ada").await;
        let service = &h.ledger.commissions;
        let commission = service
            .create_commission(client_referral(influencer.id, "call-1"))
            .await
            .unwrap();

        let cancelled = service
            .cancel_commission(commission.id, "chargeback")
            .await
            .unwrap();
        assert_eq!(cancelled.status, CommissionStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason.as_deref(), Some("chargeback"));
        assert_eq!(h.reload(influencer.id).await.balances.pending, 0);

        let again = service
            .cancel_commission(commission.id, "chargeback")
            .await
            .unwrap_err();
        assert!(matches!(again, LedgerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_available_commission_cannot_be_cancelled() {
        let h = Harness::new().await;
        let influencer = h.influencer("Ada").await;
        let service = &h.ledger.commissions;
        let commission = service
            .create_commission(client_referral(influencer.id, "call-1"))
            .await
            .unwrap();
        h.mature_all().await;

        let err = service
            .cancel_commission(commission.id, "late refund")
            .await
            .unwrap_err();
        assert_eq!(err.code(), "INVALID_TRANSITION");
        assert_eq!(h.reload(influencer.id).await.balances.available, 1000);
    }

    #[tokio::test]
    async fn test_cancel_by_source_skips_available() {
        let h = Harness::new().await;
        let first = h.influencer("Ada").await;
        let second = h.influencer("Grace").await;
        let service = &h.ledger.commissions;

        service
            .create_commission(client_referral(first.id, "call-9"))
            .await
            .unwrap();
        h.mature_all().await;
        service
            .create_commission(client_referral(second.id, "call-9"))
            .await
            .unwrap();

        let result = service
            .cancel_commissions_for_source(SourceKind::CallSession, "call-9", "refunded")
            .await
            .unwrap();
        assert_eq!(result.cancelled, 1);
        assert_eq!(result.skipped, 1);
        assert_eq!(h.reload(second.id).await.balances.pending, 0);
        assert_eq!(h.reload(first.id).await.balances.available, 1000);
    }

    #[tokio::test]
    async fn test_batch_respects_page_size() {
        let h = Harness::new().await;
        let influencer = h.influencer("Ada").await;
        let service = h.ledger.commissions.clone().with_batch_size(2);
        for i in 0..5 {
            service
                .create_commission(client_referral(influencer.id, &format!("call-{}", i)))
                .await
                .unwrap();
        }
        h.clock.advance(time::Duration::days(8));

        let first = service.validate_pending_commissions().await.unwrap();
        assert_eq!(first.transitioned, 2);
        let second = service.validate_pending_commissions().await.unwrap();
        assert_eq!(second.transitioned, 2);
        let third = service.validate_pending_commissions().await.unwrap();
        assert_eq!(third.transitioned, 1);
    }
}
