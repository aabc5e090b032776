//! Recruitment settlement
//!
//! A recruiter is paid once, when the influencer they recruited has earned
//! `recruitment_threshold` in client referral commissions within the
//! recruitment window. The payment itself happens in
//! [`LedgerStore::settle_recruitment`], which re-checks the paid flag under a
//! row lock so concurrent triggers pay at most once.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::clock::{month_key, Clock};
use crate::commission::{pending_commission, price_commission};
use crate::config::ConfigProvider;
use crate::error::{LedgerError, LedgerResult};
use crate::notifications::{format_cents, NotificationOutbox, NotificationRefs};
use crate::rates::RuleKind;
use crate::store::{ActivityStamp, LedgerStore, SettlementOutcome};
use crate::types::{CommissionSource, CommissionType, NotificationKind, SourceKind};

/// Why a recruitment check did or did not pay
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecruitmentOutcome {
    SystemDisabled,
    RecruitNotFound,
    NoRecruiter,
    NoTrackingRecord,
    AlreadyPaid,
    Inactive,
    /// Window ended; the record was deactivated
    WindowExpired,
    BelowThreshold { earned: i64, threshold: i64 },
    RecruiterInactive,
    Paid { commission_id: Uuid, amount: i64 },
}

#[derive(Clone)]
pub struct RecruitmentService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: Arc<ConfigProvider>,
    outbox: NotificationOutbox,
}

impl RecruitmentService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        config: Arc<ConfigProvider>,
    ) -> Self {
        Self {
            outbox: NotificationOutbox::new(store.clone(), clock.clone()),
            store,
            clock,
            config,
        }
    }

    /// Pay the recruiter of `recruit_id` once the threshold is reached
    ///
    /// Every short-circuit is a normal outcome, not an error.
    pub async fn check_and_pay_recruitment_commission(
        &self,
        recruit_id: Uuid,
    ) -> LedgerResult<RecruitmentOutcome> {
        let Some(recruit) = self.store.get_influencer(recruit_id).await? else {
            return Ok(RecruitmentOutcome::RecruitNotFound);
        };
        if recruit.recruited_by.is_none() {
            return Ok(RecruitmentOutcome::NoRecruiter);
        }
        let Some(record) = self.store.find_recruitment_for_recruit(recruit_id).await? else {
            return Ok(RecruitmentOutcome::NoTrackingRecord);
        };
        if record.commission_paid {
            return Ok(RecruitmentOutcome::AlreadyPaid);
        }
        if !record.is_active {
            return Ok(RecruitmentOutcome::Inactive);
        }

        let now = self.clock.now();
        if now > record.commission_window_end {
            if self.store.deactivate_recruitment(record.id, now).await? {
                tracing::info!(
                    recruitment_id = %record.id,
                    recruiter_id = %record.recruiter_id,
                    recruit_id = %recruit_id,
                    "Recruitment window expired"
                );
            }
            return Ok(RecruitmentOutcome::WindowExpired);
        }

        let config = self.config.current().await?;
        if !config.is_system_active {
            return Ok(RecruitmentOutcome::SystemDisabled);
        }

        let earned = self.store.sum_client_referral_earnings(recruit_id).await?;
        if earned < config.recruitment_threshold {
            return Ok(RecruitmentOutcome::BelowThreshold {
                earned,
                threshold: config.recruitment_threshold,
            });
        }

        let Some(recruiter) = self.store.get_influencer(record.recruiter_id).await? else {
            return Ok(RecruitmentOutcome::RecruiterInactive);
        };

        let bonus = price_commission(
            &recruiter,
            &config,
            CommissionType::Recruitment,
            RuleKind::Recruitment,
            0,
            now,
        );
        let source = CommissionSource::new(SourceKind::User, recruit_id.to_string()).with_details(
            serde_json::json!({
                "recruit_name": recruit.display_name,
                "recruit_earned": earned,
                "threshold": config.recruitment_threshold,
            }),
        );
        let commission = pending_commission(
            recruiter.id,
            CommissionType::Recruitment,
            source,
            bonus,
            format!("Recruitment bonus for {}", recruit.display_name),
            now,
        );

        let month = month_key(now);
        let outcome = self
            .store
            .settle_recruitment(
                record.id,
                &commission,
                ActivityStamp {
                    date: now.date(),
                    month: &month,
                    provider_referral: None,
                },
            )
            .await;

        match outcome {
            Ok(SettlementOutcome::Paid) => {}
            Ok(SettlementOutcome::AlreadyPaid) | Err(LedgerError::DuplicateCommission) => {
                tracing::info!(
                    recruitment_id = %record.id,
                    recruit_id = %recruit_id,
                    "Recruitment already paid by a concurrent check"
                );
                return Ok(RecruitmentOutcome::AlreadyPaid);
            }
            Ok(SettlementOutcome::RecruiterInactive)
            | Err(LedgerError::InfluencerNotActive { .. }) => {
                tracing::warn!(
                    recruiter_id = %record.recruiter_id,
                    recruit_id = %recruit_id,
                    "Recruiter inactive; recruitment bonus withheld"
                );
                return Ok(RecruitmentOutcome::RecruiterInactive);
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            recruiter_id = %recruiter.id,
            recruit_id = %recruit_id,
            commission_id = %commission.id,
            amount = commission.amount,
            earned,
            "Recruitment commission paid"
        );

        self.outbox
            .notify(
                recruiter.id,
                NotificationKind::RecruitmentReward,
                "Recruitment bonus",
                format!(
                    "{} reached ${} in earnings. You earned ${}.",
                    recruit.display_name,
                    format_cents(config.recruitment_threshold),
                    format_cents(commission.amount)
                ),
                NotificationRefs::commission(commission.id),
            )
            .await;

        Ok(RecruitmentOutcome::Paid {
            commission_id: commission.id,
            amount: commission.amount,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::Harness;
    use crate::types::{CommissionStatus, InfluencerStatus};

    #[tokio::test]
    async fn test_below_threshold_is_noop() {
        let h = Harness::new().await;
        let recruiter = h.influencer("Mentor").await;
        let recruit = h.recruit(&recruiter, "Rookie").await;
        h.client_commissions(recruit.id, 4).await;

        let outcome = h
            .ledger
            .recruitment
            .check_and_pay_recruitment_commission(recruit.id)
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RecruitmentOutcome::BelowThreshold {
                earned: 4000,
                threshold: 5000
            }
        );
        assert_eq!(h.reload(recruiter.id).await.total_commissions, 0);
    }

    #[tokio::test]
    async fn test_paid_once_at_threshold() {
        let h = Harness::new().await;
        let recruiter = h.influencer("Mentor").await;
        let recruit = h.recruit(&recruiter, "Rookie").await;

        // The fifth commission triggers the payment through create_commission
        h.client_commissions(recruit.id, 5).await;

        let stored = h.reload(recruiter.id).await;
        assert_eq!(stored.balances.pending, 500);
        assert_eq!(stored.total_recruits, 1);
        assert_eq!(stored.month_stats.recruits, 1);

        let record = h
            .store
            .find_recruitment_for_recruit(recruit.id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.commission_paid);
        let paid = h
            .store
            .get_commission(record.commission_id.unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(paid.commission_type, CommissionType::Recruitment);
        assert_eq!(paid.status, CommissionStatus::Pending);

        let again = h
            .ledger
            .recruitment
            .check_and_pay_recruitment_commission(recruit.id)
            .await
            .unwrap();
        assert_eq!(again, RecruitmentOutcome::AlreadyPaid);
    }

    #[tokio::test]
    async fn test_inactive_recruiter_not_paid() {
        let h = Harness::new().await;
        let recruiter = h.influencer("Mentor").await;
        let recruit = h.recruit(&recruiter, "Rookie").await;
        h.store
            .set_influencer_status(recruiter.id, InfluencerStatus::Banned)
            .await
            .unwrap();
        h.client_commissions(recruit.id, 5).await;

        let outcome = h
            .ledger
            .recruitment
            .check_and_pay_recruitment_commission(recruit.id)
            .await
            .unwrap();
        assert_eq!(outcome, RecruitmentOutcome::RecruiterInactive);
        let record = h
            .store
            .find_recruitment_for_recruit(recruit.id)
            .await
            .unwrap()
            .unwrap();
        assert!(!record.commission_paid);
    }

    #[tokio::test]
    async fn test_unrecruited_influencer_short_circuits() {
        let h = Harness::new().await;
        let solo = h.influencer("Solo").await;
        let outcome = h
            .ledger
            .recruitment
            .check_and_pay_recruitment_commission(solo.id)
            .await
            .unwrap();
        assert_eq!(outcome, RecruitmentOutcome::NoRecruiter);

        let missing = h
            .ledger
            .recruitment
            .check_and_pay_recruitment_commission(Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(missing, RecruitmentOutcome::RecruitNotFound);
    }
}
