//! Persistence seam for the ledger
//!
//! Every method that touches balances is a single atomic unit: the status
//! write and the balance increments commit together or not at all. Callers
//! never read a balance and write it back.
//!
//! ## Backends
//!
//! - [`PgStore`]: Postgres via sqlx, row locks and conditional updates
//! - [`InMemoryStore`]: one async mutex around the whole state, used by tests

mod memory;
mod postgres;

pub use memory::InMemoryStore;
pub use postgres::PgStore;

use async_trait::async_trait;
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::config::LedgerConfig;
use crate::error::LedgerResult;
use crate::types::{
    Commission, CommissionStatus, CommissionType, Influencer, MonthlyRanking, Notification,
    ProviderReferral, RecruitedInfluencer, SourceKind, Withdrawal, WithdrawalStatus,
    WithdrawalUpdate,
};

/// Result of the recruitment settlement transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementOutcome {
    /// Commission created and record marked paid
    Paid,
    /// Another invocation got there first
    AlreadyPaid,
    /// Recruiter is no longer active; nothing written
    RecruiterInactive,
}

/// Where a commission's creation lands in the influencer's activity stats
#[derive(Debug, Clone, Copy)]
pub struct ActivityStamp<'a> {
    /// Calendar day used for streak tracking
    pub date: Date,
    /// `YYYY-MM` month the earnings count towards
    pub month: &'a str,
    /// Provider referral whose counters the commission also bumps
    pub provider_referral: Option<Uuid>,
}

#[async_trait]
pub trait LedgerStore: Send + Sync {
    // -- Configuration ------------------------------------------------------

    async fn load_config(&self) -> LedgerResult<Option<LedgerConfig>>;

    async fn save_config(&self, config: &LedgerConfig) -> LedgerResult<()>;

    // -- Influencers --------------------------------------------------------

    /// Insert an influencer and, when recruited, its tracking record together
    ///
    /// Fails with `AlreadyExists` on duplicate id or affiliate code, in which
    /// case neither row is written.
    async fn insert_influencer(
        &self,
        influencer: &Influencer,
        recruitment: Option<&RecruitedInfluencer>,
    ) -> LedgerResult<()>;

    async fn get_influencer(&self, id: Uuid) -> LedgerResult<Option<Influencer>>;

    async fn find_influencer_by_client_code(&self, code: &str)
        -> LedgerResult<Option<Influencer>>;

    async fn find_influencer_by_recruitment_code(
        &self,
        code: &str,
    ) -> LedgerResult<Option<Influencer>>;

    /// Keyset page ordered by id
    async fn list_influencers(&self, after: Option<Uuid>, limit: i64)
        -> LedgerResult<Vec<Influencer>>;

    /// Active influencers whose stored stats month is `month` with positive earnings
    async fn list_ranking_candidates(&self, month: &str) -> LedgerResult<Vec<Influencer>>;

    /// Influencers currently holding a non-neutral monthly multiplier
    async fn list_multiplier_holders(&self) -> LedgerResult<Vec<Influencer>>;

    /// Set current rank and lower best rank when improved
    async fn record_rank(&self, influencer_id: Uuid, rank: i32) -> LedgerResult<()>;

    /// Clear the current rank of everyone not in `ranked`; best rank is kept
    async fn clear_ranks_except(&self, ranked: &[Uuid]) -> LedgerResult<u64>;

    async fn set_monthly_multiplier(
        &self,
        influencer_id: Uuid,
        multiplier: f64,
        month: Option<&str>,
    ) -> LedgerResult<()>;

    // -- Commissions --------------------------------------------------------

    /// Insert a pending commission and credit the owner in one atomic write
    ///
    /// Bumps pending balance, commission count, client/recruit counters, month
    /// stats (reset when the stored month differs), the activity streak and the
    /// counters of `activity.provider_referral` when set.
    /// Fails with `InfluencerNotFound`, `InfluencerNotActive` or
    /// `DuplicateCommission` without writing anything.
    async fn insert_commission(
        &self,
        commission: &Commission,
        activity: ActivityStamp<'_>,
    ) -> LedgerResult<()>;

    async fn get_commission(&self, id: Uuid) -> LedgerResult<Option<Commission>>;

    async fn find_commission_by_source(
        &self,
        influencer_id: Uuid,
        commission_type: CommissionType,
        source_kind: SourceKind,
        source_id: &str,
    ) -> LedgerResult<Option<Commission>>;

    async fn list_commissions_by_source(
        &self,
        source_kind: SourceKind,
        source_id: &str,
    ) -> LedgerResult<Vec<Commission>>;

    async fn list_commissions_for_influencer(
        &self,
        influencer_id: Uuid,
    ) -> LedgerResult<Vec<Commission>>;

    /// Oldest-first page of commissions in `status` that entered it at or before `cutoff`
    ///
    /// Pending rows are aged from `created_at`, validated rows from `validated_at`.
    async fn list_due_commissions(
        &self,
        status: CommissionStatus,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> LedgerResult<Vec<Commission>>;

    /// Move a commission from `from` to `to` together with its balance bucket
    ///
    /// Returns `None` when the commission is no longer in `from`, which makes
    /// re-processing a no-op.
    async fn transition_commission(
        &self,
        id: Uuid,
        from: CommissionStatus,
        to: CommissionStatus,
        now: OffsetDateTime,
        reason: Option<&str>,
    ) -> LedgerResult<Option<Commission>>;

    /// Sum of non-cancelled client referral amounts
    async fn sum_client_referral_earnings(&self, influencer_id: Uuid) -> LedgerResult<i64>;

    // -- Recruitment --------------------------------------------------------

    async fn insert_recruitment(&self, record: &RecruitedInfluencer) -> LedgerResult<()>;

    async fn find_recruitment_for_recruit(
        &self,
        recruited_id: Uuid,
    ) -> LedgerResult<Option<RecruitedInfluencer>>;

    async fn list_recruitments(&self) -> LedgerResult<Vec<RecruitedInfluencer>>;

    /// Returns false when the record was already inactive
    async fn deactivate_recruitment(&self, id: Uuid, now: OffsetDateTime) -> LedgerResult<bool>;

    /// Re-check and pay a recruitment bonus atomically
    ///
    /// Locks the record, re-reads `commission_paid`, verifies the recruiter is
    /// active, inserts `commission` crediting the recruiter and marks the record
    /// paid. Any failed check leaves no trace.
    async fn settle_recruitment(
        &self,
        recruitment_id: Uuid,
        commission: &Commission,
        activity: ActivityStamp<'_>,
    ) -> LedgerResult<SettlementOutcome>;

    // -- Provider referrals -------------------------------------------------

    async fn insert_provider_referral(&self, referral: &ProviderReferral) -> LedgerResult<()>;

    async fn find_provider_referral(
        &self,
        provider_id: &str,
    ) -> LedgerResult<Option<ProviderReferral>>;

    async fn deactivate_provider_referral(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> LedgerResult<bool>;

    // -- Withdrawals --------------------------------------------------------

    /// Reserve funds and insert a pending withdrawal atomically
    ///
    /// Fails with `InfluencerNotFound`, `WithdrawalAlreadyPending` or
    /// `InsufficientBalance` without writing anything.
    async fn create_withdrawal(&self, withdrawal: &Withdrawal) -> LedgerResult<()>;

    async fn get_withdrawal(&self, id: Uuid) -> LedgerResult<Option<Withdrawal>>;

    /// Oldest first
    async fn list_withdrawals_by_status(
        &self,
        status: WithdrawalStatus,
        limit: i64,
    ) -> LedgerResult<Vec<Withdrawal>>;

    /// Newest first
    async fn list_withdrawals_for_influencer(
        &self,
        influencer_id: Uuid,
    ) -> LedgerResult<Vec<Withdrawal>>;

    /// Move a withdrawal to `to` when its current status allows it
    ///
    /// Rejected/failed re-credit the available balance; completed adds to
    /// total withdrawn. Both clear `pending_withdrawal_id`. Returns `None` when
    /// the current status is not an allowed source for `to`.
    async fn transition_withdrawal(
        &self,
        id: Uuid,
        to: WithdrawalStatus,
        update: &WithdrawalUpdate,
        now: OffsetDateTime,
    ) -> LedgerResult<Option<Withdrawal>>;

    // -- Rankings -----------------------------------------------------------

    /// Write-once; returns false when a snapshot for the month already exists
    async fn insert_ranking(&self, ranking: &MonthlyRanking) -> LedgerResult<bool>;

    async fn get_ranking(&self, month: &str) -> LedgerResult<Option<MonthlyRanking>>;

    // -- Notifications ------------------------------------------------------

    async fn insert_notification(&self, notification: &Notification) -> LedgerResult<()>;

    async fn list_notifications(&self, influencer_id: Uuid) -> LedgerResult<Vec<Notification>>;

    async fn list_undelivered_notifications(&self, limit: i64)
        -> LedgerResult<Vec<Notification>>;

    async fn mark_notification_delivered(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> LedgerResult<bool>;
}

/// Relative balance changes produced by a commission status move
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct BalanceDelta {
    pub pending: i64,
    pub validated: i64,
    pub available: i64,
    pub total_earned: i64,
}

pub(crate) fn commission_move_delta(
    from: CommissionStatus,
    to: CommissionStatus,
    amount: i64,
) -> BalanceDelta {
    let mut delta = BalanceDelta::default();
    match from {
        CommissionStatus::Pending => delta.pending -= amount,
        CommissionStatus::Validated => delta.validated -= amount,
        CommissionStatus::Available | CommissionStatus::Cancelled => {}
    }
    match to {
        CommissionStatus::Validated => delta.validated += amount,
        CommissionStatus::Available => {
            delta.available += amount;
            delta.total_earned += amount;
        }
        CommissionStatus::Pending | CommissionStatus::Cancelled => {}
    }
    delta
}

/// Streak after activity on `today`: consecutive days extend it, a gap resets to 1
pub(crate) fn next_streak(
    current: i32,
    best: i32,
    last_activity: Option<Date>,
    today: Date,
) -> (i32, i32) {
    let current = match last_activity {
        Some(last) if last == today => current.max(1),
        Some(last) if last.next_day() == Some(today) => current + 1,
        _ => 1,
    };
    (current, best.max(current))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_move_deltas_conserve_value() {
        let release =
            commission_move_delta(CommissionStatus::Validated, CommissionStatus::Available, 700);
        assert_eq!(
            release,
            BalanceDelta {
                pending: 0,
                validated: -700,
                available: 700,
                total_earned: 700,
            }
        );

        let cancel =
            commission_move_delta(CommissionStatus::Pending, CommissionStatus::Cancelled, 700);
        assert_eq!(cancel.pending, -700);
        assert_eq!(cancel.validated + cancel.available, 0);
    }

    #[test]
    fn test_streak_progression() {
        let today = date!(2026 - 02 - 10);
        assert_eq!(next_streak(0, 0, None, today), (1, 1));
        assert_eq!(next_streak(4, 6, Some(date!(2026 - 02 - 09)), today), (5, 6));
        assert_eq!(next_streak(4, 4, Some(date!(2026 - 02 - 09)), today), (5, 5));
        assert_eq!(next_streak(4, 6, Some(today), today), (4, 6));
        assert_eq!(next_streak(9, 9, Some(date!(2026 - 02 - 01)), today), (1, 9));
    }
}
