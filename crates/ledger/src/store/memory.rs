//! In-memory ledger store
//!
//! A single `tokio::sync::Mutex` guards the whole state, so every trait
//! method is one critical section with the same all-or-nothing behaviour as
//! a Postgres transaction.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    commission_move_delta, next_streak, ActivityStamp, BalanceDelta, LedgerStore,
    SettlementOutcome,
};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::types::{
    Commission, CommissionStatus, CommissionType, Influencer, MonthlyRanking, MonthlyStats,
    Notification, ProviderReferral, RecruitedInfluencer, SourceKind, Withdrawal,
    WithdrawalStatus, WithdrawalUpdate,
};

#[derive(Default)]
struct MemoryState {
    config: Option<LedgerConfig>,
    influencers: BTreeMap<Uuid, Influencer>,
    commissions: HashMap<Uuid, Commission>,
    recruitments: HashMap<Uuid, RecruitedInfluencer>,
    provider_referrals: HashMap<Uuid, ProviderReferral>,
    withdrawals: HashMap<Uuid, Withdrawal>,
    rankings: HashMap<String, MonthlyRanking>,
    notifications: Vec<Notification>,
}

#[derive(Default)]
pub struct InMemoryStore {
    state: Mutex<MemoryState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: LedgerConfig) -> Self {
        Self {
            state: Mutex::new(MemoryState {
                config: Some(config),
                ..MemoryState::default()
            }),
        }
    }

    /// Change an influencer's account status
    pub async fn set_influencer_status(
        &self,
        id: Uuid,
        status: crate::types::InfluencerStatus,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let influencer = state
            .influencers
            .get_mut(&id)
            .ok_or(LedgerError::InfluencerNotFound(id))?;
        influencer.status = status;
        Ok(())
    }
}

impl MemoryState {
    fn source_taken(&self, commission: &Commission) -> bool {
        let Some(source_id) = commission.source.id.as_deref() else {
            return false;
        };
        self.commissions.values().any(|c| {
            c.influencer_id == commission.influencer_id
                && c.commission_type == commission.commission_type
                && c.source.kind == commission.source.kind
                && c.source.id.as_deref() == Some(source_id)
        })
    }

    /// Insert and credit; checks happen before any mutation
    fn credit_commission(
        &mut self,
        commission: &Commission,
        activity: ActivityStamp<'_>,
        now: OffsetDateTime,
    ) -> LedgerResult<()> {
        let influencer = self
            .influencers
            .get(&commission.influencer_id)
            .ok_or(LedgerError::InfluencerNotFound(commission.influencer_id))?;
        if !influencer.is_active() {
            return Err(LedgerError::InfluencerNotActive {
                id: influencer.id,
                status: influencer.status.to_string(),
            });
        }
        if self.commissions.contains_key(&commission.id) || self.source_taken(commission) {
            return Err(LedgerError::DuplicateCommission);
        }

        let influencer = self
            .influencers
            .get_mut(&commission.influencer_id)
            .ok_or(LedgerError::InfluencerNotFound(commission.influencer_id))?;

        influencer.balances.pending += commission.amount;
        influencer.total_commissions += 1;

        if influencer.month_stats.month != activity.month {
            influencer.month_stats = MonthlyStats::empty(activity.month);
        }
        influencer.month_stats.earnings += commission.amount;
        if commission.counts_as_client() {
            influencer.total_clients += 1;
            influencer.month_stats.clients += 1;
        } else {
            influencer.total_recruits += 1;
            influencer.month_stats.recruits += 1;
        }

        let (current, best) = next_streak(
            influencer.current_streak,
            influencer.best_streak,
            influencer.last_activity_date,
            activity.date,
        );
        influencer.current_streak = current;
        influencer.best_streak = best;
        influencer.last_activity_date = Some(activity.date);
        influencer.updated_at = now;

        if let Some(referral_id) = activity.provider_referral {
            if let Some(referral) = self.provider_referrals.get_mut(&referral_id) {
                referral.calls_with_commission += 1;
                referral.total_commissions += commission.amount;
                referral.last_commission_at = Some(now);
                referral.updated_at = now;
            }
        }

        self.commissions.insert(commission.id, commission.clone());
        Ok(())
    }
}

fn apply_delta(influencer: &mut Influencer, delta: BalanceDelta) {
    influencer.balances.pending += delta.pending;
    influencer.balances.validated += delta.validated;
    influencer.balances.available += delta.available;
    influencer.balances.total_earned += delta.total_earned;
}

#[async_trait]
impl LedgerStore for InMemoryStore {
    async fn load_config(&self) -> LedgerResult<Option<LedgerConfig>> {
        Ok(self.state.lock().await.config.clone())
    }

    async fn save_config(&self, config: &LedgerConfig) -> LedgerResult<()> {
        self.state.lock().await.config = Some(config.clone());
        Ok(())
    }

    async fn insert_influencer(
        &self,
        influencer: &Influencer,
        recruitment: Option<&RecruitedInfluencer>,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let clash = state.influencers.values().any(|existing| {
            existing.id == influencer.id
                || existing.client_code == influencer.client_code
                || existing.recruitment_code == influencer.recruitment_code
        });
        let tracked = recruitment.is_some()
            && state
                .recruitments
                .values()
                .any(|r| r.recruited_id == influencer.id);
        if clash || tracked {
            return Err(LedgerError::AlreadyExists(format!(
                "influencer {}",
                influencer.id
            )));
        }
        state.influencers.insert(influencer.id, influencer.clone());
        if let Some(record) = recruitment {
            state.recruitments.insert(record.id, record.clone());
        }
        Ok(())
    }

    async fn get_influencer(&self, id: Uuid) -> LedgerResult<Option<Influencer>> {
        Ok(self.state.lock().await.influencers.get(&id).cloned())
    }

    async fn find_influencer_by_client_code(
        &self,
        code: &str,
    ) -> LedgerResult<Option<Influencer>> {
        Ok(self
            .state
            .lock()
            .await
            .influencers
            .values()
            .find(|i| i.client_code.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn find_influencer_by_recruitment_code(
        &self,
        code: &str,
    ) -> LedgerResult<Option<Influencer>> {
        Ok(self
            .state
            .lock()
            .await
            .influencers
            .values()
            .find(|i| i.recruitment_code.eq_ignore_ascii_case(code))
            .cloned())
    }

    async fn list_influencers(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> LedgerResult<Vec<Influencer>> {
        let state = self.state.lock().await;
        let limit = usize::try_from(limit).unwrap_or(0);
        let page = match after {
            Some(cursor) => state
                .influencers
                .range((std::ops::Bound::Excluded(cursor), std::ops::Bound::Unbounded))
                .map(|(_, i)| i.clone())
                .take(limit)
                .collect(),
            None => state.influencers.values().take(limit).cloned().collect(),
        };
        Ok(page)
    }

    async fn list_ranking_candidates(&self, month: &str) -> LedgerResult<Vec<Influencer>> {
        Ok(self
            .state
            .lock()
            .await
            .influencers
            .values()
            .filter(|i| i.is_active() && i.month_stats.month == month && i.month_stats.earnings > 0)
            .cloned()
            .collect())
    }

    async fn list_multiplier_holders(&self) -> LedgerResult<Vec<Influencer>> {
        Ok(self
            .state
            .lock()
            .await
            .influencers
            .values()
            .filter(|i| i.monthly_multiplier != 1.0 || i.multiplier_month.is_some())
            .cloned()
            .collect())
    }

    async fn record_rank(&self, influencer_id: Uuid, rank: i32) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let influencer = state
            .influencers
            .get_mut(&influencer_id)
            .ok_or(LedgerError::InfluencerNotFound(influencer_id))?;
        influencer.current_month_rank = Some(rank);
        influencer.best_rank = Some(influencer.best_rank.map_or(rank, |best| best.min(rank)));
        Ok(())
    }

    async fn clear_ranks_except(&self, ranked: &[Uuid]) -> LedgerResult<u64> {
        let mut state = self.state.lock().await;
        let mut cleared = 0;
        for influencer in state.influencers.values_mut() {
            if influencer.current_month_rank.is_some() && !ranked.contains(&influencer.id) {
                influencer.current_month_rank = None;
                cleared += 1;
            }
        }
        Ok(cleared)
    }

    async fn set_monthly_multiplier(
        &self,
        influencer_id: Uuid,
        multiplier: f64,
        month: Option<&str>,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let influencer = state
            .influencers
            .get_mut(&influencer_id)
            .ok_or(LedgerError::InfluencerNotFound(influencer_id))?;
        influencer.monthly_multiplier = multiplier;
        influencer.multiplier_month = month.map(str::to_string);
        Ok(())
    }

    async fn insert_commission(
        &self,
        commission: &Commission,
        activity: ActivityStamp<'_>,
    ) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        state.credit_commission(commission, activity, commission.created_at)
    }

    async fn get_commission(&self, id: Uuid) -> LedgerResult<Option<Commission>> {
        Ok(self.state.lock().await.commissions.get(&id).cloned())
    }

    async fn find_commission_by_source(
        &self,
        influencer_id: Uuid,
        commission_type: CommissionType,
        source_kind: SourceKind,
        source_id: &str,
    ) -> LedgerResult<Option<Commission>> {
        Ok(self
            .state
            .lock()
            .await
            .commissions
            .values()
            .find(|c| {
                c.influencer_id == influencer_id
                    && c.commission_type == commission_type
                    && c.source.kind == source_kind
                    && c.source.id.as_deref() == Some(source_id)
            })
            .cloned())
    }

    async fn list_commissions_by_source(
        &self,
        source_kind: SourceKind,
        source_id: &str,
    ) -> LedgerResult<Vec<Commission>> {
        let state = self.state.lock().await;
        let mut found: Vec<Commission> = state
            .commissions
            .values()
            .filter(|c| c.source.kind == source_kind && c.source.id.as_deref() == Some(source_id))
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }

    async fn list_commissions_for_influencer(
        &self,
        influencer_id: Uuid,
    ) -> LedgerResult<Vec<Commission>> {
        let state = self.state.lock().await;
        let mut found: Vec<Commission> = state
            .commissions
            .values()
            .filter(|c| c.influencer_id == influencer_id)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.created_at);
        Ok(found)
    }

    async fn list_due_commissions(
        &self,
        status: CommissionStatus,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> LedgerResult<Vec<Commission>> {
        let state = self.state.lock().await;
        let entered_at = |c: &Commission| match status {
            CommissionStatus::Validated => c.validated_at,
            _ => Some(c.created_at),
        };
        let mut due: Vec<Commission> = state
            .commissions
            .values()
            .filter(|c| c.status == status && entered_at(c).is_some_and(|at| at <= cutoff))
            .cloned()
            .collect();
        due.sort_by_key(|c| (entered_at(c), c.id));
        due.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(due)
    }

    async fn transition_commission(
        &self,
        id: Uuid,
        from: CommissionStatus,
        to: CommissionStatus,
        now: OffsetDateTime,
        reason: Option<&str>,
    ) -> LedgerResult<Option<Commission>> {
        if !from.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition {
                entity: "commission",
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let mut state = self.state.lock().await;
        let Some(commission) = state.commissions.get(&id) else {
            return Err(LedgerError::CommissionNotFound(id));
        };
        if commission.status != from {
            return Ok(None);
        }
        let owner = commission.influencer_id;
        let amount = commission.amount;
        if !state.influencers.contains_key(&owner) {
            return Err(LedgerError::InfluencerNotFound(owner));
        }

        let commission = match state.commissions.get_mut(&id) {
            Some(c) => c,
            None => return Err(LedgerError::CommissionNotFound(id)),
        };
        commission.status = to;
        commission.updated_at = now;
        match to {
            CommissionStatus::Validated => commission.validated_at = Some(now),
            CommissionStatus::Available => commission.available_at = Some(now),
            CommissionStatus::Cancelled => {
                commission.cancelled_at = Some(now);
                commission.cancellation_reason = reason.map(str::to_string);
            }
            CommissionStatus::Pending => {}
        }
        let updated = commission.clone();

        if let Some(influencer) = state.influencers.get_mut(&owner) {
            apply_delta(influencer, commission_move_delta(from, to, amount));
            influencer.updated_at = now;
        }
        Ok(Some(updated))
    }

    async fn sum_client_referral_earnings(&self, influencer_id: Uuid) -> LedgerResult<i64> {
        Ok(self
            .state
            .lock()
            .await
            .commissions
            .values()
            .filter(|c| {
                c.influencer_id == influencer_id
                    && c.commission_type == CommissionType::ClientReferral
                    && c.status != CommissionStatus::Cancelled
            })
            .map(|c| c.amount)
            .sum())
    }

    async fn insert_recruitment(&self, record: &RecruitedInfluencer) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        if state
            .recruitments
            .values()
            .any(|r| r.recruited_id == record.recruited_id)
        {
            return Err(LedgerError::AlreadyExists(format!(
                "recruitment for {}",
                record.recruited_id
            )));
        }
        state.recruitments.insert(record.id, record.clone());
        Ok(())
    }

    async fn find_recruitment_for_recruit(
        &self,
        recruited_id: Uuid,
    ) -> LedgerResult<Option<RecruitedInfluencer>> {
        Ok(self
            .state
            .lock()
            .await
            .recruitments
            .values()
            .find(|r| r.recruited_id == recruited_id)
            .cloned())
    }

    async fn list_recruitments(&self) -> LedgerResult<Vec<RecruitedInfluencer>> {
        Ok(self
            .state
            .lock()
            .await
            .recruitments
            .values()
            .cloned()
            .collect())
    }

    async fn deactivate_recruitment(&self, id: Uuid, now: OffsetDateTime) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        match state.recruitments.get_mut(&id) {
            Some(record) if record.is_active => {
                record.is_active = false;
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn settle_recruitment(
        &self,
        recruitment_id: Uuid,
        commission: &Commission,
        activity: ActivityStamp<'_>,
    ) -> LedgerResult<SettlementOutcome> {
        let mut state = self.state.lock().await;

        let record = state.recruitments.get(&recruitment_id).ok_or_else(|| {
            LedgerError::Internal(format!("recruitment {} vanished", recruitment_id))
        })?;
        if record.commission_paid {
            return Ok(SettlementOutcome::AlreadyPaid);
        }
        let recruiter_active = state
            .influencers
            .get(&record.recruiter_id)
            .is_some_and(Influencer::is_active);
        if !recruiter_active {
            return Ok(SettlementOutcome::RecruiterInactive);
        }

        let now = commission.created_at;
        state.credit_commission(commission, activity, now)?;

        if let Some(record) = state.recruitments.get_mut(&recruitment_id) {
            record.commission_paid = true;
            record.commission_id = Some(commission.id);
            record.commission_paid_at = Some(now);
            record.updated_at = now;
        }
        Ok(SettlementOutcome::Paid)
    }

    async fn insert_provider_referral(&self, referral: &ProviderReferral) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        if state
            .provider_referrals
            .values()
            .any(|r| r.provider_id == referral.provider_id)
        {
            return Err(LedgerError::AlreadyExists(format!(
                "provider referral for {}",
                referral.provider_id
            )));
        }
        state.provider_referrals.insert(referral.id, referral.clone());
        Ok(())
    }

    async fn find_provider_referral(
        &self,
        provider_id: &str,
    ) -> LedgerResult<Option<ProviderReferral>> {
        Ok(self
            .state
            .lock()
            .await
            .provider_referrals
            .values()
            .find(|r| r.provider_id == provider_id)
            .cloned())
    }

    async fn deactivate_provider_referral(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        match state.provider_referrals.get_mut(&id) {
            Some(referral) if referral.is_active => {
                referral.is_active = false;
                referral.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn create_withdrawal(&self, withdrawal: &Withdrawal) -> LedgerResult<()> {
        let mut state = self.state.lock().await;
        let influencer = state
            .influencers
            .get_mut(&withdrawal.influencer_id)
            .ok_or(LedgerError::InfluencerNotFound(withdrawal.influencer_id))?;

        if let Some(pending) = influencer.pending_withdrawal_id {
            return Err(LedgerError::WithdrawalAlreadyPending(pending));
        }
        if influencer.balances.available < withdrawal.amount {
            return Err(LedgerError::InsufficientBalance {
                requested: withdrawal.amount,
                available: influencer.balances.available,
            });
        }

        influencer.balances.available -= withdrawal.amount;
        influencer.pending_withdrawal_id = Some(withdrawal.id);
        influencer.updated_at = withdrawal.requested_at;
        state.withdrawals.insert(withdrawal.id, withdrawal.clone());
        Ok(())
    }

    async fn get_withdrawal(&self, id: Uuid) -> LedgerResult<Option<Withdrawal>> {
        Ok(self.state.lock().await.withdrawals.get(&id).cloned())
    }

    async fn list_withdrawals_by_status(
        &self,
        status: WithdrawalStatus,
        limit: i64,
    ) -> LedgerResult<Vec<Withdrawal>> {
        let state = self.state.lock().await;
        let mut found: Vec<Withdrawal> = state
            .withdrawals
            .values()
            .filter(|w| w.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|w| (w.requested_at, w.id));
        found.truncate(usize::try_from(limit).unwrap_or(0));
        Ok(found)
    }

    async fn list_withdrawals_for_influencer(
        &self,
        influencer_id: Uuid,
    ) -> LedgerResult<Vec<Withdrawal>> {
        let state = self.state.lock().await;
        let mut found: Vec<Withdrawal> = state
            .withdrawals
            .values()
            .filter(|w| w.influencer_id == influencer_id)
            .cloned()
            .collect();
        found.sort_by_key(|w| std::cmp::Reverse(w.requested_at));
        Ok(found)
    }

    async fn transition_withdrawal(
        &self,
        id: Uuid,
        to: WithdrawalStatus,
        update: &WithdrawalUpdate,
        now: OffsetDateTime,
    ) -> LedgerResult<Option<Withdrawal>> {
        let mut state = self.state.lock().await;
        let withdrawal = state
            .withdrawals
            .get_mut(&id)
            .ok_or(LedgerError::WithdrawalNotFound(id))?;
        if !to.allowed_sources().contains(&withdrawal.status) {
            return Ok(None);
        }

        withdrawal.status = to;
        match to {
            WithdrawalStatus::Approved | WithdrawalStatus::Processing => {
                withdrawal.processed_at = Some(now);
                if update.processed_by.is_some() {
                    withdrawal.processed_by = update.processed_by.clone();
                }
            }
            WithdrawalStatus::Rejected => {
                withdrawal.processed_at = Some(now);
                if update.processed_by.is_some() {
                    withdrawal.processed_by = update.processed_by.clone();
                }
                withdrawal.rejection_reason = update.reason.clone();
            }
            WithdrawalStatus::Completed => {
                withdrawal.completed_at = Some(now);
                if update.payment_reference.is_some() {
                    withdrawal.payment_reference = update.payment_reference.clone();
                }
            }
            WithdrawalStatus::Failed => {
                withdrawal.failed_at = Some(now);
                withdrawal.failure_reason = update.reason.clone();
            }
            WithdrawalStatus::Pending => {}
        }
        let updated = withdrawal.clone();

        if to.is_terminal() {
            if let Some(influencer) = state.influencers.get_mut(&updated.influencer_id) {
                if to.refunds_balance() {
                    influencer.balances.available += updated.amount;
                } else {
                    influencer.balances.total_withdrawn += updated.amount;
                }
                if influencer.pending_withdrawal_id == Some(id) {
                    influencer.pending_withdrawal_id = None;
                }
                influencer.updated_at = now;
            }
        }
        Ok(Some(updated))
    }

    async fn insert_ranking(&self, ranking: &MonthlyRanking) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        if state.rankings.contains_key(&ranking.month) {
            return Ok(false);
        }
        state.rankings.insert(ranking.month.clone(), ranking.clone());
        Ok(true)
    }

    async fn get_ranking(&self, month: &str) -> LedgerResult<Option<MonthlyRanking>> {
        Ok(self.state.lock().await.rankings.get(month).cloned())
    }

    async fn insert_notification(&self, notification: &Notification) -> LedgerResult<()> {
        self.state
            .lock()
            .await
            .notifications
            .push(notification.clone());
        Ok(())
    }

    async fn list_notifications(&self, influencer_id: Uuid) -> LedgerResult<Vec<Notification>> {
        Ok(self
            .state
            .lock()
            .await
            .notifications
            .iter()
            .filter(|n| n.influencer_id == influencer_id)
            .cloned()
            .collect())
    }

    async fn list_undelivered_notifications(
        &self,
        limit: i64,
    ) -> LedgerResult<Vec<Notification>> {
        Ok(self
            .state
            .lock()
            .await
            .notifications
            .iter()
            .filter(|n| n.delivered_at.is_none())
            .take(usize::try_from(limit).unwrap_or(0))
            .cloned()
            .collect())
    }

    async fn mark_notification_delivered(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> LedgerResult<bool> {
        let mut state = self.state.lock().await;
        match state
            .notifications
            .iter_mut()
            .find(|n| n.id == id && n.delivered_at.is_none())
        {
            Some(notification) => {
                notification.delivered_at = Some(now);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
