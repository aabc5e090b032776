//! Monthly leaderboard and top-3 multiplier rewards
//!
//! Runs once after a month closes. The snapshot is write-once, so a re-run
//! reuses it and only re-applies the per-influencer updates, which are
//! themselves idempotent.

use std::cmp::Ordering;
use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::clock::{next_month_key, parse_month_key, Clock};
use crate::config::ConfigProvider;
use crate::error::{LedgerError, LedgerResult};
use crate::notifications::{NotificationOutbox, NotificationRefs};
use crate::store::LedgerStore;
use crate::types::{Influencer, MonthlyRanking, NotificationKind, RankingEntry};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RankingResult {
    pub ranked: usize,
    pub rewarded: usize,
    pub reset: usize,
    /// Previously ranked influencers who fell off the leaderboard
    pub unranked: u64,
    pub errors: usize,
}

/// Earnings desc, then clients desc, then id
fn leaderboard_order(a: &Influencer, b: &Influencer) -> Ordering {
    b.month_stats
        .earnings
        .cmp(&a.month_stats.earnings)
        .then_with(|| b.month_stats.clients.cmp(&a.month_stats.clients))
        .then_with(|| a.id.cmp(&b.id))
}

pub(crate) fn build_entries(mut candidates: Vec<Influencer>, size: usize) -> Vec<RankingEntry> {
    candidates.sort_by(leaderboard_order);
    candidates
        .into_iter()
        .take(size)
        .zip(1..)
        .map(|(influencer, rank)| RankingEntry {
            rank,
            influencer_id: influencer.id,
            name: influencer.display_name,
            client_code: influencer.client_code,
            earnings: influencer.month_stats.earnings,
            clients: influencer.month_stats.clients,
            recruits: influencer.month_stats.recruits,
        })
        .collect()
}

#[derive(Clone)]
pub struct RankingService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: Arc<ConfigProvider>,
    outbox: NotificationOutbox,
}

impl RankingService {
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

    pub async fn get_ranking(&self, month: &str) -> LedgerResult<Option<MonthlyRanking>> {
        self.store.get_ranking(month).await
    }

    /// Rank `month` (`YYYY-MM`) and grant the next month's multipliers
    pub async fn run_monthly_ranking(&self, month: &str) -> LedgerResult<RankingResult> {
        if parse_month_key(month).is_none() {
            return Err(LedgerError::InvalidMonth(month.to_string()));
        }
        let reward_month = next_month_key(month)
            .ok_or_else(|| LedgerError::Internal(format!("no month after {}", month)))?;
        let config = self.config.current().await?;

        let ranking = match self.store.get_ranking(month).await? {
            Some(existing) => {
                tracing::info!(month, "Ranking snapshot exists; reusing");
                existing
            }
            None => {
                let candidates = self.store.list_ranking_candidates(month).await?;
                let snapshot = MonthlyRanking {
                    month: month.to_string(),
                    entries: build_entries(candidates, config.leaderboard_size),
                    calculated_at: self.clock.now(),
                    is_finalized: true,
                };
                if self.store.insert_ranking(&snapshot).await? {
                    snapshot
                } else {
                    // Another run won the insert
                    self.store.get_ranking(month).await?.ok_or_else(|| {
                        LedgerError::Internal(format!("ranking for {} vanished", month))
                    })?
                }
            }
        };

        let mut result = RankingResult::default();
        let mut rewarded_ids = HashSet::new();

        for entry in &ranking.entries {
            if let Err(e) = self.store.record_rank(entry.influencer_id, entry.rank).await {
                result.errors += 1;
                tracing::error!(
                    influencer_id = %entry.influencer_id,
                    rank = entry.rank,
                    error = %e,
                    "Failed to record rank"
                );
                continue;
            }
            result.ranked += 1;

            let Some(multiplier) = config.top_multiplier(entry.rank) else {
                continue;
            };
            match self.grant(entry, multiplier, &reward_month).await {
                Ok(()) => {
                    result.rewarded += 1;
                    rewarded_ids.insert(entry.influencer_id);
                }
                Err(e) => {
                    result.errors += 1;
                    tracing::error!(
                        influencer_id = %entry.influencer_id,
                        rank = entry.rank,
                        error = %e,
                        "Failed to grant top multiplier"
                    );
                }
            }
        }

        let ranked_ids: Vec<Uuid> = ranking.entries.iter().map(|e| e.influencer_id).collect();
        result.unranked = self.store.clear_ranks_except(&ranked_ids).await?;

        for holder in self.store.list_multiplier_holders().await? {
            if rewarded_ids.contains(&holder.id) {
                continue;
            }
            match self.store.set_monthly_multiplier(holder.id, 1.0, None).await {
                Ok(()) => result.reset += 1,
                Err(e) => {
                    result.errors += 1;
                    tracing::error!(
                        influencer_id = %holder.id,
                        error = %e,
                        "Failed to reset monthly multiplier"
                    );
                }
            }
        }

        tracing::info!(
            month,
            ranked = result.ranked,
            rewarded = result.rewarded,
            reset = result.reset,
            unranked = result.unranked,
            errors = result.errors,
            "Monthly ranking complete"
        );
        Ok(result)
    }

    async fn grant(
        &self,
        entry: &RankingEntry,
        multiplier: f64,
        reward_month: &str,
    ) -> LedgerResult<()> {
        let influencer_id: Uuid = entry.influencer_id;
        let already = self
            .store
            .get_influencer(influencer_id)
            .await?
            .is_some_and(|i| i.multiplier_month.as_deref() == Some(reward_month));

        self.store
            .set_monthly_multiplier(influencer_id, multiplier, Some(reward_month))
            .await?;

        if !already {
            tracing::info!(
                influencer_id = %influencer_id,
                rank = entry.rank,
                multiplier,
                month = reward_month,
                "Top multiplier granted"
            );
            self.outbox
                .notify(
                    influencer_id,
                    NotificationKind::RankAchieved,
                    format!("You ranked #{}", entry.rank),
                    format!(
                        "Your commissions earn a x{:.2} bonus during {}.",
                        multiplier, reward_month
                    ),
                    NotificationRefs::default(),
                )
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{influencer_fixture, Harness};
    use crate::types::MonthlyStats;

    fn with_stats(earnings: i64, clients: i64) -> Influencer {
        let mut influencer = influencer_fixture();
        influencer.month_stats = MonthlyStats {
            month: "2026-03".into(),
            earnings,
            clients,
            recruits: 0,
        };
        influencer
    }

    #[test]
    fn test_leaderboard_ordering() {
        let a = with_stats(5000, 2);
        let b = with_stats(5000, 4);
        let c = with_stats(9000, 1);
        let entries = build_entries(vec![a.clone(), b.clone(), c.clone()], 10);
        let order: Vec<Uuid> = entries.iter().map(|e| e.influencer_id).collect();
        assert_eq!(order, vec![c.id, b.id, a.id]);
        assert_eq!(entries[0].rank, 1);
        assert_eq!(entries[2].rank, 3);

        let top = build_entries(vec![a, b, c], 2);
        assert_eq!(top.len(), 2);
    }

    #[tokio::test]
    async fn test_ranking_rewards_and_resets() {
        let h = Harness::new().await;
        let names = ["Ada", "Grace", "Linus", "Ken"];
        let mut ids = Vec::new();
        for (i, name) in names.iter().enumerate() {
            let influencer = h.influencer(name).await;
            h.client_commissions(influencer.id, 4 - i).await;
            ids.push(influencer.id);
        }
        let month = crate::clock::month_key(h.clock.now());
        let next = next_month_key(&month).unwrap();

        let result = h.ledger.ranking.run_monthly_ranking(&month).await.unwrap();
        assert_eq!(result.ranked, 4);
        assert_eq!(result.rewarded, 3);

        let first = h.reload(ids[0]).await;
        assert_eq!(first.current_month_rank, Some(1));
        assert_eq!(first.monthly_multiplier, 2.0);
        assert_eq!(first.multiplier_month.as_deref(), Some(next.as_str()));
        assert_eq!(h.reload(ids[2]).await.monthly_multiplier, 1.15);
        assert_eq!(h.reload(ids[3]).await.monthly_multiplier, 1.0);

        // Re-run reuses the snapshot and does not re-notify
        let again = h.ledger.ranking.run_monthly_ranking(&month).await.unwrap();
        assert_eq!(again.rewarded, 3);
        let rank_notes = h
            .store
            .list_notifications(ids[0])
            .await
            .unwrap()
            .into_iter()
            .filter(|n| n.kind == NotificationKind::RankAchieved)
            .count();
        assert_eq!(rank_notes, 1);
    }

    #[tokio::test]
    async fn test_previous_winner_reset() {
        let h = Harness::new().await;
        let champion = h.influencer("Champion").await;
        h.store
            .set_monthly_multiplier(champion.id, 2.0, Some("2026-01"))
            .await
            .unwrap();

        let result = h.ledger.ranking.run_monthly_ranking("2026-01").await.unwrap();
        assert_eq!(result.ranked, 0);
        assert_eq!(result.reset, 1);
        let stored = h.reload(champion.id).await;
        assert_eq!(stored.monthly_multiplier, 1.0);
        assert!(stored.multiplier_month.is_none());
    }

    #[tokio::test]
    async fn test_dropouts_lose_current_rank() {
        let h = Harness::new().await;
        let steady = h.influencer("Steady").await;
        let dropout = h.influencer("Dropout").await;
        h.store.record_rank(dropout.id, 2).await.unwrap();
        h.client_commissions(steady.id, 2).await;

        let month = crate::clock::month_key(h.clock.now());
        let result = h.ledger.ranking.run_monthly_ranking(&month).await.unwrap();
        assert_eq!(result.ranked, 1);
        assert_eq!(result.unranked, 1);

        let stored = h.reload(dropout.id).await;
        assert!(stored.current_month_rank.is_none());
        assert_eq!(stored.best_rank, Some(2));
        assert_eq!(h.reload(steady.id).await.current_month_rank, Some(1));
    }

    #[tokio::test]
    async fn test_rejects_bad_month_key() {
        let h = Harness::new().await;
        let err = h.ledger.ranking.run_monthly_ranking("2026-1").await.unwrap_err();
        assert_eq!(err.code(), "INVALID_MONTH");
    }
}
