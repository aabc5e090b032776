//! Ledger invariants
//!
//! Runnable consistency checks over the persisted ledger. They only read,
//! so they can run at any time, including while jobs are writing. A
//! violation observed mid-write that disappears on the next run is noise; one
//! that persists is a bug.
//!
//! ## Checks
//!
//! 1. **balance_conservation**: balances plus withdrawals account for every
//!    non-cancelled commission
//! 2. **bucket_consistency**: each balance bucket equals the commissions in
//!    that status
//! 3. **single_outstanding_withdrawal**: at most one non-terminal withdrawal,
//!    and it is the one `pending_withdrawal_id` points to
//! 4. **recruitment_paid_consistency**: paid flag, commission link and
//!    commission record agree
//! 5. **non_negative_balances**

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::LedgerResult;
use crate::store::LedgerStore;
use crate::types::{
    Commission, CommissionStatus, CommissionType, Influencer, RecruitedInfluencer, Withdrawal,
};

const PAGE_SIZE: i64 = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub invariant: String,
    pub influencer_ids: Vec<Uuid>,
    pub description: String,
    /// Values needed to debug the violation
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Money is unaccounted for
    Critical,
    High,
    Medium,
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

/// One influencer with everything the checks look at
struct Account {
    influencer: Influencer,
    commissions: Vec<Commission>,
    withdrawals: Vec<Withdrawal>,
}

impl Account {
    fn commission_total(&self, status: Option<CommissionStatus>) -> i64 {
        self.commissions
            .iter()
            .filter(|c| c.status != CommissionStatus::Cancelled)
            .filter(|c| status.map_or(true, |s| c.status == s))
            .map(|c| c.amount)
            .sum()
    }

    fn outstanding(&self) -> Vec<&Withdrawal> {
        self.withdrawals
            .iter()
            .filter(|w| !w.status.is_terminal())
            .collect()
    }
}

struct Snapshot {
    accounts: Vec<Account>,
    recruitments: Vec<RecruitedInfluencer>,
    commissions_by_id: HashMap<Uuid, (CommissionType, Uuid)>,
}

pub struct InvariantChecker {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
}

impl InvariantChecker {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    async fn snapshot(&self) -> LedgerResult<Snapshot> {
        let mut accounts = Vec::new();
        let mut after = None;
        loop {
            let page = self.store.list_influencers(after, PAGE_SIZE).await?;
            let Some(last) = page.last() else {
                break;
            };
            after = Some(last.id);
            let full = page.len() as i64 == PAGE_SIZE;

            for influencer in page {
                let commissions = self
                    .store
                    .list_commissions_for_influencer(influencer.id)
                    .await?;
                let withdrawals = self
                    .store
                    .list_withdrawals_for_influencer(influencer.id)
                    .await?;
                accounts.push(Account {
                    influencer,
                    commissions,
                    withdrawals,
                });
            }
            if !full {
                break;
            }
        }

        let commissions_by_id = accounts
            .iter()
            .flat_map(|a| a.commissions.iter())
            .map(|c| (c.id, (c.commission_type, c.influencer_id)))
            .collect();

        Ok(Snapshot {
            accounts,
            recruitments: self.store.list_recruitments().await?,
            commissions_by_id,
        })
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> LedgerResult<InvariantCheckSummary> {
        let snapshot = self.snapshot().await?;
        let mut violations = Vec::new();

        for name in Self::available_checks() {
            violations.extend(Self::evaluate(name, &snapshot));
        }

        let checks_run = Self::available_checks().len();
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<HashSet<_>>()
            .len();

        let summary = InvariantCheckSummary {
            checked_at: self.clock.now(),
            checks_run,
            checks_passed: checks_run - checks_failed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        };

        if summary.healthy {
            tracing::info!(checks_run, "Ledger invariants hold");
        } else {
            for violation in &summary.violations {
                tracing::error!(
                    invariant = %violation.invariant,
                    severity = %violation.severity,
                    influencer_ids = ?violation.influencer_ids,
                    "{}",
                    violation.description
                );
            }
        }
        Ok(summary)
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> LedgerResult<Vec<InvariantViolation>> {
        if !Self::available_checks().contains(&name) {
            return Ok(vec![]);
        }
        let snapshot = self.snapshot().await?;
        Ok(Self::evaluate(name, &snapshot))
    }

    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "balance_conservation",
            "bucket_consistency",
            "single_outstanding_withdrawal",
            "recruitment_paid_consistency",
            "non_negative_balances",
        ]
    }

    fn evaluate(name: &str, snapshot: &Snapshot) -> Vec<InvariantViolation> {
        match name {
            "balance_conservation" => check_balance_conservation(snapshot),
            "bucket_consistency" => check_bucket_consistency(snapshot),
            "single_outstanding_withdrawal" => check_single_outstanding_withdrawal(snapshot),
            "recruitment_paid_consistency" => check_recruitment_paid_consistency(snapshot),
            "non_negative_balances" => check_non_negative_balances(snapshot),
            _ => vec![],
        }
    }
}

/// available + validated + pending + outstanding withdrawals + withdrawn
/// == non-cancelled commissions
fn check_balance_conservation(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .accounts
        .iter()
        .filter_map(|account| {
            let b = &account.influencer.balances;
            let outstanding: i64 = account.outstanding().iter().map(|w| w.amount).sum();
            let held = b.available + b.validated + b.pending + outstanding + b.total_withdrawn;
            let earned = account.commission_total(None);
            (held != earned).then(|| InvariantViolation {
                invariant: "balance_conservation".to_string(),
                influencer_ids: vec![account.influencer.id],
                description: format!(
                    "Balances hold {} but commissions total {} (diff {})",
                    held,
                    earned,
                    held - earned
                ),
                context: serde_json::json!({
                    "available": b.available,
                    "validated": b.validated,
                    "pending": b.pending,
                    "outstanding_withdrawals": outstanding,
                    "total_withdrawn": b.total_withdrawn,
                    "commission_total": earned,
                }),
                severity: ViolationSeverity::Critical,
            })
        })
        .collect()
}

fn check_bucket_consistency(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .accounts
        .iter()
        .filter_map(|account| {
            let b = &account.influencer.balances;
            let pending = account.commission_total(Some(CommissionStatus::Pending));
            let validated = account.commission_total(Some(CommissionStatus::Validated));
            let released = account.commission_total(Some(CommissionStatus::Available));
            let consistent =
                b.pending == pending && b.validated == validated && b.total_earned == released;
            (!consistent).then(|| InvariantViolation {
                invariant: "bucket_consistency".to_string(),
                influencer_ids: vec![account.influencer.id],
                description: "Balance buckets disagree with commission statuses".to_string(),
                context: serde_json::json!({
                    "pending_balance": b.pending,
                    "pending_commissions": pending,
                    "validated_balance": b.validated,
                    "validated_commissions": validated,
                    "total_earned": b.total_earned,
                    "available_commissions": released,
                }),
                severity: ViolationSeverity::High,
            })
        })
        .collect()
}

fn check_single_outstanding_withdrawal(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .accounts
        .iter()
        .filter_map(|account| {
            let outstanding = account.outstanding();
            let pointer = account.influencer.pending_withdrawal_id;
            let pointer_ok = match outstanding.as_slice() {
                [] => pointer.is_none(),
                [only] => pointer == Some(only.id),
                _ => false,
            };
            (!pointer_ok).then(|| InvariantViolation {
                invariant: "single_outstanding_withdrawal".to_string(),
                influencer_ids: vec![account.influencer.id],
                description: format!(
                    "{} non-terminal withdrawals, pending_withdrawal_id {:?}",
                    outstanding.len(),
                    pointer
                ),
                context: serde_json::json!({
                    "outstanding_ids": outstanding.iter().map(|w| w.id).collect::<Vec<_>>(),
                    "pending_withdrawal_id": pointer,
                }),
                severity: ViolationSeverity::Critical,
            })
        })
        .collect()
}

fn check_recruitment_paid_consistency(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .recruitments
        .iter()
        .filter_map(|record| {
            let linked = record
                .commission_id
                .and_then(|id| snapshot.commissions_by_id.get(&id));
            let problem = match (record.commission_paid, record.commission_id, linked) {
                (false, None, _) => return None,
                (true, None, _) => "paid without a commission link",
                (false, Some(_), _) => "commission linked but not marked paid",
                (true, Some(_), None) => "linked commission does not exist",
                (true, Some(_), Some((kind, owner))) => {
                    if *kind == CommissionType::Recruitment && *owner == record.recruiter_id {
                        return None;
                    }
                    "linked commission is not the recruiter's recruitment commission"
                }
            };
            Some(InvariantViolation {
                invariant: "recruitment_paid_consistency".to_string(),
                influencer_ids: vec![record.recruiter_id, record.recruited_id],
                description: format!("Recruitment {}: {}", record.id, problem),
                context: serde_json::json!({
                    "recruitment_id": record.id,
                    "commission_paid": record.commission_paid,
                    "commission_id": record.commission_id,
                }),
                severity: ViolationSeverity::High,
            })
        })
        .collect()
}

fn check_non_negative_balances(snapshot: &Snapshot) -> Vec<InvariantViolation> {
    snapshot
        .accounts
        .iter()
        .filter_map(|account| {
            let b = &account.influencer.balances;
            let negative = [
                ("available", b.available),
                ("validated", b.validated),
                ("pending", b.pending),
                ("total_earned", b.total_earned),
                ("total_withdrawn", b.total_withdrawn),
            ]
            .into_iter()
            .filter(|(_, v)| *v < 0)
            .map(|(name, _)| name)
            .collect::<Vec<_>>();
            (!negative.is_empty()).then(|| InvariantViolation {
                invariant: "non_negative_balances".to_string(),
                influencer_ids: vec![account.influencer.id],
                description: format!("Negative balances: {}", negative.join(", ")),
                context: serde_json::json!({ "balances": b }),
                severity: ViolationSeverity::High,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{paypal, Harness};
    use crate::withdrawal::WithdrawalRequest;

    #[test]
    fn test_violation_severity_display() {
        assert_eq!(ViolationSeverity::Critical.to_string(), "CRITICAL");
        assert_eq!(ViolationSeverity::High.to_string(), "HIGH");
        assert_eq!(ViolationSeverity::Medium.to_string(), "MEDIUM");
        assert_eq!(ViolationSeverity::Low.to_string(), "LOW");
    }

    #[test]
    fn test_available_checks() {
        let checks = InvariantChecker::available_checks();
        assert_eq!(checks.len(), 5);
        assert!(checks.contains(&"balance_conservation"));
        assert!(checks.contains(&"single_outstanding_withdrawal"));
    }

    #[tokio::test]
    async fn test_healthy_after_full_lifecycle() {
        let h = Harness::new().await;
        let recruiter = h.influencer("Mentor").await;
        let recruit = h.recruit(&recruiter, "Rookie").await;
        h.client_commissions(recruit.id, 6).await;
        h.mature_all().await;
        h.ledger
            .withdrawals
            .create_withdrawal_request(WithdrawalRequest {
                influencer_id: recruit.id,
                amount: Some(4000),
                payment_details: paypal(),
            })
            .await
            .unwrap();

        let summary = h.ledger.invariants.run_all_checks().await.unwrap();
        assert!(summary.healthy, "{:?}", summary.violations);
        assert_eq!(summary.checks_passed, 5);
    }

    #[tokio::test]
    async fn test_detects_tampered_balance() {
        let h = Harness::new().await;
        let influencer = h.influencer("Ada").await;
        h.client_commissions(influencer.id, 1).await;

        // Simulate a stray write that bypasses the ledger
        let mut tampered = h.reload(influencer.id).await;
        tampered.id = Uuid::new_v4();
        tampered.client_code = "TAMPER0001".into();
        tampered.recruitment_code = "REC-TAMPER0001".into();
        h.store.insert_influencer(&tampered, None).await.unwrap();

        let violations = h
            .ledger
            .invariants
            .run_check("balance_conservation")
            .await
            .unwrap();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].influencer_ids, vec![tampered.id]);
        assert_eq!(violations[0].severity, ViolationSeverity::Critical);

        assert!(h.ledger.invariants.run_check("unknown").await.unwrap().is_empty());
    }
}
