//! Commission rules and rate capture
//!
//! An influencer's rules are frozen at registration so later config changes
//! never reprice their future commissions. Rules missing from an older
//! snapshot fall back to the live configuration.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::config::LedgerConfig;

/// How a commission amount is derived from the triggering transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationType {
    /// Flat amount per event
    Fixed,
    /// Percentage of the transaction amount
    Percentage,
    /// Flat amount plus a percentage
    Hybrid,
}

/// Pricing rule for one kind of commission
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommissionRule {
    pub calculation_type: CalculationType,
    /// Cents
    pub fixed_amount: i64,
    /// Percent, e.g. `5.0` for 5%
    #[serde(default)]
    pub percentage_rate: f64,
}

impl CommissionRule {
    pub const fn fixed(amount: i64) -> Self {
        Self {
            calculation_type: CalculationType::Fixed,
            fixed_amount: amount,
            percentage_rate: 0.0,
        }
    }

    /// Base commission for a transaction of `transaction_amount` cents
    pub fn base_amount(&self, transaction_amount: i64) -> i64 {
        let percentage =
            || (transaction_amount as f64 * self.percentage_rate / 100.0).round() as i64;
        match self.calculation_type {
            CalculationType::Fixed => self.fixed_amount,
            CalculationType::Percentage => percentage(),
            CalculationType::Hybrid => self.fixed_amount + percentage(),
        }
        .max(0)
    }
}

/// Which rule a commission is priced with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RuleKind {
    ClientReferral,
    /// One-time bonus when a recruited influencer crosses the earnings threshold
    Recruitment,
    /// Per-call commission for a recruited provider
    ProviderRecruitment,
}

/// Snapshot of commission rules taken at registration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CapturedRates {
    /// Config version the snapshot was taken from
    pub version: i64,
    pub captured_at: OffsetDateTime,
    #[serde(default)]
    pub client_referral: Option<CommissionRule>,
    #[serde(default)]
    pub recruitment: Option<CommissionRule>,
    #[serde(default)]
    pub provider_recruitment: Option<CommissionRule>,
}

impl CapturedRates {
    pub fn rule(&self, kind: RuleKind) -> Option<CommissionRule> {
        match kind {
            RuleKind::ClientReferral => self.client_referral,
            RuleKind::Recruitment => self.recruitment,
            RuleKind::ProviderRecruitment => self.provider_recruitment,
        }
    }
}

/// Freeze the current rules
pub fn capture_rates(config: &LedgerConfig, now: OffsetDateTime) -> CapturedRates {
    CapturedRates {
        version: config.version,
        captured_at: now,
        client_referral: Some(config.rules.client_referral),
        recruitment: Some(config.rules.recruitment),
        provider_recruitment: Some(config.rules.provider_recruitment),
    }
}

/// Rule for `kind`: captured first, live config otherwise
pub fn resolve_rule(
    captured: Option<&CapturedRates>,
    config: &LedgerConfig,
    kind: RuleKind,
) -> CommissionRule {
    captured
        .and_then(|rates| rates.rule(kind))
        .unwrap_or_else(|| config.rules.get(kind))
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_calculation_types() {
        assert_eq!(CommissionRule::fixed(1000).base_amount(49_00), 1000);

        let pct = CommissionRule {
            calculation_type: CalculationType::Percentage,
            fixed_amount: 0,
            percentage_rate: 10.0,
        };
        assert_eq!(pct.base_amount(4_999), 500);

        let hybrid = CommissionRule {
            calculation_type: CalculationType::Hybrid,
            fixed_amount: 200,
            percentage_rate: 5.0,
        };
        assert_eq!(hybrid.base_amount(10_000), 700);
    }

    #[test]
    fn test_captured_rates_survive_config_change() {
        let mut config = LedgerConfig::default();
        let captured = capture_rates(&config, datetime!(2026-01-01 00:00 UTC));

        config.rules.client_referral = CommissionRule::fixed(1500);
        config.version += 1;

        let rule = resolve_rule(Some(&captured), &config, RuleKind::ClientReferral);
        assert_eq!(rule.fixed_amount, 1000);
        assert_eq!(captured.version, 1);
    }

    #[test]
    fn test_missing_captured_rule_falls_back() {
        let mut config = LedgerConfig::default();
        let mut captured = capture_rates(&config, datetime!(2026-01-01 00:00 UTC));
        captured.provider_recruitment = None;
        config.rules.provider_recruitment = CommissionRule::fixed(700);

        let rule = resolve_rule(Some(&captured), &config, RuleKind::ProviderRecruitment);
        assert_eq!(rule.fixed_amount, 700);

        let legacy = resolve_rule(None, &config, RuleKind::Recruitment);
        assert_eq!(legacy.fixed_amount, 500);
    }
}
