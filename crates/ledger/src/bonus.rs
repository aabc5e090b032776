//! Bonus multipliers for client referral commissions
//!
//! Level (lifetime earnings), activity streak and the monthly top-3 reward
//! compose multiplicatively and the result is rounded to whole cents.

use serde::Serialize;

use crate::config::LedgerConfig;
use crate::types::Influencer;

/// How a final amount was derived
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BonusBreakdown {
    pub base_amount: i64,
    pub level: u8,
    pub level_multiplier: f64,
    pub streak_multiplier: f64,
    pub top_multiplier: f64,
    pub amount: i64,
}

impl BonusBreakdown {
    /// No bonuses applied
    pub fn flat(base_amount: i64) -> Self {
        Self {
            base_amount,
            level: 1,
            level_multiplier: 1.0,
            streak_multiplier: 1.0,
            top_multiplier: 1.0,
            amount: base_amount,
        }
    }
}

/// Level and multiplier for lifetime earnings
pub fn level_for(total_earned: i64, config: &LedgerConfig) -> (u8, f64) {
    config
        .level_tiers
        .iter()
        .rev()
        .find(|tier| total_earned >= tier.min_earned)
        .map(|tier| (tier.level, tier.multiplier))
        .unwrap_or((1, 1.0))
}

pub fn streak_multiplier(streak_days: i32, config: &LedgerConfig) -> f64 {
    config
        .streak_tiers
        .iter()
        .rev()
        .find(|tier| streak_days >= tier.min_days)
        .map(|tier| tier.multiplier)
        .unwrap_or(1.0)
}

/// Apply multipliers in order and round half away from zero
pub fn apply_multipliers(base_amount: i64, multipliers: &[f64]) -> i64 {
    let scaled = multipliers
        .iter()
        .fold(base_amount as f64, |acc, m| acc * m);
    scaled.round() as i64
}

/// Full bonus computation for a client referral created on `today` in `month`
pub fn compute_bonus(
    base_amount: i64,
    influencer: &Influencer,
    config: &LedgerConfig,
    today: time::Date,
    month: &str,
) -> BonusBreakdown {
    let (level, level_multiplier) = level_for(influencer.balances.total_earned, config);
    let streak_multiplier = streak_multiplier(influencer.effective_streak(today), config);
    let top_multiplier = influencer.multiplier_for(month);

    BonusBreakdown {
        base_amount,
        level,
        level_multiplier,
        streak_multiplier,
        top_multiplier,
        amount: apply_multipliers(
            base_amount,
            &[level_multiplier, streak_multiplier, top_multiplier],
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::influencer_fixture;
    use time::macros::date;

    #[test]
    fn test_level_step_function() {
        let config = LedgerConfig::default();
        assert_eq!(level_for(0, &config), (1, 1.0));
        assert_eq!(level_for(9_999, &config), (1, 1.0));
        assert_eq!(level_for(10_000, &config), (2, 1.10));
        assert_eq!(level_for(50_000, &config), (3, 1.20));
        assert_eq!(level_for(10_000_000, &config), (5, 1.50));
    }

    #[test]
    fn test_streak_tiers() {
        let config = LedgerConfig::default();
        assert_eq!(streak_multiplier(0, &config), 1.0);
        assert_eq!(streak_multiplier(6, &config), 1.0);
        assert_eq!(streak_multiplier(7, &config), 1.05);
        assert_eq!(streak_multiplier(29, &config), 1.10);
        assert_eq!(streak_multiplier(365, &config), 1.50);
    }

    #[test]
    fn test_level_three_with_rank_one_multiplier() {
        let config = LedgerConfig::default();
        let mut influencer = influencer_fixture();
        influencer.balances.total_earned = 60_000;
        influencer.monthly_multiplier = 1.5;
        influencer.multiplier_month = Some("2026-04".into());

        let bonus = compute_bonus(1000, &influencer, &config, date!(2026 - 04 - 03), "2026-04");
        assert_eq!(bonus.level, 3);
        assert_eq!(bonus.amount, 1800);
    }

    #[test]
    fn test_expired_multiplier_ignored() {
        let config = LedgerConfig::default();
        let mut influencer = influencer_fixture();
        influencer.monthly_multiplier = 2.0;
        influencer.multiplier_month = Some("2026-03".into());

        let bonus = compute_bonus(1000, &influencer, &config, date!(2026 - 04 - 03), "2026-04");
        assert_eq!(bonus.top_multiplier, 1.0);
        assert_eq!(bonus.amount, 1000);
    }

    #[test]
    fn test_rounding_to_cents() {
        assert_eq!(apply_multipliers(333, &[1.05]), 350);
        assert_eq!(apply_multipliers(1000, &[1.1, 1.05, 1.15]), 1328);
        assert_eq!(apply_multipliers(0, &[2.0]), 0);
    }
}
