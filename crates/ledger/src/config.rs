//! Commission configuration and its cached provider
//!
//! Operations never read a global config. They take an `Arc<LedgerConfig>`
//! snapshot from [`ConfigProvider::current`], which caches the persisted
//! document for a TTL and can be invalidated explicitly after admin edits.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::error::{LedgerError, LedgerResult};
use crate::rates::{CommissionRule, RuleKind};
use crate::store::LedgerStore;

/// Default cache lifetime for config snapshots
pub const DEFAULT_CACHE_TTL: time::Duration = time::Duration::minutes(5);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CommissionRules {
    pub client_referral: CommissionRule,
    pub recruitment: CommissionRule,
    pub provider_recruitment: CommissionRule,
}

impl CommissionRules {
    pub fn get(&self, kind: RuleKind) -> CommissionRule {
        match kind {
            RuleKind::ClientReferral => self.client_referral,
            RuleKind::Recruitment => self.recruitment,
            RuleKind::ProviderRecruitment => self.provider_recruitment,
        }
    }
}

impl Default for CommissionRules {
    fn default() -> Self {
        Self {
            client_referral: CommissionRule::fixed(1000),
            recruitment: CommissionRule::fixed(500),
            provider_recruitment: CommissionRule::fixed(500),
        }
    }
}

/// Level reached once lifetime earnings hit `min_earned`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LevelTier {
    pub level: u8,
    pub min_earned: i64,
    pub multiplier: f64,
}

impl LevelTier {
    pub const fn new(level: u8, min_earned: i64, multiplier: f64) -> Self {
        Self {
            level,
            min_earned,
            multiplier,
        }
    }
}

/// Multiplier applied once an activity streak reaches `min_days`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StreakTier {
    pub min_days: i32,
    pub multiplier: f64,
}

impl StreakTier {
    pub const fn new(min_days: i32, multiplier: f64) -> Self {
        Self {
            min_days,
            multiplier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    pub version: i64,
    pub is_system_active: bool,
    pub withdrawals_enabled: bool,
    pub rules: CommissionRules,
    pub minimum_withdrawal_amount: i64,
    pub validation_hold_days: i64,
    pub release_delay_hours: i64,
    pub recruitment_window_months: u32,
    /// Cumulative client earnings a recruit must reach before the recruiter is paid
    pub recruitment_threshold: i64,
    /// Ascending by `min_earned`, first tier at zero
    pub level_tiers: Vec<LevelTier>,
    /// Ascending by `min_days`
    pub streak_tiers: Vec<StreakTier>,
    /// Index 0 is rank 1
    pub top_multipliers: Vec<f64>,
    pub leaderboard_size: usize,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            version: 1,
            is_system_active: true,
            withdrawals_enabled: true,
            rules: CommissionRules::default(),
            minimum_withdrawal_amount: 2500,
            validation_hold_days: 7,
            release_delay_hours: 24,
            recruitment_window_months: 6,
            recruitment_threshold: 5000,
            level_tiers: vec![
                LevelTier::new(1, 0, 1.00),
                LevelTier::new(2, 10_000, 1.10),
                LevelTier::new(3, 50_000, 1.20),
                LevelTier::new(4, 200_000, 1.35),
                LevelTier::new(5, 500_000, 1.50),
            ],
            streak_tiers: vec![
                StreakTier::new(7, 1.05),
                StreakTier::new(14, 1.10),
                StreakTier::new(30, 1.20),
                StreakTier::new(100, 1.50),
            ],
            top_multipliers: vec![2.00, 1.50, 1.15],
            leaderboard_size: 10,
        }
    }
}

impl LedgerConfig {
    pub fn hold_delay(&self) -> time::Duration {
        time::Duration::days(self.validation_hold_days)
    }

    pub fn release_delay(&self) -> time::Duration {
        time::Duration::hours(self.release_delay_hours)
    }

    /// Multiplier for a leaderboard rank, `None` outside the rewarded ranks
    pub fn top_multiplier(&self, rank: i32) -> Option<f64> {
        usize::try_from(rank - 1)
            .ok()
            .and_then(|idx| self.top_multipliers.get(idx))
            .copied()
    }

    /// Reject documents that would make the ledger misbehave
    pub fn validate(&self) -> LedgerResult<()> {
        let rules = [
            ("client_referral", self.rules.client_referral),
            ("recruitment", self.rules.recruitment),
            ("provider_recruitment", self.rules.provider_recruitment),
        ];
        for (name, rule) in rules {
            if rule.fixed_amount < 0 || !(0.0..=100.0).contains(&rule.percentage_rate) {
                return Err(LedgerError::Config(format!("invalid {} rule", name)));
            }
        }
        if self.minimum_withdrawal_amount < 0
            || self.validation_hold_days < 0
            || self.release_delay_hours < 0
            || self.recruitment_threshold < 0
        {
            return Err(LedgerError::Config(
                "amounts and delays must be non-negative".into(),
            ));
        }
        if !self
            .level_tiers
            .windows(2)
            .all(|w| w[0].min_earned < w[1].min_earned)
        {
            return Err(LedgerError::Config("level tiers must be ascending".into()));
        }
        if !self.streak_tiers.windows(2).all(|w| w[0].min_days < w[1].min_days) {
            return Err(LedgerError::Config("streak tiers must be ascending".into()));
        }
        let multipliers = self
            .level_tiers
            .iter()
            .map(|t| t.multiplier)
            .chain(self.streak_tiers.iter().map(|t| t.multiplier))
            .chain(self.top_multipliers.iter().copied());
        for m in multipliers {
            if !m.is_finite() || m < 1.0 {
                return Err(LedgerError::Config(format!("multiplier {} below 1.0", m)));
            }
        }
        Ok(())
    }
}

struct CachedConfig {
    config: Arc<LedgerConfig>,
    loaded_at: OffsetDateTime,
}

/// Cached, versioned access to the persisted configuration
pub struct ConfigProvider {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    ttl: time::Duration,
    cache: RwLock<Option<CachedConfig>>,
}

impl ConfigProvider {
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(store, clock, DEFAULT_CACHE_TTL)
    }

    pub fn with_ttl(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        ttl: time::Duration,
    ) -> Self {
        Self {
            store,
            clock,
            ttl,
            cache: RwLock::new(None),
        }
    }

    /// Current snapshot, reloading when the cache is empty or stale
    ///
    /// A store without a persisted document yields the defaults.
    pub async fn current(&self) -> LedgerResult<Arc<LedgerConfig>> {
        let now = self.clock.now();
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.as_ref() {
                if now - cached.loaded_at < self.ttl {
                    return Ok(cached.config.clone());
                }
            }
        }

        let config = Arc::new(self.store.load_config().await?.unwrap_or_default());
        let mut cache = self.cache.write().await;
        *cache = Some(CachedConfig {
            config: config.clone(),
            loaded_at: now,
        });
        tracing::debug!(version = config.version, "Ledger config loaded");
        Ok(config)
    }

    /// Version of the snapshot `current()` would return
    pub async fn version(&self) -> LedgerResult<i64> {
        Ok(self.current().await?.version)
    }

    /// Drop the cached snapshot so the next read hits the store
    pub async fn invalidate(&self) {
        *self.cache.write().await = None;
        tracing::info!("Ledger config cache invalidated");
    }

    /// Persist a new document as the next version
    pub async fn update(&self, mut config: LedgerConfig) -> LedgerResult<Arc<LedgerConfig>> {
        config.validate()?;
        let previous = self.store.load_config().await?.unwrap_or_default();
        config.version = previous.version + 1;
        self.store.save_config(&config).await?;
        self.invalidate().await;

        tracing::info!(
            previous_version = previous.version,
            version = config.version,
            "Ledger config updated"
        );
        Ok(Arc::new(config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::InMemoryStore;
    use time::macros::datetime;

    fn provider() -> (Arc<InMemoryStore>, ManualClock, ConfigProvider) {
        let store = Arc::new(InMemoryStore::new());
        let clock = ManualClock::new(datetime!(2026-05-01 00:00 UTC));
        let provider = ConfigProvider::new(store.clone(), Arc::new(clock.clone()));
        (store, clock, provider)
    }

    #[tokio::test]
    async fn test_defaults_when_nothing_persisted() {
        let (_, _, provider) = provider();
        let config = provider.current().await.unwrap();
        assert_eq!(*config, LedgerConfig::default());
        assert_eq!(config.top_multiplier(1), Some(2.0));
        assert_eq!(config.top_multiplier(4), None);
        assert_eq!(config.top_multiplier(0), None);
    }

    #[tokio::test]
    async fn test_cache_serves_stale_until_ttl_or_invalidate() {
        let (store, clock, provider) = provider();
        assert_eq!(provider.version().await.unwrap(), 1);

        let changed = LedgerConfig {
            version: 7,
            recruitment_threshold: 9000,
            ..LedgerConfig::default()
        };
        store.save_config(&changed).await.unwrap();

        // Still cached
        assert_eq!(provider.version().await.unwrap(), 1);

        clock.advance(time::Duration::minutes(6));
        assert_eq!(provider.version().await.unwrap(), 7);

        let newer = LedgerConfig {
            version: 8,
            ..changed
        };
        store.save_config(&newer).await.unwrap();
        provider.invalidate().await;
        assert_eq!(provider.version().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn test_update_bumps_version() {
        let (_, _, provider) = provider();
        let mut config = LedgerConfig::default();
        config.minimum_withdrawal_amount = 1000;

        let saved = provider.update(config.clone()).await.unwrap();
        assert_eq!(saved.version, 2);
        let current = provider.current().await.unwrap();
        assert_eq!(current.version, 2);
        assert_eq!(current.minimum_withdrawal_amount, 1000);

        let again = provider.update(config).await.unwrap();
        assert_eq!(again.version, 3);
    }

    #[tokio::test]
    async fn test_update_rejects_bad_tiers() {
        let (_, _, provider) = provider();
        let mut config = LedgerConfig::default();
        config.top_multipliers = vec![0.5];
        assert!(matches!(
            provider.update(config).await,
            Err(LedgerError::Config(_))
        ));
    }
}
