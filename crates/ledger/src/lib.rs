// Ledger crate clippy configuration
#![allow(clippy::too_many_arguments)] // Store methods mirror the columns they write
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::float_cmp))]

//! Refbase Commission Ledger
//!
//! Tracks what each influencer has earned through referrals, moves earnings
//! through a timed hold, and pays them out through reviewed withdrawals.
//!
//! ## Features
//!
//! - **Commissions**: Idempotent creation per source, priced from captured rates
//! - **Bonuses**: Level, activity streak and monthly top-3 multipliers
//! - **Settlement**: `pending` to `validated` to `available` on a configurable hold
//! - **Recruitment**: One-time recruiter reward once a recruit crosses the threshold
//! - **Provider Referrals**: Per-call commissions inside the recruitment window
//! - **Withdrawals**: Single outstanding request with reserved funds and admin review
//! - **Rankings**: Monthly leaderboard snapshot and next-month multipliers
//! - **Triggers**: Platform events mapped onto ledger operations
//! - **Invariants**: Runnable balance conservation checks

pub mod bonus;
pub mod clock;
pub mod commission;
pub mod config;
pub mod error;
pub mod invariants;
pub mod notifications;
pub mod provider;
pub mod ranking;
pub mod rates;
pub mod recruitment;
pub mod registration;
pub mod store;
pub mod triggers;
pub mod types;
pub mod withdrawal;


// Bonus
pub use bonus::{compute_bonus, BonusBreakdown};

// Clock
pub use clock::{Clock, ManualClock, SystemClock};

// Commission
pub use commission::{BatchResult, CancelResult, CommissionService, NewCommission};

// Config
pub use config::{CommissionRules, ConfigProvider, LedgerConfig, LevelTier, StreakTier};

// Error
pub use error::{ErrorCategory, LedgerError, LedgerResult};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Notifications
pub use notifications::{NotificationOutbox, NotificationRefs};

// Provider
pub use provider::{PaidProviderCall, ProviderCommissionOutcome, ProviderCommissionService};

// Ranking
pub use ranking::{RankingResult, RankingService};

// Rates
pub use rates::{CalculationType, CapturedRates, CommissionRule, RuleKind};

// Recruitment
pub use recruitment::{RecruitmentOutcome, RecruitmentService};

// Registration
pub use registration::{NewInfluencer, NewProvider, RegistrationService};

// Store
pub use store::{InMemoryStore, LedgerStore, PgStore};

// Triggers
pub use triggers::{CompletedCall, LedgerEvent, RefundedPayment, TriggerDispatcher, TriggerOutcome};

// Types
pub use types::{
    Balances, Commission, CommissionSource, CommissionStatus, CommissionType, Influencer,
    InfluencerStatus, MonthlyRanking, MonthlyStats, Notification, NotificationKind,
    PaymentDetails, PaymentMethod, ProviderReferral, RankingEntry, RecruitedInfluencer,
    SourceKind, Withdrawal, WithdrawalStatus,
};

// Withdrawal
pub use withdrawal::{WithdrawalRequest, WithdrawalService};

use std::sync::Arc;

use sqlx::PgPool;

/// Main ledger service that combines all ledger functionality
///
/// Every service shares one store, one clock and one config provider, so a
/// config update through `config` is seen by all of them.
pub struct LedgerService {
    pub config: Arc<ConfigProvider>,
    pub commissions: CommissionService,
    pub recruitment: RecruitmentService,
    pub providers: ProviderCommissionService,
    pub registration: RegistrationService,
    pub withdrawals: WithdrawalService,
    pub ranking: RankingService,
    pub notifications: NotificationOutbox,
    pub triggers: TriggerDispatcher,
    pub invariants: InvariantChecker,
}

impl LedgerService {
    /// Create a ledger service over an arbitrary store and clock
    pub fn new(store: Arc<dyn LedgerStore>, clock: Arc<dyn Clock>) -> Self {
        let config = Arc::new(ConfigProvider::new(store.clone(), clock.clone()));
        Self::with_config(store, clock, config)
    }

    /// Create a ledger service around an existing config provider
    pub fn with_config(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        config: Arc<ConfigProvider>,
    ) -> Self {
        let commissions = CommissionService::new(store.clone(), clock.clone(), config.clone());
        let providers =
            ProviderCommissionService::new(store.clone(), clock.clone(), commissions.clone());
        let registration = RegistrationService::new(store.clone(), clock.clone(), config.clone());

        Self {
            recruitment: RecruitmentService::new(store.clone(), clock.clone(), config.clone()),
            withdrawals: WithdrawalService::new(store.clone(), clock.clone(), config.clone()),
            ranking: RankingService::new(store.clone(), clock.clone(), config.clone()),
            notifications: NotificationOutbox::new(store.clone(), clock.clone()),
            triggers: TriggerDispatcher::new(
                store.clone(),
                commissions.clone(),
                providers.clone(),
                registration.clone(),
            ),
            invariants: InvariantChecker::new(store, clock),
            commissions,
            providers,
            registration,
            config,
        }
    }

    /// Create a Postgres-backed ledger service on the wall clock
    pub fn from_pool(pool: PgPool) -> Self {
        Self::new(Arc::new(PgStore::new(pool)), Arc::new(SystemClock))
    }

    /// Postgres-backed service with explicit batch size and config cache TTL
    pub fn from_pool_with(pool: PgPool, batch_size: i64, config_ttl: time::Duration) -> Self {
        let store: Arc<dyn LedgerStore> = Arc::new(PgStore::new(pool));
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let config = Arc::new(ConfigProvider::with_ttl(
            store.clone(),
            clock.clone(),
            config_ttl,
        ));
        let mut service = Self::with_config(store, clock, config);
        service.commissions = service.commissions.with_batch_size(batch_size);
        service
    }
}
