//! Ledger records
//!
//! Plain data shared by the services and the storage backends. Amounts are
//! integer cents; status enums serialize as the lowercase strings stored in
//! Postgres.

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use crate::rates::CapturedRates;

pub const DEFAULT_CURRENCY: &str = "USD";

macro_rules! string_enum {
    ($(#[$meta:meta])* $name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(rename_all = "snake_case")]
        pub enum $name {
            $($variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl std::str::FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

string_enum!(
    /// Account state of an influencer
    InfluencerStatus {
        Active => "active",
        Pending => "pending",
        Banned => "banned",
        Suspended => "suspended",
    }
);

string_enum!(
    CommissionType {
        ClientReferral => "client_referral",
        Recruitment => "recruitment",
    }
);

string_enum!(
    /// Lifecycle: pending -> validated -> available, or cancelled from the first two
    CommissionStatus {
        Pending => "pending",
        Validated => "validated",
        Available => "available",
        Cancelled => "cancelled",
    }
);

string_enum!(
    /// What kind of event produced a commission
    SourceKind {
        CallSession => "call_session",
        User => "user",
        Provider => "provider",
    }
);

string_enum!(
    WithdrawalStatus {
        Pending => "pending",
        Approved => "approved",
        Rejected => "rejected",
        Processing => "processing",
        Completed => "completed",
        Failed => "failed",
    }
);

string_enum!(
    PaymentMethod {
        Paypal => "paypal",
        Wise => "wise",
        MobileMoney => "mobile_money",
        BankTransfer => "bank_transfer",
    }
);

string_enum!(
    NotificationKind {
        CommissionEarned => "commission_earned",
        CommissionValidated => "commission_validated",
        CommissionAvailable => "commission_available",
        RecruitmentReward => "recruitment_reward",
        WithdrawalApproved => "withdrawal_approved",
        WithdrawalRejected => "withdrawal_rejected",
        WithdrawalCompleted => "withdrawal_completed",
        WithdrawalFailed => "withdrawal_failed",
        RankAchieved => "rank_achieved",
    }
);

impl CommissionStatus {
    /// Whether a transition from `self` to `to` is allowed
    pub fn can_transition_to(&self, to: CommissionStatus) -> bool {
        matches!(
            (self, to),
            (CommissionStatus::Pending, CommissionStatus::Validated)
                | (CommissionStatus::Validated, CommissionStatus::Available)
                | (CommissionStatus::Pending, CommissionStatus::Cancelled)
                | (CommissionStatus::Validated, CommissionStatus::Cancelled)
        )
    }
}

impl WithdrawalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WithdrawalStatus::Rejected | WithdrawalStatus::Completed | WithdrawalStatus::Failed
        )
    }

    /// Statuses a withdrawal may be in for a move to `self`
    pub fn allowed_sources(&self) -> &'static [WithdrawalStatus] {
        match self {
            WithdrawalStatus::Approved => &[WithdrawalStatus::Pending],
            WithdrawalStatus::Rejected => &[WithdrawalStatus::Pending, WithdrawalStatus::Approved],
            WithdrawalStatus::Processing => &[WithdrawalStatus::Approved],
            WithdrawalStatus::Completed => &[WithdrawalStatus::Processing],
            WithdrawalStatus::Failed => &[WithdrawalStatus::Approved, WithdrawalStatus::Processing],
            WithdrawalStatus::Pending => &[],
        }
    }

    /// Whether leaving into this status returns the reserved funds
    pub fn refunds_balance(&self) -> bool {
        matches!(self, WithdrawalStatus::Rejected | WithdrawalStatus::Failed)
    }
}

/// Balance buckets on an influencer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    /// Lifetime earnings that reached `available`
    pub total_earned: i64,
    pub available: i64,
    pub pending: i64,
    pub validated: i64,
    pub total_withdrawn: i64,
}

/// Rolling statistics for a single calendar month
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonthlyStats {
    pub month: String,
    pub earnings: i64,
    pub clients: i64,
    pub recruits: i64,
}

impl MonthlyStats {
    pub fn empty(month: impl Into<String>) -> Self {
        Self {
            month: month.into(),
            earnings: 0,
            clients: 0,
            recruits: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Influencer {
    pub id: Uuid,
    pub display_name: String,
    pub email: String,
    pub status: InfluencerStatus,
    pub client_code: String,
    pub recruitment_code: String,
    pub balances: Balances,
    pub total_commissions: i64,
    pub total_clients: i64,
    pub total_recruits: i64,
    pub month_stats: MonthlyStats,
    pub current_month_rank: Option<i32>,
    pub best_rank: Option<i32>,
    pub monthly_multiplier: f64,
    /// Month (`YYYY-MM`) in which `monthly_multiplier` applies
    pub multiplier_month: Option<String>,
    pub pending_withdrawal_id: Option<Uuid>,
    pub captured_rates: Option<CapturedRates>,
    pub recruited_by: Option<Uuid>,
    pub current_streak: i32,
    pub best_streak: i32,
    pub last_activity_date: Option<Date>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Influencer {
    pub fn is_active(&self) -> bool {
        self.status == InfluencerStatus::Active
    }

    /// Multiplier in effect for `month`, neutral when none was awarded for it
    pub fn multiplier_for(&self, month: &str) -> f64 {
        match &self.multiplier_month {
            Some(m) if m == month => self.monthly_multiplier,
            _ => 1.0,
        }
    }

    /// Streak that still counts on `today`; a gap of more than a day breaks it
    pub fn effective_streak(&self, today: Date) -> i32 {
        match self.last_activity_date {
            Some(last) if last == today || last.next_day() == Some(today) => self.current_streak,
            _ => 0,
        }
    }
}

/// Origin of a commission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommissionSource {
    pub kind: SourceKind,
    pub id: Option<String>,
    #[serde(default)]
    pub details: serde_json::Value,
}

impl CommissionSource {
    pub fn new(kind: SourceKind, id: impl Into<String>) -> Self {
        Self {
            kind,
            id: Some(id.into()),
            details: serde_json::Value::Null,
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Commission {
    pub id: Uuid,
    pub influencer_id: Uuid,
    pub commission_type: CommissionType,
    pub status: CommissionStatus,
    /// Final amount after bonuses, fixed at creation
    pub amount: i64,
    pub base_amount: i64,
    pub level_multiplier: f64,
    pub streak_multiplier: f64,
    pub top_multiplier: f64,
    pub currency: String,
    pub source: CommissionSource,
    pub description: String,
    pub created_at: OffsetDateTime,
    pub validated_at: Option<OffsetDateTime>,
    pub available_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub cancellation_reason: Option<String>,
    pub updated_at: OffsetDateTime,
}

impl Commission {
    /// Month-stat counter bumped when this commission is created
    pub fn counts_as_client(&self) -> bool {
        self.commission_type == CommissionType::ClientReferral
    }
}

/// Recruiter -> recruit link with a one-shot threshold bonus
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecruitedInfluencer {
    pub id: Uuid,
    pub recruiter_id: Uuid,
    pub recruited_id: Uuid,
    pub recruitment_code: String,
    pub recruited_at: OffsetDateTime,
    pub commission_window_end: OffsetDateTime,
    pub is_active: bool,
    pub commission_paid: bool,
    pub commission_id: Option<Uuid>,
    pub commission_paid_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

/// Influencer -> provider link paying a fixed amount per paid call within the window
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderReferral {
    pub id: Uuid,
    pub influencer_id: Uuid,
    pub provider_id: String,
    pub provider_type: String,
    pub recruitment_code: String,
    pub recruited_at: OffsetDateTime,
    pub commission_window_end: OffsetDateTime,
    pub is_active: bool,
    pub calls_with_commission: i64,
    pub total_commissions: i64,
    pub last_commission_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

/// Method-specific payout details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum PaymentDetails {
    Paypal {
        email: String,
    },
    Wise {
        email: String,
        account_holder_name: String,
        #[serde(default)]
        currency: Option<String>,
    },
    MobileMoney {
        phone_number: String,
        provider: String,
        #[serde(default)]
        country: Option<String>,
    },
    BankTransfer {
        bank_name: String,
        account_holder_name: String,
        #[serde(default)]
        account_number: Option<String>,
        #[serde(default)]
        iban: Option<String>,
        #[serde(default)]
        swift_bic: Option<String>,
    },
}

impl PaymentDetails {
    pub fn method(&self) -> PaymentMethod {
        match self {
            PaymentDetails::Paypal { .. } => PaymentMethod::Paypal,
            PaymentDetails::Wise { .. } => PaymentMethod::Wise,
            PaymentDetails::MobileMoney { .. } => PaymentMethod::MobileMoney,
            PaymentDetails::BankTransfer { .. } => PaymentMethod::BankTransfer,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Withdrawal {
    pub id: Uuid,
    pub influencer_id: Uuid,
    pub amount: i64,
    pub currency: String,
    pub payment_method: PaymentMethod,
    pub payment_details: PaymentDetails,
    pub status: WithdrawalStatus,
    pub requested_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
    pub processed_by: Option<String>,
    pub rejection_reason: Option<String>,
    pub payment_reference: Option<String>,
    pub completed_at: Option<OffsetDateTime>,
    pub failed_at: Option<OffsetDateTime>,
    pub failure_reason: Option<String>,
}

/// Fields recorded alongside a withdrawal status change
#[derive(Debug, Clone, Default)]
pub struct WithdrawalUpdate {
    pub processed_by: Option<String>,
    pub reason: Option<String>,
    pub payment_reference: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingEntry {
    pub rank: i32,
    pub influencer_id: Uuid,
    pub name: String,
    pub client_code: String,
    pub earnings: i64,
    pub clients: i64,
    pub recruits: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonthlyRanking {
    /// `YYYY-MM`
    pub month: String,
    pub entries: Vec<RankingEntry>,
    pub calculated_at: OffsetDateTime,
    pub is_finalized: bool,
}

/// Outbox record consumed by the notification delivery pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: Uuid,
    pub influencer_id: Uuid,
    pub kind: NotificationKind,
    pub title: String,
    pub message: String,
    pub commission_id: Option<Uuid>,
    pub withdrawal_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub delivered_at: Option<OffsetDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::date;

    #[test]
    fn test_commission_transitions() {
        use CommissionStatus::*;
        assert!(Pending.can_transition_to(Validated));
        assert!(Validated.can_transition_to(Available));
        assert!(Pending.can_transition_to(Cancelled));
        assert!(Validated.can_transition_to(Cancelled));
        assert!(!Available.can_transition_to(Cancelled));
        assert!(!Cancelled.can_transition_to(Pending));
        assert!(!Pending.can_transition_to(Available));
    }

    #[test]
    fn test_withdrawal_state_machine() {
        use WithdrawalStatus::*;
        assert!(Completed.is_terminal());
        assert!(!Processing.is_terminal());
        assert!(Failed.refunds_balance());
        assert!(!Completed.refunds_balance());
        assert_eq!(Completed.allowed_sources(), &[Processing]);
        assert!(Pending.allowed_sources().is_empty());
    }

    #[test]
    fn test_status_string_roundtrip() {
        assert_eq!(
            "client_referral".parse::<CommissionType>().unwrap(),
            CommissionType::ClientReferral
        );
        assert_eq!(WithdrawalStatus::Processing.as_str(), "processing");
        assert!("paid".parse::<CommissionStatus>().is_err());
    }

    #[test]
    fn test_payment_details_tagging() {
        let details: PaymentDetails =
            serde_json::from_value(serde_json::json!({"method": "paypal", "email": "a@b.co"}))
                .unwrap();
        assert_eq!(details.method(), PaymentMethod::Paypal);
    }

    #[test]
    fn test_effective_streak() {
        let mut influencer = crate::test_support::influencer_fixture();
        influencer.current_streak = 9;
        influencer.last_activity_date = Some(date!(2026 - 03 - 10));
        assert_eq!(influencer.effective_streak(date!(2026 - 03 - 10)), 9);
        assert_eq!(influencer.effective_streak(date!(2026 - 03 - 11)), 9);
        assert_eq!(influencer.effective_streak(date!(2026 - 03 - 12)), 0);
    }
}
