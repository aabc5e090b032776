//! Ledger error types

use uuid::Uuid;

/// Stable error categories exposed to callers of user-facing operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    PreconditionFailed,
    NotFound,
    InvalidArgument,
    Conflict,
    Internal,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::PreconditionFailed => "precondition_failed",
            ErrorCategory::NotFound => "not_found",
            ErrorCategory::InvalidArgument => "invalid_argument",
            ErrorCategory::Conflict => "conflict",
            ErrorCategory::Internal => "internal",
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Influencer not found: {0}")]
    InfluencerNotFound(Uuid),

    #[error("Commission not found: {0}")]
    CommissionNotFound(Uuid),

    #[error("Withdrawal not found: {0}")]
    WithdrawalNotFound(Uuid),

    #[error("Influencer {id} is not active (status: {status})")]
    InfluencerNotActive { id: Uuid, status: String },

    #[error("Commission system is disabled")]
    SystemDisabled,

    #[error("Withdrawals are currently disabled")]
    WithdrawalsDisabled,

    #[error("A withdrawal is already pending: {0}")]
    WithdrawalAlreadyPending(Uuid),

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: i64, available: i64 },

    #[error("Amount {requested} is below the minimum withdrawal of {minimum}")]
    BelowMinimum { requested: i64, minimum: i64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid payment details: {0}")]
    InvalidPaymentDetails(String),

    #[error("Invalid month key: {0}")]
    InvalidMonth(String),

    #[error("Cannot move {entity} from {from} to {to}")]
    InvalidTransition {
        entity: &'static str,
        from: String,
        to: String,
    },

    #[error("Commission already exists for this source")]
    DuplicateCommission,

    #[error("Record already exists: {0}")]
    AlreadyExists(String),

    #[error("Concurrent modification detected: {0}")]
    ConcurrentModification(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl LedgerError {
    /// Coarse category for callers that only need to branch on the kind of failure
    pub fn category(&self) -> ErrorCategory {
        match self {
            LedgerError::InfluencerNotFound(_)
            | LedgerError::CommissionNotFound(_)
            | LedgerError::WithdrawalNotFound(_) => ErrorCategory::NotFound,

            LedgerError::InfluencerNotActive { .. }
            | LedgerError::SystemDisabled
            | LedgerError::WithdrawalsDisabled
            | LedgerError::WithdrawalAlreadyPending(_)
            | LedgerError::InsufficientBalance { .. }
            | LedgerError::BelowMinimum { .. }
            | LedgerError::InvalidTransition { .. } => ErrorCategory::PreconditionFailed,

            LedgerError::InvalidAmount(_)
            | LedgerError::InvalidPaymentDetails(_)
            | LedgerError::InvalidMonth(_) => ErrorCategory::InvalidArgument,

            LedgerError::DuplicateCommission
            | LedgerError::AlreadyExists(_)
            | LedgerError::ConcurrentModification(_) => ErrorCategory::Conflict,

            LedgerError::Config(_)
            | LedgerError::Database(_)
            | LedgerError::Serialization(_)
            | LedgerError::Internal(_) => ErrorCategory::Internal,
        }
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            LedgerError::InfluencerNotFound(_) => "INFLUENCER_NOT_FOUND",
            LedgerError::CommissionNotFound(_) => "COMMISSION_NOT_FOUND",
            LedgerError::WithdrawalNotFound(_) => "WITHDRAWAL_NOT_FOUND",
            LedgerError::InfluencerNotActive { .. } => "INFLUENCER_NOT_ACTIVE",
            LedgerError::SystemDisabled => "SYSTEM_DISABLED",
            LedgerError::WithdrawalsDisabled => "WITHDRAWALS_DISABLED",
            LedgerError::WithdrawalAlreadyPending(_) => "WITHDRAWAL_ALREADY_PENDING",
            LedgerError::InsufficientBalance { .. } => "INSUFFICIENT_BALANCE",
            LedgerError::BelowMinimum { .. } => "BELOW_MINIMUM",
            LedgerError::InvalidAmount(_) => "INVALID_AMOUNT",
            LedgerError::InvalidPaymentDetails(_) => "INVALID_PAYMENT_DETAILS",
            LedgerError::InvalidMonth(_) => "INVALID_MONTH",
            LedgerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            LedgerError::DuplicateCommission => "DUPLICATE_COMMISSION",
            LedgerError::AlreadyExists(_) => "ALREADY_EXISTS",
            LedgerError::ConcurrentModification(_) => "CONCURRENT_MODIFICATION",
            LedgerError::Config(_) => "CONFIG_ERROR",
            LedgerError::Database(_) => "DATABASE_ERROR",
            LedgerError::Serialization(_) => "SERIALIZATION_ERROR",
            LedgerError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether repeating the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Database(_)
                | LedgerError::ConcurrentModification(_)
                | LedgerError::Internal(_)
        )
    }

    /// Message safe to show to end users; internal details are withheld
    pub fn public_message(&self) -> String {
        match self.category() {
            ErrorCategory::Internal => "An internal error occurred".to_string(),
            _ => self.to_string(),
        }
    }
}

pub type LedgerResult<T> = Result<T, LedgerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_withdrawal_errors_are_preconditions() {
        let errors = [
            LedgerError::WithdrawalsDisabled,
            LedgerError::WithdrawalAlreadyPending(Uuid::nil()),
            LedgerError::InsufficientBalance {
                requested: 10,
                available: 5,
            },
            LedgerError::BelowMinimum {
                requested: 10,
                minimum: 2500,
            },
        ];
        for err in errors {
            assert_eq!(err.category(), ErrorCategory::PreconditionFailed);
        }
    }

    #[test]
    fn test_internal_details_hidden() {
        let err = LedgerError::Internal("lock poisoned at store.rs:42".into());
        assert_eq!(err.public_message(), "An internal error occurred");
        assert_eq!(err.code(), "INTERNAL_ERROR");

        let err = LedgerError::WithdrawalsDisabled;
        assert_eq!(err.public_message(), "Withdrawals are currently disabled");
    }

    #[test]
    fn test_only_transient_errors_retry() {
        assert!(LedgerError::ConcurrentModification("row moved".into()).is_retryable());
        assert!(!LedgerError::DuplicateCommission.is_retryable());
        assert!(!LedgerError::InfluencerNotFound(Uuid::nil()).is_retryable());
    }
}
