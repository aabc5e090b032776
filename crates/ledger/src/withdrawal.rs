//! Withdrawal processor
//!
//! Requests reserve funds out of `available_balance` immediately. Admin
//! actions then walk the request through its state machine:
//!
//! ```text
//! pending -> approved -> processing -> completed
//!    |          |            |
//!    +-> rejected <-+        +-> failed <- approved
//! ```
//!
//! Rejected and failed requests return the reserved funds; completed ones
//! count towards `total_withdrawn`. Moving funds to the payout rail is not
//! done here.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::config::ConfigProvider;
use crate::error::{LedgerError, LedgerResult};
use crate::notifications::{format_cents, NotificationOutbox, NotificationRefs};
use crate::store::LedgerStore;
use crate::types::{
    NotificationKind, PaymentDetails, Withdrawal, WithdrawalStatus, WithdrawalUpdate,
    DEFAULT_CURRENCY,
};

/// Upper bound on the pending queue returned to admins
const PENDING_PAGE_SIZE: i64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WithdrawalRequest {
    pub influencer_id: Uuid,
    /// Cents; the whole available balance when omitted
    #[serde(default)]
    pub amount: Option<i64>,
    pub payment_details: PaymentDetails,
}

fn blank(value: &str) -> bool {
    value.trim().is_empty()
}

fn looks_like_email(value: &str) -> bool {
    let value = value.trim();
    match value.split_once('@') {
        Some((local, domain)) => {
            !local.is_empty() && domain.contains('.') && !domain.ends_with('.')
        }
        None => false,
    }
}

/// Check the fields each payout method needs
pub fn validate_payment_details(details: &PaymentDetails) -> LedgerResult<()> {
    let invalid = |msg: &str| Err(LedgerError::InvalidPaymentDetails(msg.to_string()));
    match details {
        PaymentDetails::Paypal { email } => {
            if !looks_like_email(email) {
                return invalid("paypal requires a valid email");
            }
        }
        PaymentDetails::Wise {
            email,
            account_holder_name,
            ..
        } => {
            if !looks_like_email(email) {
                return invalid("wise requires a valid email");
            }
            if blank(account_holder_name) {
                return invalid("wise requires the account holder name");
            }
        }
        PaymentDetails::MobileMoney {
            phone_number,
            provider,
            ..
        } => {
            let digits = phone_number.chars().filter(char::is_ascii_digit).count();
            if digits < 6 {
                return invalid("mobile money requires a phone number");
            }
            if blank(provider) {
                return invalid("mobile money requires the provider");
            }
        }
        PaymentDetails::BankTransfer {
            bank_name,
            account_holder_name,
            account_number,
            iban,
            ..
        } => {
            if blank(bank_name) {
                return invalid("bank transfer requires the bank name");
            }
            if blank(account_holder_name) {
                return invalid("bank transfer requires the account holder name");
            }
            let has_account = account_number.as_deref().is_some_and(|v| !blank(v))
                || iban.as_deref().is_some_and(|v| !blank(v));
            if !has_account {
                return invalid("bank transfer requires an account number or IBAN");
            }
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct WithdrawalService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: Arc<ConfigProvider>,
    outbox: NotificationOutbox,
}

impl WithdrawalService {
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

    /// Reserve funds and open a pending withdrawal
    pub async fn create_withdrawal_request(
        &self,
        request: WithdrawalRequest,
    ) -> LedgerResult<Withdrawal> {
        let config = self.config.current().await?;
        if !config.withdrawals_enabled {
            return Err(LedgerError::WithdrawalsDisabled);
        }

        let influencer = self
            .store
            .get_influencer(request.influencer_id)
            .await?
            .ok_or(LedgerError::InfluencerNotFound(request.influencer_id))?;
        if !influencer.is_active() {
            return Err(LedgerError::InfluencerNotActive {
                id: influencer.id,
                status: influencer.status.to_string(),
            });
        }
        if let Some(pending) = influencer.pending_withdrawal_id {
            return Err(LedgerError::WithdrawalAlreadyPending(pending));
        }

        let available = influencer.balances.available;
        let amount = request.amount.unwrap_or(available);
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(format!(
                "withdrawal amount must be positive, got {}",
                amount
            )));
        }
        if amount > available {
            return Err(LedgerError::InsufficientBalance {
                requested: amount,
                available,
            });
        }
        if amount < config.minimum_withdrawal_amount {
            return Err(LedgerError::BelowMinimum {
                requested: amount,
                minimum: config.minimum_withdrawal_amount,
            });
        }
        validate_payment_details(&request.payment_details)?;

        let now = self.clock.now();
        let withdrawal = Withdrawal {
            id: Uuid::new_v4(),
            influencer_id: influencer.id,
            amount,
            currency: DEFAULT_CURRENCY.to_string(),
            payment_method: request.payment_details.method(),
            payment_details: request.payment_details,
            status: WithdrawalStatus::Pending,
            requested_at: now,
            processed_at: None,
            processed_by: None,
            rejection_reason: None,
            payment_reference: None,
            completed_at: None,
            failed_at: None,
            failure_reason: None,
        };

        // The store re-checks balance and pending id atomically
        self.store.create_withdrawal(&withdrawal).await?;

        tracing::info!(
            influencer_id = %influencer.id,
            withdrawal_id = %withdrawal.id,
            amount,
            method = %withdrawal.payment_method,
            "Withdrawal requested"
        );
        Ok(withdrawal)
    }

    pub async fn approve(&self, id: Uuid, admin: &str) -> LedgerResult<Withdrawal> {
        self.transition(
            id,
            WithdrawalStatus::Approved,
            WithdrawalUpdate {
                processed_by: Some(admin.to_string()),
                ..WithdrawalUpdate::default()
            },
        )
        .await
    }

    pub async fn reject(&self, id: Uuid, admin: &str, reason: &str) -> LedgerResult<Withdrawal> {
        self.transition(
            id,
            WithdrawalStatus::Rejected,
            WithdrawalUpdate {
                processed_by: Some(admin.to_string()),
                reason: Some(reason.to_string()),
                ..WithdrawalUpdate::default()
            },
        )
        .await
    }

    pub async fn mark_processing(&self, id: Uuid, admin: &str) -> LedgerResult<Withdrawal> {
        self.transition(
            id,
            WithdrawalStatus::Processing,
            WithdrawalUpdate {
                processed_by: Some(admin.to_string()),
                ..WithdrawalUpdate::default()
            },
        )
        .await
    }

    pub async fn complete(&self, id: Uuid, payment_reference: &str) -> LedgerResult<Withdrawal> {
        self.transition(
            id,
            WithdrawalStatus::Completed,
            WithdrawalUpdate {
                payment_reference: Some(payment_reference.to_string()),
                ..WithdrawalUpdate::default()
            },
        )
        .await
    }

    pub async fn fail(&self, id: Uuid, reason: &str) -> LedgerResult<Withdrawal> {
        self.transition(
            id,
            WithdrawalStatus::Failed,
            WithdrawalUpdate {
                reason: Some(reason.to_string()),
                ..WithdrawalUpdate::default()
            },
        )
        .await
    }

    async fn transition(
        &self,
        id: Uuid,
        to: WithdrawalStatus,
        update: WithdrawalUpdate,
    ) -> LedgerResult<Withdrawal> {
        let now = self.clock.now();
        let Some(withdrawal) = self
            .store
            .transition_withdrawal(id, to, &update, now)
            .await?
        else {
            let current = self.get_withdrawal(id).await?;
            return Err(LedgerError::InvalidTransition {
                entity: "withdrawal",
                from: current.status.to_string(),
                to: to.to_string(),
            });
        };

        tracing::info!(
            withdrawal_id = %id,
            influencer_id = %withdrawal.influencer_id,
            status = %to,
            amount = withdrawal.amount,
            "Withdrawal status changed"
        );
        self.notify(&withdrawal).await;
        Ok(withdrawal)
    }

    async fn notify(&self, withdrawal: &Withdrawal) {
        let amount = format_cents(withdrawal.amount);
        let (kind, title, message) = match withdrawal.status {
            WithdrawalStatus::Approved => (
                NotificationKind::WithdrawalApproved,
                "Withdrawal approved",
                format!("Your ${} withdrawal was approved.", amount),
            ),
            WithdrawalStatus::Rejected => (
                NotificationKind::WithdrawalRejected,
                "Withdrawal rejected",
                format!(
                    "Your ${} withdrawal was rejected: {}. The funds are back in your balance.",
                    amount,
                    withdrawal.rejection_reason.as_deref().unwrap_or("no reason given")
                ),
            ),
            WithdrawalStatus::Completed => (
                NotificationKind::WithdrawalCompleted,
                "Withdrawal sent",
                format!("Your ${} withdrawal has been paid.", amount),
            ),
            WithdrawalStatus::Failed => (
                NotificationKind::WithdrawalFailed,
                "Withdrawal failed",
                format!(
                    "Your ${} withdrawal failed: {}. The funds are back in your balance.",
                    amount,
                    withdrawal.failure_reason.as_deref().unwrap_or("unknown error")
                ),
            ),
            WithdrawalStatus::Pending | WithdrawalStatus::Processing => return,
        };
        self.outbox
            .notify(
                withdrawal.influencer_id,
                kind,
                title,
                message,
                NotificationRefs::withdrawal(withdrawal.id),
            )
            .await;
    }

    pub async fn get_withdrawal(&self, id: Uuid) -> LedgerResult<Withdrawal> {
        self.store
            .get_withdrawal(id)
            .await?
            .ok_or(LedgerError::WithdrawalNotFound(id))
    }

    /// Admin queue, oldest first
    pub async fn get_pending_withdrawals(&self) -> LedgerResult<Vec<Withdrawal>> {
        self.store
            .list_withdrawals_by_status(WithdrawalStatus::Pending, PENDING_PAGE_SIZE)
            .await
    }

    /// Newest first
    pub async fn list_withdrawals_for_influencer(
        &self,
        influencer_id: Uuid,
    ) -> LedgerResult<Vec<Withdrawal>> {
        self.store
            .list_withdrawals_for_influencer(influencer_id)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{paypal, Harness};

    #[test]
    fn test_payment_detail_rules() {
        assert!(validate_payment_details(&paypal()).is_ok());
        assert!(validate_payment_details(&PaymentDetails::Paypal {
            email: "not-an-email".into()
        })
        .is_err());
        assert!(validate_payment_details(&PaymentDetails::Wise {
            email: "a@b.co".into(),
            account_holder_name: " ".into(),
            currency: None,
        })
        .is_err());
        assert!(validate_payment_details(&PaymentDetails::MobileMoney {
            phone_number: "+221 77 123 45 67".into(),
            provider: "orange".into(),
            country: Some("SN".into()),
        })
        .is_ok());
        assert!(validate_payment_details(&PaymentDetails::BankTransfer {
            bank_name: "ACME Bank".into(),
            account_holder_name: "Ada".into(),
            account_number: None,
            iban: None,
            swift_bic: Some("ACMEFRPP".into()),
        })
        .is_err());
        assert!(validate_payment_details(&PaymentDetails::BankTransfer {
            bank_name: "ACME Bank".into(),
            account_holder_name: "Ada".into(),
            account_number: None,
            iban: Some("FR7630006000011234567890189".into()),
            swift_bic: None,
        })
        .is_ok());
    }

    #[tokio::test]
    async fn test_amount_defaults_to_full_balance() {
        let h = Harness::new().await;
        let influencer = h.funded_influencer("Ada", 3).await;

        let withdrawal = h
            .ledger
            .withdrawals
            .create_withdrawal_request(WithdrawalRequest {
                influencer_id: influencer.id,
                amount: None,
                payment_details: paypal(),
            })
            .await
            .unwrap();
        assert_eq!(withdrawal.amount, 3000);
        assert_eq!(h.reload(influencer.id).await.balances.available, 0);
    }

    #[tokio::test]
    async fn test_request_preconditions() {
        let h = Harness::new().await;
        let influencer = h.funded_influencer("Ada", 3).await;
        let service = &h.ledger.withdrawals;
        let request = |amount: Option<i64>| WithdrawalRequest {
            influencer_id: influencer.id,
            amount,
            payment_details: paypal(),
        };

        let err = service.create_withdrawal_request(request(Some(0))).await.unwrap_err();
        assert_eq!(err.code(), "INVALID_AMOUNT");
        let err = service.create_withdrawal_request(request(Some(2000))).await.unwrap_err();
        assert_eq!(err.code(), "BELOW_MINIMUM");
        let err = service.create_withdrawal_request(request(Some(9000))).await.unwrap_err();
        assert_eq!(err.code(), "INSUFFICIENT_BALANCE");

        h.update_config(|c| c.withdrawals_enabled = false).await;
        let err = service.create_withdrawal_request(request(None)).await.unwrap_err();
        assert_eq!(err.code(), "WITHDRAWALS_DISABLED");

        assert_eq!(h.reload(influencer.id).await.balances.available, 3000);
    }

    #[tokio::test]
    async fn test_complete_flow_counts_withdrawn() {
        let h = Harness::new().await;
        let influencer = h.funded_influencer("Ada", 3).await;
        let service = &h.ledger.withdrawals;
        let withdrawal = service
            .create_withdrawal_request(WithdrawalRequest {
                influencer_id: influencer.id,
                amount: Some(2500),
                payment_details: paypal(),
            })
            .await
            .unwrap();

        assert_eq!(service.get_pending_withdrawals().await.unwrap().len(), 1);
        service.approve(withdrawal.id, "admin-1").await.unwrap();
        service.mark_processing(withdrawal.id, "admin-1").await.unwrap();
        let done = service.complete(withdrawal.id, "PAYPAL-TX-1").await.unwrap();
        assert_eq!(done.status, WithdrawalStatus::Completed);
        assert_eq!(done.payment_reference.as_deref(), Some("PAYPAL-TX-1"));

        let stored = h.reload(influencer.id).await;
        assert_eq!(stored.balances.available, 500);
        assert_eq!(stored.balances.total_withdrawn, 2500);
        assert!(stored.pending_withdrawal_id.is_none());
        assert!(service.get_pending_withdrawals().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_transitions_rejected() {
        let h = Harness::new().await;
        let influencer = h.funded_influencer("Ada", 3).await;
        let service = &h.ledger.withdrawals;
        let withdrawal = service
            .create_withdrawal_request(WithdrawalRequest {
                influencer_id: influencer.id,
                amount: None,
                payment_details: paypal(),
            })
            .await
            .unwrap();

        let err = service.complete(withdrawal.id, "ref").await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));
        let err = service.mark_processing(withdrawal.id, "admin").await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        service.approve(withdrawal.id, "admin").await.unwrap();
        service.fail(withdrawal.id, "account closed").await.unwrap();
        let err = service.reject(withdrawal.id, "admin", "late").await.unwrap_err();
        assert!(matches!(err, LedgerError::InvalidTransition { .. }));

        let stored = h.reload(influencer.id).await;
        assert_eq!(stored.balances.available, 3000);
        assert!(stored.pending_withdrawal_id.is_none());

        let missing = service.approve(Uuid::new_v4(), "admin").await.unwrap_err();
        assert!(matches!(missing, LedgerError::WithdrawalNotFound(_)));
    }

    #[tokio::test]
    async fn test_rejection_keeps_reviewer_when_unset() {
        let h = Harness::new().await;
        let influencer = h.funded_influencer("Ada", 3).await;
        let service = &h.ledger.withdrawals;
        let withdrawal = service
            .create_withdrawal_request(WithdrawalRequest {
                influencer_id: influencer.id,
                amount: None,
                payment_details: paypal(),
            })
            .await
            .unwrap();
        service.approve(withdrawal.id, "admin-1").await.unwrap();

        let rejected = h
            .store
            .transition_withdrawal(
                withdrawal.id,
                WithdrawalStatus::Rejected,
                &WithdrawalUpdate {
                    reason: Some("payout details bounced".into()),
                    ..WithdrawalUpdate::default()
                },
                h.clock.now(),
            )
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rejected.processed_by.as_deref(), Some("admin-1"));
        assert_eq!(
            rejected.rejection_reason.as_deref(),
            Some("payout details bounced")
        );
        assert_eq!(h.reload(influencer.id).await.balances.available, 3000);
    }
}
