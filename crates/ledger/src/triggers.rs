//! Domain event triggers
//!
//! Entry points invoked when something happens elsewhere on the platform.
//! Dispatch never returns an error: every outcome, including failures, is
//! logged and reported as a [`TriggerOutcome`] so the caller can decide
//! whether to retry.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::commission::{CommissionService, NewCommission};
use crate::error::LedgerError;
use crate::provider::{PaidProviderCall, ProviderCommissionOutcome, ProviderCommissionService};
use crate::registration::{NewInfluencer, NewProvider, RegistrationService};
use crate::store::LedgerStore;
use crate::types::{CommissionSource, CommissionType, SourceKind};

/// A completed client call
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletedCall {
    pub call_session_id: String,
    pub client_id: String,
    /// Amount the client paid, in cents
    pub amount: i64,
    #[serde(default)]
    pub referrer_influencer_id: Option<Uuid>,
    #[serde(default)]
    pub referral_code: Option<String>,
    /// Only paid calls earn a commission
    #[serde(default = "default_true")]
    pub is_paid: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RefundedPayment {
    pub source_kind: SourceKind,
    pub source_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Events the ledger reacts to, as stored in the `ledger_events` queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum LedgerEvent {
    CallCompleted(CompletedCall),
    ProviderCallPaid(PaidProviderCall),
    InfluencerRegistered(NewInfluencer),
    ProviderRegistered(NewProvider),
    PaymentRefunded(RefundedPayment),
}

impl LedgerEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            LedgerEvent::CallCompleted(_) => "call_completed",
            LedgerEvent::ProviderCallPaid(_) => "provider_call_paid",
            LedgerEvent::InfluencerRegistered(_) => "influencer_registered",
            LedgerEvent::ProviderRegistered(_) => "provider_registered",
            LedgerEvent::PaymentRefunded(_) => "payment_refunded",
        }
    }

    /// Rebuild an event from its queue columns
    pub fn from_parts(
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Self, serde_json::Error> {
        serde_json::from_value(serde_json::json!({
            "type": event_type,
            "payload": payload,
        }))
    }
}

/// What a dispatch did
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Applied { detail: String },
    Skipped { reason: String },
    Failed { error: String, retryable: bool },
}

impl TriggerOutcome {
    fn applied(detail: impl Into<String>) -> Self {
        TriggerOutcome::Applied {
            detail: detail.into(),
        }
    }

    fn skipped(reason: impl Into<String>) -> Self {
        TriggerOutcome::Skipped {
            reason: reason.into(),
        }
    }

    fn failed(error: &LedgerError) -> Self {
        TriggerOutcome::Failed {
            error: error.to_string(),
            retryable: error.is_retryable(),
        }
    }
}

#[derive(Clone)]
pub struct TriggerDispatcher {
    store: std::sync::Arc<dyn LedgerStore>,
    commissions: CommissionService,
    providers: ProviderCommissionService,
    registration: RegistrationService,
}

impl TriggerDispatcher {
    pub fn new(
        store: std::sync::Arc<dyn LedgerStore>,
        commissions: CommissionService,
        providers: ProviderCommissionService,
        registration: RegistrationService,
    ) -> Self {
        Self {
            store,
            commissions,
            providers,
            registration,
        }
    }

    pub async fn dispatch(&self, event: &LedgerEvent) -> TriggerOutcome {
        let outcome = match event {
            LedgerEvent::CallCompleted(call) => self.on_call_completed(call).await,
            LedgerEvent::ProviderCallPaid(call) => self.on_provider_call_paid(call).await,
            LedgerEvent::InfluencerRegistered(input) => {
                self.on_influencer_registered(input.clone()).await
            }
            LedgerEvent::ProviderRegistered(input) => {
                self.on_provider_registered(input.clone()).await
            }
            LedgerEvent::PaymentRefunded(refund) => self.on_payment_refunded(refund).await,
        };

        match &outcome {
            TriggerOutcome::Applied { detail } => {
                tracing::info!(
                    event_type = event.event_type(),
                    detail = %detail,
                    "Trigger applied"
                );
            }
            TriggerOutcome::Skipped { reason } => {
                tracing::warn!(
                    event_type = event.event_type(),
                    reason = %reason,
                    "Trigger skipped"
                );
            }
            TriggerOutcome::Failed { error, retryable } => {
                tracing::error!(
                    event_type = event.event_type(),
                    error = %error,
                    retryable,
                    "Trigger failed"
                );
            }
        }
        outcome
    }

    async fn on_call_completed(&self, call: &CompletedCall) -> TriggerOutcome {
        if !call.is_paid {
            return TriggerOutcome::skipped("call not paid");
        }

        let referrer = match call.referrer_influencer_id {
            Some(id) => Some(id),
            None => match call.referral_code.as_deref().map(str::trim) {
                Some(code) if !code.is_empty() => {
                    match self.store.find_influencer_by_client_code(code).await {
                        Ok(found) => found.map(|i| i.id),
                        Err(e) => return TriggerOutcome::failed(&e),
                    }
                }
                _ => None,
            },
        };
        let Some(influencer_id) = referrer else {
            return TriggerOutcome::skipped("client has no referring influencer");
        };

        let input = NewCommission {
            influencer_id,
            commission_type: CommissionType::ClientReferral,
            source: CommissionSource::new(SourceKind::CallSession, call.call_session_id.clone())
                .with_details(serde_json::json!({
                    "client_id": call.client_id,
                    "call_amount": call.amount,
                })),
            transaction_amount: call.amount,
            description: None,
        };

        match self.commissions.create_commission(input).await {
            Ok(commission) => TriggerOutcome::applied(format!(
                "commission {} for {}",
                commission.id, commission.amount
            )),
            Err(LedgerError::DuplicateCommission) => {
                TriggerOutcome::skipped("commission already recorded for call")
            }
            Err(
                e @ (LedgerError::InfluencerNotActive { .. }
                | LedgerError::InfluencerNotFound(_)
                | LedgerError::SystemDisabled),
            ) => TriggerOutcome::skipped(e.to_string()),
            Err(e) => TriggerOutcome::failed(&e),
        }
    }

    async fn on_provider_call_paid(&self, call: &PaidProviderCall) -> TriggerOutcome {
        match self.providers.on_provider_call_paid(call).await {
            Ok(ProviderCommissionOutcome::Created {
                commission_id,
                amount,
            }) => TriggerOutcome::applied(format!("commission {} for {}", commission_id, amount)),
            Ok(other) => TriggerOutcome::skipped(format!("{:?}", other)),
            Err(
                e @ (LedgerError::InfluencerNotActive { .. }
                | LedgerError::InfluencerNotFound(_)
                | LedgerError::SystemDisabled),
            ) => TriggerOutcome::skipped(e.to_string()),
            Err(e) => TriggerOutcome::failed(&e),
        }
    }

    async fn on_influencer_registered(&self, input: NewInfluencer) -> TriggerOutcome {
        let influencer_id = input.id;
        match self.registration.register_influencer(input).await {
            Ok(influencer) => TriggerOutcome::applied(format!(
                "influencer {} registered as {}",
                influencer.id, influencer.client_code
            )),
            Err(LedgerError::AlreadyExists(what)) => {
                // A replay may find a recruit whose tracking record is missing
                match self
                    .registration
                    .restore_recruitment_link(influencer_id)
                    .await
                {
                    Ok(Some(record)) => TriggerOutcome::applied(format!(
                        "recruitment link from {} restored for {}",
                        record.recruiter_id, influencer_id
                    )),
                    Ok(None) => TriggerOutcome::skipped(format!("{} already registered", what)),
                    Err(e) => TriggerOutcome::failed(&e),
                }
            }
            Err(e) => TriggerOutcome::failed(&e),
        }
    }

    async fn on_provider_registered(&self, input: NewProvider) -> TriggerOutcome {
        let provider_id = input.provider_id.clone();
        match self.registration.register_provider(input).await {
            Ok(Some(referral)) => TriggerOutcome::applied(format!(
                "provider {} tracked for influencer {}",
                referral.provider_id, referral.influencer_id
            )),
            Ok(None) => TriggerOutcome::skipped(format!(
                "no active recruiter for provider {}",
                provider_id
            )),
            Err(e) => TriggerOutcome::failed(&e),
        }
    }

    async fn on_payment_refunded(&self, refund: &RefundedPayment) -> TriggerOutcome {
        let reason = refund.reason.as_deref().unwrap_or("payment refunded");
        match self
            .commissions
            .cancel_commissions_for_source(refund.source_kind, &refund.source_id, reason)
            .await
        {
            Ok(result) if result.errors > 0 => TriggerOutcome::Failed {
                error: format!("{} commissions failed to cancel", result.errors),
                retryable: true,
            },
            Ok(result) if result.cancelled == 0 => {
                TriggerOutcome::skipped("nothing cancellable for source")
            }
            Ok(result) => TriggerOutcome::applied(format!(
                "cancelled {} commissions",
                result.cancelled
            )),
            Err(e) => TriggerOutcome::failed(&e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::add_months;
    use crate::test_support::{influencer_fixture, Harness};

    fn completed(session: &str, referrer: Option<Uuid>) -> LedgerEvent {
        LedgerEvent::CallCompleted(CompletedCall {
            call_session_id: session.to_string(),
            client_id: "client-1".to_string(),
            amount: 4900,
            referrer_influencer_id: referrer,
            referral_code: None,
            is_paid: true,
        })
    }

    #[test]
    fn test_event_round_trip_through_queue_columns() {
        let event = LedgerEvent::PaymentRefunded(RefundedPayment {
            source_kind: SourceKind::CallSession,
            source_id: "call-1".into(),
            reason: None,
        });
        let value = serde_json::to_value(&event).unwrap();
        let rebuilt =
            LedgerEvent::from_parts(event.event_type(), value["payload"].clone()).unwrap();
        assert_eq!(rebuilt.event_type(), "payment_refunded");
        assert!(LedgerEvent::from_parts("mystery", serde_json::json!({})).is_err());
    }

    #[tokio::test]
    async fn test_call_completed_creates_commission_once() {
        let h = Harness::new().await;
        let influencer = h.influencer("Ada").await;

        let first = h.ledger.triggers.dispatch(&completed("call-1", Some(influencer.id))).await;
        assert!(matches!(first, TriggerOutcome::Applied { .. }));
        let second = h.ledger.triggers.dispatch(&completed("call-1", Some(influencer.id))).await;
        assert!(matches!(second, TriggerOutcome::Skipped { .. }));
        assert_eq!(h.reload(influencer.id).await.balances.pending, 1000);
    }

    #[tokio::test]
    async fn test_referral_code_fallback_and_unpaid_calls() {
        let h = Harness::new().await;
        let influencer = h.influencer("Ada").await;

        let by_code = LedgerEvent::CallCompleted(CompletedCall {
            call_session_id: "call-7".into(),
            client_id: "client-7".into(),
            amount: 4900,
            referrer_influencer_id: None,
            referral_code: Some(influencer.client_code.clone()),
            is_paid: true,
        });
        assert!(matches!(
            h.ledger.triggers.dispatch(&by_code).await,
            TriggerOutcome::Applied { .. }
        ));

        let unpaid = LedgerEvent::CallCompleted(CompletedCall {
            call_session_id: "call-8".into(),
            client_id: "client-8".into(),
            amount: 0,
            referrer_influencer_id: Some(influencer.id),
            referral_code: None,
            is_paid: false,
        });
        assert!(matches!(
            h.ledger.triggers.dispatch(&unpaid).await,
            TriggerOutcome::Skipped { .. }
        ));
        assert_eq!(h.reload(influencer.id).await.total_commissions, 1);
    }

    #[tokio::test]
    async fn test_refund_cancels_by_source() {
        let h = Harness::new().await;
        let influencer = h.influencer("Ada").await;
        h.ledger.triggers.dispatch(&completed("call-1", Some(influencer.id))).await;

        let refund = LedgerEvent::PaymentRefunded(RefundedPayment {
            source_kind: SourceKind::CallSession,
            source_id: "call-1".into(),
            reason: Some("client dispute".into()),
        });
        assert!(matches!(
            h.ledger.triggers.dispatch(&refund).await,
            TriggerOutcome::Applied { .. }
        ));
        assert_eq!(h.reload(influencer.id).await.balances.pending, 0);

        // Nothing left to cancel
        assert!(matches!(
            h.ledger.triggers.dispatch(&refund).await,
            TriggerOutcome::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_registration_events() {
        let h = Harness::new().await;
        let event = LedgerEvent::InfluencerRegistered(NewInfluencer {
            id: Uuid::new_v4(),
            display_name: "Newbie".into(),
            email: "new@example.com".into(),
            recruitment_code: None,
        });
        assert!(matches!(
            h.ledger.triggers.dispatch(&event).await,
            TriggerOutcome::Applied { .. }
        ));
        assert!(matches!(
            h.ledger.triggers.dispatch(&event).await,
            TriggerOutcome::Skipped { .. }
        ));
    }

    #[tokio::test]
    async fn test_registration_replay_restores_recruitment_link() {
        let h = Harness::new().await;
        let recruiter = h.influencer("Mentor").await;

        // Recruit stored without its tracking record
        let mut recruit = influencer_fixture();
        recruit.recruited_by = Some(recruiter.id);
        h.store.insert_influencer(&recruit, None).await.unwrap();

        let replay = LedgerEvent::InfluencerRegistered(NewInfluencer {
            id: recruit.id,
            display_name: recruit.display_name.clone(),
            email: recruit.email.clone(),
            recruitment_code: Some(recruiter.recruitment_code.clone()),
        });
        assert!(matches!(
            h.ledger.triggers.dispatch(&replay).await,
            TriggerOutcome::Applied { .. }
        ));

        let record = h
            .store
            .find_recruitment_for_recruit(recruit.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.recruiter_id, recruiter.id);
        assert_eq!(
            record.commission_window_end,
            add_months(recruit.created_at, 6)
        );
        assert!(!record.commission_paid);

        assert!(matches!(
            h.ledger.triggers.dispatch(&replay).await,
            TriggerOutcome::Skipped { .. }
        ));

        // The restored link pays once the recruit crosses the threshold
        h.client_commissions(recruit.id, 5).await;
        let record = h
            .store
            .find_recruitment_for_recruit(recruit.id)
            .await
            .unwrap()
            .unwrap();
        assert!(record.commission_paid);
        assert_eq!(h.reload(recruiter.id).await.total_recruits, 1);
    }
}
