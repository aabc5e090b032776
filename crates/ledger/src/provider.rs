//! Provider-recruitment commissions
//!
//! An influencer who recruited a service provider earns a fixed commission on
//! every paid call that provider takes, until the referral window closes.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::commission::{CommissionService, NewCommission};
use crate::error::{LedgerError, LedgerResult};
use crate::rates::RuleKind;
use crate::store::LedgerStore;
use crate::types::{CommissionSource, CommissionType, SourceKind};

/// A provider's call that has been paid
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaidProviderCall {
    pub call_session_id: String,
    pub provider_id: String,
    /// Amount the client paid, in cents
    #[serde(default)]
    pub amount: i64,
    /// Influencer credited with referring the client
    #[serde(default)]
    pub referrer_influencer_id: Option<Uuid>,
    /// Client affiliate code recorded on older client accounts
    #[serde(default)]
    pub referral_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ProviderCommissionOutcome {
    NoReferral,
    Inactive,
    /// Window ended; the referral was deactivated
    WindowExpired,
    /// The client was referred by the same influencer, who is paid through that path
    ReferredClient,
    AlreadyCredited,
    Created { commission_id: Uuid, amount: i64 },
}

#[derive(Clone)]
pub struct ProviderCommissionService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    commissions: CommissionService,
}

impl ProviderCommissionService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        commissions: CommissionService,
    ) -> Self {
        Self {
            store,
            clock,
            commissions,
        }
    }

    /// Credit the recruiting influencer for a paid provider call
    pub async fn on_provider_call_paid(
        &self,
        call: &PaidProviderCall,
    ) -> LedgerResult<ProviderCommissionOutcome> {
        let Some(referral) = self.store.find_provider_referral(&call.provider_id).await? else {
            return Ok(ProviderCommissionOutcome::NoReferral);
        };
        if !referral.is_active {
            return Ok(ProviderCommissionOutcome::Inactive);
        }

        let now = self.clock.now();
        if now > referral.commission_window_end {
            if self.store.deactivate_provider_referral(referral.id, now).await? {
                tracing::info!(
                    referral_id = %referral.id,
                    provider_id = %referral.provider_id,
                    influencer_id = %referral.influencer_id,
                    "Provider referral window expired"
                );
            }
            return Ok(ProviderCommissionOutcome::WindowExpired);
        }

        if self.client_referrer(call).await? == Some(referral.influencer_id) {
            tracing::debug!(
                call_session_id = %call.call_session_id,
                influencer_id = %referral.influencer_id,
                "Client referred by the recruiting influencer; skipping provider commission"
            );
            return Ok(ProviderCommissionOutcome::ReferredClient);
        }

        if self
            .store
            .find_commission_by_source(
                referral.influencer_id,
                CommissionType::Recruitment,
                SourceKind::CallSession,
                &call.call_session_id,
            )
            .await?
            .is_some()
        {
            return Ok(ProviderCommissionOutcome::AlreadyCredited);
        }

        let source = CommissionSource::new(SourceKind::CallSession, call.call_session_id.clone())
            .with_details(serde_json::json!({
                "provider_id": referral.provider_id,
                "provider_type": referral.provider_type,
                "referral_id": referral.id,
                "call_amount": call.amount,
            }));

        let created = self
            .commissions
            .create_priced(
                NewCommission {
                    influencer_id: referral.influencer_id,
                    commission_type: CommissionType::Recruitment,
                    source,
                    transaction_amount: call.amount,
                    description: Some(format!(
                        "Provider recruitment commission ({})",
                        referral.provider_type
                    )),
                },
                RuleKind::ProviderRecruitment,
                Some(referral.id),
            )
            .await;

        let commission = match created {
            Ok(commission) => commission,
            Err(LedgerError::DuplicateCommission) => {
                return Ok(ProviderCommissionOutcome::AlreadyCredited)
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            referral_id = %referral.id,
            provider_id = %referral.provider_id,
            influencer_id = %referral.influencer_id,
            commission_id = %commission.id,
            amount = commission.amount,
            "Provider recruitment commission created"
        );

        Ok(ProviderCommissionOutcome::Created {
            commission_id: commission.id,
            amount: commission.amount,
        })
    }

    /// Influencer who referred the paying client
    ///
    /// `referrer_influencer_id` is authoritative; the affiliate code is only
    /// consulted when the id is absent.
    async fn client_referrer(&self, call: &PaidProviderCall) -> LedgerResult<Option<Uuid>> {
        if let Some(id) = call.referrer_influencer_id {
            return Ok(Some(id));
        }
        match call.referral_code.as_deref().map(str::trim) {
            Some(code) if !code.is_empty() => Ok(self
                .store
                .find_influencer_by_client_code(code)
                .await?
                .map(|i| i.id)),
            _ => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bonus::BonusBreakdown;
    use crate::commission::pending_commission;
    use crate::registration::NewProvider;
    use crate::store::ActivityStamp;
    use crate::test_support::Harness;
    use crate::types::InfluencerStatus;

    fn paid_call(session: &str, provider: &str) -> PaidProviderCall {
        PaidProviderCall {
            call_session_id: session.to_string(),
            provider_id: provider.to_string(),
            amount: 4900,
            referrer_influencer_id: None,
            referral_code: None,
        }
    }

    async fn recruited_provider(h: &Harness, provider_id: &str) -> crate::types::Influencer {
        let influencer = h.influencer("Scout").await;
        h.ledger
            .registration
            .register_provider(NewProvider {
                provider_id: provider_id.to_string(),
                provider_type: "lawyer".to_string(),
                recruitment_code: influencer.recruitment_code.clone(),
            })
            .await
            .unwrap()
            .unwrap();
        influencer
    }

    #[tokio::test]
    async fn test_commission_per_paid_call() {
        let h = Harness::new().await;
        let influencer = recruited_provider(&h, "prov-1").await;
        let service = &h.ledger.providers;

        let outcome = service
            .on_provider_call_paid(&paid_call("call-1", "prov-1"))
            .await
            .unwrap();
        assert!(matches!(outcome, ProviderCommissionOutcome::Created { amount: 500, .. }));

        let repeat = service
            .on_provider_call_paid(&paid_call("call-1", "prov-1"))
            .await
            .unwrap();
        assert_eq!(repeat, ProviderCommissionOutcome::AlreadyCredited);

        service
            .on_provider_call_paid(&paid_call("call-2", "prov-1"))
            .await
            .unwrap();

        let referral = h.store.find_provider_referral("prov-1").await.unwrap().unwrap();
        assert_eq!(referral.calls_with_commission, 2);
        assert_eq!(referral.total_commissions, 1000);
        assert_eq!(h.reload(influencer.id).await.balances.pending, 1000);
    }

    #[tokio::test]
    async fn test_referral_counters_move_with_commission() {
        let h = Harness::new().await;
        let influencer = recruited_provider(&h, "prov-1").await;
        let referral = h.store.find_provider_referral("prov-1").await.unwrap().unwrap();
        h.ledger
            .providers
            .on_provider_call_paid(&paid_call("call-1", "prov-1"))
            .await
            .unwrap();

        let now = h.clock.now();
        let month = crate::clock::month_key(now);
        let stamp = ActivityStamp {
            date: now.date(),
            month: &month,
            provider_referral: Some(referral.id),
        };
        let replay = pending_commission(
            influencer.id,
            CommissionType::Recruitment,
            CommissionSource::new(SourceKind::CallSession, "call-1"),
            BonusBreakdown::flat(500),
            "Provider recruitment commission".into(),
            now,
        );

        // A rejected insert leaves the referral untouched
        let err = h.store.insert_commission(&replay, stamp).await.unwrap_err();
        assert!(matches!(err, LedgerError::DuplicateCommission));

        h.store
            .set_influencer_status(influencer.id, InfluencerStatus::Suspended)
            .await
            .unwrap();
        let fresh = pending_commission(
            influencer.id,
            CommissionType::Recruitment,
            CommissionSource::new(SourceKind::CallSession, "call-2"),
            BonusBreakdown::flat(500),
            "Provider recruitment commission".into(),
            now,
        );
        let err = h.store.insert_commission(&fresh, stamp).await.unwrap_err();
        assert!(matches!(err, LedgerError::InfluencerNotActive { .. }));

        let referral = h.store.find_provider_referral("prov-1").await.unwrap().unwrap();
        assert_eq!(referral.calls_with_commission, 1);
        assert_eq!(referral.total_commissions, 500);
        assert_eq!(referral.last_commission_at, Some(now));
        assert_eq!(
            h.store
                .list_commissions_for_influencer(influencer.id)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_own_client_not_double_paid() {
        let h = Harness::new().await;
        let influencer = recruited_provider(&h, "prov-1").await;
        let service = &h.ledger.providers;

        let mut by_id = paid_call("call-1", "prov-1");
        by_id.referrer_influencer_id = Some(influencer.id);
        assert_eq!(
            service.on_provider_call_paid(&by_id).await.unwrap(),
            ProviderCommissionOutcome::ReferredClient
        );

        let mut by_code = paid_call("call-2", "prov-1");
        by_code.referral_code = Some(influencer.client_code.to_lowercase());
        assert_eq!(
            service.on_provider_call_paid(&by_code).await.unwrap(),
            ProviderCommissionOutcome::ReferredClient
        );

        // The id wins over a stale code
        let mut both = paid_call("call-3", "prov-1");
        both.referrer_influencer_id = Some(Uuid::new_v4());
        both.referral_code = Some(influencer.client_code.clone());
        assert!(matches!(
            service.on_provider_call_paid(&both).await.unwrap(),
            ProviderCommissionOutcome::Created { .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_provider_skipped() {
        let h = Harness::new().await;
        let outcome = h
            .ledger
            .providers
            .on_provider_call_paid(&paid_call("call-1", "nobody"))
            .await
            .unwrap();
        assert_eq!(outcome, ProviderCommissionOutcome::NoReferral);
    }
}
