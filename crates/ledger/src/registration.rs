//! Influencer and provider registration
//!
//! Registration is where rates are captured and where the recruitment links
//! that later pay recruiters are created.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::{add_months, month_key, Clock};
use crate::config::ConfigProvider;
use crate::error::{LedgerError, LedgerResult};
use crate::rates::capture_rates;
use crate::store::LedgerStore;
use crate::types::{
    Balances, Influencer, InfluencerStatus, MonthlyStats, ProviderReferral, RecruitedInfluencer,
};

/// Attempts at finding an unused affiliate code pair
const CODE_ATTEMPTS: usize = 5;
const CODE_PREFIX_LEN: usize = 6;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewInfluencer {
    /// Identity of the account in the surrounding platform
    pub id: Uuid,
    pub display_name: String,
    pub email: String,
    /// Recruitment code of the influencer who referred this one
    #[serde(default)]
    pub recruitment_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewProvider {
    pub provider_id: String,
    pub provider_type: String,
    /// Recruitment code the provider signed up with
    pub recruitment_code: String,
}

/// Client affiliate code: name prefix plus a four digit suffix
fn client_code_for(display_name: &str) -> String {
    let prefix: String = display_name
        .chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_uppercase())
        .take(CODE_PREFIX_LEN)
        .collect();
    let prefix = if prefix.is_empty() {
        "INF".to_string()
    } else {
        prefix
    };
    let suffix = Uuid::new_v4().as_u128() % 10_000;
    format!("{}{:04}", prefix, suffix)
}

fn recruitment_code_for(client_code: &str) -> String {
    format!("REC-{}", client_code)
}

#[derive(Clone)]
pub struct RegistrationService {
    store: Arc<dyn LedgerStore>,
    clock: Arc<dyn Clock>,
    config: Arc<ConfigProvider>,
}

impl RegistrationService {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        clock: Arc<dyn Clock>,
        config: Arc<ConfigProvider>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
        }
    }

    /// Create an active influencer with fresh codes and captured rates
    ///
    /// An unknown or inactive recruitment code does not fail registration;
    /// the influencer is simply registered without a recruiter.
    pub async fn register_influencer(&self, input: NewInfluencer) -> LedgerResult<Influencer> {
        if self.store.get_influencer(input.id).await?.is_some() {
            return Err(LedgerError::AlreadyExists(format!("influencer {}", input.id)));
        }

        let config = self.config.current().await?;
        let now = self.clock.now();
        let recruiter = self.resolve_recruiter(input.recruitment_code.as_deref()).await?;

        let mut influencer = Influencer {
            id: input.id,
            display_name: input.display_name,
            email: input.email,
            status: InfluencerStatus::Active,
            client_code: String::new(),
            recruitment_code: String::new(),
            balances: Balances::default(),
            total_commissions: 0,
            total_clients: 0,
            total_recruits: 0,
            month_stats: MonthlyStats::empty(month_key(now)),
            current_month_rank: None,
            best_rank: None,
            monthly_multiplier: 1.0,
            multiplier_month: None,
            pending_withdrawal_id: None,
            captured_rates: Some(capture_rates(&config, now)),
            recruited_by: recruiter.as_ref().map(|r| r.id),
            current_streak: 0,
            best_streak: 0,
            last_activity_date: None,
            created_at: now,
            updated_at: now,
        };

        let record = recruiter.as_ref().map(|recruiter| RecruitedInfluencer {
            id: Uuid::new_v4(),
            recruiter_id: recruiter.id,
            recruited_id: influencer.id,
            recruitment_code: recruiter.recruitment_code.clone(),
            recruited_at: now,
            commission_window_end: add_months(now, config.recruitment_window_months),
            is_active: true,
            commission_paid: false,
            commission_id: None,
            commission_paid_at: None,
            updated_at: now,
        });

        let mut attempt = 0;
        loop {
            attempt += 1;
            influencer.client_code = client_code_for(&influencer.display_name);
            influencer.recruitment_code = recruitment_code_for(&influencer.client_code);
            match self
                .store
                .insert_influencer(&influencer, record.as_ref())
                .await
            {
                Ok(()) => break,
                Err(LedgerError::AlreadyExists(_)) if attempt < CODE_ATTEMPTS => {
                    tracing::debug!(
                        influencer_id = %influencer.id,
                        code = %influencer.client_code,
                        "Affiliate code taken, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if let Some(record) = &record {
            tracing::info!(
                recruiter_id = %record.recruiter_id,
                recruit_id = %influencer.id,
                window_end = %record.commission_window_end,
                "Recruitment tracked"
            );
        }

        tracing::info!(
            influencer_id = %influencer.id,
            client_code = %influencer.client_code,
            rates_version = config.version,
            "Influencer registered"
        );
        Ok(influencer)
    }

    /// Recreate a missing tracking record for an already registered recruit
    ///
    /// Returns the new record, or `None` when the influencer has no recruiter
    /// or is already tracked. The window runs from the original registration.
    pub async fn restore_recruitment_link(
        &self,
        influencer_id: Uuid,
    ) -> LedgerResult<Option<RecruitedInfluencer>> {
        let Some(influencer) = self.store.get_influencer(influencer_id).await? else {
            return Ok(None);
        };
        let Some(recruiter_id) = influencer.recruited_by else {
            return Ok(None);
        };
        if self
            .store
            .find_recruitment_for_recruit(influencer_id)
            .await?
            .is_some()
        {
            return Ok(None);
        }
        let Some(recruiter) = self.store.get_influencer(recruiter_id).await? else {
            tracing::warn!(
                influencer_id = %influencer_id,
                recruiter_id = %recruiter_id,
                "Recruiter of untracked recruit no longer exists"
            );
            return Ok(None);
        };

        let config = self.config.current().await?;
        let record = RecruitedInfluencer {
            id: Uuid::new_v4(),
            recruiter_id,
            recruited_id: influencer_id,
            recruitment_code: recruiter.recruitment_code,
            recruited_at: influencer.created_at,
            commission_window_end: add_months(
                influencer.created_at,
                config.recruitment_window_months,
            ),
            is_active: true,
            commission_paid: false,
            commission_id: None,
            commission_paid_at: None,
            updated_at: self.clock.now(),
        };

        match self.store.insert_recruitment(&record).await {
            Ok(()) => {}
            Err(LedgerError::AlreadyExists(_)) => return Ok(None),
            Err(e) => return Err(e),
        }

        tracing::warn!(
            recruiter_id = %recruiter_id,
            recruit_id = %influencer_id,
            window_end = %record.commission_window_end,
            "Recruitment link restored"
        );
        Ok(Some(record))
    }

    /// Track a provider recruited through an influencer's recruitment code
    ///
    /// Returns `None` when the code does not belong to an active influencer.
    /// Registering the same provider twice returns the existing referral.
    pub async fn register_provider(
        &self,
        input: NewProvider,
    ) -> LedgerResult<Option<ProviderReferral>> {
        if let Some(existing) = self.store.find_provider_referral(&input.provider_id).await? {
            return Ok(Some(existing));
        }
        let Some(recruiter) = self.resolve_recruiter(Some(&input.recruitment_code)).await? else {
            return Ok(None);
        };

        let config = self.config.current().await?;
        let now = self.clock.now();
        let referral = ProviderReferral {
            id: Uuid::new_v4(),
            influencer_id: recruiter.id,
            provider_id: input.provider_id,
            provider_type: input.provider_type,
            recruitment_code: recruiter.recruitment_code.clone(),
            recruited_at: now,
            commission_window_end: add_months(now, config.recruitment_window_months),
            is_active: true,
            calls_with_commission: 0,
            total_commissions: 0,
            last_commission_at: None,
            updated_at: now,
        };

        match self.store.insert_provider_referral(&referral).await {
            Ok(()) => {}
            Err(LedgerError::AlreadyExists(_)) => {
                return self.store.find_provider_referral(&referral.provider_id).await;
            }
            Err(e) => return Err(e),
        }

        tracing::info!(
            influencer_id = %recruiter.id,
            provider_id = %referral.provider_id,
            provider_type = %referral.provider_type,
            window_end = %referral.commission_window_end,
            "Provider referral tracked"
        );
        Ok(Some(referral))
    }

    async fn resolve_recruiter(&self, code: Option<&str>) -> LedgerResult<Option<Influencer>> {
        let code = match code.map(str::trim) {
            Some(code) if !code.is_empty() => code,
            _ => return Ok(None),
        };
        match self.store.find_influencer_by_recruitment_code(code).await? {
            Some(recruiter) if recruiter.is_active() => Ok(Some(recruiter)),
            Some(recruiter) => {
                tracing::warn!(
                    recruiter_id = %recruiter.id,
                    status = %recruiter.status,
                    "Recruitment code belongs to an inactive influencer; ignoring"
                );
                Ok(None)
            }
            None => {
                tracing::warn!(code, "Unknown recruitment code; ignoring");
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{influencer_fixture, Harness};

    #[test]
    fn test_code_shape() {
        let code = client_code_for("Ada Lovelace!");
        assert!(code.starts_with("ADALOV"));
        assert_eq!(code.len(), CODE_PREFIX_LEN + 4);
        assert!(client_code_for("??").starts_with("INF"));
        assert_eq!(recruitment_code_for("ADA0001"), "REC-ADA0001");
    }

    #[tokio::test]
    async fn test_registration_captures_rates() {
        let h = Harness::new().await;
        let influencer = h.influencer("Ada").await;
        let rates = influencer.captured_rates.clone().unwrap();
        assert_eq!(rates.version, 1);
        assert_eq!(rates.client_referral.unwrap().fixed_amount, 1000);
        assert!(influencer.is_active());
        assert_eq!(influencer.balances, Balances::default());
        assert!(influencer.recruited_by.is_none());
    }

    #[tokio::test]
    async fn test_recruitment_link_and_window() {
        let h = Harness::new().await;
        let recruiter = h.influencer("Mentor").await;
        let recruit = h.recruit(&recruiter, "Rookie").await;
        assert_eq!(recruit.recruited_by, Some(recruiter.id));

        let record = h
            .store
            .find_recruitment_for_recruit(recruit.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.recruiter_id, recruiter.id);
        assert_eq!(
            record.commission_window_end,
            add_months(record.recruited_at, 6)
        );
    }

    #[tokio::test]
    async fn test_recruit_and_tracking_record_written_together() {
        let h = Harness::new().await;
        let recruiter = h.influencer("Mentor").await;
        let existing = h.recruit(&recruiter, "Rookie").await;

        // Same affiliate code as an existing influencer: nothing is written
        let mut clash = influencer_fixture();
        clash.client_code = existing.client_code.clone();
        clash.recruited_by = Some(recruiter.id);
        let record = RecruitedInfluencer {
            id: Uuid::new_v4(),
            recruiter_id: recruiter.id,
            recruited_id: clash.id,
            recruitment_code: recruiter.recruitment_code.clone(),
            recruited_at: clash.created_at,
            commission_window_end: add_months(clash.created_at, 6),
            is_active: true,
            commission_paid: false,
            commission_id: None,
            commission_paid_at: None,
            updated_at: clash.created_at,
        };
        let err = h
            .store
            .insert_influencer(&clash, Some(&record))
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists(_)));
        assert!(h.store.get_influencer(clash.id).await.unwrap().is_none());
        assert!(h
            .store
            .find_recruitment_for_recruit(clash.id)
            .await
            .unwrap()
            .is_none());

        // Tracked recruits need no restoring
        let restored = h
            .ledger
            .registration
            .restore_recruitment_link(existing.id)
            .await
            .unwrap();
        assert!(restored.is_none());
    }

    #[tokio::test]
    async fn test_bad_recruitment_code_registers_without_recruiter() {
        let h = Harness::new().await;
        let influencer = h
            .ledger
            .registration
            .register_influencer(NewInfluencer {
                id: Uuid::new_v4(),
                display_name: "Orphan".into(),
                email: "orphan@example.com".into(),
                recruitment_code: Some("REC-NOPE0000".into()),
            })
            .await
            .unwrap();
        assert!(influencer.recruited_by.is_none());
        assert!(h
            .store
            .find_recruitment_for_recruit(influencer.id)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let h = Harness::new().await;
        let influencer = h.influencer("Ada").await;
        let err = h
            .ledger
            .registration
            .register_influencer(NewInfluencer {
                id: influencer.id,
                display_name: "Ada".into(),
                email: "ada@example.com".into(),
                recruitment_code: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_provider_registration_is_idempotent() {
        let h = Harness::new().await;
        let scout = h.influencer("Scout").await;
        let provider = NewProvider {
            provider_id: "prov-7".into(),
            provider_type: "expat".into(),
            recruitment_code: scout.recruitment_code.clone(),
        };
        let first = h
            .ledger
            .registration
            .register_provider(provider.clone())
            .await
            .unwrap()
            .unwrap();
        let second = h
            .ledger
            .registration
            .register_provider(provider)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.influencer_id, scout.id);

        let unknown = h
            .ledger
            .registration
            .register_provider(NewProvider {
                provider_id: "prov-8".into(),
                provider_type: "expat".into(),
                recruitment_code: "REC-MISSING".into(),
            })
            .await
            .unwrap();
        assert!(unknown.is_none());
    }
}
