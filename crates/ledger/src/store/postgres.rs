//! Postgres ledger store
//!
//! Balance-bearing writes run inside a transaction that locks the affected
//! influencer row (`SELECT ... FOR UPDATE`) and applies relative increments.
//! Status moves are conditional updates (`WHERE status = $n`), so a row that
//! another worker already advanced simply matches nothing.

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::postgres::PgQueryResult;
use sqlx::{PgPool, Postgres, Transaction};
use time::{Date, OffsetDateTime};
use uuid::Uuid;

use super::{
    commission_move_delta, next_streak, ActivityStamp, LedgerStore, SettlementOutcome,
};
use crate::config::LedgerConfig;
use crate::error::{LedgerError, LedgerResult};
use crate::rates::CapturedRates;
use crate::types::{
    Balances, Commission, CommissionSource, CommissionStatus, CommissionType, Influencer,
    InfluencerStatus, MonthlyRanking, MonthlyStats, Notification, PaymentDetails,
    ProviderReferral, RankingEntry, RecruitedInfluencer, SourceKind, Withdrawal,
    WithdrawalStatus, WithdrawalUpdate,
};

const INFLUENCER_COLUMNS: &str = r#"
    id, display_name, email, status, client_code, recruitment_code,
    total_earned, available_balance, pending_balance, validated_balance, total_withdrawn,
    total_commissions, total_clients, total_recruits,
    stats_month, month_earnings, month_clients, month_recruits,
    current_month_rank, best_rank, monthly_multiplier, multiplier_month,
    pending_withdrawal_id, captured_rates, recruited_by,
    current_streak, best_streak, last_activity_date, created_at, updated_at
"#;

const COMMISSION_COLUMNS: &str = r#"
    id, influencer_id, commission_type, status, amount, base_amount,
    level_multiplier, streak_multiplier, top_multiplier, currency,
    source_kind, source_id, source_details, description,
    created_at, validated_at, available_at, cancelled_at, cancellation_reason, updated_at
"#;

const WITHDRAWAL_COLUMNS: &str = r#"
    id, influencer_id, amount, currency, payment_method, payment_details, status,
    requested_at, processed_at, processed_by, rejection_reason, payment_reference,
    completed_at, failed_at, failure_reason
"#;

const RECRUITMENT_COLUMNS: &str = r#"
    id, recruiter_id, recruited_id, recruitment_code, recruited_at, commission_window_end,
    is_active, commission_paid, commission_id, commission_paid_at, updated_at
"#;

const PROVIDER_REFERRAL_COLUMNS: &str = r#"
    id, influencer_id, provider_id, provider_type, recruitment_code, recruited_at,
    commission_window_end, is_active, calls_with_commission, total_commissions,
    last_commission_at, updated_at
"#;

const NOTIFICATION_COLUMNS: &str = r#"
    id, influencer_id, kind, title, message, commission_id, withdrawal_id,
    created_at, delivered_at
"#;

fn parse_column<T>(raw: &str, column: &str) -> LedgerResult<T>
where
    T: std::str::FromStr<Err = String>,
{
    raw.parse()
        .map_err(|e| LedgerError::Internal(format!("bad {} value: {}", column, e)))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}

#[derive(Debug, sqlx::FromRow)]
struct InfluencerRow {
    id: Uuid,
    display_name: String,
    email: String,
    status: String,
    client_code: String,
    recruitment_code: String,
    total_earned: i64,
    available_balance: i64,
    pending_balance: i64,
    validated_balance: i64,
    total_withdrawn: i64,
    total_commissions: i64,
    total_clients: i64,
    total_recruits: i64,
    stats_month: String,
    month_earnings: i64,
    month_clients: i64,
    month_recruits: i64,
    current_month_rank: Option<i32>,
    best_rank: Option<i32>,
    monthly_multiplier: f64,
    multiplier_month: Option<String>,
    pending_withdrawal_id: Option<Uuid>,
    captured_rates: Option<Json<CapturedRates>>,
    recruited_by: Option<Uuid>,
    current_streak: i32,
    best_streak: i32,
    last_activity_date: Option<Date>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<InfluencerRow> for Influencer {
    type Error = LedgerError;

    fn try_from(row: InfluencerRow) -> LedgerResult<Self> {
        Ok(Influencer {
            id: row.id,
            display_name: row.display_name,
            email: row.email,
            status: parse_column(&row.status, "influencers.status")?,
            client_code: row.client_code,
            recruitment_code: row.recruitment_code,
            balances: Balances {
                total_earned: row.total_earned,
                available: row.available_balance,
                pending: row.pending_balance,
                validated: row.validated_balance,
                total_withdrawn: row.total_withdrawn,
            },
            total_commissions: row.total_commissions,
            total_clients: row.total_clients,
            total_recruits: row.total_recruits,
            month_stats: MonthlyStats {
                month: row.stats_month,
                earnings: row.month_earnings,
                clients: row.month_clients,
                recruits: row.month_recruits,
            },
            current_month_rank: row.current_month_rank,
            best_rank: row.best_rank,
            monthly_multiplier: row.monthly_multiplier,
            multiplier_month: row.multiplier_month,
            pending_withdrawal_id: row.pending_withdrawal_id,
            captured_rates: row.captured_rates.map(|Json(rates)| rates),
            recruited_by: row.recruited_by,
            current_streak: row.current_streak,
            best_streak: row.best_streak,
            last_activity_date: row.last_activity_date,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct CommissionRow {
    id: Uuid,
    influencer_id: Uuid,
    commission_type: String,
    status: String,
    amount: i64,
    base_amount: i64,
    level_multiplier: f64,
    streak_multiplier: f64,
    top_multiplier: f64,
    currency: String,
    source_kind: String,
    source_id: Option<String>,
    source_details: serde_json::Value,
    description: String,
    created_at: OffsetDateTime,
    validated_at: Option<OffsetDateTime>,
    available_at: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
    cancellation_reason: Option<String>,
    updated_at: OffsetDateTime,
}

impl TryFrom<CommissionRow> for Commission {
    type Error = LedgerError;

    fn try_from(row: CommissionRow) -> LedgerResult<Self> {
        Ok(Commission {
            id: row.id,
            influencer_id: row.influencer_id,
            commission_type: parse_column(&row.commission_type, "commissions.commission_type")?,
            status: parse_column(&row.status, "commissions.status")?,
            amount: row.amount,
            base_amount: row.base_amount,
            level_multiplier: row.level_multiplier,
            streak_multiplier: row.streak_multiplier,
            top_multiplier: row.top_multiplier,
            currency: row.currency,
            source: CommissionSource {
                kind: parse_column(&row.source_kind, "commissions.source_kind")?,
                id: row.source_id,
                details: row.source_details,
            },
            description: row.description,
            created_at: row.created_at,
            validated_at: row.validated_at,
            available_at: row.available_at,
            cancelled_at: row.cancelled_at,
            cancellation_reason: row.cancellation_reason,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct WithdrawalRow {
    id: Uuid,
    influencer_id: Uuid,
    amount: i64,
    currency: String,
    payment_method: String,
    payment_details: Json<PaymentDetails>,
    status: String,
    requested_at: OffsetDateTime,
    processed_at: Option<OffsetDateTime>,
    processed_by: Option<String>,
    rejection_reason: Option<String>,
    payment_reference: Option<String>,
    completed_at: Option<OffsetDateTime>,
    failed_at: Option<OffsetDateTime>,
    failure_reason: Option<String>,
}

impl TryFrom<WithdrawalRow> for Withdrawal {
    type Error = LedgerError;

    fn try_from(row: WithdrawalRow) -> LedgerResult<Self> {
        Ok(Withdrawal {
            id: row.id,
            influencer_id: row.influencer_id,
            amount: row.amount,
            currency: row.currency,
            payment_method: parse_column(&row.payment_method, "withdrawals.payment_method")?,
            payment_details: row.payment_details.0,
            status: parse_column(&row.status, "withdrawals.status")?,
            requested_at: row.requested_at,
            processed_at: row.processed_at,
            processed_by: row.processed_by,
            rejection_reason: row.rejection_reason,
            payment_reference: row.payment_reference,
            completed_at: row.completed_at,
            failed_at: row.failed_at,
            failure_reason: row.failure_reason,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct NotificationRow {
    id: Uuid,
    influencer_id: Uuid,
    kind: String,
    title: String,
    message: String,
    commission_id: Option<Uuid>,
    withdrawal_id: Option<Uuid>,
    created_at: OffsetDateTime,
    delivered_at: Option<OffsetDateTime>,
}

impl TryFrom<NotificationRow> for Notification {
    type Error = LedgerError;

    fn try_from(row: NotificationRow) -> LedgerResult<Self> {
        Ok(Notification {
            id: row.id,
            influencer_id: row.influencer_id,
            kind: parse_column(&row.kind, "ledger_notifications.kind")?,
            title: row.title,
            message: row.message,
            commission_id: row.commission_id,
            withdrawal_id: row.withdrawal_id,
            created_at: row.created_at,
            delivered_at: row.delivered_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RecruitmentRow {
    id: Uuid,
    recruiter_id: Uuid,
    recruited_id: Uuid,
    recruitment_code: String,
    recruited_at: OffsetDateTime,
    commission_window_end: OffsetDateTime,
    is_active: bool,
    commission_paid: bool,
    commission_id: Option<Uuid>,
    commission_paid_at: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl From<RecruitmentRow> for RecruitedInfluencer {
    fn from(row: RecruitmentRow) -> Self {
        RecruitedInfluencer {
            id: row.id,
            recruiter_id: row.recruiter_id,
            recruited_id: row.recruited_id,
            recruitment_code: row.recruitment_code,
            recruited_at: row.recruited_at,
            commission_window_end: row.commission_window_end,
            is_active: row.is_active,
            commission_paid: row.commission_paid,
            commission_id: row.commission_id,
            commission_paid_at: row.commission_paid_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ProviderReferralRow {
    id: Uuid,
    influencer_id: Uuid,
    provider_id: String,
    provider_type: String,
    recruitment_code: String,
    recruited_at: OffsetDateTime,
    commission_window_end: OffsetDateTime,
    is_active: bool,
    calls_with_commission: i64,
    total_commissions: i64,
    last_commission_at: Option<OffsetDateTime>,
    updated_at: OffsetDateTime,
}

impl From<ProviderReferralRow> for ProviderReferral {
    fn from(row: ProviderReferralRow) -> Self {
        ProviderReferral {
            id: row.id,
            influencer_id: row.influencer_id,
            provider_id: row.provider_id,
            provider_type: row.provider_type,
            recruitment_code: row.recruitment_code,
            recruited_at: row.recruited_at,
            commission_window_end: row.commission_window_end,
            is_active: row.is_active,
            calls_with_commission: row.calls_with_commission,
            total_commissions: row.total_commissions,
            last_commission_at: row.last_commission_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct LockedInfluencerRow {
    status: String,
    current_streak: i32,
    best_streak: i32,
    last_activity_date: Option<Date>,
}

#[derive(Debug, sqlx::FromRow)]
struct RankingRow {
    month: String,
    entries: Json<Vec<RankingEntry>>,
    calculated_at: OffsetDateTime,
    is_finalized: bool,
}

/// Postgres-backed ledger store
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn fetch_influencers(
        &self,
        sql: &str,
        bind: Option<&str>,
    ) -> LedgerResult<Vec<Influencer>> {
        let query = sqlx::query_as::<_, InfluencerRow>(sql);
        let query = match bind {
            Some(value) => query.bind(value),
            None => query,
        };
        query
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(Influencer::try_from)
            .collect()
    }

    /// Insert a commission and credit its owner inside `tx`
    async fn credit_commission_tx(
        tx: &mut Transaction<'_, Postgres>,
        commission: &Commission,
        activity: ActivityStamp<'_>,
    ) -> LedgerResult<()> {
        let locked: Option<LockedInfluencerRow> = sqlx::query_as(
            r#"
            SELECT status, current_streak, best_streak, last_activity_date
            FROM influencers
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(commission.influencer_id)
        .fetch_optional(&mut **tx)
        .await?;

        let locked = locked.ok_or(LedgerError::InfluencerNotFound(commission.influencer_id))?;
        let status: InfluencerStatus = parse_column(&locked.status, "influencers.status")?;
        if status != InfluencerStatus::Active {
            return Err(LedgerError::InfluencerNotActive {
                id: commission.influencer_id,
                status: locked.status,
            });
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO commissions (
                id, influencer_id, commission_type, status, amount, base_amount,
                level_multiplier, streak_multiplier, top_multiplier, currency,
                source_kind, source_id, source_details, description,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $15)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(commission.id)
        .bind(commission.influencer_id)
        .bind(commission.commission_type.as_str())
        .bind(commission.status.as_str())
        .bind(commission.amount)
        .bind(commission.base_amount)
        .bind(commission.level_multiplier)
        .bind(commission.streak_multiplier)
        .bind(commission.top_multiplier)
        .bind(&commission.currency)
        .bind(commission.source.kind.as_str())
        .bind(commission.source.id.as_deref())
        .bind(&commission.source.details)
        .bind(&commission.description)
        .bind(commission.created_at)
        .execute(&mut **tx)
        .await?;

        if inserted.rows_affected() == 0 {
            return Err(LedgerError::DuplicateCommission);
        }

        let (current_streak, best_streak) = next_streak(
            locked.current_streak,
            locked.best_streak,
            locked.last_activity_date,
            activity.date,
        );
        let (clients, recruits) = if commission.counts_as_client() {
            (1_i64, 0_i64)
        } else {
            (0, 1)
        };

        sqlx::query(
            r#"
            UPDATE influencers
            SET pending_balance = pending_balance + $2,
                total_commissions = total_commissions + 1,
                total_clients = total_clients + $3,
                total_recruits = total_recruits + $4,
                month_earnings = CASE WHEN stats_month = $5 THEN month_earnings ELSE 0 END + $2,
                month_clients = CASE WHEN stats_month = $5 THEN month_clients ELSE 0 END + $3,
                month_recruits = CASE WHEN stats_month = $5 THEN month_recruits ELSE 0 END + $4,
                stats_month = $5,
                current_streak = $6,
                best_streak = $7,
                last_activity_date = $8,
                updated_at = $9
            WHERE id = $1
            "#,
        )
        .bind(commission.influencer_id)
        .bind(commission.amount)
        .bind(clients)
        .bind(recruits)
        .bind(activity.month)
        .bind(current_streak)
        .bind(best_streak)
        .bind(activity.date)
        .bind(commission.created_at)
        .execute(&mut **tx)
        .await?;

        if let Some(referral_id) = activity.provider_referral {
            sqlx::query(
                r#"
                UPDATE provider_referrals
                SET calls_with_commission = calls_with_commission + 1,
                    total_commissions = total_commissions + $2,
                    last_commission_at = $3,
                    updated_at = $3
                WHERE id = $1
                "#,
            )
            .bind(referral_id)
            .bind(commission.amount)
            .bind(commission.created_at)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    async fn insert_recruitment_tx(
        tx: &mut Transaction<'_, Postgres>,
        record: &RecruitedInfluencer,
    ) -> Result<PgQueryResult, sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO recruited_influencers (
                id, recruiter_id, recruited_id, recruitment_code, recruited_at,
                commission_window_end, is_active, commission_paid, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(record.id)
        .bind(record.recruiter_id)
        .bind(record.recruited_id)
        .bind(&record.recruitment_code)
        .bind(record.recruited_at)
        .bind(record.commission_window_end)
        .bind(record.is_active)
        .bind(record.commission_paid)
        .bind(record.updated_at)
        .execute(&mut **tx)
        .await
    }

    /// Explain why the conditional reservation matched nothing
    async fn withdrawal_rejection(&self, influencer_id: Uuid, amount: i64) -> LedgerError {
        let row: Result<Option<(i64, Option<Uuid>)>, sqlx::Error> = sqlx::query_as(
            "SELECT available_balance, pending_withdrawal_id FROM influencers WHERE id = $1",
        )
        .bind(influencer_id)
        .fetch_optional(&self.pool)
        .await;

        match row {
            Ok(None) => LedgerError::InfluencerNotFound(influencer_id),
            Ok(Some((_, Some(pending)))) => LedgerError::WithdrawalAlreadyPending(pending),
            Ok(Some((available, None))) if available < amount => LedgerError::InsufficientBalance {
                requested: amount,
                available,
            },
            Ok(Some(_)) => LedgerError::ConcurrentModification(format!(
                "influencer {} changed during withdrawal request",
                influencer_id
            )),
            Err(e) => LedgerError::Database(e),
        }
    }
}

#[async_trait]
impl LedgerStore for PgStore {
    async fn load_config(&self) -> LedgerResult<Option<LedgerConfig>> {
        let row: Option<(i64, Json<LedgerConfig>)> =
            sqlx::query_as("SELECT version, document FROM ledger_config WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(|(version, Json(mut config))| {
            config.version = version;
            config
        }))
    }

    async fn save_config(&self, config: &LedgerConfig) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_config (id, version, document, updated_at)
            VALUES (1, $1, $2, NOW())
            ON CONFLICT (id) DO UPDATE
            SET version = EXCLUDED.version,
                document = EXCLUDED.document,
                updated_at = NOW()
            "#,
        )
        .bind(config.version)
        .bind(Json(config))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn insert_influencer(
        &self,
        influencer: &Influencer,
        recruitment: Option<&RecruitedInfluencer>,
    ) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO influencers (
                id, display_name, email, status, client_code, recruitment_code,
                stats_month, monthly_multiplier, captured_rates, recruited_by,
                created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(influencer.id)
        .bind(&influencer.display_name)
        .bind(&influencer.email)
        .bind(influencer.status.as_str())
        .bind(&influencer.client_code)
        .bind(&influencer.recruitment_code)
        .bind(&influencer.month_stats.month)
        .bind(influencer.monthly_multiplier)
        .bind(influencer.captured_rates.as_ref().map(Json))
        .bind(influencer.recruited_by)
        .bind(influencer.created_at)
        .bind(influencer.updated_at)
        .execute(&mut *tx)
        .await;

        let tracked = match (inserted, recruitment) {
            (Ok(_), Some(record)) => Self::insert_recruitment_tx(&mut tx, record)
                .await
                .map(|_| ()),
            (Ok(_), None) => Ok(()),
            (Err(e), _) => Err(e),
        };

        match tracked {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(LedgerError::AlreadyExists(format!(
                "influencer {}",
                influencer.id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_influencer(&self, id: Uuid) -> LedgerResult<Option<Influencer>> {
        let row: Option<InfluencerRow> = sqlx::query_as(&format!(
            "SELECT {} FROM influencers WHERE id = $1",
            INFLUENCER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Influencer::try_from).transpose()
    }

    async fn find_influencer_by_client_code(
        &self,
        code: &str,
    ) -> LedgerResult<Option<Influencer>> {
        let sql = format!(
            "SELECT {} FROM influencers WHERE UPPER(client_code) = UPPER($1)",
            INFLUENCER_COLUMNS
        );
        Ok(self.fetch_influencers(&sql, Some(code)).await?.into_iter().next())
    }

    async fn find_influencer_by_recruitment_code(
        &self,
        code: &str,
    ) -> LedgerResult<Option<Influencer>> {
        let sql = format!(
            "SELECT {} FROM influencers WHERE UPPER(recruitment_code) = UPPER($1)",
            INFLUENCER_COLUMNS
        );
        Ok(self.fetch_influencers(&sql, Some(code)).await?.into_iter().next())
    }

    async fn list_influencers(
        &self,
        after: Option<Uuid>,
        limit: i64,
    ) -> LedgerResult<Vec<Influencer>> {
        let rows: Vec<InfluencerRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM influencers
            WHERE ($1::uuid IS NULL OR id > $1)
            ORDER BY id
            LIMIT $2
            "#,
            INFLUENCER_COLUMNS
        ))
        .bind(after)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Influencer::try_from).collect()
    }

    async fn list_ranking_candidates(&self, month: &str) -> LedgerResult<Vec<Influencer>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM influencers
            WHERE status = 'active' AND stats_month = $1 AND month_earnings > 0
            "#,
            INFLUENCER_COLUMNS
        );
        self.fetch_influencers(&sql, Some(month)).await
    }

    async fn list_multiplier_holders(&self) -> LedgerResult<Vec<Influencer>> {
        let sql = format!(
            r#"
            SELECT {}
            FROM influencers
            WHERE monthly_multiplier <> 1.0 OR multiplier_month IS NOT NULL
            "#,
            INFLUENCER_COLUMNS
        );
        self.fetch_influencers(&sql, None).await
    }

    async fn record_rank(&self, influencer_id: Uuid, rank: i32) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE influencers
            SET current_month_rank = $2,
                best_rank = LEAST(COALESCE(best_rank, $2), $2),
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(influencer_id)
        .bind(rank)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::InfluencerNotFound(influencer_id));
        }
        Ok(())
    }

    async fn clear_ranks_except(&self, ranked: &[Uuid]) -> LedgerResult<u64> {
        let result = sqlx::query(
            r#"
            UPDATE influencers
            SET current_month_rank = NULL, updated_at = NOW()
            WHERE current_month_rank IS NOT NULL
              AND NOT (id = ANY($1))
            "#,
        )
        .bind(ranked)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn set_monthly_multiplier(
        &self,
        influencer_id: Uuid,
        multiplier: f64,
        month: Option<&str>,
    ) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE influencers
            SET monthly_multiplier = $2, multiplier_month = $3, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(influencer_id)
        .bind(multiplier)
        .bind(month)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(LedgerError::InfluencerNotFound(influencer_id));
        }
        Ok(())
    }

    async fn insert_commission(
        &self,
        commission: &Commission,
        activity: ActivityStamp<'_>,
    ) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        Self::credit_commission_tx(&mut tx, commission, activity).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn get_commission(&self, id: Uuid) -> LedgerResult<Option<Commission>> {
        let row: Option<CommissionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM commissions WHERE id = $1",
            COMMISSION_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Commission::try_from).transpose()
    }

    async fn find_commission_by_source(
        &self,
        influencer_id: Uuid,
        commission_type: CommissionType,
        source_kind: SourceKind,
        source_id: &str,
    ) -> LedgerResult<Option<Commission>> {
        let row: Option<CommissionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM commissions
            WHERE influencer_id = $1 AND commission_type = $2
              AND source_kind = $3 AND source_id = $4
            "#,
            COMMISSION_COLUMNS
        ))
        .bind(influencer_id)
        .bind(commission_type.as_str())
        .bind(source_kind.as_str())
        .bind(source_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Commission::try_from).transpose()
    }

    async fn list_commissions_by_source(
        &self,
        source_kind: SourceKind,
        source_id: &str,
    ) -> LedgerResult<Vec<Commission>> {
        let rows: Vec<CommissionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM commissions
            WHERE source_kind = $1 AND source_id = $2
            ORDER BY created_at
            "#,
            COMMISSION_COLUMNS
        ))
        .bind(source_kind.as_str())
        .bind(source_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Commission::try_from).collect()
    }

    async fn list_commissions_for_influencer(
        &self,
        influencer_id: Uuid,
    ) -> LedgerResult<Vec<Commission>> {
        let rows: Vec<CommissionRow> = sqlx::query_as(&format!(
            "SELECT {} FROM commissions WHERE influencer_id = $1 ORDER BY created_at",
            COMMISSION_COLUMNS
        ))
        .bind(influencer_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Commission::try_from).collect()
    }

    async fn list_due_commissions(
        &self,
        status: CommissionStatus,
        cutoff: OffsetDateTime,
        limit: i64,
    ) -> LedgerResult<Vec<Commission>> {
        let aged_from = match status {
            CommissionStatus::Validated => "validated_at",
            _ => "created_at",
        };
        let rows: Vec<CommissionRow> = sqlx::query_as(&format!(
            r#"
            SELECT {columns}
            FROM commissions
            WHERE status = $1 AND {aged_from} <= $2
            ORDER BY {aged_from}, id
            LIMIT $3
            "#,
            columns = COMMISSION_COLUMNS,
            aged_from = aged_from,
        ))
        .bind(status.as_str())
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Commission::try_from).collect()
    }

    async fn transition_commission(
        &self,
        id: Uuid,
        from: CommissionStatus,
        to: CommissionStatus,
        now: OffsetDateTime,
        reason: Option<&str>,
    ) -> LedgerResult<Option<Commission>> {
        if !from.can_transition_to(to) {
            return Err(LedgerError::InvalidTransition {
                entity: "commission",
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        let mut tx = self.pool.begin().await?;

        let row: Option<CommissionRow> = sqlx::query_as(&format!(
            r#"
            UPDATE commissions
            SET status = $3,
                updated_at = $4,
                validated_at = CASE WHEN $3 = 'validated' THEN $4 ELSE validated_at END,
                available_at = CASE WHEN $3 = 'available' THEN $4 ELSE available_at END,
                cancelled_at = CASE WHEN $3 = 'cancelled' THEN $4 ELSE cancelled_at END,
                cancellation_reason = CASE WHEN $3 = 'cancelled' THEN $5 ELSE cancellation_reason END
            WHERE id = $1 AND status = $2
            RETURNING {}
            "#,
            COMMISSION_COLUMNS
        ))
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(now)
        .bind(reason)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM commissions WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            return match exists {
                Some(_) => Ok(None),
                None => Err(LedgerError::CommissionNotFound(id)),
            };
        };
        let commission = Commission::try_from(row)?;

        let delta = commission_move_delta(from, to, commission.amount);
        sqlx::query(
            r#"
            UPDATE influencers
            SET pending_balance = pending_balance + $2,
                validated_balance = validated_balance + $3,
                available_balance = available_balance + $4,
                total_earned = total_earned + $5,
                updated_at = $6
            WHERE id = $1
            "#,
        )
        .bind(commission.influencer_id)
        .bind(delta.pending)
        .bind(delta.validated)
        .bind(delta.available)
        .bind(delta.total_earned)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(Some(commission))
    }

    async fn sum_client_referral_earnings(&self, influencer_id: Uuid) -> LedgerResult<i64> {
        let (total,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount), 0)::BIGINT
            FROM commissions
            WHERE influencer_id = $1
              AND commission_type = 'client_referral'
              AND status <> 'cancelled'
            "#,
        )
        .bind(influencer_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(total)
    }

    async fn insert_recruitment(&self, record: &RecruitedInfluencer) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;
        match Self::insert_recruitment_tx(&mut tx, record).await {
            Ok(_) => {
                tx.commit().await?;
                Ok(())
            }
            Err(e) if is_unique_violation(&e) => Err(LedgerError::AlreadyExists(format!(
                "recruitment for {}",
                record.recruited_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_recruitment_for_recruit(
        &self,
        recruited_id: Uuid,
    ) -> LedgerResult<Option<RecruitedInfluencer>> {
        let row: Option<RecruitmentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM recruited_influencers WHERE recruited_id = $1",
            RECRUITMENT_COLUMNS
        ))
        .bind(recruited_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(RecruitedInfluencer::from))
    }

    async fn list_recruitments(&self) -> LedgerResult<Vec<RecruitedInfluencer>> {
        let rows: Vec<RecruitmentRow> = sqlx::query_as(&format!(
            "SELECT {} FROM recruited_influencers ORDER BY recruited_at",
            RECRUITMENT_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(RecruitedInfluencer::from).collect())
    }

    async fn deactivate_recruitment(&self, id: Uuid, now: OffsetDateTime) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE recruited_influencers
            SET is_active = FALSE, updated_at = $2
            WHERE id = $1 AND is_active
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn settle_recruitment(
        &self,
        recruitment_id: Uuid,
        commission: &Commission,
        activity: ActivityStamp<'_>,
    ) -> LedgerResult<SettlementOutcome> {
        let mut tx = self.pool.begin().await?;

        // Serializes concurrent settlements for the same recruit
        let record: Option<(Uuid, bool)> = sqlx::query_as(
            r#"
            SELECT recruiter_id, commission_paid
            FROM recruited_influencers
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(recruitment_id)
        .fetch_optional(&mut *tx)
        .await?;

        let (recruiter_id, paid) = record.ok_or_else(|| {
            LedgerError::Internal(format!("recruitment {} vanished", recruitment_id))
        })?;
        if paid {
            return Ok(SettlementOutcome::AlreadyPaid);
        }

        let recruiter_status: Option<(String,)> =
            sqlx::query_as("SELECT status FROM influencers WHERE id = $1 FOR UPDATE")
                .bind(recruiter_id)
                .fetch_optional(&mut *tx)
                .await?;
        let active = matches!(recruiter_status, Some((ref status,)) if status == "active");
        if !active {
            return Ok(SettlementOutcome::RecruiterInactive);
        }

        Self::credit_commission_tx(&mut tx, commission, activity).await?;

        sqlx::query(
            r#"
            UPDATE recruited_influencers
            SET commission_paid = TRUE,
                commission_id = $2,
                commission_paid_at = $3,
                updated_at = $3
            WHERE id = $1
            "#,
        )
        .bind(recruitment_id)
        .bind(commission.id)
        .bind(commission.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(SettlementOutcome::Paid)
    }

    async fn insert_provider_referral(&self, referral: &ProviderReferral) -> LedgerResult<()> {
        let result = sqlx::query(
            r#"
            INSERT INTO provider_referrals (
                id, influencer_id, provider_id, provider_type, recruitment_code,
                recruited_at, commission_window_end, is_active, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(referral.id)
        .bind(referral.influencer_id)
        .bind(&referral.provider_id)
        .bind(&referral.provider_type)
        .bind(&referral.recruitment_code)
        .bind(referral.recruited_at)
        .bind(referral.commission_window_end)
        .bind(referral.is_active)
        .bind(referral.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if is_unique_violation(&e) => Err(LedgerError::AlreadyExists(format!(
                "provider referral for {}",
                referral.provider_id
            ))),
            Err(e) => Err(e.into()),
        }
    }

    async fn find_provider_referral(
        &self,
        provider_id: &str,
    ) -> LedgerResult<Option<ProviderReferral>> {
        let row: Option<ProviderReferralRow> = sqlx::query_as(&format!(
            "SELECT {} FROM provider_referrals WHERE provider_id = $1",
            PROVIDER_REFERRAL_COLUMNS
        ))
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ProviderReferral::from))
    }

    async fn deactivate_provider_referral(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE provider_referrals
            SET is_active = FALSE, updated_at = $2
            WHERE id = $1 AND is_active
            "#,
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn create_withdrawal(&self, withdrawal: &Withdrawal) -> LedgerResult<()> {
        let mut tx = self.pool.begin().await?;

        let inserted = sqlx::query(
            r#"
            INSERT INTO withdrawals (
                id, influencer_id, amount, currency, payment_method, payment_details,
                status, requested_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            "#,
        )
        .bind(withdrawal.id)
        .bind(withdrawal.influencer_id)
        .bind(withdrawal.amount)
        .bind(&withdrawal.currency)
        .bind(withdrawal.payment_method.as_str())
        .bind(Json(&withdrawal.payment_details))
        .bind(withdrawal.status.as_str())
        .bind(withdrawal.requested_at)
        .execute(&mut *tx)
        .await;

        match inserted {
            Ok(_) => {}
            Err(e) if is_unique_violation(&e) => {
                drop(tx);
                return Err(self
                    .withdrawal_rejection(withdrawal.influencer_id, withdrawal.amount)
                    .await);
            }
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                return Err(LedgerError::InfluencerNotFound(withdrawal.influencer_id));
            }
            Err(e) => return Err(e.into()),
        }

        // Reserve: debit only when nothing is pending and the balance covers it
        let reserved = sqlx::query(
            r#"
            UPDATE influencers
            SET available_balance = available_balance - $2,
                pending_withdrawal_id = $3,
                updated_at = $4
            WHERE id = $1
              AND pending_withdrawal_id IS NULL
              AND available_balance >= $2
            "#,
        )
        .bind(withdrawal.influencer_id)
        .bind(withdrawal.amount)
        .bind(withdrawal.id)
        .bind(withdrawal.requested_at)
        .execute(&mut *tx)
        .await?;

        if reserved.rows_affected() == 0 {
            tx.rollback().await?;
            return Err(self
                .withdrawal_rejection(withdrawal.influencer_id, withdrawal.amount)
                .await);
        }

        tx.commit().await?;
        Ok(())
    }

    async fn get_withdrawal(&self, id: Uuid) -> LedgerResult<Option<Withdrawal>> {
        let row: Option<WithdrawalRow> = sqlx::query_as(&format!(
            "SELECT {} FROM withdrawals WHERE id = $1",
            WITHDRAWAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(Withdrawal::try_from).transpose()
    }

    async fn list_withdrawals_by_status(
        &self,
        status: WithdrawalStatus,
        limit: i64,
    ) -> LedgerResult<Vec<Withdrawal>> {
        let rows: Vec<WithdrawalRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM withdrawals
            WHERE status = $1
            ORDER BY requested_at, id
            LIMIT $2
            "#,
            WITHDRAWAL_COLUMNS
        ))
        .bind(status.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Withdrawal::try_from).collect()
    }

    async fn list_withdrawals_for_influencer(
        &self,
        influencer_id: Uuid,
    ) -> LedgerResult<Vec<Withdrawal>> {
        let rows: Vec<WithdrawalRow> = sqlx::query_as(&format!(
            "SELECT {} FROM withdrawals WHERE influencer_id = $1 ORDER BY requested_at DESC",
            WITHDRAWAL_COLUMNS
        ))
        .bind(influencer_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Withdrawal::try_from).collect()
    }

    async fn transition_withdrawal(
        &self,
        id: Uuid,
        to: WithdrawalStatus,
        update: &WithdrawalUpdate,
        now: OffsetDateTime,
    ) -> LedgerResult<Option<Withdrawal>> {
        let sources: Vec<String> = to
            .allowed_sources()
            .iter()
            .map(|s| s.as_str().to_string())
            .collect();

        let mut tx = self.pool.begin().await?;

        let row: Option<WithdrawalRow> = sqlx::query_as(&format!(
            r#"
            UPDATE withdrawals
            SET status = $2,
                processed_at = CASE WHEN $2 IN ('approved', 'processing', 'rejected')
                                    THEN $3 ELSE processed_at END,
                processed_by = COALESCE($4, processed_by),
                rejection_reason = CASE WHEN $2 = 'rejected' THEN $5 ELSE rejection_reason END,
                failure_reason = CASE WHEN $2 = 'failed' THEN $5 ELSE failure_reason END,
                failed_at = CASE WHEN $2 = 'failed' THEN $3 ELSE failed_at END,
                completed_at = CASE WHEN $2 = 'completed' THEN $3 ELSE completed_at END,
                payment_reference = COALESCE($6, payment_reference)
            WHERE id = $1 AND status = ANY($7)
            RETURNING {}
            "#,
            WITHDRAWAL_COLUMNS
        ))
        .bind(id)
        .bind(to.as_str())
        .bind(now)
        .bind(update.processed_by.as_deref())
        .bind(update.reason.as_deref())
        .bind(update.payment_reference.as_deref())
        .bind(&sources)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            let exists: Option<(Uuid,)> = sqlx::query_as("SELECT id FROM withdrawals WHERE id = $1")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;
            return match exists {
                Some(_) => Ok(None),
                None => Err(LedgerError::WithdrawalNotFound(id)),
            };
        };
        let withdrawal = Withdrawal::try_from(row)?;

        if to.is_terminal() {
            let (refund, withdrawn) = if to.refunds_balance() {
                (withdrawal.amount, 0)
            } else {
                (0, withdrawal.amount)
            };
            sqlx::query(
                r#"
                UPDATE influencers
                SET available_balance = available_balance + $2,
                    total_withdrawn = total_withdrawn + $3,
                    pending_withdrawal_id = CASE WHEN pending_withdrawal_id = $4
                                                 THEN NULL ELSE pending_withdrawal_id END,
                    updated_at = $5
                WHERE id = $1
                "#,
            )
            .bind(withdrawal.influencer_id)
            .bind(refund)
            .bind(withdrawn)
            .bind(withdrawal.id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(Some(withdrawal))
    }

    async fn insert_ranking(&self, ranking: &MonthlyRanking) -> LedgerResult<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO monthly_rankings (month, entries, calculated_at, is_finalized)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (month) DO NOTHING
            "#,
        )
        .bind(&ranking.month)
        .bind(Json(&ranking.entries))
        .bind(ranking.calculated_at)
        .bind(ranking.is_finalized)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn get_ranking(&self, month: &str) -> LedgerResult<Option<MonthlyRanking>> {
        let row: Option<RankingRow> = sqlx::query_as(
            "SELECT month, entries, calculated_at, is_finalized FROM monthly_rankings WHERE month = $1",
        )
        .bind(month)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| MonthlyRanking {
            month: row.month,
            entries: row.entries.0,
            calculated_at: row.calculated_at,
            is_finalized: row.is_finalized,
        }))
    }

    async fn insert_notification(&self, notification: &Notification) -> LedgerResult<()> {
        sqlx::query(
            r#"
            INSERT INTO ledger_notifications (
                id, influencer_id, kind, title, message, commission_id, withdrawal_id,
                created_at, delivered_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(notification.id)
        .bind(notification.influencer_id)
        .bind(notification.kind.as_str())
        .bind(&notification.title)
        .bind(&notification.message)
        .bind(notification.commission_id)
        .bind(notification.withdrawal_id)
        .bind(notification.created_at)
        .bind(notification.delivered_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_notifications(&self, influencer_id: Uuid) -> LedgerResult<Vec<Notification>> {
        let rows: Vec<NotificationRow> = sqlx::query_as(&format!(
            "SELECT {} FROM ledger_notifications WHERE influencer_id = $1 ORDER BY created_at",
            NOTIFICATION_COLUMNS
        ))
        .bind(influencer_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Notification::try_from).collect()
    }

    async fn list_undelivered_notifications(
        &self,
        limit: i64,
    ) -> LedgerResult<Vec<Notification>> {
        let rows: Vec<NotificationRow> = sqlx::query_as(&format!(
            r#"
            SELECT {}
            FROM ledger_notifications
            WHERE delivered_at IS NULL
            ORDER BY created_at
            LIMIT $1
            "#,
            NOTIFICATION_COLUMNS
        ))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Notification::try_from).collect()
    }

    async fn mark_notification_delivered(
        &self,
        id: Uuid,
        now: OffsetDateTime,
    ) -> LedgerResult<bool> {
        let result = sqlx::query(
            "UPDATE ledger_notifications SET delivered_at = $2 WHERE id = $1 AND delivered_at IS NULL",
        )
        .bind(id)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
