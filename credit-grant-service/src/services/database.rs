//! Database service for credit-grant-service.

use crate::models::{
    ApplicationReason, ApplicationStatus, CreditGrant, CreditGrantApplication, CreditGrantCadence,
    CreditGrantPeriod, CreditGrantScope, CreditWalletRequest, ExpirationDurationUnit,
    ExpirationType, ListCreditGrantApplicationsFilter, ListCreditGrantsFilter, PlanSnapshot,
    RecordStatus, SubscriptionSnapshot, SubscriptionStatus, Wallet, WalletTransaction,
};
use crate::services::metrics::DB_QUERY_DURATION;
use crate::services::ports::{
    CreditGrantApplicationStore, CreditGrantStore, PlanSource, SubscriptionSource, WalletLedger,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::FromRow;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const GRANT_COLUMNS: &str = "grant_id, tenant_id, name, scope, plan_id, subscription_id, credits, cadence, period, period_count, priority, expiration_type, expiration_duration, expiration_duration_unit, start_date, end_date, anchor, status, metadata, created_by, updated_by, created_utc, updated_utc";

const APPLICATION_COLUMNS: &str = "application_id, tenant_id, credit_grant_id, subscription_id, scheduled_for, period_start, period_end, status, reason, subscription_status_at_application, retry_count, failure_reason, applied_at, credits, idempotency_key, metadata, created_utc, updated_utc";

const TRANSACTION_COLUMNS: &str = "transaction_id, tenant_id, wallet_id, amount, expiry_date, idempotency_key, reason, priority, metadata, created_utc";

#[derive(FromRow)]
struct CreditGrantRow {
    grant_id: Uuid,
    tenant_id: Uuid,
    name: String,
    scope: String,
    plan_id: Option<Uuid>,
    subscription_id: Option<Uuid>,
    credits: Decimal,
    cadence: String,
    period: Option<String>,
    period_count: Option<i32>,
    priority: Option<i32>,
    expiration_type: String,
    expiration_duration: Option<i32>,
    expiration_duration_unit: Option<String>,
    start_date: DateTime<Utc>,
    end_date: Option<DateTime<Utc>>,
    anchor: Option<DateTime<Utc>>,
    status: String,
    metadata: Option<serde_json::Value>,
    created_by: Option<String>,
    updated_by: Option<String>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<CreditGrantRow> for CreditGrant {
    fn from(row: CreditGrantRow) -> Self {
        Self {
            grant_id: row.grant_id,
            tenant_id: row.tenant_id,
            name: row.name,
            scope: CreditGrantScope::from_string(&row.scope),
            plan_id: row.plan_id,
            subscription_id: row.subscription_id,
            credits: row.credits,
            cadence: CreditGrantCadence::from_string(&row.cadence),
            period: row.period.as_deref().map(CreditGrantPeriod::from_string),
            period_count: row.period_count,
            priority: row.priority,
            expiration_type: ExpirationType::from_string(&row.expiration_type),
            expiration_duration: row.expiration_duration,
            expiration_duration_unit: row
                .expiration_duration_unit
                .as_deref()
                .map(ExpirationDurationUnit::from_string),
            start_date: row.start_date,
            end_date: row.end_date,
            anchor: row.anchor,
            status: RecordStatus::from_string(&row.status),
            metadata: row.metadata,
            created_by: row.created_by,
            updated_by: row.updated_by,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

#[derive(FromRow)]
struct ApplicationRow {
    application_id: Uuid,
    tenant_id: Uuid,
    credit_grant_id: Uuid,
    subscription_id: Uuid,
    scheduled_for: DateTime<Utc>,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
    status: String,
    reason: String,
    subscription_status_at_application: Option<String>,
    retry_count: i32,
    failure_reason: Option<String>,
    applied_at: Option<DateTime<Utc>>,
    credits: Decimal,
    idempotency_key: String,
    metadata: Option<serde_json::Value>,
    created_utc: DateTime<Utc>,
    updated_utc: DateTime<Utc>,
}

impl From<ApplicationRow> for CreditGrantApplication {
    fn from(row: ApplicationRow) -> Self {
        Self {
            application_id: row.application_id,
            tenant_id: row.tenant_id,
            credit_grant_id: row.credit_grant_id,
            subscription_id: row.subscription_id,
            scheduled_for: row.scheduled_for,
            period_start: row.period_start,
            period_end: row.period_end,
            status: ApplicationStatus::from_string(&row.status),
            reason: ApplicationReason::from_string(&row.reason),
            subscription_status_at_application: row
                .subscription_status_at_application
                .as_deref()
                .map(SubscriptionStatus::from_string),
            retry_count: row.retry_count,
            failure_reason: row.failure_reason,
            applied_at: row.applied_at,
            credits: row.credits,
            idempotency_key: row.idempotency_key,
            metadata: row.metadata,
            created_utc: row.created_utc,
            updated_utc: row.updated_utc,
        }
    }
}

#[derive(FromRow)]
struct SubscriptionRow {
    subscription_id: Uuid,
    tenant_id: Uuid,
    customer_id: Uuid,
    plan_id: Uuid,
    status: String,
    currency: String,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    current_period_start: NaiveDate,
    current_period_end: NaiveDate,
}

/// Billing dates are calendar days; the engine works at midnight UTC.
fn midnight_utc(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

impl From<SubscriptionRow> for SubscriptionSnapshot {
    fn from(row: SubscriptionRow) -> Self {
        Self {
            subscription_id: row.subscription_id,
            tenant_id: row.tenant_id,
            customer_id: row.customer_id,
            plan_id: row.plan_id,
            status: SubscriptionStatus::from_string(&row.status),
            currency: row.currency,
            start_date: midnight_utc(row.start_date),
            end_date: row.end_date.map(midnight_utc),
            current_period_start: midnight_utc(row.current_period_start),
            current_period_end: midnight_utc(row.current_period_end),
        }
    }
}

#[derive(FromRow)]
struct PlanRow {
    plan_id: Uuid,
    tenant_id: Uuid,
    name: String,
    currency: String,
    is_active: bool,
    is_archived: bool,
}

impl From<PlanRow> for PlanSnapshot {
    fn from(row: PlanRow) -> Self {
        Self {
            plan_id: row.plan_id,
            tenant_id: row.tenant_id,
            name: row.name,
            currency: row.currency,
            is_active: row.is_active,
            is_archived: row.is_archived,
        }
    }
}

#[derive(FromRow)]
struct WalletRow {
    wallet_id: Uuid,
    tenant_id: Uuid,
    customer_id: Uuid,
    currency: String,
    created_utc: DateTime<Utc>,
}

impl From<WalletRow> for Wallet {
    fn from(row: WalletRow) -> Self {
        Self {
            wallet_id: row.wallet_id,
            tenant_id: row.tenant_id,
            customer_id: row.customer_id,
            currency: row.currency,
            created_utc: row.created_utc,
        }
    }
}

#[derive(FromRow)]
struct TransactionRow {
    transaction_id: Uuid,
    tenant_id: Uuid,
    wallet_id: Uuid,
    amount: Decimal,
    expiry_date: Option<DateTime<Utc>>,
    idempotency_key: String,
    reason: String,
    priority: Option<i32>,
    metadata: Option<serde_json::Value>,
    created_utc: DateTime<Utc>,
}

impl From<TransactionRow> for WalletTransaction {
    fn from(row: TransactionRow) -> Self {
        Self {
            transaction_id: row.transaction_id,
            tenant_id: row.tenant_id,
            wallet_id: row.wallet_id,
            amount: row.amount,
            expiry_date: row.expiry_date,
            idempotency_key: row.idempotency_key,
            reason: row.reason,
            priority: row.priority,
            metadata: row.metadata,
            created_utc: row.created_utc,
        }
    }
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "credit-grant-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }
}

// =========================================================================
// Credit Grant Operations
// =========================================================================

#[async_trait]
impl CreditGrantStore for Database {
    #[instrument(skip(self, grant), fields(tenant_id = %grant.tenant_id, grant_id = %grant.grant_id))]
    async fn create_grant(&self, grant: &CreditGrant) -> Result<CreditGrant, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_credit_grant"])
            .start_timer();

        let query = format!(
            r#"
            INSERT INTO credit_grants ({GRANT_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21, $22, $23)
            RETURNING {GRANT_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, CreditGrantRow>(&query)
            .bind(grant.grant_id)
            .bind(grant.tenant_id)
            .bind(&grant.name)
            .bind(grant.scope.as_str())
            .bind(grant.plan_id)
            .bind(grant.subscription_id)
            .bind(grant.credits)
            .bind(grant.cadence.as_str())
            .bind(grant.period.map(|p| p.as_str()))
            .bind(grant.period_count)
            .bind(grant.priority)
            .bind(grant.expiration_type.as_str())
            .bind(grant.expiration_duration)
            .bind(grant.expiration_duration_unit.map(|u| u.as_str()))
            .bind(grant.start_date)
            .bind(grant.end_date)
            .bind(grant.anchor)
            .bind(grant.status.as_str())
            .bind(&grant.metadata)
            .bind(&grant.created_by)
            .bind(&grant.updated_by)
            .bind(grant.created_utc)
            .bind(grant.updated_utc)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    AppError::Conflict(anyhow::anyhow!("Credit grant {} already exists", grant.grant_id))
                }
                _ => AppError::DatabaseError(anyhow::anyhow!("Failed to create credit grant: {}", e)),
            })?;

        timer.observe_duration();
        Ok(row.into())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, grant_id = %grant_id))]
    async fn get_grant(
        &self,
        tenant_id: Uuid,
        grant_id: Uuid,
    ) -> Result<Option<CreditGrant>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_credit_grant"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {GRANT_COLUMNS}
            FROM credit_grants
            WHERE tenant_id = $1 AND grant_id = $2
            "#
        );
        let row = sqlx::query_as::<_, CreditGrantRow>(&query)
            .bind(tenant_id)
            .bind(grant_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to get credit grant: {}", e))
            })?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, grant), fields(tenant_id = %grant.tenant_id, grant_id = %grant.grant_id))]
    async fn update_grant(&self, grant: &CreditGrant) -> Result<CreditGrant, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_credit_grant"])
            .start_timer();

        let query = format!(
            r#"
            UPDATE credit_grants
            SET name = $3, status = $4, metadata = $5, updated_by = $6, updated_utc = $7
            WHERE tenant_id = $1 AND grant_id = $2
            RETURNING {GRANT_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, CreditGrantRow>(&query)
            .bind(grant.tenant_id)
            .bind(grant.grant_id)
            .bind(&grant.name)
            .bind(grant.status.as_str())
            .bind(&grant.metadata)
            .bind(&grant.updated_by)
            .bind(grant.updated_utc)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to update credit grant: {}", e))
            })?;

        timer.observe_duration();

        row.map(Into::into).ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Credit grant {} not found", grant.grant_id))
        })
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    async fn list_grants(
        &self,
        tenant_id: Uuid,
        filter: &ListCreditGrantsFilter,
    ) -> Result<Vec<CreditGrant>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_credit_grants"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;

        let query = format!(
            r#"
            SELECT {GRANT_COLUMNS}
            FROM credit_grants
            WHERE tenant_id = $1
              AND ($2::text IS NULL OR scope = $2)
              AND ($3::uuid IS NULL OR plan_id = $3)
              AND ($4::uuid IS NULL OR subscription_id = $4)
              AND ($5::text IS NULL OR status = $5)
              AND ($6::uuid IS NULL OR grant_id > $6)
            ORDER BY grant_id
            LIMIT $7
            "#
        );
        let rows = sqlx::query_as::<_, CreditGrantRow>(&query)
            .bind(tenant_id)
            .bind(filter.scope.map(|s| s.as_str()))
            .bind(filter.plan_id)
            .bind(filter.subscription_id)
            .bind(filter.status.map(|s| s.as_str()))
            .bind(filter.page_token)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!("Failed to list credit grants: {}", e))
            })?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// =========================================================================
// Credit Grant Application Operations
// =========================================================================

#[async_trait]
impl CreditGrantApplicationStore for Database {
    #[instrument(skip(self, application), fields(tenant_id = %application.tenant_id, grant_id = %application.credit_grant_id))]
    async fn create_application(
        &self,
        application: &CreditGrantApplication,
    ) -> Result<CreditGrantApplication, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_credit_grant_application"])
            .start_timer();

        let query = format!(
            r#"
            INSERT INTO credit_grant_applications ({APPLICATION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            RETURNING {APPLICATION_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, ApplicationRow>(&query)
            .bind(application.application_id)
            .bind(application.tenant_id)
            .bind(application.credit_grant_id)
            .bind(application.subscription_id)
            .bind(application.scheduled_for)
            .bind(application.period_start)
            .bind(application.period_end)
            .bind(application.status.as_str())
            .bind(application.reason.as_str())
            .bind(application.subscription_status_at_application.map(|s| s.as_str()))
            .bind(application.retry_count)
            .bind(&application.failure_reason)
            .bind(application.applied_at)
            .bind(application.credits)
            .bind(&application.idempotency_key)
            .bind(&application.metadata)
            .bind(application.created_utc)
            .bind(application.updated_utc)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| match e {
                sqlx::Error::Database(ref db_err) if db_err.is_unique_violation() => {
                    // Race condition: the period was already scheduled
                    AppError::Conflict(anyhow::anyhow!("Duplicate idempotency key"))
                }
                _ => AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to create credit grant application: {}",
                    e
                )),
            })?;

        timer.observe_duration();
        Ok(row.into())
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, application_id = %application_id))]
    async fn get_application(
        &self,
        tenant_id: Uuid,
        application_id: Uuid,
    ) -> Result<Option<CreditGrantApplication>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_credit_grant_application"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {APPLICATION_COLUMNS}
            FROM credit_grant_applications
            WHERE tenant_id = $1 AND application_id = $2
            "#
        );
        let row = sqlx::query_as::<_, ApplicationRow>(&query)
            .bind(tenant_id)
            .bind(application_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to get credit grant application: {}",
                    e
                ))
            })?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self, application), fields(tenant_id = %application.tenant_id, application_id = %application.application_id))]
    async fn update_application(
        &self,
        application: &CreditGrantApplication,
    ) -> Result<CreditGrantApplication, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["update_credit_grant_application"])
            .start_timer();

        // Terminal rows are excluded so a concurrent resolution is never overwritten.
        let query = format!(
            r#"
            UPDATE credit_grant_applications
            SET scheduled_for = $3,
                status = $4,
                subscription_status_at_application = $5,
                retry_count = $6,
                failure_reason = $7,
                applied_at = $8,
                updated_utc = $9
            WHERE tenant_id = $1 AND application_id = $2
              AND status IN ('pending', 'failed')
            RETURNING {APPLICATION_COLUMNS}
            "#
        );
        let row = sqlx::query_as::<_, ApplicationRow>(&query)
            .bind(application.tenant_id)
            .bind(application.application_id)
            .bind(application.scheduled_for)
            .bind(application.status.as_str())
            .bind(application.subscription_status_at_application.map(|s| s.as_str()))
            .bind(application.retry_count)
            .bind(&application.failure_reason)
            .bind(application.applied_at)
            .bind(application.updated_utc)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to update credit grant application: {}",
                    e
                ))
            })?;

        timer.observe_duration();

        match row {
            Some(row) => Ok(row.into()),
            None => match self
                .get_application(application.tenant_id, application.application_id)
                .await?
            {
                Some(existing) => Err(AppError::Conflict(anyhow::anyhow!(
                    "Credit grant application {} is already {}",
                    existing.application_id,
                    existing.status.as_str()
                ))),
                None => Err(AppError::NotFound(anyhow::anyhow!(
                    "Credit grant application {} not found",
                    application.application_id
                ))),
            },
        }
    }

    #[instrument(skip(self, filter), fields(tenant_id = %tenant_id))]
    async fn list_applications(
        &self,
        tenant_id: Uuid,
        filter: &ListCreditGrantApplicationsFilter,
    ) -> Result<Vec<CreditGrantApplication>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_credit_grant_applications"])
            .start_timer();

        let limit = filter.page_size.clamp(1, 100) as i64;
        let statuses: Option<Vec<String>> = (!filter.statuses.is_empty()).then(|| {
            filter
                .statuses
                .iter()
                .map(|s| s.as_str().to_string())
                .collect()
        });

        let query = format!(
            r#"
            SELECT {APPLICATION_COLUMNS}
            FROM credit_grant_applications
            WHERE tenant_id = $1
              AND ($2::uuid IS NULL OR credit_grant_id = $2)
              AND ($3::uuid IS NULL OR subscription_id = $3)
              AND ($4::text[] IS NULL OR status = ANY($4))
              AND ($5::uuid IS NULL OR application_id > $5)
            ORDER BY application_id
            LIMIT $6
            "#
        );
        let rows = sqlx::query_as::<_, ApplicationRow>(&query)
            .bind(tenant_id)
            .bind(filter.credit_grant_id)
            .bind(filter.subscription_id)
            .bind(statuses)
            .bind(filter.page_token)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to list credit grant applications: {}",
                    e
                ))
            })?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self, idempotency_key), fields(tenant_id = %tenant_id))]
    async fn find_by_idempotency_key(
        &self,
        tenant_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<CreditGrantApplication>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_credit_grant_application_by_key"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {APPLICATION_COLUMNS}
            FROM credit_grant_applications
            WHERE tenant_id = $1 AND idempotency_key = $2
            "#
        );
        let row = sqlx::query_as::<_, ApplicationRow>(&query)
            .bind(tenant_id)
            .bind(idempotency_key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to find credit grant application: {}",
                    e
                ))
            })?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id))]
    async fn find_open_applications(
        &self,
        tenant_id: Uuid,
        credit_grant_id: Option<Uuid>,
        subscription_id: Option<Uuid>,
    ) -> Result<Vec<CreditGrantApplication>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_open_credit_grant_applications"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {APPLICATION_COLUMNS}
            FROM credit_grant_applications
            WHERE tenant_id = $1
              AND status IN ('pending', 'failed')
              AND ($2::uuid IS NULL OR credit_grant_id = $2)
              AND ($3::uuid IS NULL OR subscription_id = $3)
            ORDER BY scheduled_for, application_id
            "#
        );
        let rows = sqlx::query_as::<_, ApplicationRow>(&query)
            .bind(tenant_id)
            .bind(credit_grant_id)
            .bind(subscription_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to find open credit grant applications: {}",
                    e
                ))
            })?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }

    #[instrument(skip(self))]
    async fn find_due_applications(
        &self,
        now: DateTime<Utc>,
        max_retries: Option<i32>,
        limit: i64,
    ) -> Result<Vec<CreditGrantApplication>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["find_due_credit_grant_applications"])
            .start_timer();

        let query = format!(
            r#"
            SELECT {APPLICATION_COLUMNS}
            FROM credit_grant_applications
            WHERE status IN ('pending', 'failed')
              AND scheduled_for <= $1
              AND ($2::int IS NULL OR status <> 'failed' OR retry_count < $2)
            ORDER BY scheduled_for, application_id
            LIMIT $3
            "#
        );
        let rows = sqlx::query_as::<_, ApplicationRow>(&query)
            .bind(now)
            .bind(max_retries)
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| {
                AppError::DatabaseError(anyhow::anyhow!(
                    "Failed to find due credit grant applications: {}",
                    e
                ))
            })?;

        timer.observe_duration();
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

// =========================================================================
// Billing Read Models
// =========================================================================

#[async_trait]
impl SubscriptionSource for Database {
    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<SubscriptionSnapshot>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_subscription"])
            .start_timer();

        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT s.subscription_id, s.tenant_id, s.customer_id, s.plan_id, s.status, p.currency,
                   s.start_date, s.end_date, s.current_period_start, s.current_period_end
            FROM subscriptions s
            JOIN billing_plans p ON p.plan_id = s.plan_id AND p.tenant_id = s.tenant_id
            WHERE s.tenant_id = $1 AND s.subscription_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get subscription: {}", e)))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }
}

#[async_trait]
impl PlanSource for Database {
    #[instrument(skip(self), fields(tenant_id = %tenant_id, plan_id = %plan_id))]
    async fn get_plan(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Option<PlanSnapshot>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_plan"])
            .start_timer();

        let row = sqlx::query_as::<_, PlanRow>(
            r#"
            SELECT plan_id, tenant_id, name, currency, is_active, is_archived
            FROM billing_plans
            WHERE tenant_id = $1 AND plan_id = $2
            "#,
        )
        .bind(tenant_id)
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to get plan: {}", e)))?;

        timer.observe_duration();
        Ok(row.map(Into::into))
    }
}

// =========================================================================
// Wallet Ledger Operations
// =========================================================================

#[async_trait]
impl WalletLedger for Database {
    #[instrument(skip(self), fields(tenant_id = %tenant_id, customer_id = %customer_id))]
    async fn resolve_wallet(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        currency: &str,
    ) -> Result<Wallet, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["resolve_wallet"])
            .start_timer();

        let row = sqlx::query_as::<_, WalletRow>(
            r#"
            INSERT INTO wallets (wallet_id, tenant_id, customer_id, currency)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (tenant_id, customer_id, currency) DO UPDATE SET currency = EXCLUDED.currency
            RETURNING wallet_id, tenant_id, customer_id, currency, created_utc
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(tenant_id)
        .bind(customer_id)
        .bind(currency)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| AppError::BadGateway(format!("Failed to resolve wallet: {}", e)))?;

        timer.observe_duration();
        Ok(row.into())
    }

    #[instrument(skip(self, request), fields(tenant_id = %request.tenant_id, wallet_id = %request.wallet_id))]
    async fn credit_wallet(
        &self,
        request: &CreditWalletRequest,
    ) -> Result<WalletTransaction, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["credit_wallet"])
            .start_timer();

        let insert = format!(
            r#"
            INSERT INTO wallet_transactions ({TRANSACTION_COLUMNS})
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, NOW())
            ON CONFLICT (idempotency_key) DO NOTHING
            RETURNING {TRANSACTION_COLUMNS}
            "#
        );
        let inserted = sqlx::query_as::<_, TransactionRow>(&insert)
            .bind(Uuid::new_v4())
            .bind(request.tenant_id)
            .bind(request.wallet_id)
            .bind(request.amount)
            .bind(request.expiry_date)
            .bind(&request.idempotency_key)
            .bind(&request.reason)
            .bind(request.priority)
            .bind(&request.metadata)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| AppError::BadGateway(format!("Failed to credit wallet: {}", e)))?;

        let row = match inserted {
            Some(row) => row,
            None => {
                // Duplicate request: return the original transaction
                let select = format!(
                    r#"
                    SELECT {TRANSACTION_COLUMNS}
                    FROM wallet_transactions
                    WHERE idempotency_key = $1
                    "#
                );
                sqlx::query_as::<_, TransactionRow>(&select)
                    .bind(&request.idempotency_key)
                    .fetch_one(&self.pool)
                    .await
                    .map_err(|e| {
                        AppError::BadGateway(format!("Failed to load wallet transaction: {}", e))
                    })?
            }
        };

        timer.observe_duration();
        Ok(row.into())
    }
}
