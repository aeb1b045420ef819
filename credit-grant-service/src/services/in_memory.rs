//! In-memory adapters for the engine ports.
//!
//! Each adapter wraps `Arc<RwLock<HashMap<..>>>` so clones share state; used by
//! tests and for running the engine without PostgreSQL.

use crate::models::{
    CreditGrant, CreditGrantApplication, CreditWalletRequest, ListCreditGrantApplicationsFilter,
    ListCreditGrantsFilter, PlanSnapshot, SubscriptionSnapshot, SubscriptionStatus, Wallet,
    WalletTransaction,
};
use crate::services::clock::{Clock, SystemClock};
use crate::services::ports::{
    CreditGrantApplicationStore, CreditGrantStore, PlanSource, SubscriptionSource, WalletLedger,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

fn page_size(requested: i32) -> usize {
    requested.clamp(1, 100) as usize
}

#[derive(Default, Clone)]
pub struct InMemoryCreditGrantStore {
    grants: Arc<RwLock<HashMap<Uuid, CreditGrant>>>,
}

impl InMemoryCreditGrantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CreditGrantStore for InMemoryCreditGrantStore {
    async fn create_grant(&self, grant: &CreditGrant) -> Result<CreditGrant, AppError> {
        let mut grants = self.grants.write().await;
        if grants.contains_key(&grant.grant_id) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Credit grant {} already exists",
                grant.grant_id
            )));
        }
        grants.insert(grant.grant_id, grant.clone());
        Ok(grant.clone())
    }

    async fn get_grant(
        &self,
        tenant_id: Uuid,
        grant_id: Uuid,
    ) -> Result<Option<CreditGrant>, AppError> {
        let grants = self.grants.read().await;
        Ok(grants
            .get(&grant_id)
            .filter(|g| g.tenant_id == tenant_id)
            .cloned())
    }

    async fn update_grant(&self, grant: &CreditGrant) -> Result<CreditGrant, AppError> {
        let mut grants = self.grants.write().await;
        match grants.get_mut(&grant.grant_id) {
            Some(existing) if existing.tenant_id == grant.tenant_id => {
                *existing = grant.clone();
                Ok(grant.clone())
            }
            _ => Err(AppError::NotFound(anyhow::anyhow!(
                "Credit grant {} not found",
                grant.grant_id
            ))),
        }
    }

    async fn list_grants(
        &self,
        tenant_id: Uuid,
        filter: &ListCreditGrantsFilter,
    ) -> Result<Vec<CreditGrant>, AppError> {
        let grants = self.grants.read().await;
        let mut matching: Vec<CreditGrant> = grants
            .values()
            .filter(|g| g.tenant_id == tenant_id)
            .filter(|g| filter.scope.map_or(true, |s| g.scope == s))
            .filter(|g| filter.plan_id.map_or(true, |p| g.plan_id == Some(p)))
            .filter(|g| {
                filter
                    .subscription_id
                    .map_or(true, |s| g.subscription_id == Some(s))
            })
            .filter(|g| filter.status.map_or(true, |s| g.status == s))
            .filter(|g| filter.page_token.map_or(true, |t| g.grant_id > t))
            .cloned()
            .collect();
        matching.sort_by_key(|g| g.grant_id);
        matching.truncate(page_size(filter.page_size));
        Ok(matching)
    }
}

#[derive(Default)]
struct ApplicationTable {
    rows: HashMap<Uuid, CreditGrantApplication>,
    keys: HashMap<String, Uuid>,
}

#[derive(Default, Clone)]
pub struct InMemoryApplicationStore {
    table: Arc<RwLock<ApplicationTable>>,
}

impl InMemoryApplicationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every stored row, ordered by `scheduled_for`.
    pub async fn all(&self) -> Vec<CreditGrantApplication> {
        let table = self.table.read().await;
        let mut rows: Vec<_> = table.rows.values().cloned().collect();
        rows.sort_by_key(|r| (r.scheduled_for, r.created_utc));
        rows
    }

    /// Overwrite a row regardless of its status. Lets tests stage rows
    /// (for example a backdated period) that normal processing never produces.
    pub async fn put(&self, application: CreditGrantApplication) {
        let mut table = self.table.write().await;
        table
            .keys
            .insert(application.idempotency_key.clone(), application.application_id);
        table.rows.insert(application.application_id, application);
    }
}

#[async_trait]
impl CreditGrantApplicationStore for InMemoryApplicationStore {
    async fn create_application(
        &self,
        application: &CreditGrantApplication,
    ) -> Result<CreditGrantApplication, AppError> {
        let mut table = self.table.write().await;
        if table.keys.contains_key(&application.idempotency_key) {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Credit grant application with idempotency key {} already exists",
                application.idempotency_key
            )));
        }
        table
            .keys
            .insert(application.idempotency_key.clone(), application.application_id);
        table
            .rows
            .insert(application.application_id, application.clone());
        Ok(application.clone())
    }

    async fn get_application(
        &self,
        tenant_id: Uuid,
        application_id: Uuid,
    ) -> Result<Option<CreditGrantApplication>, AppError> {
        let table = self.table.read().await;
        Ok(table
            .rows
            .get(&application_id)
            .filter(|a| a.tenant_id == tenant_id)
            .cloned())
    }

    async fn update_application(
        &self,
        application: &CreditGrantApplication,
    ) -> Result<CreditGrantApplication, AppError> {
        let mut table = self.table.write().await;
        let existing = table
            .rows
            .get_mut(&application.application_id)
            .filter(|a| a.tenant_id == application.tenant_id)
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Credit grant application {} not found",
                    application.application_id
                ))
            })?;

        if existing.status.is_terminal() {
            return Err(AppError::Conflict(anyhow::anyhow!(
                "Credit grant application {} is already {}",
                application.application_id,
                existing.status.as_str()
            )));
        }

        *existing = application.clone();
        Ok(application.clone())
    }

    async fn list_applications(
        &self,
        tenant_id: Uuid,
        filter: &ListCreditGrantApplicationsFilter,
    ) -> Result<Vec<CreditGrantApplication>, AppError> {
        let table = self.table.read().await;
        let mut matching: Vec<CreditGrantApplication> = table
            .rows
            .values()
            .filter(|a| a.tenant_id == tenant_id)
            .filter(|a| filter.credit_grant_id.map_or(true, |g| a.credit_grant_id == g))
            .filter(|a| filter.subscription_id.map_or(true, |s| a.subscription_id == s))
            .filter(|a| filter.statuses.is_empty() || filter.statuses.contains(&a.status))
            .filter(|a| filter.page_token.map_or(true, |t| a.application_id > t))
            .cloned()
            .collect();
        matching.sort_by_key(|a| a.application_id);
        matching.truncate(page_size(filter.page_size));
        Ok(matching)
    }

    async fn find_by_idempotency_key(
        &self,
        tenant_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<CreditGrantApplication>, AppError> {
        let table = self.table.read().await;
        Ok(table
            .keys
            .get(idempotency_key)
            .and_then(|id| table.rows.get(id))
            .filter(|a| a.tenant_id == tenant_id)
            .cloned())
    }

    async fn find_open_applications(
        &self,
        tenant_id: Uuid,
        credit_grant_id: Option<Uuid>,
        subscription_id: Option<Uuid>,
    ) -> Result<Vec<CreditGrantApplication>, AppError> {
        let table = self.table.read().await;
        let mut open: Vec<CreditGrantApplication> = table
            .rows
            .values()
            .filter(|a| a.tenant_id == tenant_id && !a.status.is_terminal())
            .filter(|a| credit_grant_id.map_or(true, |g| a.credit_grant_id == g))
            .filter(|a| subscription_id.map_or(true, |s| a.subscription_id == s))
            .cloned()
            .collect();
        open.sort_by_key(|a| (a.scheduled_for, a.application_id));
        Ok(open)
    }

    async fn find_due_applications(
        &self,
        now: DateTime<Utc>,
        max_retries: Option<i32>,
        limit: i64,
    ) -> Result<Vec<CreditGrantApplication>, AppError> {
        use crate::models::ApplicationStatus;

        let table = self.table.read().await;
        let mut due: Vec<CreditGrantApplication> = table
            .rows
            .values()
            .filter(|a| !a.status.is_terminal() && a.scheduled_for <= now)
            .filter(|a| match (a.status, max_retries) {
                (ApplicationStatus::Failed, Some(max)) => a.retry_count < max,
                _ => true,
            })
            .cloned()
            .collect();
        due.sort_by_key(|a| (a.scheduled_for, a.application_id));
        due.truncate(limit.max(0) as usize);
        Ok(due)
    }
}

#[derive(Default, Clone)]
pub struct InMemorySubscriptionSource {
    subscriptions: Arc<RwLock<HashMap<Uuid, SubscriptionSnapshot>>>,
}

impl InMemorySubscriptionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, subscription: SubscriptionSnapshot) {
        self.subscriptions
            .write()
            .await
            .insert(subscription.subscription_id, subscription);
    }

    pub async fn set_status(&self, subscription_id: Uuid, status: SubscriptionStatus) {
        if let Some(sub) = self.subscriptions.write().await.get_mut(&subscription_id) {
            sub.status = status;
        }
    }

    /// Move the subscription into a new billing period.
    pub async fn renew(
        &self,
        subscription_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) {
        if let Some(sub) = self.subscriptions.write().await.get_mut(&subscription_id) {
            sub.current_period_start = period_start;
            sub.current_period_end = period_end;
        }
    }
}

#[async_trait]
impl SubscriptionSource for InMemorySubscriptionSource {
    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<SubscriptionSnapshot>, AppError> {
        let subscriptions = self.subscriptions.read().await;
        Ok(subscriptions
            .get(&subscription_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }
}

#[derive(Default, Clone)]
pub struct InMemoryPlanSource {
    plans: Arc<RwLock<HashMap<Uuid, PlanSnapshot>>>,
}

impl InMemoryPlanSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, plan: PlanSnapshot) {
        self.plans.write().await.insert(plan.plan_id, plan);
    }
}

#[async_trait]
impl PlanSource for InMemoryPlanSource {
    async fn get_plan(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Option<PlanSnapshot>, AppError> {
        let plans = self.plans.read().await;
        Ok(plans
            .get(&plan_id)
            .filter(|p| p.tenant_id == tenant_id)
            .cloned())
    }
}

#[derive(Default)]
struct LedgerState {
    wallets: HashMap<(Uuid, Uuid, String), Wallet>,
    transactions: Vec<WalletTransaction>,
}

/// Wallet ledger that records credits in memory. Can be switched into a
/// failing mode to exercise retry paths.
#[derive(Clone)]
pub struct InMemoryWalletLedger {
    state: Arc<RwLock<LedgerState>>,
    failing: Arc<AtomicBool>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryWalletLedger {
    fn default() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }
}

impl InMemoryWalletLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ledger stamping wallets and transactions with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::default(),
            failing: Arc::default(),
            clock,
        }
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn transactions(&self) -> Vec<WalletTransaction> {
        self.state.read().await.transactions.clone()
    }
}

#[async_trait]
impl WalletLedger for InMemoryWalletLedger {
    async fn resolve_wallet(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        currency: &str,
    ) -> Result<Wallet, AppError> {
        let mut state = self.state.write().await;
        let wallet = state
            .wallets
            .entry((tenant_id, customer_id, currency.to_string()))
            .or_insert_with(|| Wallet {
                wallet_id: Uuid::new_v4(),
                tenant_id,
                customer_id,
                currency: currency.to_string(),
                created_utc: self.clock.now(),
            });
        Ok(wallet.clone())
    }

    async fn credit_wallet(
        &self,
        request: &CreditWalletRequest,
    ) -> Result<WalletTransaction, AppError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::BadGateway(
                "wallet ledger unavailable".to_string(),
            ));
        }

        let mut state = self.state.write().await;
        if let Some(existing) = state
            .transactions
            .iter()
            .find(|t| t.idempotency_key == request.idempotency_key)
        {
            return Ok(existing.clone());
        }

        let transaction = WalletTransaction {
            transaction_id: Uuid::new_v4(),
            tenant_id: request.tenant_id,
            wallet_id: request.wallet_id,
            amount: request.amount,
            expiry_date: request.expiry_date,
            idempotency_key: request.idempotency_key.clone(),
            reason: request.reason.clone(),
            priority: request.priority,
            metadata: Some(request.metadata.clone()),
            created_utc: self.clock.now(),
        };
        state.transactions.push(transaction.clone());
        Ok(transaction)
    }
}
