//! Persistence and collaborator interfaces consumed by the engine.

use crate::models::{
    CreditGrant, CreditGrantApplication, CreditWalletRequest, ListCreditGrantApplicationsFilter,
    ListCreditGrantsFilter, PlanSnapshot, SubscriptionSnapshot, Wallet, WalletTransaction,
};
use crate::services::clock::Clock;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait CreditGrantStore: Send + Sync {
    async fn create_grant(&self, grant: &CreditGrant) -> Result<CreditGrant, AppError>;

    async fn get_grant(
        &self,
        tenant_id: Uuid,
        grant_id: Uuid,
    ) -> Result<Option<CreditGrant>, AppError>;

    async fn update_grant(&self, grant: &CreditGrant) -> Result<CreditGrant, AppError>;

    /// Keyset-paginated listing ordered by `grant_id`.
    async fn list_grants(
        &self,
        tenant_id: Uuid,
        filter: &ListCreditGrantsFilter,
    ) -> Result<Vec<CreditGrant>, AppError>;
}

#[async_trait]
pub trait CreditGrantApplicationStore: Send + Sync {
    /// Insert a row. Fails with `AppError::Conflict` when the idempotency key exists.
    async fn create_application(
        &self,
        application: &CreditGrantApplication,
    ) -> Result<CreditGrantApplication, AppError>;

    async fn get_application(
        &self,
        tenant_id: Uuid,
        application_id: Uuid,
    ) -> Result<Option<CreditGrantApplication>, AppError>;

    /// Persist a status transition. Fails with `AppError::Conflict` when the
    /// stored row is already terminal.
    async fn update_application(
        &self,
        application: &CreditGrantApplication,
    ) -> Result<CreditGrantApplication, AppError>;

    /// Keyset-paginated listing ordered by `application_id`.
    async fn list_applications(
        &self,
        tenant_id: Uuid,
        filter: &ListCreditGrantApplicationsFilter,
    ) -> Result<Vec<CreditGrantApplication>, AppError>;

    async fn find_by_idempotency_key(
        &self,
        tenant_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<CreditGrantApplication>, AppError>;

    /// All PENDING and FAILED rows matching the given grant and/or subscription.
    async fn find_open_applications(
        &self,
        tenant_id: Uuid,
        credit_grant_id: Option<Uuid>,
        subscription_id: Option<Uuid>,
    ) -> Result<Vec<CreditGrantApplication>, AppError>;

    /// PENDING and FAILED rows across tenants with `scheduled_for <= now`,
    /// oldest first. FAILED rows at or above `max_retries` are excluded.
    async fn find_due_applications(
        &self,
        now: DateTime<Utc>,
        max_retries: Option<i32>,
        limit: i64,
    ) -> Result<Vec<CreditGrantApplication>, AppError>;
}

#[async_trait]
pub trait SubscriptionSource: Send + Sync {
    async fn get_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Option<SubscriptionSnapshot>, AppError>;
}

#[async_trait]
pub trait PlanSource: Send + Sync {
    async fn get_plan(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Option<PlanSnapshot>, AppError>;
}

#[async_trait]
pub trait WalletLedger: Send + Sync {
    /// Find the customer's wallet for `currency`, creating it when absent.
    async fn resolve_wallet(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        currency: &str,
    ) -> Result<Wallet, AppError>;

    /// Credit a wallet. Repeating a request with the same idempotency key
    /// returns the original transaction without crediting again.
    async fn credit_wallet(
        &self,
        request: &CreditWalletRequest,
    ) -> Result<WalletTransaction, AppError>;
}

/// Handles to every collaborator the engine talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub grants: Arc<dyn CreditGrantStore>,
    pub applications: Arc<dyn CreditGrantApplicationStore>,
    pub subscriptions: Arc<dyn SubscriptionSource>,
    pub plans: Arc<dyn PlanSource>,
    pub wallets: Arc<dyn WalletLedger>,
    pub clock: Arc<dyn Clock>,
}

/// Drain every page of a grant listing.
pub async fn list_all_grants(
    store: &dyn CreditGrantStore,
    tenant_id: Uuid,
    mut filter: ListCreditGrantsFilter,
) -> Result<Vec<CreditGrant>, AppError> {
    filter.page_size = 100;
    let mut all = Vec::new();
    loop {
        let page = store.list_grants(tenant_id, &filter).await?;
        let done = page.len() < filter.page_size as usize;
        filter.page_token = page.last().map(|g| g.grant_id);
        all.extend(page);
        if done || filter.page_token.is_none() {
            return Ok(all);
        }
    }
}
