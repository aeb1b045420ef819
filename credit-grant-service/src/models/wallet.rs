//! Wallet ledger models.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Transaction reason recorded for credits disbursed by a grant.
pub const SUBSCRIPTION_CREDIT_GRANT_REASON: &str = "subscription_credit_grant";

/// Customer wallet for a single currency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Wallet {
    pub wallet_id: Uuid,
    pub tenant_id: Uuid,
    pub customer_id: Uuid,
    pub currency: String,
    pub created_utc: DateTime<Utc>,
}

/// Credit request sent to the wallet ledger.
#[derive(Debug, Clone)]
pub struct CreditWalletRequest {
    pub tenant_id: Uuid,
    pub wallet_id: Uuid,
    pub amount: Decimal,
    pub expiry_date: Option<DateTime<Utc>>,
    pub idempotency_key: String,
    pub reason: String,
    pub priority: Option<i32>,
    pub metadata: serde_json::Value,
}

/// Credit transaction recorded by the wallet ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletTransaction {
    pub transaction_id: Uuid,
    pub tenant_id: Uuid,
    pub wallet_id: Uuid,
    pub amount: Decimal,
    pub expiry_date: Option<DateTime<Utc>>,
    pub idempotency_key: String,
    pub reason: String,
    pub priority: Option<i32>,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
}
