//! Credit grant model.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

/// Owner of a credit grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditGrantScope {
    Plan,
    Subscription,
}

impl CreditGrantScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditGrantScope::Plan => "plan",
            CreditGrantScope::Subscription => "subscription",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "plan" => CreditGrantScope::Plan,
            _ => CreditGrantScope::Subscription,
        }
    }
}

/// Disbursement pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditGrantCadence {
    OneTime,
    Recurring,
}

impl CreditGrantCadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditGrantCadence::OneTime => "one_time",
            CreditGrantCadence::Recurring => "recurring",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "recurring" => CreditGrantCadence::Recurring,
            _ => CreditGrantCadence::OneTime,
        }
    }
}

/// Period unit for recurring grants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreditGrantPeriod {
    Weekly,
    Monthly,
    Quarterly,
    Annual,
}

impl CreditGrantPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditGrantPeriod::Weekly => "weekly",
            CreditGrantPeriod::Monthly => "monthly",
            CreditGrantPeriod::Quarterly => "quarterly",
            CreditGrantPeriod::Annual => "annual",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "weekly" => CreditGrantPeriod::Weekly,
            "quarterly" => CreditGrantPeriod::Quarterly,
            "annual" => CreditGrantPeriod::Annual,
            _ => CreditGrantPeriod::Monthly,
        }
    }
}

/// Policy for when granted credits lapse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationType {
    Never,
    Duration,
    BillingCycle,
}

impl ExpirationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpirationType::Never => "never",
            ExpirationType::Duration => "duration",
            ExpirationType::BillingCycle => "billing_cycle",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "duration" => ExpirationType::Duration,
            "billing_cycle" => ExpirationType::BillingCycle,
            _ => ExpirationType::Never,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationDurationUnit {
    Day,
    Week,
    Month,
    Year,
}

impl ExpirationDurationUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpirationDurationUnit::Day => "day",
            ExpirationDurationUnit::Week => "week",
            ExpirationDurationUnit::Month => "month",
            ExpirationDurationUnit::Year => "year",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "week" => ExpirationDurationUnit::Week,
            "month" => ExpirationDurationUnit::Month,
            "year" => ExpirationDurationUnit::Year,
            _ => ExpirationDurationUnit::Day,
        }
    }
}

/// Soft-delete status shared by persisted records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    Published,
    Archived,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::Published => "published",
            RecordStatus::Archived => "archived",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "archived" => RecordStatus::Archived,
            _ => RecordStatus::Published,
        }
    }
}

/// Credit grant configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditGrant {
    pub grant_id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub scope: CreditGrantScope,
    pub plan_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub credits: Decimal,
    pub cadence: CreditGrantCadence,
    pub period: Option<CreditGrantPeriod>,
    pub period_count: Option<i32>,
    pub priority: Option<i32>,
    pub expiration_type: ExpirationType,
    pub expiration_duration: Option<i32>,
    pub expiration_duration_unit: Option<ExpirationDurationUnit>,
    pub start_date: DateTime<Utc>,
    pub end_date: Option<DateTime<Utc>>,
    pub anchor: Option<DateTime<Utc>>,
    pub status: RecordStatus,
    pub metadata: Option<serde_json::Value>,
    pub created_by: Option<String>,
    pub updated_by: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl CreditGrant {
    pub fn is_published(&self) -> bool {
        self.status == RecordStatus::Published
    }
}

/// Input for creating a credit grant.
#[derive(Debug, Clone, Validate)]
pub struct CreateCreditGrant {
    pub tenant_id: Uuid,
    #[validate(length(min = 1, max = 255))]
    pub name: String,
    pub scope: CreditGrantScope,
    pub plan_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub credits: Decimal,
    pub cadence: CreditGrantCadence,
    pub period: Option<CreditGrantPeriod>,
    #[validate(range(min = 1, max = 1000))]
    pub period_count: Option<i32>,
    pub priority: Option<i32>,
    pub expiration_type: ExpirationType,
    #[validate(range(min = 1, max = 1000))]
    pub expiration_duration: Option<i32>,
    pub expiration_duration_unit: Option<ExpirationDurationUnit>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub anchor: Option<DateTime<Utc>>,
    pub metadata: Option<serde_json::Value>,
    pub created_by: Option<String>,
}

/// Input for updating a credit grant. Only non-scheduling fields are mutable.
#[derive(Debug, Clone, Default, Validate)]
pub struct UpdateCreditGrant {
    #[validate(length(min = 1, max = 255))]
    pub name: Option<String>,
    pub metadata: Option<serde_json::Value>,
    pub updated_by: Option<String>,
}

/// Filter parameters for listing credit grants.
#[derive(Debug, Clone, Default)]
pub struct ListCreditGrantsFilter {
    pub scope: Option<CreditGrantScope>,
    pub plan_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub status: Option<RecordStatus>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}
