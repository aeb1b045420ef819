//! Credit grant application model.

use super::SubscriptionStatus;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Application status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationStatus {
    Pending,
    Applied,
    Failed,
    Skipped,
    Cancelled,
}

impl ApplicationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationStatus::Pending => "pending",
            ApplicationStatus::Applied => "applied",
            ApplicationStatus::Failed => "failed",
            ApplicationStatus::Skipped => "skipped",
            ApplicationStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "applied" => ApplicationStatus::Applied,
            "failed" => ApplicationStatus::Failed,
            "skipped" => ApplicationStatus::Skipped,
            "cancelled" => ApplicationStatus::Cancelled,
            _ => ApplicationStatus::Pending,
        }
    }

    /// Terminal rows are never revisited by the processor.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ApplicationStatus::Applied | ApplicationStatus::Skipped | ApplicationStatus::Cancelled
        )
    }
}

/// Why an application row exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationReason {
    OneTime,
    FirstTimeRecurring,
    Recurring,
}

impl ApplicationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplicationReason::OneTime => "one_time",
            ApplicationReason::FirstTimeRecurring => "first_time_recurring",
            ApplicationReason::Recurring => "recurring",
        }
    }

    pub fn from_string(s: &str) -> Self {
        match s {
            "first_time_recurring" => ApplicationReason::FirstTimeRecurring,
            "recurring" => ApplicationReason::Recurring,
            _ => ApplicationReason::OneTime,
        }
    }

    /// Whether resolving a row with this reason schedules a successor.
    pub fn is_recurring(&self) -> bool {
        matches!(
            self,
            ApplicationReason::FirstTimeRecurring | ApplicationReason::Recurring
        )
    }
}

/// One scheduled disbursement of a credit grant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreditGrantApplication {
    pub application_id: Uuid,
    pub tenant_id: Uuid,
    pub credit_grant_id: Uuid,
    pub subscription_id: Uuid,
    pub scheduled_for: DateTime<Utc>,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub status: ApplicationStatus,
    pub reason: ApplicationReason,
    pub subscription_status_at_application: Option<SubscriptionStatus>,
    pub retry_count: i32,
    pub failure_reason: Option<String>,
    pub applied_at: Option<DateTime<Utc>>,
    /// Snapshot of the grant's credits when the row was created.
    pub credits: Decimal,
    pub idempotency_key: String,
    pub metadata: Option<serde_json::Value>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl CreditGrantApplication {
    /// Date the expiry policy is measured from.
    pub fn effective_date(&self) -> DateTime<Utc> {
        self.period_start.unwrap_or(self.scheduled_for)
    }
}

/// Filter parameters for listing applications.
#[derive(Debug, Clone, Default)]
pub struct ListCreditGrantApplicationsFilter {
    pub credit_grant_id: Option<Uuid>,
    pub subscription_id: Option<Uuid>,
    pub statuses: Vec<ApplicationStatus>,
    pub page_size: i32,
    pub page_token: Option<Uuid>,
}

/// Aggregate result of a batch sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessingSummary {
    pub total: usize,
    /// Rows processed without error and not deferred. Includes rows another
    /// worker resolved first.
    pub succeeded: usize,
    pub failed: usize,
    /// Rows pushed back because their subscription is paused.
    pub deferred: usize,
}
