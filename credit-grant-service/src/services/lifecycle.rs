//! Application state machine.
//!
//! ```text
//! PENDING | FAILED --applied--------------> APPLIED   (chain)
//! PENDING | FAILED --expired--------------> SKIPPED   (chain)
//! PENDING | FAILED --subscription/grant---> CANCELLED
//! PENDING | FAILED --misconfigured--------> CANCELLED
//! PENDING | FAILED --ledger failure-------> FAILED    (retry_count + 1)
//! PENDING | FAILED --deferred-------------> PENDING   (retry_count + 1)
//! APPLIED | SKIPPED | CANCELLED ----------> no transition
//! ```

use crate::models::{ApplicationStatus, CreditGrantApplication, SubscriptionStatus};
use chrono::{DateTime, Utc};

/// Result of one processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    Expired,
    SubscriptionInactive,
    GrantInactive,
    /// The stored grant can no longer be evaluated (expiry out of range).
    Misconfigured,
    LedgerFailed,
    Deferred,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Applied => "applied",
            Outcome::Expired => "expired",
            Outcome::SubscriptionInactive => "subscription_inactive",
            Outcome::GrantInactive => "grant_inactive",
            Outcome::Misconfigured => "misconfigured",
            Outcome::LedgerFailed => "ledger_failed",
            Outcome::Deferred => "deferred",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub to: ApplicationStatus,
    /// Whether the successor period must be scheduled.
    pub chain_next: bool,
    pub increment_retry: bool,
}

const fn t(to: ApplicationStatus, chain_next: bool, increment_retry: bool) -> Transition {
    Transition {
        to,
        chain_next,
        increment_retry,
    }
}

/// Look up the transition for `outcome` from `from`. Terminal rows have none.
pub fn transition(from: ApplicationStatus, outcome: Outcome) -> Option<Transition> {
    use ApplicationStatus::*;

    if from.is_terminal() {
        return None;
    }

    Some(match outcome {
        Outcome::Applied => t(Applied, true, false),
        Outcome::Expired => t(Skipped, true, false),
        Outcome::SubscriptionInactive | Outcome::GrantInactive | Outcome::Misconfigured => {
            t(Cancelled, false, false)
        }
        Outcome::LedgerFailed => t(Failed, false, true),
        Outcome::Deferred => t(Pending, false, true),
    })
}

impl Transition {
    /// Write the transition onto `app`. A prior failure reason is kept unless
    /// a new one is supplied.
    pub fn apply(
        &self,
        app: &mut CreditGrantApplication,
        now: DateTime<Utc>,
        failure_reason: Option<String>,
    ) {
        app.status = self.to;
        if self.increment_retry {
            app.retry_count += 1;
        }
        if let Some(reason) = failure_reason {
            app.failure_reason = Some(reason);
        }
        if self.to == ApplicationStatus::Applied {
            app.applied_at = Some(now);
        }
        app.updated_utc = now;
    }
}

/// What processing does for a subscription in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionAction {
    Apply,
    Defer,
    Cancel,
}

impl SubscriptionAction {
    pub fn from_status(status: SubscriptionStatus) -> Self {
        match status {
            SubscriptionStatus::Active | SubscriptionStatus::Trial => SubscriptionAction::Apply,
            SubscriptionStatus::Paused => SubscriptionAction::Defer,
            SubscriptionStatus::Cancelled | SubscriptionStatus::Expired => {
                SubscriptionAction::Cancel
            }
        }
    }
}
