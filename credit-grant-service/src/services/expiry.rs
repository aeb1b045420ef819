//! Expiry date calculation for disbursed credits.

use crate::models::{CreditGrant, ExpirationDurationUnit, ExpirationType};
use chrono::{DateTime, Days, Months, Utc};
use service_core::error::AppError;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpiryError {
    #[error("expiration_duration and expiration_duration_unit are required for duration expiry")]
    MissingDuration,

    #[error("expiration_duration must be at least 1, got {0}")]
    InvalidDuration(i32),

    #[error("expiration duration fields are only allowed for duration expiry")]
    UnexpectedDuration,

    #[error("expiry arithmetic out of range")]
    OutOfRange,
}

impl From<ExpiryError> for AppError {
    fn from(err: ExpiryError) -> Self {
        match err {
            ExpiryError::OutOfRange => AppError::InternalError(anyhow::Error::new(err)),
            _ => AppError::BadRequest(anyhow::Error::new(err)),
        }
    }
}

/// Validated expiration policy of a grant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryPolicy {
    Never,
    Duration {
        amount: u32,
        unit: ExpirationDurationUnit,
    },
    BillingCycle,
}

impl ExpiryPolicy {
    pub fn new(
        expiration_type: ExpirationType,
        duration: Option<i32>,
        unit: Option<ExpirationDurationUnit>,
    ) -> Result<Self, ExpiryError> {
        match expiration_type {
            ExpirationType::Duration => match (duration, unit) {
                (Some(amount), Some(unit)) if amount >= 1 => Ok(ExpiryPolicy::Duration {
                    amount: amount as u32,
                    unit,
                }),
                (Some(amount), Some(_)) => Err(ExpiryError::InvalidDuration(amount)),
                _ => Err(ExpiryError::MissingDuration),
            },
            ExpirationType::Never | ExpirationType::BillingCycle => {
                if duration.is_some() || unit.is_some() {
                    return Err(ExpiryError::UnexpectedDuration);
                }
                Ok(if expiration_type == ExpirationType::Never {
                    ExpiryPolicy::Never
                } else {
                    ExpiryPolicy::BillingCycle
                })
            }
        }
    }

    pub fn from_grant(grant: &CreditGrant) -> Result<Self, ExpiryError> {
        Self::new(
            grant.expiration_type,
            grant.expiration_duration,
            grant.expiration_duration_unit,
        )
    }

    /// Expiry for an application effective at `effective`.
    ///
    /// `current_period_end` must be read from the subscription at processing
    /// time so billing-cycle expiry follows renewals.
    pub fn expiry_for(
        &self,
        effective: DateTime<Utc>,
        current_period_end: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, ExpiryError> {
        match *self {
            ExpiryPolicy::Never => Ok(None),
            ExpiryPolicy::BillingCycle => Ok(Some(current_period_end)),
            ExpiryPolicy::Duration { amount, unit } => {
                let expiry = match unit {
                    ExpirationDurationUnit::Day => {
                        effective.checked_add_days(Days::new(u64::from(amount)))
                    }
                    ExpirationDurationUnit::Week => {
                        effective.checked_add_days(Days::new(7 * u64::from(amount)))
                    }
                    ExpirationDurationUnit::Month => {
                        effective.checked_add_months(Months::new(amount))
                    }
                    ExpirationDurationUnit::Year => amount
                        .checked_mul(12)
                        .and_then(|months| effective.checked_add_months(Months::new(months))),
                };
                expiry.map(Some).ok_or(ExpiryError::OutOfRange)
            }
        }
    }
}

/// Credits whose expiry is at or before `now` must not be disbursed.
pub fn is_expired(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expiry.is_some_and(|e| e <= now)
}
