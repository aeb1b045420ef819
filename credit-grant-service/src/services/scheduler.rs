//! Turns credit grant configuration into application rows.

use crate::models::{
    ApplicationReason, ApplicationStatus, CreateCreditGrant, CreditGrant, CreditGrantApplication,
    CreditGrantCadence, CreditGrantScope, SubscriptionSnapshot,
};
use crate::services::expiry::ExpiryPolicy;
use crate::services::period::{PeriodError, PeriodWindow, Recurrence};
use crate::services::ports::Collaborators;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::utils::generate_key;
use tracing::{debug, info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Idempotency key of the row covering one period of a grant for a subscription.
pub fn application_key(
    grant_id: Uuid,
    subscription_id: Uuid,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
) -> String {
    let fmt = |d: Option<DateTime<Utc>>| d.map_or_else(|| "none".to_string(), |d| d.to_rfc3339());
    generate_key(
        "credit_grant",
        &[
            ("grant_id", grant_id.to_string()),
            ("subscription_id", subscription_id.to_string()),
            ("period_start", fmt(period_start)),
            ("period_end", fmt(period_end)),
        ],
    )
}

/// Earliest instant the grant may disburse for this subscription.
pub fn schedule_start(grant: &CreditGrant, subscription: &SubscriptionSnapshot) -> DateTime<Utc> {
    grant.start_date.max(subscription.start_date)
}

pub fn schedule_anchor(grant: &CreditGrant, subscription: &SubscriptionSnapshot) -> DateTime<Utc> {
    grant
        .anchor
        .unwrap_or_else(|| schedule_start(grant, subscription))
}

/// The earlier of the grant and subscription end dates.
pub fn schedule_limit(
    grant: &CreditGrant,
    subscription: &SubscriptionSnapshot,
) -> Option<DateTime<Utc>> {
    match (grant.end_date, subscription.end_date) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn recurrence(grant: &CreditGrant) -> Result<Recurrence, PeriodError> {
    let period = grant.period.ok_or(PeriodError::MissingPeriod)?;
    Recurrence::new(period, grant.period_count.unwrap_or(1))
}

fn bad_request(msg: &str) -> AppError {
    AppError::BadRequest(anyhow::anyhow!(msg.to_string()))
}

#[derive(Clone)]
pub struct Scheduler {
    deps: Collaborators,
}

impl Scheduler {
    pub fn new(deps: Collaborators) -> Self {
        Self { deps }
    }

    /// Check a grant configuration on its own, without touching collaborators.
    /// Returns the validated start date.
    pub fn validate_config(input: &CreateCreditGrant) -> Result<DateTime<Utc>, AppError> {
        input.validate()?;

        if input.credits <= Decimal::ZERO {
            return Err(bad_request("credits must be greater than zero"));
        }

        let start = input
            .start_date
            .ok_or_else(|| bad_request("start_date is required"))?;

        if input.anchor.is_some_and(|anchor| anchor < start) {
            return Err(bad_request("anchor must not be before start_date"));
        }
        if input.end_date.is_some_and(|end| end <= start) {
            return Err(bad_request("end_date must be after start_date"));
        }

        match input.scope {
            CreditGrantScope::Plan => {
                if input.plan_id.is_none() {
                    return Err(bad_request("plan_id is required for plan scoped grants"));
                }
                if input.subscription_id.is_some() {
                    return Err(bad_request(
                        "subscription_id is not allowed for plan scoped grants",
                    ));
                }
            }
            CreditGrantScope::Subscription => {
                if input.subscription_id.is_none() {
                    return Err(bad_request(
                        "subscription_id is required for subscription scoped grants",
                    ));
                }
                if input.plan_id.is_some() {
                    return Err(bad_request(
                        "plan_id is not allowed for subscription scoped grants",
                    ));
                }
            }
        }

        match input.cadence {
            CreditGrantCadence::Recurring => {
                let period = input
                    .period
                    .ok_or_else(|| bad_request("period is required for recurring grants"))?;
                Recurrence::new(period, input.period_count.unwrap_or(1))?;
            }
            CreditGrantCadence::OneTime => {
                if input.period.is_some() || input.period_count.is_some() {
                    return Err(bad_request(
                        "period and period_count are only allowed for recurring grants",
                    ));
                }
            }
        }

        ExpiryPolicy::new(
            input.expiration_type,
            input.expiration_duration,
            input.expiration_duration_unit,
        )?;

        Ok(start)
    }

    /// Check that the grant's owner exists and can take the grant. Returns the
    /// subscription for subscription scoped grants.
    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id))]
    pub async fn validate_references(
        &self,
        input: &CreateCreditGrant,
        start: DateTime<Utc>,
    ) -> Result<Option<SubscriptionSnapshot>, AppError> {
        match input.scope {
            CreditGrantScope::Plan => {
                let plan_id = input
                    .plan_id
                    .ok_or_else(|| bad_request("plan_id is required for plan scoped grants"))?;
                let plan = self
                    .deps
                    .plans
                    .get_plan(input.tenant_id, plan_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(anyhow::anyhow!("Plan {} not found", plan_id))
                    })?;
                if !plan.is_available() {
                    return Err(AppError::BadRequest(anyhow::anyhow!(
                        "Plan {} is not active",
                        plan_id
                    )));
                }
                Ok(None)
            }
            CreditGrantScope::Subscription => {
                let subscription_id = input.subscription_id.ok_or_else(|| {
                    bad_request("subscription_id is required for subscription scoped grants")
                })?;
                let subscription = self
                    .deps
                    .subscriptions
                    .get_subscription(input.tenant_id, subscription_id)
                    .await?
                    .ok_or_else(|| {
                        AppError::NotFound(anyhow::anyhow!(
                            "Subscription {} not found",
                            subscription_id
                        ))
                    })?;

                if subscription.status.is_ended() {
                    return Err(AppError::BadRequest(anyhow::anyhow!(
                        "Subscription {} is {}",
                        subscription_id,
                        subscription.status.as_str()
                    )));
                }
                if start < subscription.start_date {
                    return Err(bad_request(
                        "start_date must not be before the subscription start date",
                    ));
                }
                if let Some(sub_end) = subscription.end_date {
                    if input.end_date.is_some_and(|end| end > sub_end) {
                        return Err(bad_request(
                            "end_date must not be after the subscription end date",
                        ));
                    }
                    if input.anchor.is_some_and(|anchor| anchor > sub_end) {
                        return Err(bad_request(
                            "anchor must not be after the subscription end date",
                        ));
                    }
                }
                if input
                    .anchor
                    .is_some_and(|anchor| anchor < subscription.start_date)
                {
                    return Err(bad_request(
                        "anchor must not be before the subscription start date",
                    ));
                }

                Ok(Some(subscription))
            }
        }
    }

    /// Create the first application of `grant` for `subscription`.
    ///
    /// ONE_TIME grants get a single row due at the later of start and now.
    /// RECURRING grants get the period covering the later of start and now;
    /// later periods are chained as each row resolves. Returns the existing row
    /// when the grant was already scheduled for this subscription.
    #[instrument(skip(self, grant, subscription), fields(grant_id = %grant.grant_id, subscription_id = %subscription.subscription_id))]
    pub async fn schedule(
        &self,
        grant: &CreditGrant,
        subscription: &SubscriptionSnapshot,
    ) -> Result<Option<CreditGrantApplication>, AppError> {
        let now = self.deps.clock.now();
        let start = schedule_start(grant, subscription);
        let limit = schedule_limit(grant, subscription);

        if limit.is_some_and(|l| start >= l) {
            debug!("Grant starts at or after its end; nothing to schedule");
            return Ok(None);
        }

        let row = match grant.cadence {
            CreditGrantCadence::OneTime => self.new_row(
                grant,
                subscription,
                start.max(now),
                Some(start),
                None,
                ApplicationReason::OneTime,
            ),
            CreditGrantCadence::Recurring => {
                let anchor = schedule_anchor(grant, subscription);
                let Some(window) = recurrence(grant)?.window_covering(now, start, anchor, limit)?
                else {
                    debug!("No period left before the end date; nothing to schedule");
                    return Ok(None);
                };
                self.window_row(grant, subscription, window, ApplicationReason::FirstTimeRecurring)
            }
        };

        let row = self.insert_once(row).await?;
        info!(
            application_id = %row.application_id,
            scheduled_for = %row.scheduled_for,
            reason = row.reason.as_str(),
            "Credit grant application scheduled"
        );
        Ok(Some(row))
    }

    /// Period that follows `current`, if the grant keeps recurring past it.
    ///
    /// Returns `None` when the row is not recurring or the grant or
    /// subscription ends at or before the current period end.
    pub fn successor_window(
        grant: &CreditGrant,
        subscription: &SubscriptionSnapshot,
        current: &CreditGrantApplication,
    ) -> Result<Option<PeriodWindow>, PeriodError> {
        if !current.reason.is_recurring() || grant.cadence != CreditGrantCadence::Recurring {
            return Ok(None);
        }
        let Some(current_end) = current.period_end else {
            return Ok(None);
        };

        let limit = schedule_limit(grant, subscription);
        if limit.is_some_and(|l| current_end >= l) {
            debug!("Reached the grant or subscription end; chain stops");
            return Ok(None);
        }

        let anchor = schedule_anchor(grant, subscription);
        recurrence(grant)?.window_from(current_end, anchor, limit)
    }

    /// Insert the PENDING row for `window`. Repeated calls return the same row.
    #[instrument(skip_all, fields(grant_id = %grant.grant_id, period_start = %window.start))]
    pub async fn insert_successor(
        &self,
        grant: &CreditGrant,
        subscription: &SubscriptionSnapshot,
        window: PeriodWindow,
    ) -> Result<CreditGrantApplication, AppError> {
        let row = self
            .insert_once(self.window_row(grant, subscription, window, ApplicationReason::Recurring))
            .await?;
        debug!(
            next_application_id = %row.application_id,
            period_end = %window.end,
            "Next credit grant application chained"
        );
        Ok(row)
    }

    fn window_row(
        &self,
        grant: &CreditGrant,
        subscription: &SubscriptionSnapshot,
        window: PeriodWindow,
        reason: ApplicationReason,
    ) -> CreditGrantApplication {
        self.new_row(
            grant,
            subscription,
            window.start,
            Some(window.start),
            Some(window.end),
            reason,
        )
    }

    fn new_row(
        &self,
        grant: &CreditGrant,
        subscription: &SubscriptionSnapshot,
        scheduled_for: DateTime<Utc>,
        period_start: Option<DateTime<Utc>>,
        period_end: Option<DateTime<Utc>>,
        reason: ApplicationReason,
    ) -> CreditGrantApplication {
        let now = self.deps.clock.now();
        CreditGrantApplication {
            application_id: Uuid::new_v4(),
            tenant_id: grant.tenant_id,
            credit_grant_id: grant.grant_id,
            subscription_id: subscription.subscription_id,
            scheduled_for,
            period_start,
            period_end,
            status: ApplicationStatus::Pending,
            reason,
            subscription_status_at_application: None,
            retry_count: 0,
            failure_reason: None,
            applied_at: None,
            credits: grant.credits,
            idempotency_key: application_key(
                grant.grant_id,
                subscription.subscription_id,
                period_start,
                period_end,
            ),
            metadata: grant.metadata.clone(),
            created_utc: now,
            updated_utc: now,
        }
    }

    /// Insert `row`, or return the row already holding its idempotency key.
    async fn insert_once(
        &self,
        row: CreditGrantApplication,
    ) -> Result<CreditGrantApplication, AppError> {
        match self.deps.applications.create_application(&row).await {
            Ok(created) => Ok(created),
            Err(e) if e.is_conflict() => self
                .deps
                .applications
                .find_by_idempotency_key(row.tenant_id, &row.idempotency_key)
                .await?
                .ok_or(e),
            Err(e) => Err(e),
        }
    }
}
