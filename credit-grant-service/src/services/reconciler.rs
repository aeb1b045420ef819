//! Propagates subscription cancellation and grant removal into pending applications.

use crate::models::{
    CreditGrant, CreditGrantApplication, CreditGrantScope, ListCreditGrantsFilter, RecordStatus,
};
use crate::services::lifecycle::{transition, Outcome};
use crate::services::metrics::{record_application_outcome, record_error};
use crate::services::ports::{list_all_grants, Collaborators};
use chrono::{DateTime, Utc};
use service_core::error::AppError;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

#[derive(Clone)]
pub struct Reconciler {
    deps: Collaborators,
}

impl Reconciler {
    pub fn new(deps: Collaborators) -> Self {
        Self { deps }
    }

    /// Cancel every open application of a subscription and archive its
    /// subscription scoped grants. Plan scoped grants are left untouched.
    ///
    /// Keeps going past individual failures and returns the first one.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn cancel_future_subscription_grants(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<(), AppError> {
        let now = self.deps.clock.now();
        let mut first_error: Option<AppError> = None;

        let open = self
            .deps
            .applications
            .find_open_applications(tenant_id, None, Some(subscription_id))
            .await?;

        let mut cancelled = 0usize;
        for application in open {
            let application_id = application.application_id;
            match self
                .cancel_application(
                    application,
                    Outcome::SubscriptionInactive,
                    now,
                    "subscription cancelled",
                )
                .await
            {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(application_id = %application_id, error = %e, "Failed to cancel credit grant application");
                    record_error("cancel_application", "cancel_future_subscription_grants");
                    first_error.get_or_insert(e);
                }
            }
        }

        let grants = list_all_grants(
            self.deps.grants.as_ref(),
            tenant_id,
            ListCreditGrantsFilter {
                scope: Some(CreditGrantScope::Subscription),
                subscription_id: Some(subscription_id),
                status: Some(RecordStatus::Published),
                ..Default::default()
            },
        )
        .await?;

        let mut archived = 0usize;
        for grant in grants {
            let grant_id = grant.grant_id;
            match self.archive_grant(grant, now, None).await {
                Ok(_) => archived += 1,
                Err(e) => {
                    warn!(grant_id = %grant_id, error = %e, "Failed to archive credit grant");
                    record_error("archive_grant", "cancel_future_subscription_grants");
                    first_error.get_or_insert(e);
                }
            }
        }

        info!(
            cancelled_applications = cancelled,
            archived_grants = archived,
            "Subscription credit grants cancelled"
        );

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Cancel every open application of a grant. Returns how many were cancelled.
    #[instrument(skip(self, grant), fields(grant_id = %grant.grant_id))]
    pub async fn cancel_grant_applications(
        &self,
        grant: &CreditGrant,
        reason: &str,
    ) -> Result<usize, AppError> {
        let now = self.deps.clock.now();
        let open = self
            .deps
            .applications
            .find_open_applications(grant.tenant_id, Some(grant.grant_id), None)
            .await?;

        let mut cancelled = 0usize;
        for application in open {
            if self
                .cancel_application(application, Outcome::GrantInactive, now, reason)
                .await?
            {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    /// Move one open application to CANCELLED. Returns `false` when the row
    /// was already terminal, including when another worker resolved it first.
    pub async fn cancel_application(
        &self,
        mut application: CreditGrantApplication,
        outcome: Outcome,
        now: DateTime<Utc>,
        reason: &str,
    ) -> Result<bool, AppError> {
        let Some(t) = transition(application.status, outcome) else {
            return Ok(false);
        };
        t.apply(&mut application, now, Some(reason.to_string()));

        match self.deps.applications.update_application(&application).await {
            Ok(_) => {
                record_application_outcome(outcome.as_str());
                debug!(application_id = %application.application_id, reason, "Credit grant application cancelled");
                Ok(true)
            }
            Err(e) if e.is_conflict() => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub async fn archive_grant(
        &self,
        mut grant: CreditGrant,
        now: DateTime<Utc>,
        updated_by: Option<String>,
    ) -> Result<CreditGrant, AppError> {
        grant.status = RecordStatus::Archived;
        grant.updated_utc = now;
        if updated_by.is_some() {
            grant.updated_by = updated_by;
        }
        let grant = self.deps.grants.update_grant(&grant).await?;
        info!(grant_id = %grant.grant_id, "Credit grant archived");
        Ok(grant)
    }
}
