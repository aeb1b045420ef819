//! Executes due credit grant applications.

use crate::config::{ProcessorConfig, MAX_DEFER_EXPONENT};
use crate::models::{
    CreditGrant, CreditGrantApplication, CreditWalletRequest, ProcessingSummary,
    SubscriptionSnapshot, WalletTransaction, SUBSCRIPTION_CREDIT_GRANT_REASON,
};
use crate::services::expiry::{is_expired, ExpiryPolicy};
use crate::services::lifecycle::{transition, Outcome, SubscriptionAction};
use crate::services::metrics::{
    record_application_outcome, record_credits_granted, record_error, record_sweep,
};
use crate::services::ports::Collaborators;
use crate::services::reconciler::Reconciler;
use crate::services::scheduler::Scheduler;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use rust_decimal::prelude::ToPrimitive;
use serde_json::json;
use service_core::error::AppError;
use service_core::utils::generate_key;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Idempotency key sent to the wallet ledger for one application.
pub fn ledger_key(grant_id: Uuid, application_id: Uuid) -> String {
    generate_key(
        "credit_grant_application",
        &[
            ("grant_id", grant_id.to_string()),
            ("application_id", application_id.to_string()),
        ],
    )
}

#[derive(Clone)]
pub struct Processor {
    deps: Collaborators,
    scheduler: Scheduler,
    reconciler: Reconciler,
    config: ProcessorConfig,
}

impl Processor {
    pub fn new(
        deps: Collaborators,
        scheduler: Scheduler,
        reconciler: Reconciler,
        config: ProcessorConfig,
    ) -> Self {
        Self {
            deps,
            scheduler,
            reconciler,
            config,
        }
    }

    /// Process every due PENDING/FAILED row. Failures are counted, not returned.
    #[instrument(skip(self))]
    pub async fn process_scheduled_applications(&self) -> Result<ProcessingSummary, AppError> {
        let started = Instant::now();
        let now = self.deps.clock.now();

        let due = self
            .deps
            .applications
            .find_due_applications(now, self.config.max_retries, self.config.sweep_batch_size)
            .await
            .map_err(|e| {
                record_sweep("error", started.elapsed().as_secs_f64());
                e
            })?;

        let total = due.len();
        if total == 0 {
            debug!("No credit grant applications due");
        } else {
            info!(total, "Processing scheduled credit grant applications");
        }

        let results: Vec<Result<Option<Outcome>, AppError>> = stream::iter(due)
            .map(|application| self.attempt(application))
            .buffer_unordered(self.config.sweep_concurrency.max(1))
            .collect()
            .await;

        let mut failed = 0usize;
        for err in results.iter().filter_map(|r| r.as_ref().err()) {
            failed += 1;
            if !matches!(err, AppError::BadGateway(_)) {
                error!(error = %err, "Credit grant application processing failed");
            }
        }
        let deferred = results
            .iter()
            .filter(|r| matches!(r, Ok(Some(Outcome::Deferred))))
            .count();
        let summary = ProcessingSummary {
            total,
            succeeded: total - failed - deferred,
            failed,
            deferred,
        };

        record_sweep("ok", started.elapsed().as_secs_f64());
        info!(
            total = summary.total,
            succeeded = summary.succeeded,
            failed = summary.failed,
            deferred = summary.deferred,
            "Credit grant sweep complete"
        );
        Ok(summary)
    }

    /// Process a single application by id.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, application_id = %application_id))]
    pub async fn process_application(
        &self,
        tenant_id: Uuid,
        application_id: Uuid,
    ) -> Result<(), AppError> {
        let application = self
            .deps
            .applications
            .get_application(tenant_id, application_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Credit grant application {} not found",
                    application_id
                ))
            })?;
        self.process(application).await
    }

    /// Drive one application through the state machine.
    ///
    /// Returns `Ok` for every business outcome (applied, skipped, cancelled,
    /// deferred) and for rows that are already terminal. Returns the ledger
    /// error after the row has been marked FAILED.
    pub async fn process(&self, application: CreditGrantApplication) -> Result<(), AppError> {
        self.attempt(application).await.map(|_| ())
    }

    /// Like [`Processor::process`], reporting the outcome that was persisted.
    /// `None` means the row was, or concurrently became, terminal.
    #[instrument(
        skip(self, application),
        fields(
            application_id = %application.application_id,
            grant_id = %application.credit_grant_id,
            subscription_id = %application.subscription_id
        )
    )]
    async fn attempt(
        &self,
        mut application: CreditGrantApplication,
    ) -> Result<Option<Outcome>, AppError> {
        if application.status.is_terminal() {
            debug!(
                status = application.status.as_str(),
                "Credit grant application already resolved"
            );
            return Ok(None);
        }

        let now = self.deps.clock.now();
        let tenant_id = application.tenant_id;

        let grant = match self
            .deps
            .grants
            .get_grant(tenant_id, application.credit_grant_id)
            .await?
        {
            Some(grant) if grant.is_published() => grant,
            Some(_) => {
                return self
                    .resolve(
                        application,
                        Outcome::GrantInactive,
                        now,
                        Some("credit grant archived".to_string()),
                    )
                    .await;
            }
            None => {
                return self
                    .resolve(
                        application,
                        Outcome::GrantInactive,
                        now,
                        Some("credit grant not found".to_string()),
                    )
                    .await;
            }
        };

        let Some(subscription) = self
            .deps
            .subscriptions
            .get_subscription(tenant_id, application.subscription_id)
            .await?
        else {
            return self
                .resolve(
                    application,
                    Outcome::SubscriptionInactive,
                    now,
                    Some("subscription not found".to_string()),
                )
                .await;
        };
        application.subscription_status_at_application = Some(subscription.status);

        match SubscriptionAction::from_status(subscription.status) {
            SubscriptionAction::Apply => {}
            SubscriptionAction::Defer => return self.defer(application, now).await,
            SubscriptionAction::Cancel => {
                let reason = format!("subscription {}", subscription.status.as_str());
                let grant_id = application.credit_grant_id;
                let subscription_id = application.subscription_id;
                let application_id = application.application_id;
                let outcome = self
                    .resolve(
                        application,
                        Outcome::SubscriptionInactive,
                        now,
                        Some(reason.clone()),
                    )
                    .await?;

                let siblings = self
                    .deps
                    .applications
                    .find_open_applications(tenant_id, Some(grant_id), Some(subscription_id))
                    .await?;
                for sibling in siblings
                    .into_iter()
                    .filter(|s| s.application_id != application_id)
                {
                    self.reconciler
                        .cancel_application(sibling, Outcome::SubscriptionInactive, now, &reason)
                        .await?;
                }
                return Ok(outcome);
            }
        }

        let expiry = match ExpiryPolicy::from_grant(&grant).and_then(|policy| {
            policy.expiry_for(application.effective_date(), subscription.current_period_end)
        }) {
            Ok(expiry) => expiry,
            Err(e) => {
                warn!(error = %e, "Credit grant expiry cannot be computed");
                record_error("expiry", "process_application");
                return self
                    .resolve(
                        application,
                        Outcome::Misconfigured,
                        now,
                        Some(format!("invalid credit grant configuration: {}", e)),
                    )
                    .await;
            }
        };

        if is_expired(expiry, now) {
            let reason = match expiry {
                Some(at) => format!("expired: credits would have expired at {}", at.to_rfc3339()),
                None => "expired".to_string(),
            };
            info!(reason = %reason, "Skipping expired credit grant application");
            return self
                .chain_and_resolve(
                    application,
                    &grant,
                    &subscription,
                    Outcome::Expired,
                    now,
                    Some(reason),
                )
                .await;
        }

        match self.credit(&application, &grant, &subscription, expiry).await {
            Ok(transaction) => {
                record_credits_granted(
                    &tenant_id.to_string(),
                    &subscription.currency,
                    transaction.amount.to_f64().unwrap_or_default(),
                );
                info!(
                    transaction_id = %transaction.transaction_id,
                    credits = %application.credits,
                    "Credits applied to wallet"
                );
                self.chain_and_resolve(
                    application,
                    &grant,
                    &subscription,
                    Outcome::Applied,
                    now,
                    None,
                )
                .await
            }
            Err(e) => {
                warn!(error = %e, "Wallet credit failed; application left for retry");
                record_error("ledger", "process_application");
                self.resolve(application, Outcome::LedgerFailed, now, Some(e.to_string()))
                    .await?;
                Err(e)
            }
        }
    }

    async fn credit(
        &self,
        application: &CreditGrantApplication,
        grant: &CreditGrant,
        subscription: &SubscriptionSnapshot,
        expiry: Option<DateTime<Utc>>,
    ) -> Result<WalletTransaction, AppError> {
        let wallet = self
            .deps
            .wallets
            .resolve_wallet(
                application.tenant_id,
                subscription.customer_id,
                &subscription.currency,
            )
            .await?;

        let request = CreditWalletRequest {
            tenant_id: application.tenant_id,
            wallet_id: wallet.wallet_id,
            amount: application.credits,
            expiry_date: expiry,
            idempotency_key: ledger_key(grant.grant_id, application.application_id),
            reason: SUBSCRIPTION_CREDIT_GRANT_REASON.to_string(),
            priority: grant.priority,
            metadata: json!({
                "grant_id": grant.grant_id,
                "subscription_id": subscription.subscription_id,
                "application_id": application.application_id,
            }),
        };

        self.deps.wallets.credit_wallet(&request).await
    }

    async fn defer(
        &self,
        mut application: CreditGrantApplication,
        now: DateTime<Utc>,
    ) -> Result<Option<Outcome>, AppError> {
        let backoff = defer_backoff(&self.config, application.retry_count);
        application.scheduled_for = now.checked_add_signed(backoff).ok_or_else(|| {
            AppError::InternalError(anyhow::anyhow!("deferred schedule out of range"))
        })?;

        info!(
            next_attempt = %application.scheduled_for,
            "Subscription paused; credit grant application deferred"
        );
        self.resolve(application, Outcome::Deferred, now, None).await
    }

    /// Persist the transition for `outcome`. Returns `None` when there was
    /// nothing to do because the row is, or concurrently became, terminal.
    async fn resolve(
        &self,
        mut application: CreditGrantApplication,
        outcome: Outcome,
        now: DateTime<Utc>,
        failure_reason: Option<String>,
    ) -> Result<Option<Outcome>, AppError> {
        let Some(t) = transition(application.status, outcome) else {
            return Ok(None);
        };
        t.apply(&mut application, now, failure_reason);

        match self.deps.applications.update_application(&application).await {
            Ok(updated) => {
                record_application_outcome(outcome.as_str());
                debug!(
                    status = updated.status.as_str(),
                    outcome = outcome.as_str(),
                    "Credit grant application transitioned"
                );
                Ok(Some(outcome))
            }
            Err(e) if e.is_conflict() => {
                debug!("Credit grant application resolved concurrently");
                Ok(None)
            }
            Err(e) => {
                error!(error = %e, "Failed to persist credit grant application transition");
                Err(e)
            }
        }
    }

    /// Insert the successor period, then persist the transition.
    ///
    /// The row stays open when the successor cannot be written, so the next
    /// sweep retries both steps. A grant whose recurrence can no longer be
    /// computed resolves without a successor.
    async fn chain_and_resolve(
        &self,
        application: CreditGrantApplication,
        grant: &CreditGrant,
        subscription: &SubscriptionSnapshot,
        outcome: Outcome,
        now: DateTime<Utc>,
        mut failure_reason: Option<String>,
    ) -> Result<Option<Outcome>, AppError> {
        if transition(application.status, outcome).is_some_and(|t| t.chain_next) {
            match Scheduler::successor_window(grant, subscription, &application) {
                Ok(Some(window)) => {
                    self.scheduler
                        .insert_successor(grant, subscription, window)
                        .await
                        .map_err(|e| {
                            error!(error = %e, "Failed to chain next credit grant application");
                            record_error("chain", "process_application");
                            e
                        })?;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(error = %e, "Credit grant recurrence cannot continue");
                    record_error("period", "process_application");
                    let note = format!("recurrence stopped: {}", e);
                    failure_reason = Some(match failure_reason {
                        Some(reason) => format!("{}; {}", reason, note),
                        None => note,
                    });
                }
            }
        }
        self.resolve(application, outcome, now, failure_reason).await
    }
}

/// Delay before a deferred row is retried: the base backoff doubled per
/// retry, up to the configured exponent and never more than 30 days.
pub fn defer_backoff(config: &ProcessorConfig, retry_count: i32) -> Duration {
    let cap = Duration::days(30);
    let exponent = retry_count.clamp(0, config.max_defer_exponent.min(MAX_DEFER_EXPONENT) as i32);
    2i64.checked_pow(exponent as u32)
        .and_then(|factor| config.defer_backoff_minutes.max(1).checked_mul(factor))
        .and_then(Duration::try_minutes)
        .map_or(cap, |backoff| backoff.min(cap))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_exponent() {
        let config = ProcessorConfig::default();
        assert_eq!(defer_backoff(&config, 0), Duration::minutes(30));
        assert_eq!(defer_backoff(&config, 2), Duration::minutes(120));
        assert_eq!(defer_backoff(&config, 4), Duration::minutes(480));
        assert_eq!(defer_backoff(&config, 9), Duration::minutes(480));
    }

    #[test]
    fn backoff_is_capped_for_extreme_settings() {
        let config = ProcessorConfig {
            max_defer_exponent: 64,
            defer_backoff_minutes: i64::MAX,
            ..ProcessorConfig::default()
        };
        for retry_count in [0, 1, 20, 63, 64, i32::MAX] {
            assert_eq!(defer_backoff(&config, retry_count), Duration::days(30));
        }

        let negative = ProcessorConfig {
            defer_backoff_minutes: -5,
            ..ProcessorConfig::default()
        };
        assert_eq!(defer_backoff(&negative, 0), Duration::minutes(1));
    }
}
