//! Credit grant service: the operations exposed to callers.

use crate::config::ProcessorConfig;
use crate::models::{
    CreateCreditGrant, CreditGrant, CreditGrantApplication, CreditGrantCadence, CreditGrantScope,
    ListCreditGrantApplicationsFilter, ListCreditGrantsFilter, ProcessingSummary, RecordStatus,
    UpdateCreditGrant,
};
use crate::services::metrics::record_grant_operation;
use crate::services::ports::{list_all_grants, Collaborators};
use crate::services::processor::Processor;
use crate::services::reconciler::Reconciler;
use crate::services::scheduler::Scheduler;
use service_core::error::AppError;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

#[derive(Clone)]
pub struct CreditGrantService {
    deps: Collaborators,
    scheduler: Scheduler,
    processor: Processor,
    reconciler: Reconciler,
}

impl CreditGrantService {
    pub fn new(deps: Collaborators, config: ProcessorConfig) -> Self {
        let scheduler = Scheduler::new(deps.clone());
        let reconciler = Reconciler::new(deps.clone());
        let processor = Processor::new(
            deps.clone(),
            scheduler.clone(),
            reconciler.clone(),
            config,
        );
        Self {
            deps,
            scheduler,
            processor,
            reconciler,
        }
    }

    pub fn processor(&self) -> &Processor {
        &self.processor
    }

    /// Validate and persist a grant, then schedule it when subscription scoped.
    ///
    /// A first application that is already due is processed right away; if
    /// that attempt fails the row stays FAILED for the sweep and the grant is
    /// still returned.
    #[instrument(skip(self, input), fields(tenant_id = %input.tenant_id, scope = input.scope.as_str()))]
    pub async fn create_credit_grant(
        &self,
        input: CreateCreditGrant,
    ) -> Result<CreditGrant, AppError> {
        let start_date = Scheduler::validate_config(&input)?;
        let subscription = self
            .scheduler
            .validate_references(&input, start_date)
            .await?;

        let now = self.deps.clock.now();
        let recurring = input.cadence == CreditGrantCadence::Recurring;
        let grant = CreditGrant {
            grant_id: Uuid::new_v4(),
            tenant_id: input.tenant_id,
            name: input.name,
            scope: input.scope,
            plan_id: input.plan_id,
            subscription_id: input.subscription_id,
            credits: input.credits,
            cadence: input.cadence,
            period: input.period.filter(|_| recurring),
            period_count: recurring.then(|| input.period_count.unwrap_or(1)),
            priority: input.priority,
            expiration_type: input.expiration_type,
            expiration_duration: input.expiration_duration,
            expiration_duration_unit: input.expiration_duration_unit,
            start_date,
            end_date: input.end_date,
            anchor: input.anchor,
            status: RecordStatus::Published,
            metadata: input.metadata,
            created_by: input.created_by.clone(),
            updated_by: input.created_by,
            created_utc: now,
            updated_utc: now,
        };

        let grant = self.deps.grants.create_grant(&grant).await?;
        record_grant_operation(&grant.tenant_id.to_string(), "create");
        info!(grant_id = %grant.grant_id, name = %grant.name, "Credit grant created");

        if let Some(subscription) = subscription {
            if let Some(first) = self.scheduler.schedule(&grant, &subscription).await? {
                self.process_if_due(first).await;
            }
        }

        Ok(grant)
    }

    #[instrument(skip(self), fields(tenant_id = %tenant_id, grant_id = %grant_id))]
    pub async fn get_credit_grant(
        &self,
        tenant_id: Uuid,
        grant_id: Uuid,
    ) -> Result<CreditGrant, AppError> {
        self.deps
            .grants
            .get_grant(tenant_id, grant_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Credit grant {} not found", grant_id)))
    }

    pub async fn list_credit_grants(
        &self,
        tenant_id: Uuid,
        filter: &ListCreditGrantsFilter,
    ) -> Result<Vec<CreditGrant>, AppError> {
        self.deps.grants.list_grants(tenant_id, filter).await
    }

    /// Update non-scheduling fields. Already created applications keep their
    /// credit snapshot.
    #[instrument(skip(self, input), fields(tenant_id = %tenant_id, grant_id = %grant_id))]
    pub async fn update_credit_grant(
        &self,
        tenant_id: Uuid,
        grant_id: Uuid,
        input: UpdateCreditGrant,
    ) -> Result<CreditGrant, AppError> {
        input.validate()?;

        let mut grant = self.get_credit_grant(tenant_id, grant_id).await?;
        if !grant.is_published() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Credit grant {} is archived",
                grant_id
            )));
        }

        if let Some(name) = input.name {
            grant.name = name;
        }
        if let Some(metadata) = input.metadata {
            grant.metadata = Some(metadata);
        }
        if input.updated_by.is_some() {
            grant.updated_by = input.updated_by;
        }
        grant.updated_utc = self.deps.clock.now();

        let grant = self.deps.grants.update_grant(&grant).await?;
        record_grant_operation(&tenant_id.to_string(), "update");
        Ok(grant)
    }

    /// Cancel the grant's open applications and archive it.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, grant_id = %grant_id))]
    pub async fn delete_credit_grant(
        &self,
        tenant_id: Uuid,
        grant_id: Uuid,
        deleted_by: Option<String>,
    ) -> Result<(), AppError> {
        let grant = self.get_credit_grant(tenant_id, grant_id).await?;
        if !grant.is_published() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Credit grant {} is already archived",
                grant_id
            )));
        }

        let cancelled = self
            .reconciler
            .cancel_grant_applications(&grant, "credit grant deleted")
            .await?;
        self.reconciler
            .archive_grant(grant, self.deps.clock.now(), deleted_by)
            .await?;

        record_grant_operation(&tenant_id.to_string(), "delete");
        info!(cancelled_applications = cancelled, "Credit grant deleted");
        Ok(())
    }

    /// Published plan scoped grants of a plan.
    pub async fn get_credit_grants_by_plan(
        &self,
        tenant_id: Uuid,
        plan_id: Uuid,
    ) -> Result<Vec<CreditGrant>, AppError> {
        list_all_grants(
            self.deps.grants.as_ref(),
            tenant_id,
            ListCreditGrantsFilter {
                scope: Some(CreditGrantScope::Plan),
                plan_id: Some(plan_id),
                status: Some(RecordStatus::Published),
                ..Default::default()
            },
        )
        .await
    }

    /// Published subscription scoped grants of a subscription.
    pub async fn get_credit_grants_by_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Vec<CreditGrant>, AppError> {
        list_all_grants(
            self.deps.grants.as_ref(),
            tenant_id,
            ListCreditGrantsFilter {
                scope: Some(CreditGrantScope::Subscription),
                subscription_id: Some(subscription_id),
                status: Some(RecordStatus::Published),
                ..Default::default()
            },
        )
        .await
    }

    /// Schedule every published grant of the subscription's plan for the
    /// subscription. Returns the first application of each grant.
    #[instrument(skip(self), fields(tenant_id = %tenant_id, subscription_id = %subscription_id))]
    pub async fn apply_plan_grants_to_subscription(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<Vec<CreditGrantApplication>, AppError> {
        let subscription = self
            .deps
            .subscriptions
            .get_subscription(tenant_id, subscription_id)
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

        let grants = self
            .get_credit_grants_by_plan(tenant_id, subscription.plan_id)
            .await?;

        let mut scheduled = Vec::with_capacity(grants.len());
        for grant in &grants {
            if let Some(first) = self.scheduler.schedule(grant, &subscription).await? {
                let application_id = first.application_id;
                self.process_if_due(first).await;
                if let Some(current) = self
                    .deps
                    .applications
                    .get_application(tenant_id, application_id)
                    .await?
                {
                    scheduled.push(current);
                }
            }
        }

        info!(
            grants = grants.len(),
            scheduled = scheduled.len(),
            "Plan credit grants applied to subscription"
        );
        Ok(scheduled)
    }

    pub async fn process_scheduled_applications(&self) -> Result<ProcessingSummary, AppError> {
        self.processor.process_scheduled_applications().await
    }

    pub async fn process_application(
        &self,
        tenant_id: Uuid,
        application_id: Uuid,
    ) -> Result<(), AppError> {
        self.processor
            .process_application(tenant_id, application_id)
            .await
    }

    pub async fn cancel_future_subscription_grants(
        &self,
        tenant_id: Uuid,
        subscription_id: Uuid,
    ) -> Result<(), AppError> {
        self.reconciler
            .cancel_future_subscription_grants(tenant_id, subscription_id)
            .await
    }

    pub async fn list_credit_grant_applications(
        &self,
        tenant_id: Uuid,
        filter: &ListCreditGrantApplicationsFilter,
    ) -> Result<Vec<CreditGrantApplication>, AppError> {
        self.deps
            .applications
            .list_applications(tenant_id, filter)
            .await
    }

    pub async fn get_credit_grant_application(
        &self,
        tenant_id: Uuid,
        application_id: Uuid,
    ) -> Result<CreditGrantApplication, AppError> {
        self.deps
            .applications
            .get_application(tenant_id, application_id)
            .await?
            .ok_or_else(|| {
                AppError::NotFound(anyhow::anyhow!(
                    "Credit grant application {} not found",
                    application_id
                ))
            })
    }

    async fn process_if_due(&self, application: CreditGrantApplication) {
        if application.scheduled_for > self.deps.clock.now() {
            return;
        }
        let application_id = application.application_id;
        if let Err(e) = self.processor.process(application).await {
            warn!(
                application_id = %application_id,
                error = %e,
                "Initial credit grant application failed; left for the next sweep"
            );
        }
    }
}
