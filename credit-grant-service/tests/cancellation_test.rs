//! Subscription cancellation and grant deletion integration tests.

mod common;

use common::{one_time_grant, plan_grant, recurring_grant, statuses, tenant_id, utc, TestEngine};
use credit_grant_service::models::{
    ApplicationStatus, CreditGrantPeriod, RecordStatus, SubscriptionStatus, UpdateCreditGrant,
};
use rust_decimal_macros::dec;
use uuid::Uuid;

#[tokio::test]
async fn cancelling_a_subscription_cancels_pending_rows_and_archives_grants() {
    let engine = TestEngine::new();
    let plan = engine.add_plan(true).await;
    let sub = engine.add_subscription_with(plan.plan_id, None).await;

    let recurring = engine
        .service
        .create_credit_grant(recurring_grant(
            sub.subscription_id,
            dec!(25),
            CreditGrantPeriod::Monthly,
            1,
            utc(2025, 3, 15),
        ))
        .await
        .unwrap();
    let future = engine
        .service
        .create_credit_grant(one_time_grant(sub.subscription_id, dec!(100), utc(2025, 5, 1)))
        .await
        .unwrap();
    let plan_scoped = engine
        .service
        .create_credit_grant(plan_grant(plan.plan_id, dec!(40), utc(2025, 3, 1)))
        .await
        .unwrap();

    engine
        .service
        .cancel_future_subscription_grants(tenant_id(), sub.subscription_id)
        .await
        .unwrap();

    let apps = engine.applications_of(recurring.grant_id).await;
    assert_eq!(
        statuses(&apps),
        vec![ApplicationStatus::Applied, ApplicationStatus::Cancelled]
    );
    assert_eq!(
        apps[1].failure_reason.as_deref(),
        Some("subscription cancelled")
    );
    let apps = engine.applications_of(future.grant_id).await;
    assert_eq!(statuses(&apps), vec![ApplicationStatus::Cancelled]);

    let recurring = engine
        .service
        .get_credit_grant(tenant_id(), recurring.grant_id)
        .await
        .unwrap();
    assert_eq!(recurring.status, RecordStatus::Archived);

    // Plan scoped grants are shared and stay published
    let plan_scoped = engine
        .service
        .get_credit_grant(tenant_id(), plan_scoped.grant_id)
        .await
        .unwrap();
    assert_eq!(plan_scoped.status, RecordStatus::Published);

    // Nothing cancelled ever reaches APPLIED
    engine.subscriptions.set_status(sub.subscription_id, SubscriptionStatus::Active).await;
    engine.set_now(utc(2025, 6, 1));
    let summary = engine.service.process_scheduled_applications().await.unwrap();
    assert_eq!(summary.total, 0);
    assert_eq!(engine.wallets.transactions().await.len(), 1);
}

#[tokio::test]
async fn cancellation_leaves_other_subscriptions_untouched() {
    let engine = TestEngine::new();
    let cancelled = engine.add_subscription().await;
    let other = engine.add_subscription().await;

    engine
        .service
        .create_credit_grant(one_time_grant(cancelled.subscription_id, dec!(1), utc(2025, 4, 1)))
        .await
        .unwrap();
    let kept = engine
        .service
        .create_credit_grant(one_time_grant(other.subscription_id, dec!(1), utc(2025, 4, 1)))
        .await
        .unwrap();

    engine
        .service
        .cancel_future_subscription_grants(tenant_id(), cancelled.subscription_id)
        .await
        .unwrap();

    let apps = engine.applications_of(kept.grant_id).await;
    assert_eq!(statuses(&apps), vec![ApplicationStatus::Pending]);
}

#[tokio::test]
async fn subscription_cancelled_before_processing_stops_the_chain() {
    let engine = TestEngine::new();
    let sub = engine.add_subscription().await;

    let grant = engine
        .service
        .create_credit_grant(recurring_grant(
            sub.subscription_id,
            dec!(25),
            CreditGrantPeriod::Monthly,
            1,
            utc(2025, 3, 15),
        ))
        .await
        .unwrap();

    // Status is re-read at processing time
    engine
        .subscriptions
        .set_status(sub.subscription_id, SubscriptionStatus::Cancelled)
        .await;
    engine.set_now(utc(2025, 4, 15));
    let summary = engine.service.process_scheduled_applications().await.unwrap();
    assert_eq!(summary.succeeded, 1);

    let apps = engine.applications_of(grant.grant_id).await;
    assert_eq!(
        statuses(&apps),
        vec![ApplicationStatus::Applied, ApplicationStatus::Cancelled]
    );
    assert_eq!(apps[1].failure_reason.as_deref(), Some("subscription cancelled"));
    assert_eq!(
        apps[1].subscription_status_at_application,
        Some(SubscriptionStatus::Cancelled)
    );
    assert_eq!(engine.open_count(grant.grant_id).await, 0);
    assert_eq!(engine.wallets.transactions().await.len(), 1);
}

#[tokio::test]
async fn expired_subscription_cancels_the_row() {
    let engine = TestEngine::new();
    let sub = engine.add_subscription().await;

    let grant = engine
        .service
        .create_credit_grant(one_time_grant(sub.subscription_id, dec!(100), utc(2025, 4, 1)))
        .await
        .unwrap();
    engine
        .subscriptions
        .set_status(sub.subscription_id, SubscriptionStatus::Expired)
        .await;

    engine.set_now(utc(2025, 4, 1));
    engine.service.process_scheduled_applications().await.unwrap();

    let app = engine.applications_of(grant.grant_id).await.remove(0);
    assert_eq!(app.status, ApplicationStatus::Cancelled);
    assert_eq!(app.failure_reason.as_deref(), Some("subscription expired"));
}

#[tokio::test]
async fn deleting_a_grant_cancels_its_rows_and_archives_it() {
    let engine = TestEngine::new();
    let sub = engine.add_subscription().await;

    let grant = engine
        .service
        .create_credit_grant(recurring_grant(
            sub.subscription_id,
            dec!(25),
            CreditGrantPeriod::Monthly,
            1,
            utc(2025, 3, 15),
        ))
        .await
        .unwrap();

    engine
        .service
        .delete_credit_grant(tenant_id(), grant.grant_id, Some("admin".to_string()))
        .await
        .unwrap();

    let apps = engine.applications_of(grant.grant_id).await;
    assert_eq!(
        statuses(&apps),
        vec![ApplicationStatus::Applied, ApplicationStatus::Cancelled]
    );
    assert_eq!(apps[1].failure_reason.as_deref(), Some("credit grant deleted"));

    let archived = engine
        .service
        .get_credit_grant(tenant_id(), grant.grant_id)
        .await
        .unwrap();
    assert_eq!(archived.status, RecordStatus::Archived);
    assert_eq!(archived.updated_by.as_deref(), Some("admin"));

    let err = engine
        .service
        .delete_credit_grant(tenant_id(), grant.grant_id, None)
        .await
        .unwrap_err();
    assert!(err.is_validation());

    let err = engine
        .service
        .update_credit_grant(
            tenant_id(),
            grant.grant_id,
            UpdateCreditGrant {
                name: Some("Too late".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert!(err.is_validation());
}

#[tokio::test]
async fn deleting_unknown_grant_is_not_found() {
    let engine = TestEngine::new();

    let err = engine
        .service
        .delete_credit_grant(tenant_id(), Uuid::new_v4(), None)
        .await
        .unwrap_err();
    assert!(err.is_not_found());
}
