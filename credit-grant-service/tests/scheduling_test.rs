//! Scheduling and chaining integration tests for credit-grant-service.

mod common;

use chrono::Duration;
use common::{one_time_grant, recurring_grant, statuses, utc, TestEngine};
use credit_grant_service::models::{
    ApplicationReason, ApplicationStatus, CreditGrantPeriod, ExpirationType,
    SUBSCRIPTION_CREDIT_GRANT_REASON,
};
use rust_decimal_macros::dec;

#[tokio::test]
async fn one_time_grant_is_applied_once() {
    let engine = TestEngine::new();
    let sub = engine.add_subscription().await;

    let grant = engine
        .service
        .create_credit_grant(one_time_grant(sub.subscription_id, dec!(100), utc(2025, 3, 15)))
        .await
        .unwrap();

    let apps = engine.applications_of(grant.grant_id).await;
    assert_eq!(apps.len(), 1);
    assert_eq!(apps[0].status, ApplicationStatus::Applied);
    assert_eq!(apps[0].reason, ApplicationReason::OneTime);
    assert!(apps[0].applied_at.is_some());

    let transactions = engine.wallets.transactions().await;
    assert_eq!(transactions.len(), 1);
    assert_eq!(transactions[0].amount, dec!(100));
    assert_eq!(transactions[0].expiry_date, None);
    assert_eq!(transactions[0].reason, SUBSCRIPTION_CREDIT_GRANT_REASON);
    assert_eq!(transactions[0].priority, Some(1));

    let metadata = transactions[0].metadata.clone().unwrap();
    assert_eq!(metadata["grant_id"], grant.grant_id.to_string());
    assert_eq!(metadata["application_id"], apps[0].application_id.to_string());
}

#[tokio::test]
async fn future_one_time_grant_waits_for_its_start_date() {
    let engine = TestEngine::new();
    let sub = engine.add_subscription().await;

    let grant = engine
        .service
        .create_credit_grant(one_time_grant(sub.subscription_id, dec!(50), utc(2025, 4, 1)))
        .await
        .unwrap();

    let apps = engine.applications_of(grant.grant_id).await;
    assert_eq!(statuses(&apps), vec![ApplicationStatus::Pending]);
    assert_eq!(apps[0].scheduled_for, utc(2025, 4, 1));
    assert!(engine.wallets.transactions().await.is_empty());

    // Not yet due
    let summary = engine.service.process_scheduled_applications().await.unwrap();
    assert_eq!(summary.total, 0);

    engine.set_now(utc(2025, 4, 1));
    let summary = engine.service.process_scheduled_applications().await.unwrap();
    assert_eq!(summary.total, 1);
    assert_eq!(summary.succeeded, 1);

    let apps = engine.applications_of(grant.grant_id).await;
    assert_eq!(statuses(&apps), vec![ApplicationStatus::Applied]);
    assert_eq!(engine.wallets.transactions().await.len(), 1);
}

#[tokio::test]
async fn monthly_grant_applies_current_period_and_schedules_next() {
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

    let apps = engine.applications_of(grant.grant_id).await;
    assert_eq!(apps.len(), 2);

    let (current, next) = (&apps[0], &apps[1]);
    assert_eq!(current.status, ApplicationStatus::Applied);
    assert_eq!(current.reason, ApplicationReason::FirstTimeRecurring);
    assert_eq!(current.period_start, Some(utc(2025, 3, 15)));
    assert_eq!(current.period_end, Some(utc(2025, 4, 15)));

    assert_eq!(next.status, ApplicationStatus::Pending);
    assert_eq!(next.reason, ApplicationReason::Recurring);
    assert_eq!(next.period_start, current.period_end);
    assert_eq!(next.period_end, Some(utc(2025, 5, 15)));
    assert_eq!(next.scheduled_for, utc(2025, 4, 15));
}

#[tokio::test]
async fn biweekly_grant_uses_fourteen_day_periods() {
    let engine = TestEngine::new();
    let sub = engine.add_subscription().await;

    let grant = engine
        .service
        .create_credit_grant(recurring_grant(
            sub.subscription_id,
            dec!(10),
            CreditGrantPeriod::Weekly,
            2,
            utc(2025, 3, 15),
        ))
        .await
        .unwrap();

    let apps = engine.applications_of(grant.grant_id).await;
    assert_eq!(apps.len(), 2);
    for app in &apps {
        let length = app.period_end.unwrap() - app.period_start.unwrap();
        assert_eq!(length, Duration::days(14));
    }
}

#[tokio::test]
async fn billing_cycle_expiry_matches_current_period_end() {
    let engine = TestEngine::new();
    let sub = engine.add_subscription().await;

    let mut input = one_time_grant(sub.subscription_id, dec!(100), utc(2025, 3, 15));
    input.expiration_type = ExpirationType::BillingCycle;
    engine.service.create_credit_grant(input).await.unwrap();

    let transactions = engine.wallets.transactions().await;
    assert_eq!(transactions.len(), 1);
    let expiry = transactions[0].expiry_date.unwrap();
    assert_eq!(expiry.date_naive(), sub.current_period_end.date_naive());
}

#[tokio::test]
async fn billing_cycle_expiry_follows_renewals() {
    let engine = TestEngine::new();
    let sub = engine.add_subscription().await;

    let mut input = recurring_grant(
        sub.subscription_id,
        dec!(5),
        CreditGrantPeriod::Monthly,
        1,
        utc(2025, 3, 15),
    );
    input.expiration_type = ExpirationType::BillingCycle;
    engine.service.create_credit_grant(input).await.unwrap();

    engine
        .subscriptions
        .renew(sub.subscription_id, utc(2025, 4, 1), utc(2025, 5, 1))
        .await;
    engine.set_now(utc(2025, 4, 15));
    engine.service.process_scheduled_applications().await.unwrap();

    let expiries: Vec<_> = engine
        .wallets
        .transactions()
        .await
        .iter()
        .map(|t| t.expiry_date)
        .collect();
    assert_eq!(expiries, vec![Some(utc(2025, 4, 1)), Some(utc(2025, 5, 1))]);
}

#[tokio::test]
async fn chain_keeps_a_single_open_row_across_sweeps() {
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

    for month in 4..=8 {
        engine.set_now(utc(2025, month, 15));
        let summary = engine.service.process_scheduled_applications().await.unwrap();
        assert_eq!(summary.total, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(engine.open_count(grant.grant_id).await, 1);
    }

    // A second sweep at the same instant finds nothing new
    let summary = engine.service.process_scheduled_applications().await.unwrap();
    assert_eq!(summary.total, 0);

    let apps = engine.applications_of(grant.grant_id).await;
    assert_eq!(apps.len(), 7);
    for pair in apps.windows(2) {
        assert_eq!(pair[0].period_end, pair[1].period_start);
    }
    assert_eq!(engine.wallets.transactions().await.len(), 6);
}

#[tokio::test]
async fn month_end_start_does_not_drift() {
    let engine = TestEngine::new();
    let sub = engine.add_subscription().await;
    engine.set_now(utc(2025, 3, 31));

    let grant = engine
        .service
        .create_credit_grant(recurring_grant(
            sub.subscription_id,
            dec!(25),
            CreditGrantPeriod::Monthly,
            1,
            utc(2025, 3, 31),
        ))
        .await
        .unwrap();

    engine.set_now(utc(2025, 4, 30));
    engine.service.process_scheduled_applications().await.unwrap();

    let ends: Vec<_> = engine
        .applications_of(grant.grant_id)
        .await
        .iter()
        .map(|a| a.period_end.unwrap())
        .collect();
    assert_eq!(
        ends,
        vec![utc(2025, 4, 30), utc(2025, 5, 31), utc(2025, 6, 30)]
    );
}

#[tokio::test]
async fn grant_end_date_clips_and_stops_the_chain() {
    let engine = TestEngine::new();
    let sub = engine.add_subscription().await;

    let mut input = recurring_grant(
        sub.subscription_id,
        dec!(25),
        CreditGrantPeriod::Monthly,
        1,
        utc(2025, 3, 15),
    );
    input.end_date = Some(utc(2025, 5, 1));
    let grant = engine.service.create_credit_grant(input).await.unwrap();

    engine.set_now(utc(2025, 4, 15));
    engine.service.process_scheduled_applications().await.unwrap();
    engine.set_now(utc(2025, 6, 15));
    let summary = engine.service.process_scheduled_applications().await.unwrap();
    assert_eq!(summary.total, 0);

    let apps = engine.applications_of(grant.grant_id).await;
    assert_eq!(
        statuses(&apps),
        vec![ApplicationStatus::Applied, ApplicationStatus::Applied]
    );
    assert_eq!(apps[1].period_start, Some(utc(2025, 4, 15)));
    assert_eq!(apps[1].period_end, Some(utc(2025, 5, 1)));
}

#[tokio::test]
async fn subscription_end_date_limits_recurring_schedule() {
    let engine = TestEngine::new();
    let sub = engine
        .add_subscription_with(uuid::Uuid::new_v4(), Some(utc(2025, 4, 20)))
        .await;

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

    let apps = engine.applications_of(grant.grant_id).await;
    assert_eq!(apps.len(), 2);
    assert_eq!(apps[1].period_end, Some(utc(2025, 4, 20)));

    engine.set_now(utc(2025, 4, 15));
    engine.service.process_scheduled_applications().await.unwrap();

    // No period may start at or after the subscription end
    let apps = engine.applications_of(grant.grant_id).await;
    assert_eq!(apps.len(), 2);
    assert_eq!(engine.open_count(grant.grant_id).await, 0);
}

#[tokio::test]
async fn late_first_period_is_not_backfilled() {
    let engine = TestEngine::new();
    let sub = engine.add_subscription().await;
    engine.set_now(utc(2025, 5, 20));

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

    let apps = engine.applications_of(grant.grant_id).await;
    assert_eq!(apps.len(), 2);
    assert_eq!(apps[0].status, ApplicationStatus::Applied);
    assert_eq!(apps[0].period_start, Some(utc(2025, 5, 15)));
    assert_eq!(apps[0].period_end, Some(utc(2025, 6, 15)));
    assert_eq!(engine.wallets.transactions().await.len(), 1);
}

#[tokio::test]
async fn explicit_anchor_sets_period_boundaries() {
    let engine = TestEngine::new();
    let sub = engine.add_subscription().await;

    let mut input = recurring_grant(
        sub.subscription_id,
        dec!(25),
        CreditGrantPeriod::Monthly,
        1,
        utc(2025, 3, 15),
    );
    input.anchor = Some(utc(2025, 3, 20));
    let grant = engine.service.create_credit_grant(input).await.unwrap();

    let apps = engine.applications_of(grant.grant_id).await;
    // Stub period up to the anchor, then anchor-aligned months
    assert_eq!(apps[0].period_start, Some(utc(2025, 3, 15)));
    assert_eq!(apps[0].period_end, Some(utc(2025, 3, 20)));
    assert_eq!(apps[1].period_start, Some(utc(2025, 3, 20)));
    assert_eq!(apps[1].period_end, Some(utc(2025, 4, 20)));
}

#[tokio::test]
async fn application_keeps_credit_snapshot() {
    let engine = TestEngine::new();
    let sub = engine.add_subscription().await;

    let grant = engine
        .service
        .create_credit_grant(one_time_grant(sub.subscription_id, dec!(100), utc(2025, 4, 1)))
        .await
        .unwrap();

    engine
        .service
        .update_credit_grant(
            grant.tenant_id,
            grant.grant_id,
            credit_grant_service::models::UpdateCreditGrant {
                name: Some("Renamed".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let apps = engine.applications_of(grant.grant_id).await;
    assert_eq!(apps[0].credits, dec!(100));
}
