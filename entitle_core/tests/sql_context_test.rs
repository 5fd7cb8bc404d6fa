// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0
#![cfg(feature = "sql")]

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use rstest::*;
use serde_json::json;

use entitle_core::{
    manager::{
        adapters::{EntitlementRead, EntitlementStore, UsageCounter, WeeklyPlanCache},
        context::sql::{DatabaseType, SqlContext},
    },
    quota::{MeteredAction, QuotaLedger, QuotaWindow, UsageKind},
    record::{SubscriptionStatus, SubscriptionUpdate, WeeklyPlan, WeeklyPlanKey, DEFAULT_PLATFORM},
};

#[fixture]
fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap()
}

async fn setup_test_db() -> SqlContext {
    let context = SqlContext::connect("sqlite::memory:", 1)
        .await
        .expect("Failed to connect");
    context
        .ensure_schema()
        .await
        .expect("Failed to create schema");
    context
}

fn update(
    user_id: i64,
    status: SubscriptionStatus,
    expire_at: Option<DateTime<Utc>>,
    transaction_id: &str,
    original_transaction_id: &str,
) -> SubscriptionUpdate {
    SubscriptionUpdate {
        user_id,
        platform: DEFAULT_PLATFORM.to_string(),
        sku: "pro.monthly".to_string(),
        status,
        expire_at,
        transaction_id: transaction_id.to_string(),
        original_transaction_id: original_transaction_id.to_string(),
    }
}

#[tokio::test]
async fn connects_to_sqlite() {
    let context = setup_test_db().await;
    assert_eq!(context.database_type(), DatabaseType::SQLite);
    // Creating the schema twice is harmless.
    context.ensure_schema().await.unwrap();
}

#[tokio::test]
async fn rejects_unknown_scheme() {
    let connected = SqlContext::connect("mysql://localhost/db", 1).await;
    assert!(connected.is_err());
}

#[rstest]
#[tokio::test]
async fn upsert_keeps_one_row_and_original_id(now: DateTime<Utc>) {
    let context = setup_test_db().await;
    let expiry = Some(now + Duration::days(30));
    let first = update(1, SubscriptionStatus::Active, expiry, "tx-1", "orig-1");
    context.upsert(first, now).await.unwrap();
    let later = now + Duration::minutes(1);
    let lapsed = update(1, SubscriptionStatus::Expired, Some(now), "tx-1", "");
    context.upsert(lapsed, later).await.unwrap();

    let latest = context.latest(1).await.unwrap().unwrap();
    assert_eq!(latest.transaction_id, "tx-1");
    assert_eq!(latest.original_transaction_id, "orig-1");
    assert_eq!(latest.status, SubscriptionStatus::Expired);
    assert_eq!(latest.expire_at, Some(now));
    assert_eq!(latest.updated_at, later);
    assert_eq!(context.count_distinct_subscribers().await.unwrap(), 1);
    assert!(!context.is_active(1, now).await.unwrap());
}

#[rstest]
#[tokio::test]
async fn synthetic_key_when_ids_missing(now: DateTime<Utc>) {
    let context = setup_test_db().await;
    context
        .upsert(update(9, SubscriptionStatus::Active, None, "", ""), now)
        .await
        .unwrap();

    let latest = context.latest(9).await.unwrap().unwrap();
    assert_eq!(latest.transaction_id, "pro.monthly-9");
    assert_eq!(latest.expire_at, None);
    assert!(context.is_active(9, now).await.unwrap());
}

#[rstest]
#[tokio::test]
async fn active_users_and_latest_row(now: DateTime<Utc>) {
    let context = setup_test_db().await;
    let future = Some(now + Duration::days(1));
    let past = Some(now - Duration::days(1));
    context
        .upsert(update(2, SubscriptionStatus::Active, future, "a", ""), now)
        .await
        .unwrap();
    context
        .upsert(update(2, SubscriptionStatus::Active, None, "b", ""), now)
        .await
        .unwrap();
    context
        .upsert(update(3, SubscriptionStatus::Active, past, "c", ""), now)
        .await
        .unwrap();
    context
        .upsert(update(1, SubscriptionStatus::Inactive, None, "d", ""), now)
        .await
        .unwrap();

    assert_eq!(context.list_active_user_ids(now).await.unwrap(), vec![2]);
    assert_eq!(context.count_distinct_subscribers().await.unwrap(), 3);
    // Same timestamp: the later write wins.
    assert_eq!(
        context.latest(2).await.unwrap().unwrap().transaction_id,
        "b"
    );
    assert!(context.latest(42).await.unwrap().is_none());
}

#[rstest]
#[tokio::test]
async fn usage_counted_within_window(now: DateTime<Utc>) {
    let context = setup_test_db().await;
    let local = now.with_timezone(&FixedOffset::east_opt(8 * 3600).unwrap());
    let window = QuotaWindow::containing(local);

    for _ in 0..2 {
        context
            .record_usage(1, UsageKind::ChatMessage, now)
            .await
            .unwrap();
    }
    context
        .record_usage(1, UsageKind::ChatMessage, window.end_utc())
        .await
        .unwrap();
    context
        .record_usage(1, UsageKind::MealPhotoRecord, window.start_utc())
        .await
        .unwrap();
    context
        .record_usage(2, UsageKind::MenuScan, now)
        .await
        .unwrap();

    let count = |kind| context.count_usage(1, kind, &window);
    assert_eq!(count(UsageKind::ChatMessage).await.unwrap(), 2);
    assert_eq!(count(UsageKind::MealPhotoRecord).await.unwrap(), 1);
    assert_eq!(count(UsageKind::MenuScan).await.unwrap(), 0);
}

#[rstest]
#[tokio::test]
async fn ledger_runs_on_sql_context(now: DateTime<Utc>) {
    let context = setup_test_db().await;
    context
        .record_usage(5, UsageKind::MenuScan, now)
        .await
        .unwrap();
    let ledger = QuotaLedger::with_default_policies(context);
    let window = QuotaWindow::containing(now.fixed_offset());

    let scan = MeteredAction::for_path("/api/menu/scan");
    assert!(ledger.admit(5, &scan, &window, now).await.is_err());
    let chat = MeteredAction::for_path("/api/chat/messages");
    let admission = ledger.admit(5, &chat, &window, now).await.unwrap();
    assert_eq!(admission.remaining_credits, Some(30 - 8 - 5));
}

#[tokio::test]
async fn weekly_plans_are_upserted() {
    let context = setup_test_db().await;
    let key = WeeklyPlanKey::for_date(1, NaiveDate::from_ymd_opt(2024, 5, 8).unwrap());
    assert!(context.cached_plan(&key).await.unwrap().is_none());

    let first = WeeklyPlan {
        plan_meals: json!([{ "name": "oats" }]),
        recommendations: json!([]),
    };
    let second = WeeklyPlan {
        plan_meals: json!([{ "name": "salad" }]),
        recommendations: json!(["more greens"]),
    };
    context.store_plan(&key, &first).await.unwrap();
    context.store_plan(&key, &second).await.unwrap();

    assert_eq!(context.cached_plan(&key).await.unwrap(), Some(second));
    let other_day = WeeklyPlanKey { weekday: 4, ..key };
    assert!(context.cached_plan(&other_day).await.unwrap().is_none());
}
