// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0
use chrono::{DateTime, Duration, FixedOffset, TimeZone, Utc};
use rstest::*;

use entitle_core::{
    manager::{adapters::EntitlementStore, context::memory::InMemoryContext},
    quota::{
        MeteredAction, QuotaDenial, QuotaLedger, QuotaWindow, SubscriptionTier, UsageKind,
        UsageScope,
    },
    record::{SubscriptionStatus, SubscriptionUpdate, DEFAULT_PLATFORM},
    Error,
};

#[fixture]
fn now() -> DateTime<FixedOffset> {
    FixedOffset::east_opt(8 * 3600)
        .unwrap()
        .with_ymd_and_hms(2024, 5, 6, 18, 0, 0)
        .unwrap()
}

#[fixture]
fn ledger() -> QuotaLedger<InMemoryContext> {
    QuotaLedger::with_default_policies(InMemoryContext::default())
}

async fn subscribe(context: &InMemoryContext, user_id: i64, sku: &str, now: DateTime<Utc>) {
    context
        .upsert(
            SubscriptionUpdate {
                user_id,
                platform: DEFAULT_PLATFORM.to_string(),
                sku: sku.to_string(),
                status: SubscriptionStatus::Active,
                expire_at: Some(now + Duration::days(30)),
                transaction_id: format!("{sku}-tx"),
                original_transaction_id: String::new(),
            },
            now,
        )
        .await
        .unwrap();
}

fn record(
    context: &InMemoryContext,
    user_id: i64,
    kind: UsageKind,
    times: usize,
    at: DateTime<Utc>,
) {
    for _ in 0..times {
        context.record_usage(user_id, kind, at).unwrap();
    }
}

#[rstest]
#[tokio::test]
async fn free_user_gets_one_menu_scan_per_day(
    ledger: QuotaLedger<InMemoryContext>,
    now: DateTime<FixedOffset>,
) {
    let window = QuotaWindow::containing(now);
    let utc_now = now.with_timezone(&Utc);
    let scan = MeteredAction::for_path("/api/menu/scan");

    let admission = ledger.admit(1, &scan, &window, utc_now).await.unwrap();
    assert_eq!(admission.remaining_credits, Some(30 - 8));

    record(ledger.context(), 1, UsageKind::MenuScan, 1, utc_now);
    let denied = ledger.admit(1, &scan, &window, utc_now).await.unwrap_err();
    assert!(matches!(
        denied,
        Error::QuotaExceeded(QuotaDenial::FeatureCapReached {
            kind: UsageKind::MenuScan,
            used: 1,
            limit: 1
        })
    ));

    // Tomorrow is a new window.
    let tomorrow = QuotaWindow::containing(now + Duration::days(1));
    assert!(ledger.admit(1, &scan, &tomorrow, utc_now).await.is_ok());
}

#[rstest]
#[tokio::test]
async fn free_budget_rejects_overspend(
    ledger: QuotaLedger<InMemoryContext>,
    now: DateTime<FixedOffset>,
) {
    let window = QuotaWindow::containing(now);
    let utc_now = now.with_timezone(&Utc);
    // 8 + 3 * 5 = 23 consumed; one more chat message (5) would be 28.
    record(ledger.context(), 2, UsageKind::MenuScan, 1, utc_now);
    record(ledger.context(), 2, UsageKind::ChatMessage, 3, utc_now);

    let chat = MeteredAction::for_path("/api/chat/messages");
    let admission = ledger.admit(2, &chat, &window, utc_now).await.unwrap();
    assert_eq!(admission.remaining_credits, Some(2));

    // A vision call (8) would reach 31.
    let photo = MeteredAction::for_path("/api/meals/analyze");
    let denied = ledger.admit(2, &photo, &window, utc_now).await.unwrap_err();
    assert!(matches!(
        denied,
        Error::QuotaExceeded(QuotaDenial::CreditsExhausted {
            budget: 30,
            consumed: 23,
            cost: 8
        })
    ));
}

#[rstest]
#[case::monthly("pro.monthly", SubscriptionTier::Monthly)]
#[case::yearly("pro.Yearly", SubscriptionTier::Yearly)]
#[tokio::test]
async fn paid_tiers_skip_feature_caps(
    ledger: QuotaLedger<InMemoryContext>,
    now: DateTime<FixedOffset>,
    #[case] sku: &str,
    #[case] tier: SubscriptionTier,
) {
    let window = QuotaWindow::containing(now);
    let utc_now = now.with_timezone(&Utc);
    subscribe(ledger.context(), 3, sku, utc_now).await;
    record(ledger.context(), 3, UsageKind::MenuScan, 5, utc_now);

    let snapshot = ledger.snapshot(3, &window, utc_now).await.unwrap();
    assert!(snapshot.entitled);
    assert_eq!(snapshot.tier, tier);

    let scan = MeteredAction::for_path("/menu/scan");
    let admission = ledger.admit(3, &scan, &window, utc_now).await.unwrap();
    assert_eq!(
        admission.remaining_credits,
        Some(tier.daily_budget() - 5 * 8 - 8)
    );
}

#[rstest]
#[tokio::test]
async fn expired_subscription_falls_back_to_free(
    ledger: QuotaLedger<InMemoryContext>,
    now: DateTime<FixedOffset>,
) {
    let window = QuotaWindow::containing(now);
    let utc_now = now.with_timezone(&Utc);
    subscribe(
        ledger.context(),
        4,
        "pro.yearly",
        utc_now - Duration::days(60),
    )
    .await;

    let snapshot = ledger.snapshot(4, &window, utc_now).await.unwrap();
    assert!(!snapshot.entitled);
    assert_eq!(snapshot.tier, SubscriptionTier::Free);
}

#[rstest]
#[tokio::test]
async fn unmetered_paths_are_always_admitted(
    ledger: QuotaLedger<InMemoryContext>,
    now: DateTime<FixedOffset>,
) {
    let window = QuotaWindow::containing(now);
    let utc_now = now.with_timezone(&Utc);
    record(ledger.context(), 5, UsageKind::MenuScan, 10, utc_now);

    let admission = ledger
        .admit(5, &MeteredAction::for_path("/settings"), &window, utc_now)
        .await
        .unwrap();
    assert_eq!(admission.remaining_credits, None);
}

#[rstest]
#[tokio::test]
async fn usage_summary_reports_free_tier_counts(
    ledger: QuotaLedger<InMemoryContext>,
    now: DateTime<FixedOffset>,
) {
    let window = QuotaWindow::containing(now);
    let utc_now = now.with_timezone(&Utc);
    record(ledger.context(), 6, UsageKind::ChatMessage, 3, utc_now);

    let report = ledger
        .usage_summary(6, UsageScope::All, &window, utc_now)
        .await
        .unwrap();
    assert!(!report.is_subscriber);
    assert_eq!(report.usage.len(), 3);
    let questions = report.usage[&UsageKind::ChatMessage];
    assert_eq!(
        (questions.used, questions.limit, questions.remaining),
        (3, 1, 0)
    );
    let scans = report.usage[&UsageKind::MenuScan];
    assert_eq!(
        (scans.used, scans.remaining, scans.unlimited),
        (0, 1, false)
    );

    subscribe(ledger.context(), 6, "pro.monthly", utc_now).await;
    let report = ledger
        .usage_summary(
            6,
            UsageScope::Single(UsageKind::MealPhotoRecord),
            &window,
            utc_now,
        )
        .await
        .unwrap();
    assert!(report.is_subscriber);
    assert_eq!(report.usage.len(), 1);
    assert!(report.usage[&UsageKind::MealPhotoRecord].unlimited);
}
