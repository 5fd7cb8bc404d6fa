// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! Data carried between the verifier, the stores and the scheduler.

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Platform recorded when the caller does not name one.
pub const DEFAULT_PLATFORM: &str = "ios";

/// Stored subscription status.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SubscriptionStatus {
    Active,
    Inactive,
    Expired,
}

impl SubscriptionStatus {
    /// `active` while the expiry is in the future, `expired` once it passed and
    /// `inactive` when the storefront reported no expiry at all.
    pub fn from_expiry(expire_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Self {
        match expire_at {
            Some(expire_at) if expire_at > now => Self::Active,
            Some(_) => Self::Expired,
            None => Self::Inactive,
        }
    }
}

/// One persisted entitlement row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionRecord {
    pub user_id: i64,
    pub platform: String,
    pub sku: String,
    pub status: SubscriptionStatus,
    pub expire_at: Option<DateTime<Utc>>,
    pub transaction_id: String,
    pub original_transaction_id: String,
    pub updated_at: DateTime<Utc>,
}

impl SubscriptionRecord {
    /// Whether this row alone grants an entitlement at `now`.
    pub fn is_entitled(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active
            && self.expire_at.is_none_or(|expire_at| expire_at > now)
    }
}

/// Values written by an entitlement upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionUpdate {
    pub user_id: i64,
    pub platform: String,
    pub sku: String,
    pub status: SubscriptionStatus,
    pub expire_at: Option<DateTime<Utc>>,
    pub transaction_id: String,
    pub original_transaction_id: String,
}

impl SubscriptionUpdate {
    /// Key the row is stored under.
    ///
    /// Falls back to the original transaction id, then to `"{sku}-{user_id}"`.
    /// The synthetic key collapses distinct purchases of one SKU into a single
    /// row; it only applies when the storefront returned no id at all.
    pub fn idempotency_key(&self) -> String {
        if !self.transaction_id.is_empty() {
            self.transaction_id.clone()
        } else if !self.original_transaction_id.is_empty() {
            self.original_transaction_id.clone()
        } else {
            format!("{}-{}", self.sku, self.user_id)
        }
    }
}

/// Transaction selected by the verifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReceiptInfo {
    pub product_id: String,
    pub transaction_id: String,
    pub original_transaction_id: String,
    pub expires_at_millis: Option<i64>,
}

impl ReceiptInfo {
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at_millis
            .and_then(DateTime::<Utc>::from_timestamp_millis)
    }
}

/// Caller supplied context of a verify or restore request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerificationRequest {
    pub user_id: i64,
    pub platform: String,
    /// Product the client believes it bought, used when the storefront omits one.
    pub product_id: String,
    /// Transaction id sent by the client, used when the storefront omits one.
    pub transaction_id: String,
}

impl VerificationRequest {
    pub fn new(user_id: i64, product_id: impl Into<String>) -> Self {
        Self {
            user_id,
            platform: DEFAULT_PLATFORM.to_string(),
            product_id: product_id.into(),
            transaction_id: String::new(),
        }
    }

    pub fn with_transaction_id(mut self, transaction_id: impl Into<String>) -> Self {
        self.transaction_id = transaction_id.into();
        self
    }

    pub fn with_platform(mut self, platform: impl Into<String>) -> Self {
        let platform = platform.into();
        if !platform.trim().is_empty() {
            self.platform = platform;
        }
        self
    }
}

/// Result reported back to the client after a verify or restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationOutcome {
    pub active: bool,
    pub status: SubscriptionStatus,
    pub expire_at: Option<DateTime<Utc>>,
    pub product_id: String,
    pub subscriber_rank: u64,
}

/// Cache key of one generated day plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WeeklyPlanKey {
    pub user_id: i64,
    /// Monday of the week the day belongs to.
    pub week_start: NaiveDate,
    /// 1 for Monday through 7 for Sunday.
    pub weekday: u8,
}

impl WeeklyPlanKey {
    pub fn for_date(user_id: i64, date: NaiveDate) -> Self {
        let weekday = date.weekday();
        Self {
            user_id,
            week_start: date - Duration::days(i64::from(weekday.num_days_from_monday())),
            weekday: weekday.number_from_monday() as u8,
        }
    }
}

/// Generated content for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeeklyPlan {
    pub plan_meals: serde_json::Value,
    pub recommendations: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, NaiveDate, TimeZone, Utc};
    use rstest::*;

    use super::*;

    #[rstest]
    #[case::future(Some(1), SubscriptionStatus::Active)]
    #[case::past(Some(-1), SubscriptionStatus::Expired)]
    #[case::now(Some(0), SubscriptionStatus::Expired)]
    #[case::unknown(None, SubscriptionStatus::Inactive)]
    fn status_follows_expiry(
        #[case] offset_hours: Option<i64>,
        #[case] expected: SubscriptionStatus,
    ) {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let expire_at = offset_hours.map(|hours| now + Duration::hours(hours));
        assert_eq!(SubscriptionStatus::from_expiry(expire_at, now), expected);
    }

    #[test]
    fn status_strings_are_lowercase() {
        assert_eq!(SubscriptionStatus::Active.to_string(), "active");
        assert_eq!(
            "expired".parse::<SubscriptionStatus>().unwrap(),
            SubscriptionStatus::Expired
        );
    }

    #[rstest]
    #[case::transaction("tx", "orig", "tx")]
    #[case::original("", "orig", "orig")]
    #[case::synthetic("", "", "pro.monthly-42")]
    fn idempotency_key_fallbacks(#[case] tx: &str, #[case] original: &str, #[case] expected: &str) {
        let update = SubscriptionUpdate {
            user_id: 42,
            platform: DEFAULT_PLATFORM.to_string(),
            sku: "pro.monthly".to_string(),
            status: SubscriptionStatus::Active,
            expire_at: None,
            transaction_id: tx.to_string(),
            original_transaction_id: original.to_string(),
        };
        assert_eq!(update.idempotency_key(), expected);
    }

    #[rstest]
    // 2024-05-06 is a Monday.
    #[case::monday(NaiveDate::from_ymd_opt(2024, 5, 6).unwrap(), 1)]
    #[case::wednesday(NaiveDate::from_ymd_opt(2024, 5, 8).unwrap(), 3)]
    #[case::sunday(NaiveDate::from_ymd_opt(2024, 5, 12).unwrap(), 7)]
    fn plan_key_uses_monday_weeks(#[case] date: NaiveDate, #[case] weekday: u8) {
        let key = WeeklyPlanKey::for_date(1, date);
        assert_eq!(key.week_start, NaiveDate::from_ymd_opt(2024, 5, 6).unwrap());
        assert_eq!(key.weekday, weekday);
    }
}
