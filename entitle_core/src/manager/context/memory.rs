// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! In-memory context implementation for the entitlement managers.
//!
//! This module provides an in-memory implementation of every adapter.
//! It is useful for testing and development purposes.

use std::{
    collections::{HashMap, HashSet},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, PoisonError, RwLock,
    },
};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;
use thiserror::Error;

use crate::{
    manager::adapters::*,
    quota::{QuotaWindow, UsageKind},
    record::{SubscriptionRecord, SubscriptionUpdate, WeeklyPlan, WeeklyPlanKey},
};

#[derive(Debug, Clone)]
pub struct StoredSubscription {
    pub record: SubscriptionRecord,
    /// Write order, breaks ties between rows updated at the same instant.
    sequence: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UsageEvent {
    pub user_id: i64,
    pub kind: UsageKind,
    pub created_at: DateTime<Utc>,
}

pub type EntitlementStorage = Arc<RwLock<HashMap<(i64, String), StoredSubscription>>>;
pub type UsageStorage = Arc<RwLock<Vec<UsageEvent>>>;
pub type WeeklyPlanStorage = Arc<RwLock<HashMap<WeeklyPlanKey, WeeklyPlan>>>;

#[derive(Debug, Error)]
pub enum InMemoryError {
    #[error("something went wrong: {error}")]
    AdapterError { error: String },
}

impl<T> From<PoisonError<T>> for InMemoryError {
    fn from(err: PoisonError<T>) -> Self {
        InMemoryError::AdapterError {
            error: err.to_string(),
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryContext {
    /// local stores with rwlocks to allow sharing with other compenents as needed
    entitlement_storage: EntitlementStorage,
    usage_storage: UsageStorage,
    weekly_plan_storage: WeeklyPlanStorage,
    sequence: Arc<AtomicU64>,
}

impl InMemoryContext {
    pub fn new(
        entitlement_storage: EntitlementStorage,
        usage_storage: UsageStorage,
        weekly_plan_storage: WeeklyPlanStorage,
    ) -> Self {
        InMemoryContext {
            entitlement_storage,
            usage_storage,
            weekly_plan_storage,
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Records one metered use, as the feature producing it would.
    pub fn record_usage(
        &self,
        user_id: i64,
        kind: UsageKind,
        created_at: DateTime<Utc>,
    ) -> Result<(), InMemoryError> {
        self.usage_storage.write()?.push(UsageEvent {
            user_id,
            kind,
            created_at,
        });
        Ok(())
    }

    /// All rows of a user, in write order.
    pub fn subscriptions_of(&self, user_id: i64) -> Result<Vec<SubscriptionRecord>, InMemoryError> {
        let storage = self.entitlement_storage.read()?;
        let mut rows = storage
            .values()
            .filter(|stored| stored.record.user_id == user_id)
            .cloned()
            .collect::<Vec<_>>();
        rows.sort_by_key(|stored| stored.sequence);
        Ok(rows.into_iter().map(|stored| stored.record).collect())
    }

    pub fn cached_plan_count(&self) -> Result<usize, InMemoryError> {
        Ok(self.weekly_plan_storage.read()?.len())
    }
}

#[async_trait]
impl EntitlementStore for InMemoryContext {
    type AdapterError = InMemoryError;

    async fn upsert(
        &self,
        update: SubscriptionUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), Self::AdapterError> {
        let key = update.idempotency_key();
        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let mut storage = self.entitlement_storage.write()?;

        match storage.get_mut(&(update.user_id, key.clone())) {
            Some(stored) => {
                let record = &mut stored.record;
                record.sku = update.sku;
                record.status = update.status;
                record.expire_at = update.expire_at;
                if !update.original_transaction_id.is_empty() {
                    record.original_transaction_id = update.original_transaction_id;
                }
                record.updated_at = now;
                stored.sequence = sequence;
            }
            None => {
                let record = SubscriptionRecord {
                    user_id: update.user_id,
                    platform: update.platform,
                    sku: update.sku,
                    status: update.status,
                    expire_at: update.expire_at,
                    transaction_id: key.clone(),
                    original_transaction_id: update.original_transaction_id,
                    updated_at: now,
                };
                storage.insert(
                    (update.user_id, key),
                    StoredSubscription { record, sequence },
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl EntitlementRead for InMemoryContext {
    type AdapterError = InMemoryError;

    async fn is_active(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, Self::AdapterError> {
        Ok(self
            .entitlement_storage
            .read()?
            .values()
            .any(|stored| stored.record.user_id == user_id && stored.record.is_entitled(now)))
    }

    async fn list_active_user_ids(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, Self::AdapterError> {
        let storage = self.entitlement_storage.read()?;
        let mut user_ids = storage
            .values()
            .filter(|stored| stored.record.is_entitled(now))
            .map(|stored| stored.record.user_id)
            .collect::<Vec<_>>();
        user_ids.sort_unstable();
        user_ids.dedup();
        Ok(user_ids)
    }

    async fn latest(&self, user_id: i64) -> Result<Option<SubscriptionRecord>, Self::AdapterError> {
        Ok(self
            .entitlement_storage
            .read()?
            .values()
            .filter(|stored| stored.record.user_id == user_id)
            .max_by_key(|stored| (stored.record.updated_at, stored.sequence))
            .map(|stored| stored.record.clone()))
    }

    async fn count_distinct_subscribers(&self) -> Result<u64, Self::AdapterError> {
        let storage = self.entitlement_storage.read()?;
        let users = storage
            .keys()
            .map(|(user_id, _)| *user_id)
            .collect::<HashSet<_>>();
        Ok(users.len() as u64)
    }
}

#[async_trait]
impl UsageCounter for InMemoryContext {
    type AdapterError = InMemoryError;

    async fn count_usage(
        &self,
        user_id: i64,
        kind: UsageKind,
        window: &QuotaWindow,
    ) -> Result<u64, Self::AdapterError> {
        Ok(self
            .usage_storage
            .read()?
            .iter()
            .filter(|event| {
                event.user_id == user_id && event.kind == kind && window.contains(event.created_at)
            })
            .count() as u64)
    }
}

#[async_trait]
impl WeeklyPlanCache for InMemoryContext {
    type AdapterError = InMemoryError;

    async fn cached_plan(
        &self,
        key: &WeeklyPlanKey,
    ) -> Result<Option<WeeklyPlan>, Self::AdapterError> {
        Ok(self.weekly_plan_storage.read()?.get(key).cloned())
    }

    async fn store_plan(
        &self,
        key: &WeeklyPlanKey,
        plan: &WeeklyPlan,
    ) -> Result<(), Self::AdapterError> {
        self.weekly_plan_storage.write()?.insert(*key, plan.clone());
        Ok(())
    }
}

/// Plan generator returning a fixed plan and recording every request.
///
/// Weekdays listed in `failing_weekdays` fail, to exercise partial refreshes.
#[derive(Clone, Default)]
pub struct InMemoryPlanGenerator {
    requests: Arc<RwLock<Vec<WeeklyPlanKey>>>,
    failing_weekdays: HashSet<u8>,
}

impl InMemoryPlanGenerator {
    pub fn failing_on(weekdays: impl IntoIterator<Item = u8>) -> Self {
        Self {
            failing_weekdays: weekdays.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn requests(&self) -> Result<Vec<WeeklyPlanKey>, InMemoryError> {
        Ok(self.requests.read()?.clone())
    }
}

#[async_trait]
impl WeeklyPlanGenerator for InMemoryPlanGenerator {
    type AdapterError = InMemoryError;

    async fn generate_plan(
        &self,
        key: &WeeklyPlanKey,
        date: NaiveDate,
    ) -> Result<WeeklyPlan, Self::AdapterError> {
        self.requests.write()?.push(*key);
        if self.failing_weekdays.contains(&key.weekday) {
            return Err(InMemoryError::AdapterError {
                error: format!("generation failed for {date}"),
            });
        }
        Ok(WeeklyPlan {
            plan_meals: json!([{ "name": format!("plan {date}") }]),
            recommendations: json!([]),
        })
    }
}
