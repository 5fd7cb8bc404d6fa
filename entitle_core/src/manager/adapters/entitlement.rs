// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::record::{SubscriptionRecord, SubscriptionUpdate};

/// Writes entitlement rows.
///
/// # Example
///
/// For example code see [crate::manager::context::memory::InMemoryContext]
#[async_trait]
pub trait EntitlementStore {
    /// Defines the user-specified error type.
    ///
    /// This error type should implement the `Error` and `Debug` traits from the standard library.
    /// Errors of this type are returned to the user when an operation fails.
    type AdapterError: std::error::Error + std::fmt::Debug + Send + Sync + 'static;

    /// Inserts or updates the row keyed by `(user_id, update.idempotency_key())`.
    ///
    /// On conflict `sku`, `status` and `expire_at` are overwritten, the stored
    /// `original_transaction_id` is kept unless the update carries a non-empty one,
    /// and `updated_at` is set to `now`. Rows are never deleted.
    async fn upsert(
        &self,
        update: SubscriptionUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), Self::AdapterError>;
}

/// Reads entitlement rows.
///
/// # Example
///
/// For example code see [crate::manager::context::memory::InMemoryContext]
#[async_trait]
pub trait EntitlementRead {
    /// Defines the user-specified error type.
    ///
    /// This error type should implement the `Error` and `Debug` traits from the standard library.
    /// Errors of this type are returned to the user when an operation fails.
    type AdapterError: std::error::Error + std::fmt::Debug + Send + Sync + 'static;

    /// True iff the user has a row with status `active` whose expiry is unset or after `now`.
    async fn is_active(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool, Self::AdapterError>;

    /// Distinct users for which [`EntitlementRead::is_active`] holds.
    async fn list_active_user_ids(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, Self::AdapterError>;

    /// Most recently updated row of the user, if any.
    ///
    /// Only used to pick a quota tier; entitlement is decided by `is_active`.
    async fn latest(&self, user_id: i64) -> Result<Option<SubscriptionRecord>, Self::AdapterError>;

    /// Number of distinct users that ever stored a row.
    async fn count_distinct_subscribers(&self) -> Result<u64, Self::AdapterError>;
}
