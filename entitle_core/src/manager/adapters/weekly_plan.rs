// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::record::{WeeklyPlan, WeeklyPlanKey};

/// Persists generated day plans keyed by `(user_id, week_start, weekday)`.
#[async_trait]
pub trait WeeklyPlanCache {
    /// Defines the user-specified error type.
    ///
    /// This error type should implement the `Error` and `Debug` traits from the standard library.
    /// Errors of this type are returned to the user when an operation fails.
    type AdapterError: std::error::Error + std::fmt::Debug + Send + Sync + 'static;

    async fn cached_plan(
        &self,
        key: &WeeklyPlanKey,
    ) -> Result<Option<WeeklyPlan>, Self::AdapterError>;

    /// Idempotent: storing twice under one key keeps the last plan.
    async fn store_plan(
        &self,
        key: &WeeklyPlanKey,
        plan: &WeeklyPlan,
    ) -> Result<(), Self::AdapterError>;
}

/// Produces the plan of one day for one user.
#[async_trait]
pub trait WeeklyPlanGenerator {
    type AdapterError: std::error::Error + std::fmt::Debug + Send + Sync + 'static;

    async fn generate_plan(
        &self,
        key: &WeeklyPlanKey,
        date: NaiveDate,
    ) -> Result<WeeklyPlan, Self::AdapterError>;
}
