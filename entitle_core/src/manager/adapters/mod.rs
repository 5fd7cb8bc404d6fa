// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! Context adapters for the entitlement managers.
//!
//! Each adapter should be defined by the user of the library based on their
//! specific storage and generation requirements. This allows the managers to be
//! backed by any database or service.
//!
//! # Adapters
//!
//! - [`EntitlementStore`] / [`EntitlementRead`]: durable subscription rows.
//! - [`UsageCounter`]: daily counts of metered records.
//! - [`WeeklyPlanCache`] / [`WeeklyPlanGenerator`]: storage and production of
//!   day plans for the refresh scheduler.
//!
//! For reference implementations see [crate::manager::context].

mod entitlement;
mod usage;
mod weekly_plan;

pub use entitlement::{EntitlementRead, EntitlementStore};
pub use usage::UsageCounter;
pub use weekly_plan::{WeeklyPlanCache, WeeklyPlanGenerator};
