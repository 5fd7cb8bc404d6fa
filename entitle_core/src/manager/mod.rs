// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! The `manager` module turns storefront verification results into durable
//! entitlement rows.
//!
//! The [`EntitlementManager`] uses user-defined adapters (see [adapters]) for
//! storage. Any database can back it as long as it implements
//! [`adapters::EntitlementStore`] and [`adapters::EntitlementRead`].

pub mod adapters;
pub mod context;
mod entitlement_manager;

pub use entitlement_manager::EntitlementManager;
