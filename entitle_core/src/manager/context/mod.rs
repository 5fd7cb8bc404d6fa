// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! Reference adapter implementations.
//!
//! - [`memory`] keeps everything in process, for tests and development.
//! - `sql` persists to PostgreSQL or SQLite through `sqlx` (feature `sql`).

#[cfg(feature = "in_memory")]
pub mod memory;
#[cfg(feature = "sql")]
pub mod sql;
