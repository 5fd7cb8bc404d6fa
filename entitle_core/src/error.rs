// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! Error type returned by the entitlement managers.

use crate::quota::QuotaDenial;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Error returned by a user supplied adapter.
    #[error("Error from adapter.\n Caused by: {source_error}")]
    AdapterError { source_error: anyhow::Error },

    /// The metered action was refused by an admission policy.
    #[error(transparent)]
    QuotaExceeded(#[from] QuotaDenial),
}
