// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;

use crate::quota::{QuotaWindow, UsageKind};

/// Counts metered records created by a user.
///
/// The records themselves are written by the features that produce them
/// (menu scans, photo meal records, chat messages); this adapter only reads.
#[async_trait]
pub trait UsageCounter {
    /// Defines the user-specified error type.
    ///
    /// This error type should implement the `Error` and `Debug` traits from the standard library.
    /// Errors of this type are returned to the user when an operation fails.
    type AdapterError: std::error::Error + std::fmt::Debug + Send + Sync + 'static;

    /// Number of `kind` records of the user created within `[window.start, window.end)`.
    async fn count_usage(
        &self,
        user_id: i64,
        kind: UsageKind,
        window: &QuotaWindow,
    ) -> Result<u64, Self::AdapterError>;
}
