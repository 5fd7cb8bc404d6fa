// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    policy::PolicyList, MeteredAction, QuotaWindow, SubscriptionTier, UsageKind, UsageScope,
    UsageSnapshot,
};
use crate::{
    manager::adapters::{EntitlementRead, UsageCounter},
    Error,
};

/// Outcome of an admitted action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Admission {
    /// Credits left once the action is recorded, when a credit policy ran.
    pub remaining_credits: Option<u64>,
}

/// Free-tier view of one usage kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSummary {
    pub used: u64,
    pub limit: u64,
    pub remaining: u64,
    pub unlimited: bool,
}

/// Usage of the requested kinds within one window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageReport {
    pub is_subscriber: bool,
    pub usage: BTreeMap<UsageKind, UsageSummary>,
}

/// Runs admission policies over live usage counts.
pub struct QuotaLedger<E> {
    /// Context that implements adapters
    context: E,

    /// Policies evaluated in order for every metered action
    policies: PolicyList,

    /// Per-feature limit reported by the usage summary
    feature_limit: u64,
}

impl<E> QuotaLedger<E> {
    pub fn new(context: E, policies: impl Into<PolicyList>) -> Self {
        Self {
            context,
            policies: policies.into(),
            feature_limit: 1,
        }
    }

    /// Ledger with the free-tier feature cap and the tiered credit budget.
    pub fn with_default_policies(context: E) -> Self {
        Self::new(context, PolicyList::default())
    }

    pub fn context(&self) -> &E {
        &self.context
    }
}

impl<E> QuotaLedger<E>
where
    E: EntitlementRead + UsageCounter + Sync,
{
    async fn is_entitled(&self, user_id: i64, now: DateTime<Utc>) -> Result<bool, Error> {
        self.context
            .is_active(user_id, now)
            .await
            .map_err(|err| Error::AdapterError {
                source_error: anyhow::Error::new(err),
            })
    }

    async fn count(
        &self,
        user_id: i64,
        kind: UsageKind,
        window: &QuotaWindow,
    ) -> Result<u64, Error> {
        self.context
            .count_usage(user_id, kind, window)
            .await
            .map_err(|err| Error::AdapterError {
                source_error: anyhow::Error::new(err),
            })
    }

    /// Reads entitlement, tier and the three usage counts for `window`.
    pub async fn snapshot(
        &self,
        user_id: i64,
        window: &QuotaWindow,
        now: DateTime<Utc>,
    ) -> Result<UsageSnapshot, Error> {
        let entitled = self.is_entitled(user_id, now).await?;
        let latest = if entitled {
            self.context
                .latest(user_id)
                .await
                .map_err(|err| Error::AdapterError {
                    source_error: anyhow::Error::new(err),
                })?
        } else {
            None
        };

        let mut snapshot = UsageSnapshot {
            entitled,
            tier: SubscriptionTier::resolve(entitled, latest.as_ref()),
            menu_scans: 0,
            meal_photo_records: 0,
            chat_messages: 0,
        };
        for kind in UsageKind::ALL {
            *snapshot.count_mut(kind) = self.count(user_id, kind, window).await?;
        }
        Ok(snapshot)
    }

    /// Decides whether `user_id` may perform `action` now.
    ///
    /// Unmetered actions are admitted without any read.
    ///
    /// # Errors
    ///
    /// Returns [`Error::QuotaExceeded`] when a policy refuses the action and
    /// [`Error::AdapterError`] when entitlement or usage cannot be read.
    pub async fn admit(
        &self,
        user_id: i64,
        action: &MeteredAction,
        window: &QuotaWindow,
        now: DateTime<Utc>,
    ) -> Result<Admission, Error> {
        if !action.is_metered() {
            return Ok(Admission::default());
        }
        let snapshot = self.snapshot(user_id, window, now).await?;
        match self.policies.evaluate(action, &snapshot) {
            Ok(remaining_credits) => Ok(Admission { remaining_credits }),
            Err(denial) => {
                log::debug!("Quota denied for user {user_id}: {denial}");
                Err(denial.into())
            }
        }
    }

    /// Per-kind free-tier usage within `window`.
    pub async fn usage_summary(
        &self,
        user_id: i64,
        scope: UsageScope,
        window: &QuotaWindow,
        now: DateTime<Utc>,
    ) -> Result<UsageReport, Error> {
        let is_subscriber = self.is_entitled(user_id, now).await?;
        let mut usage = BTreeMap::new();
        for kind in scope.kinds() {
            let used = self.count(user_id, kind, window).await?;
            usage.insert(
                kind,
                UsageSummary {
                    used,
                    limit: self.feature_limit,
                    remaining: self.feature_limit.saturating_sub(used),
                    unlimited: is_subscriber,
                },
            );
        }
        Ok(UsageReport {
            is_subscriber,
            usage,
        })
    }
}
