// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! # Admission policies
//!
//! A policy looks at one [`UsageSnapshot`] and either admits the action or
//! returns a [`QuotaDenial`]. Policies are pure: all reads happen before they run.
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use entitle_core::quota::{
//!     policy::{AdmissionCheck, AdmissionPolicy, PolicyList},
//!     MeteredAction, QuotaDenial, UsageSnapshot,
//! };
//!
//! struct NoChatOnFreeTier;
//!
//! impl AdmissionPolicy for NoChatOnFreeTier {
//!     fn admit(
//!         &self,
//!         action: &MeteredAction,
//!         usage: &UsageSnapshot,
//!     ) -> Result<Option<u64>, QuotaDenial> {
//!         // Implement your policy here
//!         Ok(None)
//!     }
//! }
//!
//! let my_policy: AdmissionCheck = Arc::new(NoChatOnFreeTier);
//! let policies = PolicyList::new(vec![my_policy]);
//! assert_eq!(policies.len(), 1);
//! ```

use std::{ops::Deref, sync::Arc};

use super::{MeteredAction, QuotaDenial, UsageSnapshot};

/// Shared handle to a policy.
pub type AdmissionCheck = Arc<dyn AdmissionPolicy>;

/// Decides whether a metered action may run.
pub trait AdmissionPolicy: Send + Sync {
    /// Returns the credits left after the action when the policy tracks
    /// credits, `None` when it admits without an opinion on credits.
    fn admit(
        &self,
        action: &MeteredAction,
        usage: &UsageSnapshot,
    ) -> Result<Option<u64>, QuotaDenial>;
}

/// PolicyList is a NewType pattern to store an ordered list of policies.
#[derive(Clone)]
pub struct PolicyList(Arc<[AdmissionCheck]>);

impl PolicyList {
    pub fn new(policies: Vec<AdmissionCheck>) -> Self {
        Self(policies.into())
    }

    pub fn empty() -> Self {
        Self(Arc::new([]))
    }

    /// Runs every policy in order and stops at the first denial.
    ///
    /// The reported remaining credits come from the last policy that tracks them.
    pub fn evaluate(
        &self,
        action: &MeteredAction,
        usage: &UsageSnapshot,
    ) -> Result<Option<u64>, QuotaDenial> {
        let mut remaining = None;
        for policy in self.iter() {
            if let Some(left) = policy.admit(action, usage)? {
                remaining = Some(left);
            }
        }
        Ok(remaining)
    }
}

impl Default for PolicyList {
    /// Free-tier feature cap followed by the tiered credit budget.
    fn default() -> Self {
        let feature_cap: AdmissionCheck = Arc::new(FeatureCapPolicy::default());
        let credit_budget: AdmissionCheck = Arc::new(CreditBudgetPolicy);
        Self::new(vec![feature_cap, credit_budget])
    }
}

impl Deref for PolicyList {
    type Target = [AdmissionCheck];

    fn deref(&self) -> &Self::Target {
        self.0.as_ref()
    }
}

impl From<Vec<AdmissionCheck>> for PolicyList {
    fn from(policies: Vec<AdmissionCheck>) -> Self {
        Self::new(policies)
    }
}

/// Caps each capped feature at `limit` uses per window for users without an
/// entitlement. Entitled users are exempt.
#[derive(Debug, Clone, Copy)]
pub struct FeatureCapPolicy {
    pub limit: u64,
}

impl Default for FeatureCapPolicy {
    fn default() -> Self {
        Self { limit: 1 }
    }
}

impl AdmissionPolicy for FeatureCapPolicy {
    fn admit(
        &self,
        action: &MeteredAction,
        usage: &UsageSnapshot,
    ) -> Result<Option<u64>, QuotaDenial> {
        let Some(kind) = action.feature_cap else {
            return Ok(None);
        };
        if usage.entitled {
            return Ok(None);
        }
        let used = usage.count(kind);
        if used >= self.limit {
            return Err(QuotaDenial::FeatureCapReached {
                kind,
                used,
                limit: self.limit,
            });
        }
        Ok(None)
    }
}

/// Charges the action's credit cost against the tier's daily budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct CreditBudgetPolicy;

impl CreditBudgetPolicy {
    /// Remaining credits after spending `cost`, or the denial.
    pub fn check(budget: u64, consumed: u64, cost: u64) -> Result<u64, QuotaDenial> {
        let after = consumed.saturating_add(cost);
        if after > budget {
            return Err(QuotaDenial::CreditsExhausted {
                budget,
                consumed,
                cost,
            });
        }
        Ok(budget - after)
    }
}

impl AdmissionPolicy for CreditBudgetPolicy {
    fn admit(
        &self,
        action: &MeteredAction,
        usage: &UsageSnapshot,
    ) -> Result<Option<u64>, QuotaDenial> {
        if action.credit_cost == 0 {
            return Ok(None);
        }
        Self::check(
            usage.tier.daily_budget(),
            usage.consumed_credits(),
            action.credit_cost,
        )
        .map(Some)
    }
}
