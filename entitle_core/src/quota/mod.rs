// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! # Usage quotas
//!
//! Two independent throttles guard every metered action:
//!
//! - a per-feature daily cap for users without an entitlement
//!   ([`policy::FeatureCapPolicy`]);
//! - a daily credit budget sized by subscription tier
//!   ([`policy::CreditBudgetPolicy`]).
//!
//! Both are [`policy::AdmissionPolicy`] implementations evaluated in order by
//! the [`QuotaLedger`]; the first denial wins. Nothing is reserved: usage is
//! read, a decision is made, and the action records its own usage later. Two
//! concurrent requests may therefore both be admitted on the same reading.

mod ledger;
pub mod policy;
mod window;

use std::str::FromStr;

use serde::{Deserialize, Serialize};

pub use ledger::{Admission, QuotaLedger, UsageReport, UsageSummary};
pub use window::{parse_client_time, QuotaWindow};

use crate::record::SubscriptionRecord;

/// Independently counted metered resources.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::AsRefStr,
)]
pub enum UsageKind {
    /// A menu photo parsed into dishes.
    #[serde(rename = "menu_scan")]
    #[strum(serialize = "menu_scan")]
    MenuScan,
    /// A meal recorded from a food photo.
    #[serde(rename = "meal_record")]
    #[strum(serialize = "meal_record")]
    MealPhotoRecord,
    /// A question sent to the assistant.
    #[serde(rename = "question")]
    #[strum(serialize = "question")]
    ChatMessage,
}

impl UsageKind {
    pub const ALL: [UsageKind; 3] = [Self::MenuScan, Self::MealPhotoRecord, Self::ChatMessage];

    /// Credits one recorded use of this kind consumes from the daily budget.
    pub fn credit_weight(self) -> u64 {
        match self {
            Self::MenuScan => 8,
            Self::MealPhotoRecord => 3,
            Self::ChatMessage => 5,
        }
    }
}

/// Usage kinds requested from the usage report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageScope {
    All,
    Single(UsageKind),
}

impl UsageScope {
    pub fn kinds(self) -> Vec<UsageKind> {
        match self {
            Self::All => UsageKind::ALL.to_vec(),
            Self::Single(kind) => vec![kind],
        }
    }
}

impl FromStr for UsageScope {
    type Err = strum::ParseError;

    /// Empty input means all kinds.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let value = raw.trim().to_lowercase();
        match value.as_str() {
            "" | "all" => Ok(Self::All),
            other => other.parse().map(Self::Single),
        }
    }
}

const VISION_PATHS: &[&str] = &[
    "/menu/parse",
    "/menu/scan",
    "/meals/photo",
    "/meals/analyze",
    "/ingredients/scan",
    "/discover/recommendations",
    "/discover/replace",
    "/discover/weekly/generate",
    "/oss/sts",
    "/oss/sign",
];
const CHAT_PATHS: &[&str] = &["/chat/messages", "/chat/complete"];
const FEATURE_CAPS: &[(&str, UsageKind)] = &[
    ("/menu/scan", UsageKind::MenuScan),
    ("/meals/photo", UsageKind::MealPhotoRecord),
    ("/chat/complete", UsageKind::ChatMessage),
];

/// Quota relevant classification of a request path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MeteredAction {
    /// Credits charged against the daily budget.
    pub credit_cost: u64,
    /// Resource whose free-tier daily cap applies.
    pub feature_cap: Option<UsageKind>,
}

impl MeteredAction {
    pub const VISION_COST: u64 = 8;
    pub const CHAT_COST: u64 = 5;

    /// Classifies a route path, case-insensitively. Unknown paths are unmetered.
    pub fn for_path(path: &str) -> Self {
        let path = path.to_lowercase();
        let credit_cost = if VISION_PATHS.iter().any(|p| path.contains(p)) {
            Self::VISION_COST
        } else if CHAT_PATHS.iter().any(|p| path.contains(p)) {
            Self::CHAT_COST
        } else {
            0
        };
        let feature_cap = FEATURE_CAPS
            .iter()
            .find(|(prefix, _)| path.contains(prefix))
            .map(|(_, kind)| *kind);
        Self {
            credit_cost,
            feature_cap,
        }
    }

    pub fn is_metered(&self) -> bool {
        self.credit_cost > 0 || self.feature_cap.is_some()
    }
}

/// Daily credit tier of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum SubscriptionTier {
    Free,
    Monthly,
    Yearly,
}

impl SubscriptionTier {
    /// Paid tiers need a live entitlement; the SKU of the latest row only picks
    /// between them, and a paid user without any row gets the monthly budget.
    pub fn resolve(entitled: bool, latest: Option<&SubscriptionRecord>) -> Self {
        if !entitled {
            return Self::Free;
        }
        match latest {
            Some(record) if record.sku.to_lowercase().contains("year") => Self::Yearly,
            _ => Self::Monthly,
        }
    }

    pub fn daily_budget(self) -> u64 {
        match self {
            Self::Free => 30,
            Self::Monthly => 600,
            Self::Yearly => 2000,
        }
    }
}

/// Usage read for one admission decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsageSnapshot {
    pub entitled: bool,
    pub tier: SubscriptionTier,
    pub menu_scans: u64,
    pub meal_photo_records: u64,
    pub chat_messages: u64,
}

impl UsageSnapshot {
    pub fn count(&self, kind: UsageKind) -> u64 {
        match kind {
            UsageKind::MenuScan => self.menu_scans,
            UsageKind::MealPhotoRecord => self.meal_photo_records,
            UsageKind::ChatMessage => self.chat_messages,
        }
    }

    fn count_mut(&mut self, kind: UsageKind) -> &mut u64 {
        match kind {
            UsageKind::MenuScan => &mut self.menu_scans,
            UsageKind::MealPhotoRecord => &mut self.meal_photo_records,
            UsageKind::ChatMessage => &mut self.chat_messages,
        }
    }

    /// Credits consumed so far in the window.
    pub fn consumed_credits(&self) -> u64 {
        UsageKind::ALL
            .iter()
            .map(|kind| kind.credit_weight() * self.count(*kind))
            .sum()
    }
}

/// Why a metered action was refused.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum QuotaDenial {
    #[error("daily {kind} limit reached ({used}/{limit})")]
    FeatureCapReached {
        kind: UsageKind,
        used: u64,
        limit: u64,
    },
    #[error("daily credits exhausted ({consumed} used, {cost} requested, budget {budget})")]
    CreditsExhausted {
        budget: u64,
        consumed: u64,
        cost: u64,
    },
}
