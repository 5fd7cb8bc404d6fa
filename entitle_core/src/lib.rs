// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! # Entitlement core
//!
//! Durable subscription state, daily usage quotas and the nightly weekly plan
//! refresh.
//!
//! - [`manager`] holds the storage adapters and the [`manager::EntitlementManager`],
//!   which turns a verified receipt into a persisted [`record::SubscriptionRecord`].
//! - [`quota`] decides whether a metered action is admitted right now.
//! - [`scheduler`] pre-generates next week's plans for entitled users.
//!
//! ## Getting started
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use chrono::{Duration, Utc};
//! use entitle_core::{
//!     manager::{adapters::EntitlementRead, context::memory::InMemoryContext, EntitlementManager},
//!     record::{ReceiptInfo, VerificationRequest},
//! };
//!
//! let manager = EntitlementManager::new(InMemoryContext::default());
//! let now = Utc::now();
//! let info = ReceiptInfo {
//!     product_id: "pro.yearly".to_string(),
//!     transaction_id: "2000000123".to_string(),
//!     original_transaction_id: String::new(),
//!     expires_at_millis: Some((now + Duration::days(30)).timestamp_millis()),
//! };
//!
//! let outcome = manager
//!     .record_verification(&VerificationRequest::new(7, "pro.yearly"), Some(&info), now)
//!     .await;
//!
//! assert!(outcome.active);
//! assert_eq!(outcome.subscriber_rank, 1);
//! assert!(manager.context().is_active(7, now).await.unwrap());
//! # }
//! ```

mod error;
pub mod manager;
pub mod quota;
pub mod record;
pub mod scheduler;

pub use error::Error;
