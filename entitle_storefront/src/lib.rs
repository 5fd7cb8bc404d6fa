// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! # Storefront receipt verification
//!
//! Turns what a client presents as proof of purchase into a
//! [`ReceiptInfo`](entitle_core::record::ReceiptInfo) the entitlement manager
//! can persist. The storefront is reached through the [`api::StorefrontApi`]
//! trait, so the verification rules in [`verifier::ReceiptVerifier`] can be
//! exercised against a mock storefront.
//!
//! # Example
//! ```rust,no_run
//! # async fn example() -> Result<(), entitle_storefront::VerifyError> {
//! use entitle_storefront::{
//!     api::{HttpStorefrontApi, StorefrontEndpoints},
//!     verifier::ReceiptVerifier,
//! };
//!
//! let api = HttpStorefrontApi::new(StorefrontEndpoints::default())?;
//! let verifier = ReceiptVerifier::new(api).with_shared_secret("shared-secret");
//!
//! let info = verifier.verify("MIIT...", Some("pro.monthly")).await?;
//! println!("{} expires at {:?}", info.transaction_id, info.expires_at());
//! # Ok(())
//! # }
//! ```

pub mod api;
mod error;
pub mod selection;
pub mod verifier;

pub use error::VerifyError;
