// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! # Storefront compact tokens
//!
//! This crate handles the two kinds of compact signed tokens exchanged with the
//! storefront:
//!
//! - signed transactions submitted by clients (or returned by the transaction
//!   lookup API), see [`codec`] and [`verifier`];
//! - short-lived service tokens used to authenticate against the lookup API,
//!   see [`issuer`].
//!
//! # Example
//! ```rust
//! use entitle_jws::codec::{classify, ReceiptFormat, SignedTransactionClaims};
//! use entitle_jws::verifier::{TokenVerifier, UnverifiedTokenVerifier};
//! use entitle_jws::StorefrontEnvironment;
//!
//! let token = "eyJhbGciOiJFUzI1NiJ9.\
//!     eyJ0cmFuc2FjdGlvbklkIjoiMjAwMDAwMDEyMyIsImVudmlyb25tZW50IjoiU2FuZGJveCJ9.\
//!     c2lnbmF0dXJl";
//! assert_eq!(classify(token), ReceiptFormat::Signed);
//!
//! let claims = UnverifiedTokenVerifier.verify(token).unwrap();
//! let transaction = SignedTransactionClaims::from_claims(&claims).unwrap();
//!
//! assert_eq!(transaction.transaction_id, "2000000123");
//! assert_eq!(transaction.environment, Some(StorefrontEnvironment::Sandbox));
//! ```
//!

pub mod codec;
mod error;
pub mod issuer;
pub mod verifier;

pub use error::JwsError;

/// Storefront environment a transaction belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum StorefrontEnvironment {
    #[default]
    Production,
    Sandbox,
}

impl StorefrontEnvironment {
    /// Parses an environment hint, case-insensitively.
    ///
    /// Unknown or empty hints return `None`, leaving the caller on its default order.
    pub fn from_hint(hint: &str) -> Option<Self> {
        let hint = hint.trim();
        if hint.eq_ignore_ascii_case("sandbox") {
            Some(Self::Sandbox)
        } else if hint.eq_ignore_ascii_case("production") {
            Some(Self::Production)
        } else {
            None
        }
    }

    /// Order in which environments should be tried when this one is preferred.
    pub fn preferred_order(hint: Option<Self>) -> [Self; 2] {
        match hint {
            Some(Self::Sandbox) => [Self::Sandbox, Self::Production],
            _ => [Self::Production, Self::Sandbox],
        }
    }
}

impl std::fmt::Display for StorefrontEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Production => write!(f, "Production"),
            Self::Sandbox => write!(f, "Sandbox"),
        }
    }
}
