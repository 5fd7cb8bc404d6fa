// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! Trust decisions for signed transactions.
//!
//! The storefront signs transactions with a certificate chain carried in the
//! token header. [`UnverifiedTokenVerifier`] reads the claims without any check
//! and relies on the transaction lookup being authenticated by the service token.
//! [`PinnedKeyVerifier`] checks the ES256 signature against one configured key.

use std::collections::HashSet;

use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, Validation};

use crate::{
    codec::{decode_unverified_claims, Claims},
    JwsError,
};

/// Turns a compact token into a claim map, applying some trust policy.
pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> Result<Claims, JwsError>;
}

/// Accepts any well formed token.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnverifiedTokenVerifier;

impl TokenVerifier for UnverifiedTokenVerifier {
    fn verify(&self, token: &str) -> Result<Claims, JwsError> {
        decode_unverified_claims(token)
    }
}

/// Accepts tokens carrying a valid ES256 signature from a pinned public key.
pub struct PinnedKeyVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl PinnedKeyVerifier {
    /// Builds a verifier from a PEM encoded EC public key.
    pub fn from_pem(pem: &[u8]) -> Result<Self, JwsError> {
        let key = DecodingKey::from_ec_pem(pem).map_err(|err| JwsError::KeyLoad(err.to_string()))?;

        // Transactions carry their own expiry semantics and no audience.
        let mut validation = Validation::new(Algorithm::ES256);
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims = HashSet::new();

        Ok(Self { key, validation })
    }
}

impl TokenVerifier for PinnedKeyVerifier {
    fn verify(&self, token: &str) -> Result<Claims, JwsError> {
        jsonwebtoken::decode::<Claims>(token, &self.key, &self.validation)
            .map(|data| data.claims)
            .map_err(|err| match err.kind() {
                ErrorKind::InvalidSignature
                | ErrorKind::InvalidAlgorithm
                | ErrorKind::InvalidEcdsaKey => JwsError::InvalidSignature(err.to_string()),
                _ => JwsError::MalformedToken(err.to_string()),
            })
    }
}
