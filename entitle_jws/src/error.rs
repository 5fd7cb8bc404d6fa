// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

/// Errors returned while decoding, verifying or minting compact tokens.
///
/// Cloneable so that a failed key load can be cached and handed to every caller.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum JwsError {
    /// The token is not a well formed compact token or misses required claims.
    #[error("malformed token: {0}")]
    MalformedToken(String),

    /// The storefront signing key could not be read or is not an EC private key.
    #[error("failed to load storefront signing key: {0}")]
    KeyLoad(String),

    /// The service token could not be signed.
    #[error("failed to sign service token: {0}")]
    Signing(String),

    /// The token signature does not verify against the configured key.
    #[error("token signature check failed: {0}")]
    InvalidSignature(String),
}
