// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! Service token minting for the storefront lookup API.
//!
//! The private key is read from disk the first time a token is requested and
//! held for the lifetime of the [`StorefrontTokenIssuer`]. A failed load is
//! remembered too: a misconfigured key is a fixed condition, so every later
//! call returns the same [`JwsError::KeyLoad`] without touching the disk again.

use std::{
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use jsonwebtoken::{Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::JwsError;

/// Audience expected by the storefront server API.
pub const SERVICE_TOKEN_AUDIENCE: &str = "appstoreconnect-v1";

/// Lifetime of a minted service token, in seconds.
pub const SERVICE_TOKEN_TTL_SECS: i64 = 15 * 60;

/// Storefront credentials needed to mint service tokens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerConfig {
    pub issuer_id: String,
    pub key_id: String,
    pub bundle_id: String,
    pub private_key_path: PathBuf,
}

impl IssuerConfig {
    /// Returns the name of the first empty setting, if any.
    pub fn missing_field(&self) -> Option<&'static str> {
        if self.issuer_id.trim().is_empty() {
            Some("issuer id")
        } else if self.key_id.trim().is_empty() {
            Some("key id")
        } else if self.bundle_id.trim().is_empty() {
            Some("bundle id")
        } else if self.private_key_path.as_os_str().is_empty() {
            Some("private key path")
        } else {
            None
        }
    }
}

/// Claims carried by a service token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceTokenClaims {
    pub iss: String,
    pub iat: i64,
    pub exp: i64,
    pub aud: String,
    pub bid: String,
}

/// Mints ES256 service tokens, loading the signing key at most once.
pub struct StorefrontTokenIssuer {
    config: IssuerConfig,
    key: OnceCell<Result<EncodingKey, JwsError>>,
}

impl std::fmt::Debug for StorefrontTokenIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorefrontTokenIssuer")
            .field("config", &self.config)
            .field("key_loaded", &self.key.initialized())
            .finish()
    }
}

impl StorefrontTokenIssuer {
    pub fn new(config: IssuerConfig) -> Self {
        Self {
            config,
            key: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &IssuerConfig {
        &self.config
    }

    /// Mints a service token issued now.
    pub async fn issue(&self) -> Result<String, JwsError> {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs() as i64)
            .unwrap_or_default();
        self.issue_at(now).await
    }

    /// Mints a service token with `iat` set to `issued_at` (unix seconds).
    ///
    /// # Errors
    ///
    /// Returns [`JwsError::KeyLoad`] if the key cannot be read or is not an EC
    /// private key, and [`JwsError::Signing`] if signing fails.
    pub async fn issue_at(&self, issued_at: i64) -> Result<String, JwsError> {
        let key = self.signing_key().await?;

        let mut header = Header::new(Algorithm::ES256);
        header.kid = Some(self.config.key_id.clone());

        let claims = ServiceTokenClaims {
            iss: self.config.issuer_id.clone(),
            iat: issued_at,
            exp: issued_at + SERVICE_TOKEN_TTL_SECS,
            aud: SERVICE_TOKEN_AUDIENCE.to_string(),
            bid: self.config.bundle_id.clone(),
        };

        jsonwebtoken::encode(&header, &claims, key)
            .map_err(|err| JwsError::Signing(err.to_string()))
    }

    async fn signing_key(&self) -> Result<&EncodingKey, JwsError> {
        self.key
            .get_or_init(|| load_signing_key(&self.config.private_key_path))
            .await
            .as_ref()
            .map_err(Clone::clone)
    }
}

/// Candidate locations for a key path.
///
/// Relative paths are also tried one directory up, so a service started from a
/// sub-directory of its deployment still finds the key shipped next to it.
fn key_path_candidates(path: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![path.to_path_buf()];
    if path.is_relative() {
        candidates.push(Path::new("..").join(path));
    }
    candidates
}

async fn load_signing_key(path: &Path) -> Result<EncodingKey, JwsError> {
    let mut last_error = None;
    for candidate in key_path_candidates(path) {
        match tokio::fs::read(&candidate).await {
            Ok(pem) => {
                log::debug!(
                    "Loading storefront signing key from {}",
                    candidate.display()
                );
                return EncodingKey::from_ec_pem(&pem).map_err(|err| {
                    JwsError::KeyLoad(format!("{}: {err}", candidate.display()))
                });
            }
            Err(err) => last_error = Some(format!("{}: {err}", candidate.display())),
        }
    }
    let error = JwsError::KeyLoad(last_error.unwrap_or_else(|| "no key path".to_string()));
    log::error!("{error}");
    Err(error)
}
