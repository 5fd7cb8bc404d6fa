// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! Keys and token helpers shared by the end-to-end tests.

use anyhow::Result;
use jsonwebtoken::{Algorithm, EncodingKey, Header};

/// PKCS#8 key used both to sign transactions and to mint service tokens.
pub const STOREFRONT_KEY_PATH: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../entitle_jws/testdata/storefront_key.p8"
);

/// Public half of [`STOREFRONT_KEY_PATH`].
pub const STOREFRONT_PUBLIC_KEY_PATH: &str = concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/../entitle_jws/testdata/storefront_key.pub.pem"
);

pub const SHARED_SECRET: &str = "integration-shared-secret";
pub const BUNDLE_ID: &str = "com.example.eatclean";

/// Signs `claims` as the storefront would sign a transaction.
pub fn sign_transaction(claims: &serde_json::Value) -> Result<String> {
    let key = EncodingKey::from_ec_pem(&std::fs::read(STOREFRONT_KEY_PATH)?)?;
    let header = Header::new(Algorithm::ES256);
    Ok(jsonwebtoken::encode(&header, claims, &key)?)
}
