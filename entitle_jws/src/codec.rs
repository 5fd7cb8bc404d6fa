// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! Classification and unverified decoding of client supplied receipts.
//!
//! A receipt is either an opaque legacy blob, forwarded as-is to the legacy
//! verification endpoint, or a compact signed token (`header.payload.signature`).
//! The payload of a signed token can be read without checking its signature,
//! which is all the transaction lookup flow needs to locate the transaction.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde_json::Value;

use crate::{JwsError, StorefrontEnvironment};

/// Claim map of a decoded token payload.
pub type Claims = serde_json::Map<String, Value>;

/// Shape of a client supplied receipt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiptFormat {
    /// Opaque base64 receipt accepted by the legacy verification endpoint.
    Legacy,
    /// Compact signed token.
    Signed,
}

/// Treats any input with at least two `.` separators as a signed token.
pub fn classify(receipt: &str) -> ReceiptFormat {
    if receipt.matches('.').count() >= 2 {
        ReceiptFormat::Signed
    } else {
        ReceiptFormat::Legacy
    }
}

/// Decodes the payload segment of a compact token without verifying its signature.
///
/// # Errors
///
/// Returns [`JwsError::MalformedToken`] if the token has fewer than two segments,
/// if the payload is not valid base64url, or if it does not decode to a JSON object.
pub fn decode_unverified_claims(token: &str) -> Result<Claims, JwsError> {
    let mut segments = token.split('.');
    let payload = match (segments.next(), segments.next()) {
        (Some(_), Some(payload)) => payload,
        _ => {
            return Err(JwsError::MalformedToken(
                "expected at least two segments".to_string(),
            ))
        }
    };

    let bytes = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .map_err(|err| JwsError::MalformedToken(format!("payload is not base64url: {err}")))?;

    serde_json::from_slice::<Claims>(&bytes)
        .map_err(|err| JwsError::MalformedToken(format!("payload is not a JSON object: {err}")))
}

/// Returns the first non-empty string value among `keys`.
///
/// Numbers are rendered to their decimal form, since some producers send ids as numbers.
pub fn read_string(claims: &Claims, keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| match claims.get(*key) {
        Some(Value::String(value)) if !value.trim().is_empty() => Some(value.trim().to_string()),
        Some(Value::Number(value)) => Some(value.to_string()),
        _ => None,
    })
}

/// Returns the first integer value among `keys`, accepting numbers and numeric strings.
pub fn read_i64(claims: &Claims, keys: &[&str]) -> Option<i64> {
    keys.iter().find_map(|key| match claims.get(*key) {
        Some(Value::Number(value)) => value
            .as_i64()
            .or_else(|| value.as_f64().map(|value| value as i64)),
        Some(Value::String(value)) => value.trim().parse::<i64>().ok(),
        _ => None,
    })
}

const TRANSACTION_ID_KEYS: &[&str] = &[
    "transactionId",
    "transaction_id",
    "originalTransactionId",
    "original_transaction_id",
];
const ORIGINAL_TRANSACTION_ID_KEYS: &[&str] = &["originalTransactionId", "original_transaction_id"];
const PRODUCT_ID_KEYS: &[&str] = &["productId", "product_id"];
const EXPIRES_KEYS: &[&str] = &["expiresDate", "expiresDateMs", "expires_date_ms"];

/// Fields of a signed transaction that the verification flow relies on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedTransactionClaims {
    pub transaction_id: String,
    pub original_transaction_id: Option<String>,
    pub product_id: Option<String>,
    pub environment: Option<StorefrontEnvironment>,
    pub expires_date_ms: Option<i64>,
}

impl SignedTransactionClaims {
    /// Extracts the transaction fields from a claim map.
    ///
    /// # Errors
    ///
    /// Returns [`JwsError::MalformedToken`] when no transaction id can be found.
    pub fn from_claims(claims: &Claims) -> Result<Self, JwsError> {
        let transaction_id = read_string(claims, TRANSACTION_ID_KEYS).ok_or_else(|| {
            JwsError::MalformedToken("token carries no transaction id".to_string())
        })?;

        Ok(Self {
            transaction_id,
            original_transaction_id: read_string(claims, ORIGINAL_TRANSACTION_ID_KEYS),
            product_id: read_string(claims, PRODUCT_ID_KEYS),
            environment: read_string(claims, &["environment"])
                .as_deref()
                .and_then(StorefrontEnvironment::from_hint),
            expires_date_ms: read_i64(claims, EXPIRES_KEYS),
        })
    }
}

#[cfg(test)]
mod tests {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rstest::*;
    use serde_json::json;

    use super::*;

    fn token_for(payload: serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES256"}"#);
        let payload = URL_SAFE_NO_PAD.encode(payload.to_string());
        format!("{header}.{payload}.c2ln")
    }

    #[rstest]
    #[case::legacy_base64("MIIT0gYJKoZIhvcNAQcCoIITwzCCE78CAQEx", ReceiptFormat::Legacy)]
    #[case::one_dot("abc.def", ReceiptFormat::Legacy)]
    #[case::two_dots("a.b.c", ReceiptFormat::Signed)]
    #[case::empty_segments("..", ReceiptFormat::Signed)]
    #[case::empty("", ReceiptFormat::Legacy)]
    fn classify_by_separators(#[case] receipt: &str, #[case] expected: ReceiptFormat) {
        assert_eq!(classify(receipt), expected);
    }

    #[test]
    fn decode_reads_payload() {
        let token = token_for(json!({"transactionId": "42", "environment": "Sandbox"}));
        let claims = decode_unverified_claims(&token).unwrap();
        assert_eq!(claims["transactionId"], json!("42"));
    }

    #[test]
    fn decode_tolerates_padding() {
        let payload = base64::engine::general_purpose::URL_SAFE.encode(r#"{"a":1}"#);
        assert!(payload.ends_with('='));
        let claims = decode_unverified_claims(&format!("h.{payload}.s")).unwrap();
        assert_eq!(claims["a"], json!(1));
    }

    #[rstest]
    #[case::single_segment("nodots")]
    #[case::bad_base64("h.%%%%.s")]
    #[case::not_json("h.bm90IGpzb24.s")]
    #[case::json_array("h.WzEsMl0.s")]
    fn decode_rejects_malformed(#[case] token: &str) {
        assert!(matches!(
            decode_unverified_claims(token),
            Err(JwsError::MalformedToken(_))
        ));
    }

    #[test]
    fn transaction_claims_with_all_fields() {
        let token = token_for(json!({
            "transactionId": "1000",
            "originalTransactionId": "900",
            "productId": "pro.monthly",
            "environment": "Sandbox",
            "expiresDate": 1_700_000_000_000i64,
        }));
        let claims = decode_unverified_claims(&token).unwrap();
        let tx = SignedTransactionClaims::from_claims(&claims).unwrap();
        assert_eq!(
            tx,
            SignedTransactionClaims {
                transaction_id: "1000".into(),
                original_transaction_id: Some("900".into()),
                product_id: Some("pro.monthly".into()),
                environment: Some(StorefrontEnvironment::Sandbox),
                expires_date_ms: Some(1_700_000_000_000),
            }
        );
    }

    #[rstest]
    #[case::snake_case(json!({"transaction_id": "7"}), "7")]
    #[case::original_only(json!({"originalTransactionId": "8"}), "8")]
    #[case::numeric(json!({"transactionId": 9}), "9")]
    #[case::blank_falls_through(
        json!({"transactionId": " ", "original_transaction_id": "10"}),
        "10"
    )]
    fn transaction_id_fallbacks(#[case] payload: serde_json::Value, #[case] expected: &str) {
        let claims = decode_unverified_claims(&token_for(payload)).unwrap();
        let tx = SignedTransactionClaims::from_claims(&claims).unwrap();
        assert_eq!(tx.transaction_id, expected);
    }

    #[test]
    fn missing_transaction_id_is_malformed() {
        let claims = decode_unverified_claims(&token_for(json!({"productId": "p"}))).unwrap();
        assert!(matches!(
            SignedTransactionClaims::from_claims(&claims),
            Err(JwsError::MalformedToken(_))
        ));
    }

    #[rstest]
    #[case::number(json!({"expiresDate": 5}), Some(5))]
    #[case::numeric_string(json!({"expiresDateMs": "6"}), Some(6))]
    #[case::snake_case(json!({"expires_date_ms": "7"}), Some(7))]
    #[case::garbage(json!({"expiresDate": "soon"}), None)]
    #[case::absent(json!({}), None)]
    fn expiry_parsing(#[case] payload: serde_json::Value, #[case] expected: Option<i64>) {
        let claims = payload.as_object().cloned().unwrap();
        assert_eq!(read_i64(&claims, EXPIRES_KEYS), expected);
    }
}
