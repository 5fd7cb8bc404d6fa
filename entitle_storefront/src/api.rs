// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! Transport to the storefront endpoints.
//!
//! [`StorefrontApi`] is the seam between the verification logic and the wire;
//! [`HttpStorefrontApi`] is the production implementation over `reqwest`.

use std::time::Duration;

use async_trait::async_trait;
use entitle_jws::StorefrontEnvironment;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::VerifyError;

/// Timeout applied to every storefront call.
pub const STOREFRONT_TIMEOUT: Duration = Duration::from_secs(12);

pub const LEGACY_PRODUCTION_URL: &str = "https://buy.itunes.apple.com/verifyReceipt";
pub const LEGACY_SANDBOX_URL: &str = "https://sandbox.itunes.apple.com/verifyReceipt";
pub const LOOKUP_PRODUCTION_URL: &str = "https://api.storekit.itunes.apple.com";
pub const LOOKUP_SANDBOX_URL: &str = "https://api.storekit-sandbox.itunes.apple.com";

/// Base URLs of the storefront, per environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorefrontEndpoints {
    pub legacy_production: String,
    pub legacy_sandbox: String,
    pub lookup_production: String,
    pub lookup_sandbox: String,
}

impl Default for StorefrontEndpoints {
    fn default() -> Self {
        Self {
            legacy_production: LEGACY_PRODUCTION_URL.to_string(),
            legacy_sandbox: LEGACY_SANDBOX_URL.to_string(),
            lookup_production: LOOKUP_PRODUCTION_URL.to_string(),
            lookup_sandbox: LOOKUP_SANDBOX_URL.to_string(),
        }
    }
}

impl StorefrontEndpoints {
    /// Serves both environments from one host, sandbox under `/sandbox`.
    pub fn single_host(base_url: &str) -> Self {
        let base = base_url.trim_end_matches('/');
        Self {
            legacy_production: format!("{base}/verifyReceipt"),
            legacy_sandbox: format!("{base}/sandbox/verifyReceipt"),
            lookup_production: base.to_string(),
            lookup_sandbox: format!("{base}/sandbox"),
        }
    }

    pub fn legacy_url(&self, environment: StorefrontEnvironment) -> &str {
        match environment {
            StorefrontEnvironment::Production => &self.legacy_production,
            StorefrontEnvironment::Sandbox => &self.legacy_sandbox,
        }
    }

    pub fn lookup_url(&self, environment: StorefrontEnvironment, transaction_id: &str) -> String {
        let base = match environment {
            StorefrontEnvironment::Production => &self.lookup_production,
            StorefrontEnvironment::Sandbox => &self.lookup_sandbox,
        };
        format!(
            "{}/inApps/v1/transactions/{transaction_id}",
            base.trim_end_matches('/')
        )
    }
}

/// Body of a legacy verification request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LegacyVerifyRequest {
    #[serde(rename = "receipt-data")]
    pub receipt_data: String,
    pub password: String,
    #[serde(rename = "exclude-old-transactions")]
    pub exclude_old_transactions: bool,
}

impl LegacyVerifyRequest {
    pub fn new(receipt_data: impl Into<String>, shared_secret: impl Into<String>) -> Self {
        Self {
            receipt_data: receipt_data.into(),
            password: shared_secret.into(),
            exclude_old_transactions: true,
        }
    }
}

/// One purchase entry of a legacy verification response.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyReceiptInfo {
    pub product_id: String,
    pub expires_date_ms: String,
    pub transaction_id: String,
    pub original_transaction_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyReceipt {
    pub in_app: Vec<LegacyReceiptInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LegacyVerifyResponse {
    pub status: i64,
    pub latest_receipt_info: Vec<LegacyReceiptInfo>,
    pub receipt: LegacyReceipt,
}

impl LegacyVerifyResponse {
    /// Purchase entries, from `latest_receipt_info` or else `receipt.in_app`.
    pub fn receipt_infos(&self) -> &[LegacyReceiptInfo] {
        if self.latest_receipt_info.is_empty() {
            &self.receipt.in_app
        } else {
            &self.latest_receipt_info
        }
    }
}

/// Body of a transaction lookup response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransactionLookupResponse {
    pub signed_transaction_info: String,
}

#[async_trait]
pub trait StorefrontApi: Send + Sync {
    /// Posts a legacy receipt to the verification endpoint of `environment`.
    async fn post_verify_receipt(
        &self,
        environment: StorefrontEnvironment,
        request: &LegacyVerifyRequest,
    ) -> Result<LegacyVerifyResponse, VerifyError>;

    /// Looks a transaction up, returning its signed transaction token.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::LookupStatus`] on an error status and
    /// [`VerifyError::MissingSignedTransaction`] if the response carries no token.
    async fn get_transaction(
        &self,
        environment: StorefrontEnvironment,
        service_token: &str,
        transaction_id: &str,
    ) -> Result<String, VerifyError>;
}

#[derive(Debug, Clone)]
pub struct HttpStorefrontApi {
    client: Client,
    endpoints: StorefrontEndpoints,
}

impl HttpStorefrontApi {
    pub fn new(endpoints: StorefrontEndpoints) -> Result<Self, VerifyError> {
        let client = Client::builder().timeout(STOREFRONT_TIMEOUT).build()?;
        Ok(Self::with_client(client, endpoints))
    }

    /// Create with a custom reqwest [`Client`].
    pub fn with_client(client: Client, endpoints: StorefrontEndpoints) -> Self {
        Self { client, endpoints }
    }

    pub fn endpoints(&self) -> &StorefrontEndpoints {
        &self.endpoints
    }
}

#[async_trait]
impl StorefrontApi for HttpStorefrontApi {
    async fn post_verify_receipt(
        &self,
        environment: StorefrontEnvironment,
        request: &LegacyVerifyRequest,
    ) -> Result<LegacyVerifyResponse, VerifyError> {
        let url = self.endpoints.legacy_url(environment);
        log::debug!("Posting legacy receipt to {environment} ({url})");

        let resp = self.client.post(url).json(request).send().await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(VerifyError::LookupStatus {
                status,
                body: body.trim().to_string(),
            });
        }
        Ok(resp.json().await?)
    }

    async fn get_transaction(
        &self,
        environment: StorefrontEnvironment,
        service_token: &str,
        transaction_id: &str,
    ) -> Result<String, VerifyError> {
        let url = self.endpoints.lookup_url(environment, transaction_id);
        log::debug!("Looking up transaction {transaction_id} in {environment}");

        let resp = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {service_token}"))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(VerifyError::LookupStatus {
                status,
                body: body.trim().to_string(),
            });
        }

        let payload: TransactionLookupResponse = resp.json().await?;
        if payload.signed_transaction_info.is_empty() {
            return Err(VerifyError::MissingSignedTransaction);
        }
        Ok(payload.signed_transaction_info)
    }
}
