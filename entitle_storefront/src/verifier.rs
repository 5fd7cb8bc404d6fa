// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! Receipt verification against the storefront.
//!
//! A client receipt is either a legacy blob or a signed transaction token
//! ([`classify`]). Legacy receipts are posted to the verification endpoint,
//! following the storefront's environment redirections (`21007`, `21008`).
//! Signed tokens only give away a transaction id: the transaction is looked up
//! in both environments, hinted environment first, with a freshly minted
//! service token. Restores run the same lookup from a client transaction id.

use std::{
    sync::Arc,
    time::{SystemTime, UNIX_EPOCH},
};

use entitle_core::record::ReceiptInfo;
use entitle_jws::{
    codec::{classify, ReceiptFormat, SignedTransactionClaims},
    issuer::StorefrontTokenIssuer,
    verifier::{TokenVerifier, UnverifiedTokenVerifier},
    StorefrontEnvironment,
};

use crate::{
    api::{LegacyVerifyRequest, LegacyVerifyResponse, StorefrontApi},
    selection::{pick_latest_receipt, product_matches},
    VerifyError,
};

/// Legacy status: a sandbox receipt was sent to production.
pub const STATUS_SANDBOX_RECEIPT: i64 = 21007;
/// Legacy status: a production receipt was sent to sandbox.
pub const STATUS_PRODUCTION_RECEIPT: i64 = 21008;

pub struct ReceiptVerifier<A> {
    api: A,

    /// Shared secret of the legacy endpoint
    shared_secret: Option<String>,

    /// Service token issuer of the lookup endpoint
    issuer: Option<Arc<StorefrontTokenIssuer>>,

    /// Trust policy applied to client and storefront signed tokens
    token_verifier: Arc<dyn TokenVerifier>,
}

impl<A> ReceiptVerifier<A> {
    pub fn new(api: A) -> Self {
        Self {
            api,
            shared_secret: None,
            issuer: None,
            token_verifier: Arc::new(UnverifiedTokenVerifier),
        }
    }

    pub fn with_shared_secret(mut self, shared_secret: impl Into<String>) -> Self {
        self.shared_secret = Some(shared_secret.into());
        self
    }

    pub fn with_issuer(mut self, issuer: Arc<StorefrontTokenIssuer>) -> Self {
        self.issuer = Some(issuer);
        self
    }

    pub fn with_token_verifier(mut self, token_verifier: Arc<dyn TokenVerifier>) -> Self {
        self.token_verifier = token_verifier;
        self
    }

    pub fn api(&self) -> &A {
        &self.api
    }

    fn shared_secret(&self) -> Result<&str, VerifyError> {
        self.shared_secret
            .as_deref()
            .filter(|secret| !secret.trim().is_empty())
            .ok_or(VerifyError::ConfigMissing("shared secret"))
    }

    fn issuer(&self) -> Result<&StorefrontTokenIssuer, VerifyError> {
        let issuer = self
            .issuer
            .as_deref()
            .ok_or(VerifyError::ConfigMissing("server API credentials"))?;
        match issuer.config().missing_field() {
            Some(field) => Err(VerifyError::ConfigMissing(field)),
            None => Ok(issuer),
        }
    }
}

impl<A> ReceiptVerifier<A>
where
    A: StorefrontApi,
{
    /// Verifies a client receipt of either format.
    ///
    /// `product_filter` restricts the accepted purchases to one product; an
    /// empty filter accepts any.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::ConfigMissing`] before any network call when the
    /// credentials of the receipt's protocol are not configured.
    pub async fn verify(
        &self,
        receipt: &str,
        product_filter: Option<&str>,
    ) -> Result<ReceiptInfo, VerifyError> {
        match classify(receipt) {
            ReceiptFormat::Signed => self.verify_signed(receipt, product_filter).await,
            ReceiptFormat::Legacy => self.verify_legacy(receipt, product_filter).await,
        }
    }

    pub async fn verify_legacy(
        &self,
        receipt: &str,
        product_filter: Option<&str>,
    ) -> Result<ReceiptInfo, VerifyError> {
        let request = LegacyVerifyRequest::new(receipt, self.shared_secret()?);

        let mut response = self
            .post_legacy(StorefrontEnvironment::Production, &request)
            .await?;
        match response.status {
            STATUS_SANDBOX_RECEIPT => {
                log::debug!("Sandbox receipt sent to production, retrying in sandbox");
                response = self
                    .post_legacy(StorefrontEnvironment::Sandbox, &request)
                    .await?;
            }
            STATUS_PRODUCTION_RECEIPT => {
                log::debug!("Production receipt sent to sandbox, retrying in production");
                response = self
                    .post_legacy(StorefrontEnvironment::Production, &request)
                    .await?;
            }
            _ => {}
        }
        if response.status != 0 {
            return Err(VerifyError::ReceiptRejected(response.status));
        }

        pick_latest_receipt(response.receipt_infos(), product_filter, now_millis())
            .map(ReceiptInfo::from)
            .ok_or(VerifyError::NoReceiptInfo)
    }

    pub async fn verify_signed(
        &self,
        token: &str,
        product_filter: Option<&str>,
    ) -> Result<ReceiptInfo, VerifyError> {
        let issuer = self.issuer()?;
        let claims = self.token_verifier.verify(token)?;
        let transaction = SignedTransactionClaims::from_claims(&claims)?;

        self.lookup(
            issuer,
            &transaction.transaction_id,
            product_filter,
            transaction.environment,
        )
        .await
    }

    /// Looks a purchase up from a transaction id the client kept.
    ///
    /// `environment` overrides the default production-first order.
    pub async fn restore(
        &self,
        transaction_id: &str,
        product_filter: Option<&str>,
        environment: Option<StorefrontEnvironment>,
    ) -> Result<ReceiptInfo, VerifyError> {
        let issuer = self.issuer()?;
        self.lookup(issuer, transaction_id, product_filter, environment)
            .await
    }

    async fn post_legacy(
        &self,
        environment: StorefrontEnvironment,
        request: &LegacyVerifyRequest,
    ) -> Result<LegacyVerifyResponse, VerifyError> {
        self.api.post_verify_receipt(environment, request).await
    }

    /// Tries each environment in order and returns the first matching transaction.
    ///
    /// Mismatching products are skipped. When no environment yields a match the
    /// last failure is returned, or [`VerifyError::NoReceiptInfo`] if every
    /// response was skipped.
    async fn lookup(
        &self,
        issuer: &StorefrontTokenIssuer,
        transaction_id: &str,
        product_filter: Option<&str>,
        hint: Option<StorefrontEnvironment>,
    ) -> Result<ReceiptInfo, VerifyError> {
        let service_token = issuer.issue().await?;

        let mut last_error = None;
        for environment in StorefrontEnvironment::preferred_order(hint) {
            match self
                .lookup_in(environment, &service_token, transaction_id)
                .await
            {
                Ok(info) if product_matches(product_filter, &info.product_id) => return Ok(info),
                Ok(info) => {
                    log::debug!(
                        "Transaction {transaction_id} in {environment} is for {}, skipping",
                        info.product_id
                    );
                }
                Err(err) => {
                    log::warn!("Transaction lookup in {environment} failed: {err}");
                    last_error = Some(err);
                }
            }
        }
        Err(last_error.unwrap_or(VerifyError::NoReceiptInfo))
    }

    async fn lookup_in(
        &self,
        environment: StorefrontEnvironment,
        service_token: &str,
        transaction_id: &str,
    ) -> Result<ReceiptInfo, VerifyError> {
        let signed = self
            .api
            .get_transaction(environment, service_token, transaction_id)
            .await?;
        let claims = self.token_verifier.verify(&signed)?;
        let transaction = SignedTransactionClaims::from_claims(&claims)?;

        Ok(ReceiptInfo {
            product_id: transaction.product_id.unwrap_or_default(),
            transaction_id: transaction.transaction_id,
            original_transaction_id: transaction.original_transaction_id.unwrap_or_default(),
            expires_at_millis: transaction.expires_date_ms.filter(|ms| *ms > 0),
        })
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}
