// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

// These tests run the entitlement server against the mock storefront, the way a
// mobile client would use it: verify a purchase, restore it on a new device, and
// spend the daily quota that comes with it. State is persisted in SQLite.
use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use chrono::{Duration, Utc};
use entitle_core::{
    manager::context::sql::SqlContext,
    scheduler::{Clock, SystemClock},
};
use entitle_integration_tests::{
    sign_transaction, BUNDLE_ID, SHARED_SECRET, STOREFRONT_KEY_PATH, STOREFRONT_PUBLIC_KEY_PATH,
};
use entitle_jws::{
    issuer::{IssuerConfig, StorefrontTokenIssuer},
    verifier::PinnedKeyVerifier,
    StorefrontEnvironment,
};
use entitle_server::{
    identity::USER_ID_HEADER,
    quota_guard::QUOTA_REMAINING_HEADER,
    server::{self, AppState},
};
use entitle_storefront::{
    api::{HttpStorefrontApi, StorefrontEndpoints},
    verifier::ReceiptVerifier,
};
use rstest::*;
use serde_json::{json, Value};
use tokio::task::JoinHandle;

use crate::storefront_mock::{self, StorefrontState};

const SANDBOX_TX: &str = "2000000100";
const LAPSED_TX: &str = "3000000001";

struct Deployment {
    storefront: Arc<StorefrontState>,
    base_url: String,
    client: reqwest::Client,
    _handles: Vec<JoinHandle<()>>,
}

struct Reply {
    status: u16,
    body: Value,
    quota_remaining: Option<String>,
}

impl Deployment {
    async fn post(&self, user_id: i64, path: &str, body: Value) -> Result<Reply> {
        let response = self
            .client
            .post(format!("{}{path}", self.base_url))
            .header(USER_ID_HEADER, user_id.to_string())
            .json(&body)
            .send()
            .await?;
        let status = response.status().as_u16();
        let quota_remaining = response
            .headers()
            .get(QUOTA_REMAINING_HEADER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        Ok(Reply {
            status,
            body: response.json().await?,
            quota_remaining,
        })
    }
}

fn millis_from_now(offset: Duration) -> i64 {
    (Utc::now() + offset).timestamp_millis()
}

fn signed_transaction(
    transaction_id: &str,
    product_id: &str,
    environment: &str,
    expires_in: Duration,
) -> String {
    sign_transaction(&json!({
        "transactionId": transaction_id,
        "originalTransactionId": "2000000000",
        "productId": product_id,
        "environment": environment,
        "expiresDate": millis_from_now(expires_in),
        "bundleId": BUNDLE_ID,
    }))
    .unwrap()
}

#[fixture]
fn storefront() -> StorefrontState {
    StorefrontState::default()
        .with_receipt(
            StorefrontEnvironment::Sandbox,
            "MIIT-sandbox",
            json!([
                {
                    "product_id": "pro.monthly",
                    "expires_date_ms": millis_from_now(-Duration::days(30)).to_string(),
                    "transaction_id": "2000000001",
                    "original_transaction_id": "2000000000",
                },
                {
                    "product_id": "pro.monthly",
                    "expires_date_ms": millis_from_now(Duration::days(30)).to_string(),
                    "transaction_id": "2000000002",
                    "original_transaction_id": "2000000000",
                },
            ]),
        )
        .with_transaction(
            StorefrontEnvironment::Sandbox,
            SANDBOX_TX,
            signed_transaction(SANDBOX_TX, "pro.yearly", "Sandbox", Duration::days(365)),
        )
        .with_transaction(
            StorefrontEnvironment::Production,
            LAPSED_TX,
            signed_transaction(LAPSED_TX, "pro.monthly", "Production", -Duration::days(2)),
        )
}

async fn deploy(storefront: StorefrontState) -> Result<Deployment> {
    let storefront = Arc::new(storefront);
    let (storefront_handle, storefront_url) = storefront_mock::spawn(storefront.clone()).await?;

    let issuer = StorefrontTokenIssuer::new(IssuerConfig {
        issuer_id: "57246542-96fe-1a63-e053-0824d011072a".to_string(),
        key_id: "2X9R4HXF34".to_string(),
        bundle_id: BUNDLE_ID.to_string(),
        private_key_path: PathBuf::from(STOREFRONT_KEY_PATH),
    });
    let signing_key = std::fs::read(STOREFRONT_PUBLIC_KEY_PATH)?;
    let api = HttpStorefrontApi::new(StorefrontEndpoints::single_host(&storefront_url))?;
    let verifier = ReceiptVerifier::new(api)
        .with_shared_secret(SHARED_SECRET)
        .with_issuer(Arc::new(issuer))
        .with_token_verifier(Arc::new(PinnedKeyVerifier::from_pem(&signing_key)?));

    let context = SqlContext::connect("sqlite::memory:", 1).await?;
    context.ensure_schema().await?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let (server_handle, addr) =
        server::run_server(0, AppState::new(verifier, context, clock), 8).await?;

    Ok(Deployment {
        storefront,
        base_url: format!("http://127.0.0.1:{}", addr.port()),
        client: reqwest::Client::new(),
        _handles: vec![storefront_handle, server_handle],
    })
}

#[rstest]
#[tokio::test]
async fn sandbox_receipt_is_retried_in_sandbox(storefront: StorefrontState) -> Result<()> {
    let deployment = deploy(storefront).await?;

    let reply = deployment
        .post(
            1,
            "/subscription/verify",
            json!({
                "platform": "ios",
                "product_id": "pro.monthly",
                "transaction_id": "2000000002",
                "verification_data": "MIIT-sandbox",
                "verification_source": "app_store",
            }),
        )
        .await?;

    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["code"], 0);
    assert_eq!(reply.body["data"]["active"], true);
    assert_eq!(reply.body["data"]["status"], "active");
    assert_eq!(reply.body["data"]["product_id"], "pro.monthly");
    assert_eq!(reply.body["data"]["subscriber_rank"], 1);
    assert_eq!(
        deployment.storefront.requests(),
        vec!["POST /verifyReceipt", "POST /sandbox/verifyReceipt"]
    );
    Ok(())
}

#[rstest]
#[tokio::test]
async fn signed_transaction_is_looked_up_where_it_was_made(
    storefront: StorefrontState,
) -> Result<()> {
    let deployment = deploy(storefront).await?;
    let client_token = signed_transaction(SANDBOX_TX, "pro.yearly", "Sandbox", Duration::days(365));

    let reply = deployment
        .post(
            2,
            "/subscription/verify",
            json!({ "product_id": "pro.yearly", "verification_data": client_token }),
        )
        .await?;

    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["data"]["active"], true);
    assert_eq!(reply.body["data"]["product_id"], "pro.yearly");
    assert_eq!(
        deployment.storefront.requests(),
        vec![format!("GET /sandbox/inApps/v1/transactions/{SANDBOX_TX}")]
    );

    let tokens = deployment.storefront.service_tokens();
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].bid, BUNDLE_ID);
    assert_eq!(tokens[0].exp - tokens[0].iat, 15 * 60);
    Ok(())
}

#[rstest]
#[tokio::test]
async fn restore_falls_back_to_sandbox(storefront: StorefrontState) -> Result<()> {
    let deployment = deploy(storefront).await?;

    let reply = deployment
        .post(
            3,
            "/subscription/restore",
            json!({ "transaction_id": SANDBOX_TX, "product_id": "pro.yearly" }),
        )
        .await?;

    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["data"]["active"], true);
    assert_eq!(reply.body["data"]["status"], "active");
    assert_eq!(
        deployment.storefront.requests(),
        vec![
            format!("GET /inApps/v1/transactions/{SANDBOX_TX}"),
            format!("GET /sandbox/inApps/v1/transactions/{SANDBOX_TX}"),
        ]
    );
    Ok(())
}

#[rstest]
#[tokio::test]
async fn restore_of_a_lapsed_purchase(storefront: StorefrontState) -> Result<()> {
    let deployment = deploy(storefront).await?;

    let reply = deployment
        .post(
            4,
            "/subscription/restore",
            json!({ "transaction_id": LAPSED_TX, "environment": "production" }),
        )
        .await?;

    assert_eq!(reply.status, 200);
    assert_eq!(reply.body["data"]["active"], false);
    assert_eq!(reply.body["data"]["status"], "expired");
    Ok(())
}

#[rstest]
#[tokio::test]
async fn restore_of_another_product_reports_last_failure(
    storefront: StorefrontState,
) -> Result<()> {
    let deployment = deploy(storefront).await?;

    let reply = deployment
        .post(
            5,
            "/subscription/restore",
            json!({ "transaction_id": SANDBOX_TX, "product_id": "pro.monthly" }),
        )
        .await?;

    // Production does not know the transaction and the sandbox one is yearly.
    assert_eq!(reply.status, 500);
    let message = reply.body["message"].as_str().unwrap_or_default();
    assert!(
        message.starts_with("storefront API status=404"),
        "{message}"
    );
    assert!(reply.body.get("data").is_none());
    Ok(())
}

#[rstest]
#[tokio::test]
async fn subscribing_lifts_the_daily_quota(storefront: StorefrontState) -> Result<()> {
    let deployment = deploy(storefront).await?;
    let user_id = 6;

    let admit = json!({ "path": "/api/menu/scan" });
    let reply = deployment
        .post(user_id, "/quota/admit", admit.clone())
        .await?;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.quota_remaining.as_deref(), Some("22"));

    let reply = deployment
        .post(
            user_id,
            "/subscription/restore",
            json!({ "transaction_id": SANDBOX_TX }),
        )
        .await?;
    assert_eq!(reply.body["data"]["active"], true);

    let reply = deployment.post(user_id, "/quota/admit", admit).await?;
    assert_eq!(reply.status, 200);
    assert_eq!(reply.quota_remaining.as_deref(), Some("1992"));

    let reply = deployment
        .post(user_id, "/usage/check", json!({ "type": "menu_scan" }))
        .await?;
    assert_eq!(reply.body["data"]["is_subscriber"], true);
    assert_eq!(reply.body["data"]["usage"]["unlimited"], true);
    Ok(())
}
