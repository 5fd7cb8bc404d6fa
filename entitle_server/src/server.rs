// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

use std::{net::SocketAddr, sync::Arc};

use anyhow::Result;
use axum::{
    extract::{rejection::JsonRejection, State},
    http::HeaderValue,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use entitle_core::{
    manager::{
        adapters::{EntitlementRead, EntitlementStore, UsageCounter},
        EntitlementManager,
    },
    quota::{QuotaLedger, QuotaWindow, UsageKind, UsageReport, UsageScope, UsageSummary},
    record::{ReceiptInfo, VerificationOutcome, VerificationRequest},
    scheduler::Clock,
};
use entitle_jws::StorefrontEnvironment;
use entitle_storefront::{api::StorefrontApi, verifier::ReceiptVerifier, VerifyError};
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use tokio::{net::TcpListener, signal, task::JoinHandle};

use crate::{
    envelope::{ApiError, ApiResponse, ApiResult},
    identity::UserId,
    metrics::{VERIFICATION_FAILURE_COUNTER, VERIFICATION_SUCCESS_COUNTER},
    quota_guard::{QuotaGuard, QUOTA_REMAINING_HEADER},
};

/// Storage the HTTP surface needs from a context.
pub trait EntitlementContext:
    EntitlementStore + EntitlementRead + UsageCounter + Send + Sync + 'static
{
}

impl<T> EntitlementContext for T where
    T: EntitlementStore + EntitlementRead + UsageCounter + Send + Sync + 'static
{
}

/// Shared by every handler.
pub struct AppState<E, A> {
    verifier: ReceiptVerifier<A>,
    entitlements: EntitlementManager<E>,
    quota: QuotaGuard<E>,
    clock: Arc<dyn Clock>,
}

impl<E, A> AppState<E, A>
where
    E: Clone,
{
    /// Every component reads and writes through `context`.
    pub fn new(verifier: ReceiptVerifier<A>, context: E, clock: Arc<dyn Clock>) -> Self {
        Self {
            verifier,
            entitlements: EntitlementManager::new(context.clone()),
            quota: QuotaGuard::new(QuotaLedger::with_default_policies(context), clock.clone()),
            clock,
        }
    }
}

impl<E, A> AppState<E, A> {
    pub fn quota(&self) -> &QuotaGuard<E> {
        &self.quota
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerifyBody {
    pub platform: String,
    pub product_id: String,
    pub transaction_id: String,
    pub verification_data: String,
    pub verification_source: String,
    pub transaction_date: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreBody {
    pub transaction_id: String,
    pub product_id: String,
    pub environment: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageCheckBody {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_time: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmitBody {
    pub path: String,
    pub client_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UsageCheckResponse {
    Single {
        #[serde(rename = "type")]
        kind: UsageKind,
        is_subscriber: bool,
        usage: UsageSummary,
    },
    All(UsageReport),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdmitResponse {
    pub admitted: bool,
    pub remaining: Option<u64>,
}

fn verification_failed(operation: &str, user_id: i64, err: VerifyError) -> ApiError {
    VERIFICATION_FAILURE_COUNTER.inc();
    error!("Subscription {operation} failed for user {user_id}: {err}");
    ApiError::internal(err.to_string())
}

async fn record<E, A>(
    state: &AppState<E, A>,
    request: VerificationRequest,
    info: ReceiptInfo,
) -> VerificationOutcome
where
    E: EntitlementContext,
{
    VERIFICATION_SUCCESS_COUNTER.inc();
    let now = state.clock.now().with_timezone(&Utc);
    state
        .entitlements
        .record_verification(&request, Some(&info), now)
        .await
}

async fn verify_subscription<E, A>(
    State(state): State<Arc<AppState<E, A>>>,
    UserId(user_id): UserId,
    body: Result<Json<VerifyBody>, JsonRejection>,
) -> ApiResult<VerificationOutcome>
where
    E: EntitlementContext,
    A: StorefrontApi + 'static,
{
    let Json(body) = body.map_err(|_| ApiError::bad_request("invalid request body"))?;
    if body.verification_data.is_empty() {
        return Err(ApiError::bad_request("verification_data is required"));
    }
    debug!(
        "Verify for user {user_id}: platform={} product_id={} transaction_id={} source={} \
         receipt_len={}",
        body.platform,
        body.product_id,
        body.transaction_id,
        body.verification_source,
        body.verification_data.len()
    );

    let info = state
        .verifier
        .verify(&body.verification_data, Some(&body.product_id))
        .await
        .map_err(|err| verification_failed("verify", user_id, err))?;

    let request = VerificationRequest::new(user_id, body.product_id)
        .with_transaction_id(body.transaction_id)
        .with_platform(body.platform);
    Ok(ApiResponse::success(record(&state, request, info).await))
}

async fn restore_subscription<E, A>(
    State(state): State<Arc<AppState<E, A>>>,
    UserId(user_id): UserId,
    body: Result<Json<RestoreBody>, JsonRejection>,
) -> ApiResult<VerificationOutcome>
where
    E: EntitlementContext,
    A: StorefrontApi + 'static,
{
    let body = match body {
        Ok(Json(body)) if !body.transaction_id.is_empty() => body,
        _ => return Err(ApiError::bad_request("transaction_id is required")),
    };

    let info = state
        .verifier
        .restore(
            &body.transaction_id,
            Some(&body.product_id),
            StorefrontEnvironment::from_hint(&body.environment),
        )
        .await
        .map_err(|err| verification_failed("restore", user_id, err))?;

    let request = VerificationRequest::new(user_id, body.product_id)
        .with_transaction_id(body.transaction_id);
    Ok(ApiResponse::success(record(&state, request, info).await))
}

async fn check_usage<E, A>(
    State(state): State<Arc<AppState<E, A>>>,
    UserId(user_id): UserId,
    body: Result<Json<UsageCheckBody>, JsonRejection>,
) -> ApiResult<UsageCheckResponse>
where
    E: EntitlementContext,
    A: Send + Sync + 'static,
{
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let scope: UsageScope = body
        .kind
        .parse()
        .map_err(|_| ApiError::bad_request("invalid type"))?;

    let now = state.clock.now();
    let window = QuotaWindow::from_client_time(&body.client_time, now);
    let mut report = state
        .quota
        .ledger()
        .usage_summary(user_id, scope, &window, now.with_timezone(&Utc))
        .await
        .map_err(|err| {
            error!("Usage check failed for user {user_id}: {err}");
            ApiError::internal("usage check failed")
        })?;

    let response = match scope {
        UsageScope::Single(kind) => match report.usage.remove(&kind) {
            Some(usage) => UsageCheckResponse::Single {
                kind,
                is_subscriber: report.is_subscriber,
                usage,
            },
            None => return Err(ApiError::internal("usage check failed")),
        },
        UsageScope::All => UsageCheckResponse::All(report),
    };
    Ok(ApiResponse::success(response))
}

async fn admit_quota<E, A>(
    State(state): State<Arc<AppState<E, A>>>,
    UserId(user_id): UserId,
    body: Result<Json<AdmitBody>, JsonRejection>,
) -> Result<Response, ApiError>
where
    E: EntitlementContext,
    A: Send + Sync + 'static,
{
    let Json(body) = body.map_err(|_| ApiError::bad_request("invalid request body"))?;
    if body.path.trim().is_empty() {
        return Err(ApiError::bad_request("path is required"));
    }

    let admission = state
        .quota
        .check(user_id, &body.path, &body.client_time)
        .await?;

    let mut response = ApiResponse::success(AdmitResponse {
        admitted: true,
        remaining: admission.remaining_credits,
    })
    .into_response();
    if let Some(remaining) = admission.remaining_credits {
        response
            .headers_mut()
            .insert(QUOTA_REMAINING_HEADER, HeaderValue::from(remaining));
    }
    Ok(response)
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Client-facing routes.
pub fn create_router<E, A>(state: Arc<AppState<E, A>>) -> Router
where
    E: EntitlementContext,
    A: StorefrontApi + 'static,
{
    Router::new()
        .route("/subscription/verify", post(verify_subscription::<E, A>))
        .route("/subscription/restore", post(restore_subscription::<E, A>))
        .route("/usage/check", post(check_usage::<E, A>))
        .route("/quota/admit", post(admit_quota::<E, A>))
        .route("/health", get(health))
        .with_state(state)
}

pub async fn run_server<E, A>(
    port: u16,
    state: AppState<E, A>,
    max_concurrent_connections: u32,
) -> Result<(JoinHandle<()>, SocketAddr)>
where
    E: EntitlementContext,
    A: StorefrontApi + 'static,
{
    let router = create_router(Arc::new(state)).layer(tower::limit::ConcurrencyLimitLayer::new(
        max_concurrent_connections as usize,
    ));

    // Create a `TcpListener` using tokio.
    let listener = TcpListener::bind(&format!("0.0.0.0:{port}")).await?;

    let addr = listener.local_addr()?;
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_handler())
            .await
        {
            log::error!("Entitlement server error: {e}");
        }
    });

    Ok((handle, addr))
}

/// Waits for a background task and logs it if the task panicked or was
/// cancelled. Returns whether the task finished cleanly.
pub async fn join_task<T>(name: &str, handle: JoinHandle<T>) -> bool {
    match handle.await {
        Ok(_) => true,
        Err(e) => {
            error!("{name} task failed: {e}");
            false
        }
    }
}

/// Graceful shutdown handler
async fn shutdown_handler() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(err) => {
                error!("Failed to install signal handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Signal received, starting graceful shutdown");
}
