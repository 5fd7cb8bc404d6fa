// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use log::{error, info};
use prometheus::{register_int_counter, IntCounter, TextEncoder};
use tokio::net::TcpListener;

// Register the metrics into the global metrics registry.
lazy_static! {
    pub static ref VERIFICATION_SUCCESS_COUNTER: IntCounter = register_int_counter!(
        "subscription_verification_success_count",
        "Number of verify and restore requests resolved by the storefront."
    )
    .unwrap();
    pub static ref VERIFICATION_FAILURE_COUNTER: IntCounter = register_int_counter!(
        "subscription_verification_failure_count",
        "Number of verify and restore requests that failed (for any reason)."
    )
    .unwrap();
    pub static ref QUOTA_ADMITTED_COUNTER: IntCounter = register_int_counter!(
        "quota_admitted_count",
        "Number of metered requests admitted."
    )
    .unwrap();
    pub static ref QUOTA_DENIED_COUNTER: IntCounter = register_int_counter!(
        "quota_denied_count",
        "Number of metered requests refused with 429."
    )
    .unwrap();
    pub static ref PLANS_GENERATED_COUNTER: IntCounter = register_int_counter!(
        "weekly_plans_generated_count",
        "Number of day plans generated by the nightly refresh."
    )
    .unwrap();
    pub static ref PLANS_FAILED_COUNTER: IntCounter = register_int_counter!(
        "weekly_plans_failed_count",
        "Number of day plans the nightly refresh failed to generate or store."
    )
    .unwrap();
}

async fn handler_metrics() -> Result<String, (StatusCode, String)> {
    TextEncoder::new()
        .encode_to_string(&prometheus::gather())
        .map_err(|err| {
            error!("Error encoding metrics: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Error encoding metrics: {err}"),
            )
        })
}

pub fn router() -> Router {
    Router::new().route("/metrics", get(handler_metrics))
}

/// Serves `/metrics` on `port` until the process exits.
pub async fn run_server(port: u16) {
    let listener = match TcpListener::bind(&format!("0.0.0.0:{port}")).await {
        Ok(listener) => listener,
        Err(err) => {
            error!("Failed to bind metrics server to port {port}: {err}");
            return;
        }
    };
    info!("Metrics server listening on port {port}");
    if let Err(err) = axum::serve(listener, router()).await {
        error!("Metrics server error: {err}");
    }
}
