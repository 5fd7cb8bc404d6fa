// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]

use std::{path::PathBuf, sync::Arc};

use anyhow::Result;
use clap::Parser;
use entitle_core::{
    manager::{
        adapters::WeeklyPlanCache,
        context::{memory::InMemoryContext, sql::SqlContext},
    },
    scheduler::{
        Clock, SystemClock, WeeklyRefreshScheduler, DEFAULT_REFRESH_HOUR, DEFAULT_REFRESH_MINUTE,
    },
};
use entitle_jws::{
    issuer::{IssuerConfig, StorefrontTokenIssuer},
    verifier::PinnedKeyVerifier,
};
use entitle_server::{
    metrics,
    plan_generator::HttpPlanGenerator,
    server::{self, join_task, AppState, EntitlementContext},
};
use entitle_storefront::{
    api::{HttpStorefrontApi, StorefrontEndpoints},
    verifier::ReceiptVerifier,
};
use log::{debug, info, warn};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Port to listen on for client requests.
    /// Defaults to 8080.
    #[arg(long, default_value_t = 8080, env = "ENTITLE_PORT")]
    port: u16,

    /// Metrics server port.
    /// Defaults to 5000.
    #[arg(long, default_value_t = 5000, env = "ENTITLE_METRICS_PORT")]
    metrics_port: u16,

    /// Maximum number of concurrent connections.
    /// Defaults to 32.
    #[arg(long, default_value_t = 32, env = "ENTITLE_MAX_CONNECTIONS")]
    max_connections: u32,

    /// Database URL, `postgres://` or `sqlite:`. Without one, state lives in memory.
    #[arg(long, env = "ENTITLE_DATABASE_URL")]
    database_url: Option<String>,

    /// Size of the database connection pool.
    /// Defaults to 10.
    #[arg(long, default_value_t = 10, env = "ENTITLE_DATABASE_MAX_CONNECTIONS")]
    database_max_connections: u32,

    /// Issuer id of the storefront API key, for signed transaction lookups.
    #[arg(long, env = "ENTITLE_STOREFRONT_ISSUER_ID")]
    issuer_id: Option<String>,

    /// Id of the storefront API key.
    #[arg(long, env = "ENTITLE_STOREFRONT_KEY_ID")]
    key_id: Option<String>,

    /// Bundle id of the app the subscriptions belong to.
    #[arg(long, env = "ENTITLE_STOREFRONT_BUNDLE_ID")]
    bundle_id: Option<String>,

    /// Path to the PKCS#8 PEM private key of the storefront API key.
    #[arg(long, env = "ENTITLE_STOREFRONT_PRIVATE_KEY_PATH")]
    private_key_path: Option<PathBuf>,

    /// Shared secret for legacy receipt verification.
    #[arg(long, env = "ENTITLE_STOREFRONT_SHARED_SECRET", hide_env_values = true)]
    shared_secret: Option<String>,

    /// PEM public key signed transactions must be signed with. When unset, signed
    /// transactions are decoded without checking their signature.
    #[arg(long, env = "ENTITLE_STOREFRONT_SIGNING_KEY_PATH")]
    signing_key_path: Option<PathBuf>,

    /// Serve every storefront endpoint from this base URL, sandbox under `/sandbox`.
    /// Meant for staging and tests.
    #[arg(long, env = "ENTITLE_STOREFRONT_URL")]
    storefront_url: Option<String>,

    /// Hour of the nightly weekly plan refresh, server local time.
    #[arg(long, default_value_t = DEFAULT_REFRESH_HOUR, env = "ENTITLE_REFRESH_HOUR")]
    refresh_hour: u32,

    /// Minute of the nightly weekly plan refresh.
    #[arg(long, default_value_t = DEFAULT_REFRESH_MINUTE, env = "ENTITLE_REFRESH_MINUTE")]
    refresh_minute: u32,

    /// Endpoint generating one day plan per request. The nightly refresh is
    /// skipped when unset.
    #[arg(long, env = "ENTITLE_PLAN_GENERATOR_URL")]
    plan_generator_url: Option<String>,
}

impl Args {
    fn redacted(&self) -> Self {
        let mut args = self.clone();
        if args.shared_secret.is_some() {
            args.shared_secret = Some("<redacted>".to_string());
        }
        args
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize the logger.
    // Set the log level by setting the RUST_LOG environment variable.
    tracing_subscriber::fmt::init();

    let args = Args::parse();
    debug!("Settings: {:?}", args.redacted());

    // Start the metrics server.
    // We just let it gracelessly get killed at the end of main()
    tokio::spawn(metrics::run_server(args.metrics_port));

    let verifier = create_verifier(&args)?;

    match &args.database_url {
        Some(url) => {
            let context = SqlContext::connect(url, args.database_max_connections).await?;
            context.ensure_schema().await?;
            info!("Connected to {:?} database", context.database_type());
            serve(&args, verifier, context).await
        }
        None => {
            warn!("No database configured, entitlements are kept in memory");
            serve(&args, verifier, InMemoryContext::default()).await
        }
    }
}

fn create_verifier(args: &Args) -> Result<ReceiptVerifier<HttpStorefrontApi>> {
    let endpoints = match &args.storefront_url {
        Some(url) => StorefrontEndpoints::single_host(url),
        None => StorefrontEndpoints::default(),
    };
    let mut verifier = ReceiptVerifier::new(HttpStorefrontApi::new(endpoints)?);

    if let Some(shared_secret) = &args.shared_secret {
        verifier = verifier.with_shared_secret(shared_secret.clone());
    }

    let issuer_configured = args.issuer_id.is_some()
        || args.key_id.is_some()
        || args.bundle_id.is_some()
        || args.private_key_path.is_some();
    if issuer_configured {
        let config = IssuerConfig {
            issuer_id: args.issuer_id.clone().unwrap_or_default(),
            key_id: args.key_id.clone().unwrap_or_default(),
            bundle_id: args.bundle_id.clone().unwrap_or_default(),
            private_key_path: args.private_key_path.clone().unwrap_or_default(),
        };
        if let Some(field) = config.missing_field() {
            warn!("Storefront {field} is not configured, signed receipts will be refused");
        }
        verifier = verifier.with_issuer(Arc::new(StorefrontTokenIssuer::new(config)));
    }

    match &args.signing_key_path {
        Some(path) => {
            let pem = std::fs::read(path)?;
            verifier = verifier.with_token_verifier(Arc::new(PinnedKeyVerifier::from_pem(&pem)?));
            info!("Signed transactions are checked against {}", path.display());
        }
        None => warn!("Signed transactions are accepted without signature verification"),
    }

    Ok(verifier)
}

async fn serve<E>(
    args: &Args,
    verifier: ReceiptVerifier<HttpStorefrontApi>,
    context: E,
) -> Result<()>
where
    E: EntitlementContext + WeeklyPlanCache + Clone,
{
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    let generator = args
        .plan_generator_url
        .as_deref()
        .map(HttpPlanGenerator::new)
        .transpose()?;
    let scheduler = WeeklyRefreshScheduler::new(context.clone(), Some(context.clone()), generator)
        .with_clock(clock.clone())
        .with_schedule(args.refresh_hour, args.refresh_minute);

    let cancel = CancellationToken::new();
    let scheduler_handle = tokio::spawn(scheduler.run(cancel.clone(), |report| {
        metrics::PLANS_GENERATED_COUNTER.inc_by(report.generated as u64);
        metrics::PLANS_FAILED_COUNTER.inc_by(report.failed as u64);
    }));

    // Start the HTTP server.
    // This await is non-blocking
    let state = AppState::new(verifier, context, clock);
    let (handle, _) = server::run_server(args.port, state, args.max_connections).await?;
    info!("Server started. Listening on port {}.", args.port);

    join_task("Entitlement server", handle).await;

    // If we're here, we've received a signal to exit.
    info!("Shutting down...");
    cancel.cancel();
    join_task("Weekly refresh", scheduler_handle).await;
    Ok(())
}
