// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! # Quota guard
//!
//! Admission check for metered routes. Hosted routes get it as an axum
//! middleware ([`guard_routes`]); routes living in other services ask for the
//! same decision through `POST /quota/admit`.
//!
//! Admitted metered requests carry the credits left in the
//! [`QUOTA_REMAINING_HEADER`] response header; refused ones get a 429.

use std::sync::Arc;

use axum::{
    extract::{MatchedPath, Request, State},
    http::HeaderValue,
    middleware::{self, Next},
    response::Response,
    Router,
};
use chrono::Utc;
use entitle_core::{
    manager::adapters::{EntitlementRead, UsageCounter},
    quota::{Admission, MeteredAction, QuotaLedger, QuotaWindow},
    scheduler::Clock,
    Error,
};
use log::{debug, error};

use crate::{
    envelope::ApiError,
    identity::UserId,
    metrics::{QUOTA_ADMITTED_COUNTER, QUOTA_DENIED_COUNTER},
};

pub const QUOTA_REMAINING_HEADER: &str = "x-quota-remaining";
pub const QUOTA_EXHAUSTED_MESSAGE: &str = "quota exhausted, subscribe to continue";

/// Ledger plus the clock that decides which day is being counted.
pub struct QuotaGuard<E> {
    ledger: Arc<QuotaLedger<E>>,
    clock: Arc<dyn Clock>,
}

impl<E> Clone for QuotaGuard<E> {
    fn clone(&self) -> Self {
        Self {
            ledger: self.ledger.clone(),
            clock: self.clock.clone(),
        }
    }
}

impl<E> QuotaGuard<E> {
    pub fn new(ledger: QuotaLedger<E>, clock: Arc<dyn Clock>) -> Self {
        Self {
            ledger: Arc::new(ledger),
            clock,
        }
    }

    pub fn ledger(&self) -> &QuotaLedger<E> {
        &self.ledger
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

impl<E> QuotaGuard<E>
where
    E: EntitlementRead + UsageCounter + Send + Sync,
{
    /// Decides whether `user_id` may call `path` now.
    ///
    /// The day counted is the one `client_time` falls in, or the server's when
    /// it is empty or unreadable.
    pub async fn check(
        &self,
        user_id: i64,
        path: &str,
        client_time: &str,
    ) -> Result<Admission, ApiError> {
        let action = MeteredAction::for_path(path);
        if !action.is_metered() {
            return Ok(Admission::default());
        }

        let now = self.clock.now();
        let window = QuotaWindow::from_client_time(client_time, now);
        match self
            .ledger
            .admit(user_id, &action, &window, now.with_timezone(&Utc))
            .await
        {
            Ok(admission) => {
                QUOTA_ADMITTED_COUNTER.inc();
                Ok(admission)
            }
            Err(Error::QuotaExceeded(denial)) => {
                QUOTA_DENIED_COUNTER.inc();
                debug!("Refused {path} for user {user_id}: {denial}");
                Err(ApiError::too_many_requests(QUOTA_EXHAUSTED_MESSAGE))
            }
            Err(err) => {
                error!("Quota check of {path} failed for user {user_id}: {err}");
                Err(ApiError::internal("quota check failed"))
            }
        }
    }
}

/// Middleware body; the route pattern is classified when one matched.
pub async fn quota_guard<E>(
    State(guard): State<QuotaGuard<E>>,
    UserId(user_id): UserId,
    request: Request,
    next: Next,
) -> Result<Response, ApiError>
where
    E: EntitlementRead + UsageCounter + Send + Sync + 'static,
{
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());

    let admission = guard.check(user_id, &path, "").await?;

    let mut response = next.run(request).await;
    if let Some(remaining) = admission.remaining_credits {
        response
            .headers_mut()
            .insert(QUOTA_REMAINING_HEADER, HeaderValue::from(remaining));
    }
    Ok(response)
}

/// Puts every route of `routes` behind the quota guard.
pub fn guard_routes<S, E>(routes: Router<S>, guard: QuotaGuard<E>) -> Router<S>
where
    S: Clone + Send + Sync + 'static,
    E: EntitlementRead + UsageCounter + Send + Sync + 'static,
{
    routes.route_layer(middleware::from_fn_with_state(guard, quota_guard::<E>))
}
