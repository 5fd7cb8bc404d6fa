// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

use axum::{extract::FromRequestParts, http::request::Parts};

use crate::envelope::ApiError;

/// Header carrying the caller, set by the authentication layer in front of us.
pub const USER_ID_HEADER: &str = "x-user-id";

/// Authenticated caller of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserId(pub i64);

impl<S> FromRequestParts<S> for UserId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(USER_ID_HEADER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<i64>().ok())
            .filter(|user_id| *user_id > 0)
            .map(UserId)
            .ok_or_else(|| ApiError::unauthorized("invalid user context"))
    }
}
