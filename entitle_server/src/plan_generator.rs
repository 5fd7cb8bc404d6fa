// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! Weekly plan generation delegated to an external planning service.

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use entitle_core::{
    manager::adapters::WeeklyPlanGenerator,
    record::{WeeklyPlan, WeeklyPlanKey},
};
use reqwest::Client;
use serde::{Deserialize, Serialize};

/// Generation runs a model per day; allow it far more time than a storefront call.
pub const PLAN_GENERATION_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(thiserror::Error, Debug)]
pub enum PlanGeneratorError {
    #[error("plan generator request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("plan generator status={status} body={body}")]
    Status { status: u16, body: String },
}

/// Body posted to the planning service for one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRequest {
    pub user_id: i64,
    pub week_start: NaiveDate,
    pub weekday: u8,
    pub date: NaiveDate,
}

/// Posts a [`PlanRequest`] to `endpoint` and reads a [`WeeklyPlan`] back.
#[derive(Debug, Clone)]
pub struct HttpPlanGenerator {
    client: Client,
    endpoint: String,
}

impl HttpPlanGenerator {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, PlanGeneratorError> {
        let client = Client::builder().timeout(PLAN_GENERATION_TIMEOUT).build()?;
        Ok(Self::with_client(client, endpoint))
    }

    pub fn with_client(client: Client, endpoint: impl Into<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
        }
    }
}

#[async_trait]
impl WeeklyPlanGenerator for HttpPlanGenerator {
    type AdapterError = PlanGeneratorError;

    async fn generate_plan(
        &self,
        key: &WeeklyPlanKey,
        date: NaiveDate,
    ) -> Result<WeeklyPlan, Self::AdapterError> {
        let request = PlanRequest {
            user_id: key.user_id,
            week_start: key.week_start,
            weekday: key.weekday,
            date,
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let body = resp.text().await.unwrap_or_default();
            return Err(PlanGeneratorError::Status {
                status,
                body: body.trim().to_string(),
            });
        }
        Ok(resp.json().await?)
    }
}
