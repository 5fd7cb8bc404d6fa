// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! SQL context implementation for the entitlement managers.
//!
//! Backed by the `sqlx` Any driver, so the same context serves PostgreSQL in
//! production and SQLite in tests. Timestamps are stored as unix milliseconds
//! and JSON documents as text, which keeps every column portable between both
//! databases.
//!
//! Usage is counted from the tables owned by the metered features:
//! `menu_scan`, `meal_record` (rows with `source = 'food'`) and
//! `chat_message` (rows with `role = 'user'`).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{
    any::{AnyPoolOptions, AnyRow},
    AnyPool, Row,
};
use thiserror::Error;

use crate::{
    manager::adapters::*,
    quota::{QuotaWindow, UsageKind},
    record::{
        SubscriptionRecord, SubscriptionStatus, SubscriptionUpdate, WeeklyPlan, WeeklyPlanKey,
    },
};

/// Database type, selects the placeholder syntax of each query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatabaseType {
    PostgreSQL,
    SQLite,
}

impl DatabaseType {
    pub fn from_url(url: &str) -> Option<Self> {
        if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::PostgreSQL)
        } else if url.starts_with("sqlite:") {
            Some(Self::SQLite)
        } else {
            None
        }
    }
}

#[derive(Debug, Error)]
pub enum SqlError {
    #[error("unsupported database URL scheme: {0}")]
    UnsupportedUrl(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stored value is invalid: {0}")]
    InvalidRow(String),
}

mod queries {
    pub const CREATE_SUBSCRIPTION: &str = r#"
CREATE TABLE IF NOT EXISTS subscription (
    user_id BIGINT NOT NULL,
    platform TEXT NOT NULL,
    sku TEXT NOT NULL,
    status TEXT NOT NULL,
    expire_at_ms BIGINT,
    transaction_id TEXT NOT NULL,
    original_transaction_id TEXT NOT NULL DEFAULT '',
    created_at_ms BIGINT NOT NULL,
    updated_at_ms BIGINT NOT NULL,
    write_seq BIGINT NOT NULL DEFAULT 0,
    UNIQUE (user_id, transaction_id)
)
"#;

    pub const CREATE_WEEKLY_PLAN: &str = r#"
CREATE TABLE IF NOT EXISTS weekly_plan (
    user_id BIGINT NOT NULL,
    week_start TEXT NOT NULL,
    weekday INTEGER NOT NULL,
    plan_meals TEXT NOT NULL,
    recommendations TEXT NOT NULL,
    updated_at_ms BIGINT NOT NULL,
    UNIQUE (user_id, week_start, weekday)
)
"#;

    pub const CREATE_MENU_SCAN: &str = r#"
CREATE TABLE IF NOT EXISTS menu_scan (
    user_id BIGINT NOT NULL,
    created_at_ms BIGINT NOT NULL
)
"#;

    pub const CREATE_MEAL_RECORD: &str = r#"
CREATE TABLE IF NOT EXISTS meal_record (
    user_id BIGINT NOT NULL,
    source TEXT NOT NULL,
    recorded_at_ms BIGINT NOT NULL
)
"#;

    pub const CREATE_CHAT_MESSAGE: &str = r#"
CREATE TABLE IF NOT EXISTS chat_message (
    user_id BIGINT NOT NULL,
    role TEXT NOT NULL,
    created_at_ms BIGINT NOT NULL
)
"#;

    /// Keeps the stored original transaction id when the update carries none.
    pub const UPSERT_SUBSCRIPTION: &str = r#"
INSERT INTO subscription
    (user_id, platform, sku, status, expire_at_ms, transaction_id,
     original_transaction_id, created_at_ms, updated_at_ms, write_seq)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $8,
    (SELECT COALESCE(MAX(write_seq), 0) + 1 FROM subscription))
ON CONFLICT (user_id, transaction_id) DO UPDATE SET
    sku = excluded.sku,
    status = excluded.status,
    expire_at_ms = excluded.expire_at_ms,
    original_transaction_id = CASE
        WHEN excluded.original_transaction_id = '' THEN subscription.original_transaction_id
        ELSE excluded.original_transaction_id
    END,
    updated_at_ms = excluded.updated_at_ms,
    write_seq = excluded.write_seq
"#;

    pub const IS_ACTIVE: &str = r#"
SELECT COUNT(1) AS n
FROM subscription
WHERE user_id = $1
  AND status = 'active'
  AND (expire_at_ms IS NULL OR expire_at_ms > $2)
"#;

    pub const LIST_ACTIVE_USERS: &str = r#"
SELECT DISTINCT user_id
FROM subscription
WHERE status = 'active'
  AND (expire_at_ms IS NULL OR expire_at_ms > $1)
ORDER BY user_id
"#;

    pub const LATEST: &str = r#"
SELECT user_id, platform, sku, status, expire_at_ms, transaction_id,
       original_transaction_id, updated_at_ms
FROM subscription
WHERE user_id = $1
ORDER BY updated_at_ms DESC, write_seq DESC
LIMIT 1
"#;

    pub const COUNT_SUBSCRIBERS: &str = "SELECT COUNT(DISTINCT user_id) AS n FROM subscription";

    pub const COUNT_MENU_SCANS: &str = r#"
SELECT COUNT(1) AS n
FROM menu_scan
WHERE user_id = $1 AND created_at_ms >= $2 AND created_at_ms < $3
"#;

    pub const COUNT_MEAL_PHOTO_RECORDS: &str = r#"
SELECT COUNT(1) AS n
FROM meal_record
WHERE user_id = $1 AND source = 'food' AND recorded_at_ms >= $2 AND recorded_at_ms < $3
"#;

    pub const COUNT_CHAT_MESSAGES: &str = r#"
SELECT COUNT(1) AS n
FROM chat_message
WHERE user_id = $1 AND role = 'user' AND created_at_ms >= $2 AND created_at_ms < $3
"#;

    pub const INSERT_MENU_SCAN: &str =
        "INSERT INTO menu_scan (user_id, created_at_ms) VALUES ($1, $2)";
    pub const INSERT_MEAL_RECORD: &str =
        "INSERT INTO meal_record (user_id, source, recorded_at_ms) VALUES ($1, 'food', $2)";
    pub const INSERT_CHAT_MESSAGE: &str =
        "INSERT INTO chat_message (user_id, role, created_at_ms) VALUES ($1, 'user', $2)";

    pub const FIND_PLAN: &str = r#"
SELECT plan_meals, recommendations
FROM weekly_plan
WHERE user_id = $1 AND week_start = $2 AND weekday = $3
"#;

    pub const UPSERT_PLAN: &str = r#"
INSERT INTO weekly_plan
    (user_id, week_start, weekday, plan_meals, recommendations, updated_at_ms)
VALUES ($1, $2, $3, $4, $5, $6)
ON CONFLICT (user_id, week_start, weekday) DO UPDATE SET
    plan_meals = excluded.plan_meals,
    recommendations = excluded.recommendations,
    updated_at_ms = excluded.updated_at_ms
"#;
}

/// Rewrites `$N` placeholders to `?` for SQLite.
///
/// Every query binds its parameters in order of first appearance, except for
/// repeated placeholders which are expanded by [`SqlContext::bind_order`].
fn placeholders(query: &str, db_type: DatabaseType) -> String {
    match db_type {
        DatabaseType::PostgreSQL => query.to_string(),
        DatabaseType::SQLite => {
            let mut out = String::with_capacity(query.len());
            let mut chars = query.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '$' && chars.peek().is_some_and(char::is_ascii_digit) {
                    while chars.peek().is_some_and(char::is_ascii_digit) {
                        chars.next();
                    }
                    out.push('?');
                } else {
                    out.push(c);
                }
            }
            out
        }
    }
}

/// Positions (1-based) of the `$N` placeholders in textual order.
fn placeholder_order(query: &str) -> Vec<usize> {
    let mut order = Vec::new();
    let mut chars = query.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            continue;
        }
        let mut digits = String::new();
        while let Some(d) = chars.peek().filter(|d| d.is_ascii_digit()) {
            digits.push(*d);
            chars.next();
        }
        if let Ok(position) = digits.parse() {
            order.push(position);
        }
    }
    order
}

/// Bindable parameter of the queries above.
#[derive(Debug, Clone)]
enum Param {
    Int(i64),
    OptInt(Option<i64>),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct SqlContext {
    pool: AnyPool,
    db_type: DatabaseType,
}

impl SqlContext {
    /// Connects to `database_url` (PostgreSQL or SQLite).
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, SqlError> {
        sqlx::any::install_default_drivers();

        let db_type = DatabaseType::from_url(database_url)
            .ok_or_else(|| SqlError::UnsupportedUrl(database_url.to_string()))?;
        let pool = AnyPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;
        log::debug!("Connected to {db_type:?} database");

        Ok(Self { pool, db_type })
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }

    pub fn database_type(&self) -> DatabaseType {
        self.db_type
    }

    /// Creates the tables this context reads and writes, if missing.
    pub async fn ensure_schema(&self) -> Result<(), SqlError> {
        for statement in [
            queries::CREATE_SUBSCRIPTION,
            queries::CREATE_WEEKLY_PLAN,
            queries::CREATE_MENU_SCAN,
            queries::CREATE_MEAL_RECORD,
            queries::CREATE_CHAT_MESSAGE,
        ] {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Inserts one usage row in the table of `kind`.
    pub async fn record_usage(
        &self,
        user_id: i64,
        kind: UsageKind,
        created_at: DateTime<Utc>,
    ) -> Result<(), SqlError> {
        let query = match kind {
            UsageKind::MenuScan => queries::INSERT_MENU_SCAN,
            UsageKind::MealPhotoRecord => queries::INSERT_MEAL_RECORD,
            UsageKind::ChatMessage => queries::INSERT_CHAT_MESSAGE,
        };
        let created_at = created_at.timestamp_millis();
        self.execute(query, &[Param::Int(user_id), Param::Int(created_at)])
            .await
    }

    /// Parameters in the order the driver expects them.
    ///
    /// PostgreSQL binds by position so `params` is used as is; SQLite `?`
    /// placeholders bind in textual order, so repeated `$N` are expanded.
    fn bind_order(&self, query: &str, params: &[Param]) -> Vec<Param> {
        match self.db_type {
            DatabaseType::PostgreSQL => params.to_vec(),
            DatabaseType::SQLite => placeholder_order(query)
                .into_iter()
                .filter_map(|position| params.get(position.wrapping_sub(1)).cloned())
                .collect(),
        }
    }

    fn prepare<'q>(
        &self,
        sql: &'q str,
        params: Vec<Param>,
    ) -> sqlx::query::Query<'q, sqlx::Any, sqlx::any::AnyArguments<'q>> {
        params
            .into_iter()
            .fold(sqlx::query(sql), |query, param| match param {
                Param::Int(value) => query.bind(value),
                Param::OptInt(value) => query.bind(value),
                Param::Text(value) => query.bind(value),
            })
    }

    async fn execute(&self, query: &str, params: &[Param]) -> Result<(), SqlError> {
        let sql = placeholders(query, self.db_type);
        let params = self.bind_order(query, params);
        self.prepare(&sql, params).execute(&self.pool).await?;
        Ok(())
    }

    async fn fetch_all(&self, query: &str, params: &[Param]) -> Result<Vec<AnyRow>, SqlError> {
        let sql = placeholders(query, self.db_type);
        let params = self.bind_order(query, params);
        Ok(self.prepare(&sql, params).fetch_all(&self.pool).await?)
    }

    async fn fetch_optional(
        &self,
        query: &str,
        params: &[Param],
    ) -> Result<Option<AnyRow>, SqlError> {
        let sql = placeholders(query, self.db_type);
        let params = self.bind_order(query, params);
        Ok(self.prepare(&sql, params).fetch_optional(&self.pool).await?)
    }

    async fn fetch_count(&self, query: &str, params: &[Param]) -> Result<u64, SqlError> {
        let row = self.fetch_optional(query, params).await?;
        let count = match row {
            Some(row) => row.try_get::<i64, _>("n")?,
            None => 0,
        };
        u64::try_from(count).map_err(|err| SqlError::InvalidRow(err.to_string()))
    }
}

fn millis_to_utc(millis: i64) -> Result<DateTime<Utc>, SqlError> {
    DateTime::from_timestamp_millis(millis)
        .ok_or_else(|| SqlError::InvalidRow(format!("timestamp out of range: {millis}")))
}

fn parse_record(row: &AnyRow) -> Result<SubscriptionRecord, SqlError> {
    let status: String = row.try_get("status")?;
    let status = status
        .parse::<SubscriptionStatus>()
        .map_err(|err| SqlError::InvalidRow(format!("status {status:?}: {err}")))?;
    let expire_at = row
        .try_get::<Option<i64>, _>("expire_at_ms")?
        .map(millis_to_utc)
        .transpose()?;

    Ok(SubscriptionRecord {
        user_id: row.try_get("user_id")?,
        platform: row.try_get("platform")?,
        sku: row.try_get("sku")?,
        status,
        expire_at,
        transaction_id: row.try_get("transaction_id")?,
        original_transaction_id: row.try_get("original_transaction_id")?,
        updated_at: millis_to_utc(row.try_get("updated_at_ms")?)?,
    })
}

fn plan_params(key: &WeeklyPlanKey) -> [Param; 3] {
    [
        Param::Int(key.user_id),
        Param::Text(key.week_start.format("%Y-%m-%d").to_string()),
        Param::Int(i64::from(key.weekday)),
    ]
}

#[async_trait]
impl EntitlementStore for SqlContext {
    type AdapterError = SqlError;

    async fn upsert(
        &self,
        update: SubscriptionUpdate,
        now: DateTime<Utc>,
    ) -> Result<(), Self::AdapterError> {
        let transaction_id = update.idempotency_key();
        self.execute(
            queries::UPSERT_SUBSCRIPTION,
            &[
                Param::Int(update.user_id),
                Param::Text(update.platform),
                Param::Text(update.sku),
                Param::Text(update.status.to_string()),
                Param::OptInt(update.expire_at.map(|at| at.timestamp_millis())),
                Param::Text(transaction_id),
                Param::Text(update.original_transaction_id),
                Param::Int(now.timestamp_millis()),
            ],
        )
        .await
    }
}

#[async_trait]
impl EntitlementRead for SqlContext {
    type AdapterError = SqlError;

    async fn is_active(
        &self,
        user_id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, Self::AdapterError> {
        let count = self
            .fetch_count(
                queries::IS_ACTIVE,
                &[Param::Int(user_id), Param::Int(now.timestamp_millis())],
            )
            .await?;
        Ok(count > 0)
    }

    async fn list_active_user_ids(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<i64>, Self::AdapterError> {
        let rows = self
            .fetch_all(
                queries::LIST_ACTIVE_USERS,
                &[Param::Int(now.timestamp_millis())],
            )
            .await?;
        rows.iter()
            .map(|row| row.try_get::<i64, _>("user_id").map_err(SqlError::from))
            .collect()
    }

    async fn latest(&self, user_id: i64) -> Result<Option<SubscriptionRecord>, Self::AdapterError> {
        let row = self
            .fetch_optional(queries::LATEST, &[Param::Int(user_id)])
            .await?;
        row.as_ref().map(parse_record).transpose()
    }

    async fn count_distinct_subscribers(&self) -> Result<u64, Self::AdapterError> {
        self.fetch_count(queries::COUNT_SUBSCRIBERS, &[]).await
    }
}

#[async_trait]
impl UsageCounter for SqlContext {
    type AdapterError = SqlError;

    async fn count_usage(
        &self,
        user_id: i64,
        kind: UsageKind,
        window: &QuotaWindow,
    ) -> Result<u64, Self::AdapterError> {
        let query = match kind {
            UsageKind::MenuScan => queries::COUNT_MENU_SCANS,
            UsageKind::MealPhotoRecord => queries::COUNT_MEAL_PHOTO_RECORDS,
            UsageKind::ChatMessage => queries::COUNT_CHAT_MESSAGES,
        };
        self.fetch_count(
            query,
            &[
                Param::Int(user_id),
                Param::Int(window.start_utc().timestamp_millis()),
                Param::Int(window.end_utc().timestamp_millis()),
            ],
        )
        .await
    }
}

#[async_trait]
impl WeeklyPlanCache for SqlContext {
    type AdapterError = SqlError;

    async fn cached_plan(
        &self,
        key: &WeeklyPlanKey,
    ) -> Result<Option<WeeklyPlan>, Self::AdapterError> {
        let params = plan_params(key);
        let Some(row) = self.fetch_optional(queries::FIND_PLAN, &params).await? else {
            return Ok(None);
        };
        let plan_meals: String = row.try_get("plan_meals")?;
        let recommendations: String = row.try_get("recommendations")?;
        let parse = |raw: &str| {
            serde_json::from_str(raw).map_err(|err| SqlError::InvalidRow(err.to_string()))
        };
        Ok(Some(WeeklyPlan {
            plan_meals: parse(&plan_meals)?,
            recommendations: parse(&recommendations)?,
        }))
    }

    async fn store_plan(
        &self,
        key: &WeeklyPlanKey,
        plan: &WeeklyPlan,
    ) -> Result<(), Self::AdapterError> {
        let [user_id, week_start, weekday] = plan_params(key);
        self.execute(
            queries::UPSERT_PLAN,
            &[
                user_id,
                week_start,
                weekday,
                Param::Text(plan.plan_meals.to_string()),
                Param::Text(plan.recommendations.to_string()),
                Param::Int(Utc::now().timestamp_millis()),
            ],
        )
        .await
    }
}
