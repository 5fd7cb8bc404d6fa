// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, NaiveTime, Utc};

const NAIVE_CLIENT_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// The local calendar day usage is counted over: `[start, start + 24h)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaWindow {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
}

impl QuotaWindow {
    /// Window of the day `at` falls in, in the offset of `at`.
    pub fn containing(at: DateTime<FixedOffset>) -> Self {
        let start = at - (at.time() - NaiveTime::MIN);
        Self {
            start,
            end: start + Duration::hours(24),
        }
    }

    /// Window of the day the client says it is, falling back to `now`.
    pub fn from_client_time(raw: &str, now: DateTime<FixedOffset>) -> Self {
        Self::containing(parse_client_time(raw, now))
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        at >= self.start_utc() && at < self.end_utc()
    }

    pub fn start_utc(&self) -> DateTime<Utc> {
        self.start.with_timezone(&Utc)
    }

    pub fn end_utc(&self) -> DateTime<Utc> {
        self.end.with_timezone(&Utc)
    }
}

/// Reads a client supplied timestamp.
///
/// RFC 3339 keeps the client offset, `YYYY-MM-DD HH:MM:SS` is read as UTC,
/// anything else (including an empty string) yields `now`.
pub fn parse_client_time(raw: &str, now: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let value = raw.trim();
    if value.is_empty() {
        return now;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return parsed;
    }
    if let Ok(parsed) = NaiveDateTime::parse_from_str(value, NAIVE_CLIENT_TIME_FORMAT) {
        return parsed.and_utc().fixed_offset();
    }
    log::debug!("Unparseable client time {value:?}, using server clock");
    now
}
