// Copyright 2024-, EatClean contributors
// SPDX-License-Identifier: Apache-2.0

//! # Weekly plan refresh
//!
//! Once a night the scheduler walks every entitled user and fills the plan
//! cache for the seven days starting tomorrow. Days already cached are left
//! alone, so a second pass over the same night generates nothing.
//!
//! The scheduler is a small state machine:
//!
//! ```text
//! Idle --arm--> Sleeping { until } --due--> Running { scheduled_for } --arm--> Sleeping
//! ```
//!
//! Time is read through a [`Clock`], so the transitions can be driven by a
//! [`ManualClock`] in tests without waiting for the real night.

use std::sync::{Arc, RwLock};

use chrono::{
    DateTime, Duration, FixedOffset, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Utc,
};
use tokio_util::sync::CancellationToken;

use crate::{
    manager::adapters::{EntitlementRead, WeeklyPlanCache, WeeklyPlanGenerator},
    record::WeeklyPlanKey,
};

pub const DEFAULT_REFRESH_HOUR: u32 = 23;
pub const DEFAULT_REFRESH_MINUTE: u32 = 30;

/// Days generated ahead of each run.
const PLAN_HORIZON_DAYS: i64 = 7;

/// Source of the current time.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<FixedOffset>;

    /// Next `hour:minute` on this clock's wall clock, strictly after now.
    ///
    /// The default keeps the offset of [`Clock::now`], which is only right for
    /// clocks without daylight saving transitions.
    fn next_run(&self, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        next_nightly_run(&self.now(), hour, minute)
    }
}

/// Wall clock in the server's local time zone.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<FixedOffset> {
        Local::now().fixed_offset()
    }

    fn next_run(&self, hour: u32, minute: u32) -> DateTime<FixedOffset> {
        next_nightly_run(&Local::now(), hour, minute).fixed_offset()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(RwLock<DateTime<FixedOffset>>);

impl ManualClock {
    pub fn new(now: DateTime<FixedOffset>) -> Self {
        Self(RwLock::new(now))
    }

    pub fn set(&self, now: DateTime<FixedOffset>) {
        match self.0.write() {
            Ok(mut current) => *current = now,
            Err(poisoned) => *poisoned.into_inner() = now,
        }
    }

    pub fn advance(&self, by: Duration) {
        let now = self.now();
        self.set(now + by);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<FixedOffset> {
        match self.0.read() {
            Ok(current) => *current,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

/// Next wall-clock time `hour:minute` strictly after `now`, in the time zone of `now`.
///
/// An hour outside `0..=23` means 23, a minute outside `0..=59` means 0. The
/// target is resolved on the local date, so a daylight saving transition moves
/// the gap between two runs instead of the time of day.
pub fn next_nightly_run<Tz: TimeZone>(now: &DateTime<Tz>, hour: u32, minute: u32) -> DateTime<Tz> {
    let hour = if hour > 23 { 23 } else { hour };
    let minute = if minute > 59 { 0 } else { minute };
    let time = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);

    let zone = now.timezone();
    let today = now.date_naive();
    (0..=2)
        .filter_map(|days| local_time(&zone, (today + Duration::days(days)).and_time(time)))
        .find(|target| target > now)
        .unwrap_or_else(|| now.clone() + Duration::days(1))
}

/// Resolves a local time. A repeated time takes its first occurrence, a time
/// skipped by a transition moves one hour later.
fn local_time<Tz: TimeZone>(zone: &Tz, time: NaiveDateTime) -> Option<DateTime<Tz>> {
    match zone.from_local_datetime(&time) {
        LocalResult::Single(at) => Some(at),
        LocalResult::Ambiguous(earliest, _) => Some(earliest),
        LocalResult::None => time
            .checked_add_signed(Duration::hours(1))
            .and_then(|later| zone.from_local_datetime(&later).earliest()),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Idle,
    Sleeping { until: DateTime<FixedOffset> },
    Running {
        scheduled_for: DateTime<FixedOffset>,
    },
}

/// Counts of one refresh pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefreshReport {
    pub users: usize,
    pub generated: usize,
    pub skipped: usize,
    pub failed: usize,
}

pub struct WeeklyRefreshScheduler<S, P, G> {
    /// Source of entitled users
    store: S,

    /// Plan storage, `None` when no cache is configured
    plans: Option<P>,

    /// Plan producer, `None` when generation is not configured
    generator: Option<G>,

    clock: Arc<dyn Clock>,
    hour: u32,
    minute: u32,
    state: SchedulerState,
}

impl<S, P, G> WeeklyRefreshScheduler<S, P, G> {
    pub fn new(store: S, plans: Option<P>, generator: Option<G>) -> Self {
        Self {
            store,
            plans,
            generator,
            clock: Arc::new(SystemClock),
            hour: DEFAULT_REFRESH_HOUR,
            minute: DEFAULT_REFRESH_MINUTE,
            state: SchedulerState::Idle,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_schedule(mut self, hour: u32, minute: u32) -> Self {
        self.hour = hour;
        self.minute = minute;
        self
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Computes the next run from the clock and goes to sleep until then.
    pub fn arm(&mut self) -> DateTime<FixedOffset> {
        let until = self.clock.next_run(self.hour, self.minute);
        self.state = SchedulerState::Sleeping { until };
        until
    }

    /// Moves from `Sleeping` to `Running` once the wake-up time has passed.
    ///
    /// Returns the scheduled time of the run that became due.
    pub fn poll_due(&mut self) -> Option<DateTime<FixedOffset>> {
        match self.state {
            SchedulerState::Sleeping { until } if self.clock.now() >= until => {
                self.state = SchedulerState::Running {
                    scheduled_for: until,
                };
                Some(until)
            }
            _ => None,
        }
    }
}

impl<S, P, G> WeeklyRefreshScheduler<S, P, G>
where
    S: EntitlementRead + Send + Sync,
    P: WeeklyPlanCache + Send + Sync,
    G: WeeklyPlanGenerator + Send + Sync,
{
    /// Runs a due pass, if any, and re-arms.
    pub async fn tick(&mut self) -> Option<RefreshReport> {
        let scheduled_for = self.poll_due()?;
        let report = self.run_once(scheduled_for).await;
        self.arm();
        Some(report)
    }

    /// Fills the cache for every entitled user and each of the seven days
    /// following `now`.
    ///
    /// Failures of one user/day pair are logged and counted; the pass goes on.
    pub async fn run_once(&self, now: DateTime<FixedOffset>) -> RefreshReport {
        let mut report = RefreshReport::default();

        let Some(generator) = &self.generator else {
            log::info!("Weekly plan refresh skipped: plan generator not configured");
            return report;
        };
        let Some(plans) = &self.plans else {
            log::info!("Weekly plan refresh skipped: plan cache unavailable");
            return report;
        };

        let now_utc = now.with_timezone(&Utc);
        let user_ids = match self.store.list_active_user_ids(now_utc).await {
            Ok(user_ids) => user_ids,
            Err(err) => {
                log::error!("Weekly plan refresh failed to load subscribers: {err}");
                return report;
            }
        };
        if user_ids.is_empty() {
            log::info!("Weekly plan refresh skipped: no entitled users");
            return report;
        }
        report.users = user_ids.len();

        let start_date = now.date_naive() + Duration::days(1);
        for user_id in user_ids {
            for offset in 0..PLAN_HORIZON_DAYS {
                let date = start_date + Duration::days(offset);
                let key = WeeklyPlanKey::for_date(user_id, date);

                match plans.cached_plan(&key).await {
                    Ok(Some(_)) => {
                        report.skipped += 1;
                        continue;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        log::warn!("Plan cache lookup failed (user {user_id}, {date}): {err}");
                    }
                }

                let plan = match generator.generate_plan(&key, date).await {
                    Ok(plan) => plan,
                    Err(err) => {
                        log::warn!(
                            "Plan generation failed (user {user_id}, day {}): {err}",
                            key.weekday
                        );
                        report.failed += 1;
                        continue;
                    }
                };
                if let Err(err) = plans.store_plan(&key, &plan).await {
                    log::warn!("Plan cache write failed (user {user_id}, {date}): {err}");
                    report.failed += 1;
                    continue;
                }
                report.generated += 1;
            }
        }

        log::info!(
            "Weekly plan refresh done: {} users, {} generated, {} cached, {} failed",
            report.users,
            report.generated,
            report.skipped,
            report.failed
        );
        report
    }

    /// Sleeps until each nightly run and executes it, until `cancel` fires.
    ///
    /// Cancellation is observed during the sleep only; a running pass finishes.
    /// `on_report` is called after every pass.
    pub async fn run<F>(mut self, cancel: CancellationToken, mut on_report: F)
    where
        F: FnMut(&RefreshReport) + Send,
    {
        loop {
            let until = self.arm();
            let wait = (until - self.clock.now()).to_std().unwrap_or_default();
            log::debug!("Weekly plan refresh sleeping until {until}");

            tokio::select! {
                _ = cancel.cancelled() => {
                    self.state = SchedulerState::Idle;
                    log::info!("Weekly plan refresh stopped");
                    return;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            self.state = SchedulerState::Running {
                scheduled_for: until,
            };
            let report = self.run_once(until).await;
            on_report(&report);
        }
    }
}
