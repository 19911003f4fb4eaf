//! Cadence scheduler.
//!
//! Three cadences run on wall-clock times (UTC). Each step inside a cadence is
//! isolated: a failing step is reported and the next one still runs. A cadence
//! that is still running when it fires again is skipped, not queued.

use chrono::{DateTime, Datelike, Duration, NaiveTime, TimeZone, Utc, Weekday};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use utoipa::ToSchema;

use crate::engine::OutreachEngine;
use crate::errors::AppError;

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for tests and replays.
#[derive(Debug)]
pub struct FixedClock {
    now: RwLock<DateTime<Utc>>,
}

impl FixedClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            now: RwLock::new(now),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        if let Ok(mut guard) = self.now.write() {
            *guard = now;
        }
    }

    pub fn advance(&self, by: Duration) {
        if let Ok(mut guard) = self.now.write() {
            *guard += by;
        }
    }
}

impl Clock for FixedClock {
    fn now(&self) -> DateTime<Utc> {
        match self.now.read() {
            Ok(guard) => *guard,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    DailyMorning,
    DailyAfternoon,
    Weekly,
}

impl Cadence {
    pub const ALL: [Cadence; 3] = [Cadence::DailyMorning, Cadence::DailyAfternoon, Cadence::Weekly];

    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::DailyMorning => "daily_morning",
            Cadence::DailyAfternoon => "daily_afternoon",
            Cadence::Weekly => "weekly",
        }
    }

    fn slot(&self) -> usize {
        match self {
            Cadence::DailyMorning => 0,
            Cadence::DailyAfternoon => 1,
            Cadence::Weekly => 2,
        }
    }
}

impl std::fmt::Display for Cadence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "daily_morning" | "morning" => Ok(Cadence::DailyMorning),
            "daily_afternoon" | "afternoon" => Ok(Cadence::DailyAfternoon),
            "weekly" => Ok(Cadence::Weekly),
            other => Err(format!(
                "unknown cadence '{}' (expected daily_morning, daily_afternoon or weekly)",
                other
            )),
        }
    }
}

/// Fire times, in UTC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CadenceSchedule {
    pub morning: NaiveTime,
    pub afternoon: NaiveTime,
    pub weekly_day: Weekday,
    pub weekly_time: NaiveTime,
}

impl Default for CadenceSchedule {
    fn default() -> Self {
        let at = |h| NaiveTime::from_hms_opt(h, 0, 0).unwrap_or_default();
        Self {
            morning: at(9),
            afternoon: at(14),
            weekly_day: Weekday::Mon,
            weekly_time: at(8),
        }
    }
}

impl CadenceSchedule {
    /// First fire time strictly after `after`.
    pub fn next_fire(&self, cadence: Cadence, after: DateTime<Utc>) -> DateTime<Utc> {
        let on = |date: chrono::NaiveDate, time: NaiveTime| Utc.from_utc_datetime(&date.and_time(time));
        let today = after.date_naive();
        match cadence {
            Cadence::DailyMorning | Cadence::DailyAfternoon => {
                let time = if cadence == Cadence::DailyMorning {
                    self.morning
                } else {
                    self.afternoon
                };
                let candidate = on(today, time);
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::days(1)
                }
            }
            Cadence::Weekly => {
                let ahead = (7 + self.weekly_day.num_days_from_monday() as i64
                    - today.weekday().num_days_from_monday() as i64)
                    % 7;
                let candidate = on(today + Duration::days(ahead), self.weekly_time);
                if candidate > after {
                    candidate
                } else {
                    candidate + Duration::days(7)
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct StepReport {
    pub name: String,
    pub ok: bool,
    /// Step summary on success, error text on failure.
    #[schema(value_type = Object)]
    pub detail: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, ToSchema)]
pub struct CadenceReport {
    pub cadence: Cadence,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// True when another run of the same cadence was already in progress.
    pub skipped: bool,
    pub steps: Vec<StepReport>,
}

impl CadenceReport {
    pub fn all_ok(&self) -> bool {
        self.steps.iter().all(|s| s.ok)
    }
}

fn step<T: Serialize>(name: &str, result: Result<T, AppError>) -> StepReport {
    match result {
        Ok(summary) => StepReport {
            name: name.to_string(),
            ok: true,
            detail: serde_json::to_value(summary).unwrap_or(serde_json::Value::Null),
        },
        Err(e) => {
            tracing::error!("Step {} failed: {}", name, e);
            StepReport {
                name: name.to_string(),
                ok: false,
                detail: serde_json::Value::String(e.to_string()),
            }
        }
    }
}

pub struct Scheduler {
    engine: Arc<OutreachEngine>,
    clock: Arc<dyn Clock>,
    running: [Mutex<()>; 3],
}

impl Scheduler {
    pub fn new(engine: Arc<OutreachEngine>, clock: Arc<dyn Clock>) -> Self {
        Self {
            engine,
            clock,
            running: [Mutex::new(()), Mutex::new(()), Mutex::new(())],
        }
    }

    pub fn engine(&self) -> &Arc<OutreachEngine> {
        &self.engine
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Runs one cadence to completion, or returns a skipped report if the
    /// same cadence is already running.
    pub async fn run(&self, cadence: Cadence) -> CadenceReport {
        let started_at = self.clock.now();
        let Ok(_running) = self.running[cadence.slot()].try_lock() else {
            tracing::warn!("Cadence {} already running; skipping this trigger", cadence);
            return CadenceReport {
                cadence,
                started_at,
                finished_at: started_at,
                skipped: true,
                steps: Vec::new(),
            };
        };

        tracing::info!("Cadence {} started", cadence);
        let now = started_at;
        let engine = &self.engine;
        let mut steps = Vec::new();
        match cadence {
            Cadence::DailyMorning => {
                steps.push(step("score_leads", engine.score_pending(now).await));
                // Call targets are picked before the campaign touches last_contact_at.
                let targets = engine.call_targets(now).await;
                steps.push(step("email_campaign", engine.run_email_campaign(now).await));
                let calls = match targets {
                    Ok(targets) => engine.place_calls(&targets, now).await,
                    Err(e) => Err(e),
                };
                steps.push(step("hot_lead_calls", calls));
                steps.push(step("ticket_reprioritization", engine.reprioritize_tickets(now).await));
                steps.push(step("ticket_escalation", engine.escalate_stale_tickets(now).await));
            }
            Cadence::DailyAfternoon => {
                steps.push(step("follow_ups", engine.run_follow_ups(now).await));
                steps.push(step("delivery_metrics", engine.delivery_metrics(now).await));
                steps.push(step("ticket_auto_close", engine.auto_close_resolved(now).await));
            }
            Cadence::Weekly => {
                steps.push(step("weekly_report", engine.weekly_report(now).await));
                steps.push(step("retention", engine.run_retention(now).await));
            }
        }

        let report = CadenceReport {
            cadence,
            started_at,
            finished_at: self.clock.now(),
            skipped: false,
            steps,
        };
        let failed = report.steps.iter().filter(|s| !s.ok).count();
        if failed == 0 {
            tracing::info!("Cadence {} finished ({} steps)", cadence, report.steps.len());
        } else {
            tracing::warn!(
                "Cadence {} finished with {} of {} steps failed",
                cadence,
                failed,
                report.steps.len()
            );
        }
        report
    }

    /// Starts one background loop per cadence.
    pub fn spawn(self: Arc<Self>) -> Vec<JoinHandle<()>> {
        Cadence::ALL
            .into_iter()
            .map(|cadence| {
                let scheduler = self.clone();
                tokio::spawn(async move {
                    loop {
                        let now = scheduler.clock.now();
                        let next = scheduler
                            .engine
                            .settings()
                            .schedule
                            .next_fire(cadence, now);
                        tracing::debug!("Cadence {} next fires at {}", cadence, next);
                        let wait = (next - now).to_std().unwrap_or_default();
                        tokio::time::sleep(wait).await;
                        scheduler.run(cadence).await;
                    }
                })
            })
            .collect()
    }
}
