//! Cron triggers for the scrape and analysis jobs.
//!
//! Schedules are cron expressions evaluated in a fixed UTC offset (KST by
//! default). Five-field expressions (`min hour dom month dow`) are accepted
//! and run at second zero. A tick that finds its job still running is
//! skipped, not queued.

use crate::error::{PipelineError, Result};
use crate::jobs::TriggerOutcome;
use crate::models::{JobKind, TriggerSource};
use crate::pipeline::Pipeline;
use crate::scrapers::ArticleFetcher;
use chrono::{DateTime, FixedOffset, Utc};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Offset of `hours` east of UTC.
pub fn utc_offset(hours: i32) -> Result<FixedOffset> {
    FixedOffset::east_opt(hours * 3600).ok_or_else(|| PipelineError::Config(format!("invalid UTC offset: {hours}h")))
}

/// A cron expression bound to a UTC offset.
#[derive(Debug, Clone)]
pub struct CronSchedule {
    expr: String,
    schedule: Schedule,
    offset: FixedOffset,
}

impl CronSchedule {
    pub fn parse(expr: &str, offset_hours: i32) -> Result<Self> {
        let offset = utc_offset(offset_hours)?;
        let fields: Vec<&str> = expr.split_whitespace().collect();
        let full = match fields.len() {
            5 => format!("0 {}", fields.join(" ")),
            _ => fields.join(" "),
        };
        let schedule = Schedule::from_str(&full)
            .map_err(|e| PipelineError::Config(format!("invalid cron expression {expr:?}: {e}")))?;
        Ok(Self {
            expr: expr.trim().to_string(),
            schedule,
            offset,
        })
    }

    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First firing strictly after `t`.
    pub fn next_after(&self, t: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule
            .after(&t.with_timezone(&self.offset))
            .next()
            .map(|next| next.with_timezone(&Utc))
    }

    /// Firing after the one at `fired`, observed at wall-clock `now`.
    ///
    /// Never earlier than `fired`, so a clock running behind cannot fire the
    /// same slot twice; slots missed while the process was suspended are
    /// dropped rather than replayed.
    pub fn following(&self, fired: DateTime<Utc>, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_after(fired.max(now))
    }
}

/// Trigger `kind`; returns the running job's start time if it was already running.
fn fire<F>(pipeline: &Arc<Pipeline<F>>, kind: JobKind) -> Option<Option<DateTime<Utc>>>
where
    F: ArticleFetcher + 'static,
{
    fn rejected<T>(outcome: TriggerOutcome<T>) -> Option<Option<DateTime<Utc>>> {
        match outcome {
            TriggerOutcome::Started { .. } => None,
            TriggerOutcome::AlreadyRunning { running_since } => Some(running_since),
        }
    }

    match kind {
        JobKind::Scrape => rejected(pipeline.trigger_scrape(TriggerSource::Cron)),
        JobKind::Analysis => rejected(
            pipeline.trigger_analysis(TriggerSource::Cron, pipeline.settings().analysis_batch_size),
        ),
    }
}

/// Run `kind` on `schedule` until `shutdown` fires.
pub fn spawn_schedule<F>(
    pipeline: Arc<Pipeline<F>>,
    kind: JobKind,
    schedule: CronSchedule,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()>
where
    F: ArticleFetcher + 'static,
{
    tokio::spawn(async move {
        let mut slot = schedule.next_after(Utc::now());
        loop {
            let Some(next) = slot else {
                warn!(%kind, cron = schedule.expr(), "Schedule has no future runs");
                break;
            };
            let wait = (next - Utc::now()).to_std().unwrap_or_default();
            info!(%kind, next = %next.with_timezone(&schedule.offset), "Next scheduled run");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    if let Some(running_since) = fire(&pipeline, kind) {
                        warn!(%kind, ?running_since, "Scheduled run skipped; previous run still active");
                    }
                    slot = schedule.following(next, Utc::now());
                }
                _ = shutdown.recv() => {
                    info!(%kind, "Schedule stopped");
                    break;
                }
            }
        }
    })
}
