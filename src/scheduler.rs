//! Archive scheduler.
//!
//! A long-lived task that fires the Hot → Cold archive flow on a daily
//! cron-style schedule and accepts manual `archive_now` triggers over a
//! channel. After each timed run it also checks the Cold rebuild
//! trigger. The scheduler owns nothing; it calls back into the store.

use crate::config::{parse_schedule, DailySchedule};
use crate::error::{EngineError, Result};
use crate::store::{ArchiveReport, GenerationalStore};
use chrono::{Local, NaiveTime, TimeZone};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Manual trigger message.
struct RunNow {
    force: bool,
    reply: oneshot::Sender<Result<ArchiveReport>>,
}

/// Handle to the running scheduler task.
pub struct ArchiveScheduler {
    trigger_tx: mpsc::Sender<RunNow>,
    handle: tokio::task::JoinHandle<()>,
}

impl ArchiveScheduler {
    /// Spawn the scheduler for a store, using the store's configured
    /// cron expression. Requires the generational index.
    pub fn spawn(store: Arc<GenerationalStore>) -> Result<Self> {
        let schedule = parse_schedule(&store.config().archive_schedule)?;
        if store.stats().cold.is_none() {
            return Err(EngineError::Config(
                "archive scheduler requires the generational index".into(),
            ));
        }
        let (trigger_tx, mut trigger_rx) = mpsc::channel::<RunNow>(8);

        let handle = tokio::spawn(async move {
            tracing::info!(
                hour = schedule.hour,
                minute = schedule.minute,
                "archive scheduler started"
            );
            loop {
                let wait = until_next_fire(schedule);
                tokio::select! {
                    maybe_cmd = trigger_rx.recv() => {
                        match maybe_cmd {
                            Some(cmd) => {
                                let result = store.archive_old(cmd.force).await;
                                let _ = cmd.reply.send(result);
                            }
                            None => {
                                tracing::info!("archive scheduler shutting down");
                                break;
                            }
                        }
                    }
                    _ = tokio::time::sleep(wait) => {
                        match store.archive_old(false).await {
                            Ok(report) => tracing::info!(
                                archived = report.archived,
                                "scheduled archive run finished"
                            ),
                            Err(e) => tracing::warn!("scheduled archive run failed: {e}"),
                        }
                        // Piggyback the Cold rebuild check on the daily run
                        if store.stats().needs_cold_rebuild {
                            match store.rebuild_cold().await {
                                Ok(report) => tracing::info!(
                                    dropped = report.dropped,
                                    "scheduled cold rebuild finished"
                                ),
                                Err(e) => tracing::warn!("scheduled cold rebuild failed: {e}"),
                            }
                        }
                    }
                }
            }
        });

        Ok(Self { trigger_tx, handle })
    }

    /// Trigger an archive run immediately and wait for its report.
    pub async fn archive_now(&self, force: bool) -> Result<ArchiveReport> {
        let (reply, rx) = oneshot::channel();
        self.trigger_tx
            .send(RunNow { force, reply })
            .await
            .map_err(|_| EngineError::BackendUnavailable("archive scheduler stopped".into()))?;
        rx.await
            .map_err(|_| EngineError::BackendUnavailable("archive scheduler dropped reply".into()))?
    }

    /// Stop the scheduler task.
    pub fn stop(self) {
        self.handle.abort();
    }
}

/// Duration until the next `hh:mm` local-time occurrence.
fn until_next_fire(schedule: DailySchedule) -> Duration {
    let now = Local::now();
    let target_time = NaiveTime::from_hms_opt(schedule.hour, schedule.minute, 0)
        .expect("schedule validated at parse");
    let today_target = now.date_naive().and_time(target_time);
    let target = if today_target > now.naive_local() {
        today_target
    } else {
        today_target + chrono::Duration::days(1)
    };
    match Local.from_local_datetime(&target).earliest() {
        Some(fire_at) => (fire_at - now)
            .to_std()
            .unwrap_or(Duration::from_secs(60)),
        // DST gap: retry in an hour
        None => Duration::from_secs(3600),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_until_next_fire_within_a_day() {
        let wait = until_next_fire(DailySchedule { minute: 0, hour: 2 });
        assert!(wait <= Duration::from_secs(24 * 3600));
        assert!(wait > Duration::ZERO);
    }

    #[test]
    fn test_until_next_fire_differs_across_times() {
        // Two schedules an hour apart can't both be due at the same instant
        let a = until_next_fire(DailySchedule { minute: 0, hour: 3 });
        let b = until_next_fire(DailySchedule { minute: 0, hour: 4 });
        let diff = if a > b { a - b } else { b - a };
        assert!(diff >= Duration::from_secs(3000));
    }
}
