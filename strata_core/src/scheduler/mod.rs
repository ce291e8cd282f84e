//! Cron scheduler: keeps one scheduling arm per enabled job, dispatches
//! firings with bounded concurrency and retry, and persists run history.
//!
//! The registry is synced on startup and then periodically: jobs that
//! disappeared get their arm cancelled, every loaded job gets its arm
//! cancelled and reinstalled (so edits take effect), and `next_run_at` is
//! persisted after each install. A job's arm awaits its own dispatch, so
//! dispatches of the same job never overlap.

pub mod actions;
pub mod dispatch;

use chrono::{DateTime, Utc};
use cron::Schedule;
use dashmap::DashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::models::CronJob;
use crate::store::PlatformDb;
use crate::{Error, Result};

pub use actions::{LogNotifier, NotificationSink, PlatformActions};
pub use dispatch::{AttemptOutcome, HttpPlatformRunner, JobRunner};

struct Inner {
    store: Arc<dyn PlatformDb>,
    runner: Arc<dyn JobRunner>,
    notifier: Option<Arc<dyn NotificationSink>>,
    cfg: SchedulerConfig,
    arms: DashMap<Uuid, JoinHandle<()>>,
    running: AtomicUsize,
}

#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn PlatformDb>,
        runner: Arc<dyn JobRunner>,
        notifier: Option<Arc<dyn NotificationSink>>,
        cfg: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                runner,
                notifier,
                cfg,
                arms: DashMap::new(),
                running: AtomicUsize::new(0),
            }),
        }
    }

    /// Sync once, then keep syncing on the poll interval until aborted.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn run_loop(&self) {
        let mut ticker = tokio::time::interval(self.inner.cfg.poll_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.sync_jobs().await {
                tracing::warn!(error = %e, "scheduler sync failed");
            }
        }
    }

    /// Reconcile the arm registry against the enabled jobs in the store.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn sync_jobs(&self) -> Result<()> {
        let jobs = self.inner.store.list_cron_jobs(true).await?;

        let live: std::collections::HashSet<Uuid> = jobs.iter().map(|j| j.id).collect();
        let stale: Vec<Uuid> = self
            .inner
            .arms
            .iter()
            .map(|e| *e.key())
            .filter(|id| !live.contains(id))
            .collect();
        for id in stale {
            if let Some((_, handle)) = self.inner.arms.remove(&id) {
                handle.abort();
                tracing::debug!(job_id = %id, "cancelled stale scheduling arm");
            }
        }

        for job in jobs {
            self.install_arm(job).await;
        }
        Ok(())
    }

    /// Cancel and replace the arm for one job, persisting its next run.
    #[tracing::instrument(level = "debug", skip(self, job))]
    async fn install_arm(&self, job: CronJob) {
        if let Some((_, prior)) = self.inner.arms.remove(&job.id) {
            prior.abort();
        }

        let next = match next_fire(&job.cron_expr, &job.timezone, Utc::now()) {
            Ok(Some(next)) => next,
            Ok(None) => {
                tracing::warn!(job_id = %job.id, expr = %job.cron_expr,
                    "cron expression yields no future firing; arm not installed");
                return;
            }
            Err(e) => {
                tracing::warn!(job_id = %job.id, expr = %job.cron_expr, error = %e,
                    "invalid cron expression; arm not installed");
                return;
            }
        };

        // Next-run persistence is best-effort.
        if let Err(e) = self
            .inner
            .store
            .set_cron_job_runtimes(job.id, None, Some(next))
            .await
        {
            tracing::warn!(job_id = %job.id, error = %e, "failed persisting next_run_at");
        }

        let scheduler = self.clone();
        let job_id = job.id;
        let handle = tokio::spawn(async move {
            loop {
                let now = Utc::now();
                let next = match next_fire(&job.cron_expr, &job.timezone, now) {
                    Ok(Some(next)) => next,
                    _ => break,
                };
                let delay = (next - now).to_std().unwrap_or_default();
                tokio::time::sleep(delay).await;
                // Awaiting the dispatch keeps firings of this job serial.
                scheduler.dispatch(&job).await;
            }
        });
        self.inner.arms.insert(job_id, handle);
    }

    pub(crate) fn store(&self) -> &Arc<dyn PlatformDb> {
        &self.inner.store
    }

    pub(crate) fn runner(&self) -> &Arc<dyn JobRunner> {
        &self.inner.runner
    }

    pub(crate) fn notifier(&self) -> Option<&Arc<dyn NotificationSink>> {
        self.inner.notifier.as_ref()
    }

    pub(crate) fn max_concurrent(&self) -> usize {
        self.inner.cfg.max_concurrent_jobs
    }

    pub(crate) fn running_counter(&self) -> &AtomicUsize {
        &self.inner.running
    }

    /// Number of live arms (for the admin stats surface).
    pub fn active_jobs(&self) -> usize {
        self.inner.arms.len()
    }

    /// Abort every arm. Called on shutdown.
    pub fn shutdown(&self) {
        let ids: Vec<Uuid> = self.inner.arms.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, handle)) = self.inner.arms.remove(&id) {
                handle.abort();
            }
        }
    }
}

/// Next firing of `expr` in `timezone`, strictly after `after`.
///
/// Five-field expressions get a seconds field of `0` prepended. An
/// unknown timezone falls back to UTC with a warning.
pub fn next_fire(
    expr: &str,
    timezone: &str,
    after: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>> {
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    let schedule = Schedule::from_str(&normalized)
        .map_err(|e| Error::BadRequest(format!("invalid cron expression '{expr}': {e}")))?;

    let tz: chrono_tz::Tz = match timezone.parse() {
        Ok(tz) => tz,
        Err(_) => {
            tracing::warn!(timezone = %timezone, "unknown timezone; evaluating cron in UTC");
            chrono_tz::UTC
        }
    };
    Ok(schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn five_field_expressions_are_accepted() {
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 10, 30, 0).unwrap();
        let next = next_fire("0 12 * * *", "UTC", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap());
    }

    #[test]
    fn six_field_expressions_pass_through() {
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let next = next_fire("30 * * * * *", "UTC", after).unwrap().unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 30).unwrap());
    }

    #[test]
    fn timezone_shifts_the_firing() {
        // 09:00 in Oslo is 08:00 UTC in winter.
        let after = Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap();
        let next = next_fire("0 9 * * *", "Europe/Oslo", after)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 1, 15, 8, 0, 0).unwrap());
    }

    #[test]
    fn unknown_timezone_falls_back_to_utc() {
        let after = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let next = next_fire("0 9 * * *", "Neverland/Nowhere", after)
            .unwrap()
            .unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap());
    }

    #[test]
    fn invalid_expression_errors() {
        assert!(next_fire("not a cron", "UTC", Utc::now()).is_err());
    }
}
