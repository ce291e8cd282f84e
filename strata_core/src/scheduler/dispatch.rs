//! Dispatch: one firing of a job, comprising up to `retries + 1` attempts.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use uuid::Uuid;

use crate::crypto::CryptoService;
use crate::models::{CronJob, CronJobRun, CronJobType, RunStatus};
use crate::scheduler::{PlatformActions, Scheduler, next_fire};

/// Bytes of response body kept as the run's log preview.
const PREVIEW_BYTES: usize = 500;

#[derive(Debug, Clone, PartialEq)]
pub struct AttemptOutcome {
    pub status: RunStatus,
    pub http_status: Option<i32>,
    pub error_text: Option<String>,
    pub log_preview: Option<String>,
}

impl AttemptOutcome {
    pub fn success(preview: Option<String>) -> Self {
        Self {
            status: RunStatus::Success,
            http_status: None,
            error_text: None,
            log_preview: preview,
        }
    }

    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            status: RunStatus::Fail,
            http_status: None,
            error_text: Some(error.into()),
            log_preview: None,
        }
    }
}

/// Executes a single attempt of a job. Separated from the dispatch loop
/// so the loop is testable with a scripted runner.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run_attempt(&self, job: &CronJob) -> AttemptOutcome;
}

/// The production runner: HTTP jobs via reqwest, platform jobs via the
/// built-in action set.
pub struct HttpPlatformRunner {
    http: reqwest::Client,
    crypto: CryptoService,
    actions: Arc<PlatformActions>,
    default_timeout_ms: i64,
}

impl HttpPlatformRunner {
    pub fn new(
        crypto: CryptoService,
        actions: Arc<PlatformActions>,
        default_timeout_ms: i64,
    ) -> Self {
        Self {
            http: reqwest::Client::new(),
            crypto,
            actions,
            default_timeout_ms,
        }
    }

    #[tracing::instrument(level = "debug", skip(self, job))]
    async fn run_http(&self, job: &CronJob) -> AttemptOutcome {
        let Some(url) = job.http_url.as_deref() else {
            return AttemptOutcome::fail("http job has no url");
        };
        let method = job
            .http_method
            .as_deref()
            .unwrap_or("GET")
            .parse::<reqwest::Method>()
            .unwrap_or(reqwest::Method::GET);
        let timeout_ms = if job.timeout_ms > 0 {
            job.timeout_ms
        } else {
            self.default_timeout_ms
        };

        let mut request = self
            .http
            .request(method, url)
            .timeout(Duration::from_millis(timeout_ms as u64));

        // Headers and body are decrypted for this dispatch only; the
        // plaintext never leaves this scope.
        if let Some(payload) = &job.encrypted_headers {
            let headers = match self
                .crypto
                .decrypt_str(payload)
                .and_then(|s| {
                    serde_json::from_str::<std::collections::BTreeMap<String, String>>(&s).map_err(
                        |e| crate::Error::Crypto(format!("headers are not a string map: {e}")),
                    )
                }) {
                Ok(h) => h,
                Err(e) => return AttemptOutcome::fail(format!("decrypt headers: {e}")),
            };
            for (name, value) in &headers {
                request = request.header(name.as_str(), value.as_str());
            }
        }
        if let Some(payload) = &job.encrypted_body {
            match self.crypto.decrypt_str(payload) {
                Ok(body) => request = request.body(body),
                Err(e) => return AttemptOutcome::fail(format!("decrypt body: {e}")),
            }
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let preview = response
                    .text()
                    .await
                    .map(|t| t.chars().take(PREVIEW_BYTES).collect::<String>())
                    .unwrap_or_default();
                if status.is_success() {
                    AttemptOutcome {
                        status: RunStatus::Success,
                        http_status: Some(status.as_u16() as i32),
                        error_text: None,
                        log_preview: Some(preview),
                    }
                } else {
                    AttemptOutcome {
                        status: RunStatus::Fail,
                        http_status: Some(status.as_u16() as i32),
                        error_text: Some(format!("http status {status}")),
                        log_preview: Some(preview),
                    }
                }
            }
            Err(e) if e.is_timeout() => AttemptOutcome {
                status: RunStatus::Timeout,
                http_status: None,
                error_text: Some(format!("request timed out after {timeout_ms}ms")),
                log_preview: None,
            },
            Err(e) => AttemptOutcome::fail(format!("request failed: {e}")),
        }
    }
}

#[async_trait]
impl JobRunner for HttpPlatformRunner {
    #[tracing::instrument(level = "debug", skip(self, job))]
    async fn run_attempt(&self, job: &CronJob) -> AttemptOutcome {
        match job.job_type {
            CronJobType::Http => self.run_http(job).await,
            CronJobType::Platform => {
                let Some(action) = job.platform_action.as_deref() else {
                    return AttemptOutcome::fail("platform job has no action");
                };
                match self
                    .actions
                    .run(action, job.platform_config.as_ref(), job.project_id)
                    .await
                {
                    Ok(log) => AttemptOutcome::success(Some(
                        log.chars().take(PREVIEW_BYTES).collect(),
                    )),
                    Err(e) => AttemptOutcome::fail(e.to_string()),
                }
            }
        }
    }
}

impl Scheduler {
    /// One firing. Dropped (not queued) when the concurrency cap is
    /// reached; a dropped firing updates neither `last_run_at` nor
    /// `next_run_at`.
    #[tracing::instrument(level = "debug", skip(self, job))]
    pub async fn dispatch(&self, job: &CronJob) {
        let counter = self.running_counter();
        let prior = counter.fetch_add(1, Ordering::SeqCst);
        if prior >= self.max_concurrent() {
            counter.fetch_sub(1, Ordering::SeqCst);
            tracing::warn!(job_id = %job.id, running = prior,
                "concurrency cap reached; dropping firing");
            return;
        }
        self.dispatch_inner(job).await;
        counter.fetch_sub(1, Ordering::SeqCst);
    }

    #[tracing::instrument(level = "debug", skip(self, job))]
    async fn dispatch_inner(&self, job: &CronJob) {
        let attempts = job.retries.max(0) + 1;
        let mut succeeded = false;
        let mut last_error = String::from("no attempts ran");

        for attempt in 1..=attempts {
            let started = Utc::now();
            let mut run = CronJobRun {
                id: Uuid::new_v4(),
                job_id: job.id,
                attempt_number: attempt,
                started_at: started,
                finished_at: None,
                duration_ms: None,
                status: RunStatus::Running,
                http_status: None,
                error_text: None,
                log_preview: None,
            };
            if let Err(e) = self.store().insert_cron_run(&run).await {
                tracing::warn!(job_id = %job.id, attempt, error = %e,
                    "failed inserting run row");
            }

            let outcome = self.runner().run_attempt(job).await;

            let finished = Utc::now();
            run.finished_at = Some(finished);
            run.duration_ms = Some((finished - started).num_milliseconds());
            run.status = outcome.status;
            run.http_status = outcome.http_status;
            run.error_text = outcome.error_text.clone();
            run.log_preview = outcome.log_preview;
            if let Err(e) = self.store().update_cron_run(&run).await {
                tracing::warn!(job_id = %job.id, attempt, error = %e,
                    "failed updating run row");
            }

            if outcome.status == RunStatus::Success {
                succeeded = true;
                break;
            }
            last_error = outcome
                .error_text
                .unwrap_or_else(|| "attempt failed".to_string());
            tracing::warn!(job_id = %job.id, attempt, error = %last_error, "attempt failed");
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(job.retry_backoff_ms.max(0) as u64))
                    .await;
            }
        }

        // A finished dispatch refreshes the job's run times whether or not
        // any attempt succeeded.
        let now = Utc::now();
        let next = next_fire(&job.cron_expr, &job.timezone, now)
            .ok()
            .flatten();
        if let Err(e) = self
            .store()
            .set_cron_job_runtimes(job.id, Some(now), next)
            .await
        {
            tracing::warn!(job_id = %job.id, error = %e, "failed refreshing job run times");
        }

        if !succeeded {
            if let Some(notifier) = self.notifier() {
                notifier.notify_job_failure(job, attempts, &last_error).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SchedulerConfig;
    use crate::scheduler::NotificationSink;
    use crate::store::{MemoryPlatformDb, PlatformDb};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicI32, AtomicUsize};

    struct ScriptedRunner {
        outcomes: Mutex<Vec<AttemptOutcome>>,
        delay: Duration,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
    }

    impl ScriptedRunner {
        fn new(outcomes: Vec<AttemptOutcome>) -> Self {
            Self {
                outcomes: Mutex::new(outcomes),
                delay: Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl JobRunner for ScriptedRunner {
        async fn run_attempt(&self, _job: &CronJob) -> AttemptOutcome {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(current, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            let mut outcomes = self.outcomes.lock().unwrap();
            if outcomes.is_empty() {
                AttemptOutcome::success(None)
            } else {
                outcomes.remove(0)
            }
        }
    }

    struct CountingNotifier {
        failures: AtomicI32,
    }

    #[async_trait]
    impl NotificationSink for CountingNotifier {
        async fn notify_job_failure(&self, _job: &CronJob, _attempts: i32, _error: &str) {
            self.failures.fetch_add(1, Ordering::SeqCst);
        }
        async fn notify_status(&self, _message: &str) {}
    }

    fn job(retries: i32) -> CronJob {
        let now = Utc::now();
        CronJob {
            id: Uuid::new_v4(),
            project_id: None,
            name: "test".to_string(),
            job_type: CronJobType::Http,
            cron_expr: "0 * * * *".to_string(),
            timezone: "UTC".to_string(),
            http_url: Some("http://localhost/hook".to_string()),
            http_method: Some("POST".to_string()),
            encrypted_headers: None,
            encrypted_body: None,
            platform_action: None,
            platform_config: None,
            enabled: true,
            timeout_ms: 1000,
            retries,
            retry_backoff_ms: 1,
            last_run_at: None,
            next_run_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn scheduler_with(
        store: Arc<MemoryPlatformDb>,
        runner: Arc<dyn JobRunner>,
        notifier: Option<Arc<dyn NotificationSink>>,
        max_concurrent: usize,
    ) -> Scheduler {
        Scheduler::new(
            store,
            runner,
            notifier,
            SchedulerConfig {
                poll_interval: Duration::from_secs(60),
                default_timeout_ms: 1000,
                max_concurrent_jobs: max_concurrent,
            },
        )
    }

    #[tokio::test]
    async fn retries_until_success_with_contiguous_attempts() {
        let store = Arc::new(MemoryPlatformDb::new());
        let runner = Arc::new(ScriptedRunner::new(vec![
            AttemptOutcome::fail("boom"),
            AttemptOutcome::success(Some("ok".to_string())),
        ]));
        let scheduler = scheduler_with(store.clone(), runner, None, 4);
        let job = job(3);
        store.upsert_cron_job(&job).await.unwrap();

        scheduler.dispatch(&job).await;

        let mut runs = store
            .list_cron_runs(job.id, Default::default())
            .await
            .unwrap();
        runs.sort_by_key(|r| r.attempt_number);
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].attempt_number, 1);
        assert_eq!(runs[0].status, RunStatus::Fail);
        assert_eq!(runs[1].attempt_number, 2);
        assert_eq!(runs[1].status, RunStatus::Success);
        assert!(runs[0].started_at <= runs[1].started_at);
        assert!(runs.iter().all(|r| r.finished_at.is_some()));

        let stored = store.get_cron_job(job.id).await.unwrap().unwrap();
        assert!(stored.last_run_at.is_some());
        assert!(stored.next_run_at.is_some());
    }

    #[tokio::test]
    async fn all_failed_dispatch_still_refreshes_run_times_and_notifies() {
        let store = Arc::new(MemoryPlatformDb::new());
        let runner = Arc::new(ScriptedRunner::new(vec![
            AttemptOutcome::fail("a"),
            AttemptOutcome::fail("b"),
        ]));
        let notifier = Arc::new(CountingNotifier {
            failures: AtomicI32::new(0),
        });
        let scheduler = scheduler_with(store.clone(), runner, Some(notifier.clone()), 4);
        let job = job(1);
        store.upsert_cron_job(&job).await.unwrap();

        scheduler.dispatch(&job).await;

        let runs = store
            .list_cron_runs(job.id, Default::default())
            .await
            .unwrap();
        assert_eq!(runs.len(), 2);
        assert!(runs.iter().all(|r| r.status == RunStatus::Fail));

        let stored = store.get_cron_job(job.id).await.unwrap().unwrap();
        assert!(stored.last_run_at.is_some());
        assert!(stored.next_run_at.is_some());
        assert_eq!(notifier.failures.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn over_cap_firings_are_dropped_without_side_effects() {
        let store = Arc::new(MemoryPlatformDb::new());
        let runner = Arc::new(ScriptedRunner::new(vec![]));
        let scheduler = scheduler_with(store.clone(), runner, None, 1);
        let job = job(0);
        store.upsert_cron_job(&job).await.unwrap();

        // Saturate the counter as if another dispatch were running.
        scheduler.running_counter().fetch_add(1, Ordering::SeqCst);
        scheduler.dispatch(&job).await;
        scheduler.running_counter().fetch_sub(1, Ordering::SeqCst);

        let runs = store
            .list_cron_runs(job.id, Default::default())
            .await
            .unwrap();
        assert!(runs.is_empty());
        let stored = store.get_cron_job(job.id).await.unwrap().unwrap();
        assert!(stored.last_run_at.is_none());
        assert!(stored.next_run_at.is_none());
    }

    #[tokio::test]
    async fn running_count_never_exceeds_cap() {
        let store = Arc::new(MemoryPlatformDb::new());
        let runner = Arc::new(ScriptedRunner {
            outcomes: Mutex::new(Vec::new()),
            delay: Duration::from_millis(25),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        });
        let scheduler = scheduler_with(store.clone(), runner.clone(), None, 2);

        let mut handles = Vec::new();
        for _ in 0..6 {
            let scheduler = scheduler.clone();
            let job = job(0);
            store.upsert_cron_job(&job).await.unwrap();
            handles.push(tokio::spawn(async move {
                scheduler.dispatch(&job).await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert!(runner.max_in_flight.load(Ordering::SeqCst) <= 2);
    }
}
