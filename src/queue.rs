//! Crawl job queue.
//!
//! [`JobQueue::connect`] builds the queue and spawns a fixed pool of worker
//! tasks that share one intake channel. [`JobQueue::shutdown`] closes intake,
//! lets queued jobs drain, and waits for the workers.
//!
//! A source has at most one queued or active job: a second
//! [`enqueue`](JobQueue::enqueue) for the same source is rejected with
//! [`QueueError::SourceBusy`], so chunk positions are only ever written by
//! one crawl at a time.
//!
//! Job starts are rate limited across the pool. A failed attempt is retried
//! with exponential backoff (`base * 2^(attempt - 1)`) until `max_attempts`,
//! unless the failure is fatal.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use ingest_harness_core::models::{CrawlJob, JobRecord, JobStatus, SourceStatus, SourceUpdate};
use ingest_harness_core::store::Store;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::error::{JobError, QueueError};
use crate::worker::CrawlWorker;

const INTAKE_CAPACITY: usize = 1024;

/// Attempt limit and backoff for failed jobs.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff_base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    /// Delay before the attempt following `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.backoff_base.saturating_mul(1u32 << exponent)
    }
}

/// Spaces job starts at least `1 / per_second` apart.
pub struct StartLimiter {
    interval: Option<Duration>,
    next: tokio::sync::Mutex<Instant>,
}

impl StartLimiter {
    pub fn new(per_second: u32) -> Self {
        let interval = (per_second > 0).then(|| Duration::from_secs(1) / per_second);
        Self {
            interval,
            next: tokio::sync::Mutex::new(Instant::now()),
        }
    }

    pub async fn wait(&self) {
        let Some(interval) = self.interval else {
            return;
        };
        let mut next = self.next.lock().await;
        let now = Instant::now();
        if *next > now {
            tokio::time::sleep_until(*next).await;
        }
        *next = (*next).max(now) + interval;
    }
}

pub struct JobQueue {
    store: Arc<dyn Store>,
    intake: Mutex<Option<mpsc::Sender<JobRecord>>>,
    active: Arc<Mutex<HashSet<String>>>,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl JobQueue {
    /// Build the queue and spawn `config.concurrency` workers.
    pub fn connect(worker: CrawlWorker, config: &WorkerConfig) -> Self {
        let store = worker.store().clone();
        let (tx, rx) = mpsc::channel::<JobRecord>(INTAKE_CAPACITY);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let active: Arc<Mutex<HashSet<String>>> = Arc::new(Mutex::new(HashSet::new()));
        let limiter = Arc::new(StartLimiter::new(config.starts_per_second));
        let policy = RetryPolicy::from_config(config);
        let worker = Arc::new(worker);

        let concurrency = config.concurrency.max(1);
        let handles = (0..concurrency)
            .map(|n| {
                let rx = rx.clone();
                let active = active.clone();
                let limiter = limiter.clone();
                let worker = worker.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        let Some(record) = next else {
                            break;
                        };
                        limiter.wait().await;
                        let source_id = record.source_id.clone();
                        debug!(worker = n, job_id = %record.id, "job picked up");
                        run_with_retries(&worker, &policy, record).await;
                        lock(&active).remove(&source_id);
                    }
                    debug!(worker = n, "worker stopped");
                })
            })
            .collect();

        info!(concurrency, "job queue connected");
        Self {
            store,
            intake: Mutex::new(Some(tx)),
            active,
            workers: tokio::sync::Mutex::new(handles),
        }
    }

    /// Queue a crawl job. Returns the stored job record.
    pub async fn enqueue(&self, job: CrawlJob) -> Result<JobRecord> {
        let sender = lock(&self.intake)
            .clone()
            .ok_or(QueueError::Closed)?;

        if !lock(&self.active).insert(job.source_id.clone()) {
            return Err(QueueError::SourceBusy(job.source_id).into());
        }

        let record = JobRecord::new(job);
        let queued = async {
            self.store
                .upsert_job(&record)
                .await
                .context("failed to record job")?;
            if let Err(e) = self
                .store
                .update_source(&record.source_id, &SourceUpdate::status(SourceStatus::Queued))
                .await
            {
                warn!(source_id = %record.source_id, error = %e, "failed to mark source queued");
            }
            sender
                .send(record.clone())
                .await
                .map_err(|_| QueueError::Closed)?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = queued {
            lock(&self.active).remove(&record.source_id);
            return Err(e);
        }
        info!(job_id = %record.id, source_id = %record.source_id, "job enqueued");
        Ok(record)
    }

    pub fn is_active(&self, source_id: &str) -> bool {
        lock(&self.active).contains(source_id)
    }

    pub fn active_count(&self) -> usize {
        lock(&self.active).len()
    }

    /// Stop accepting jobs, drain the queue and wait for the workers.
    pub async fn shutdown(&self) {
        lock(&self.intake).take();
        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
        info!("job queue shut down");
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Run a job until it completes, fails fatally, or runs out of attempts.
/// Returns the final job record.
pub async fn run_with_retries(
    worker: &CrawlWorker,
    policy: &RetryPolicy,
    mut record: JobRecord,
) -> JobRecord {
    let store = worker.store().clone();
    loop {
        record.attempts += 1;
        record.status = JobStatus::Active;
        save(store.as_ref(), &mut record).await;

        match worker.process(&record.job).await {
            Ok(totals) => {
                record.status = JobStatus::Completed;
                record.last_error = None;
                save(store.as_ref(), &mut record).await;
                info!(
                    job_id = %record.id,
                    attempts = record.attempts,
                    chunks = totals.chunks,
                    "job completed"
                );
                return record;
            }
            Err(e) => {
                let failure = JobError::classify(&e);
                record.last_error = Some(failure.message().to_string());

                if failure.is_fatal() || record.attempts >= policy.max_attempts {
                    record.status = JobStatus::Failed;
                    save(store.as_ref(), &mut record).await;
                    worker.fail(&record.job, failure.message()).await;
                    error!(
                        job_id = %record.id,
                        attempts = record.attempts,
                        fatal = failure.is_fatal(),
                        error = failure.message(),
                        "job failed"
                    );
                    return record;
                }

                let delay = policy.backoff(record.attempts);
                record.status = JobStatus::Retrying;
                save(store.as_ref(), &mut record).await;
                warn!(
                    job_id = %record.id,
                    attempt = record.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = failure.message(),
                    "job attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

async fn save(store: &dyn Store, record: &mut JobRecord) {
    record.updated_at = Utc::now();
    if let Err(e) = store.upsert_job(record).await {
        warn!(job_id = %record.id, error = %e, "failed to record job state");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::fetch::{FetchedPage, PageFetcher};
    use crate::pubsub::BroadcastPubSub;
    use crate::worker::FetcherFactory;
    use async_trait::async_trait;
    use ingest_harness_core::models::{Source, SourceType};
    use ingest_harness_core::store::memory::InMemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Slow;

    #[async_trait]
    impl PageFetcher for Slow {
        async fn fetch(&self, url: &str) -> FetchedPage {
            tokio::time::sleep(Duration::from_millis(100)).await;
            FetchedPage {
                url: url.into(),
                content: "A page that takes a while to load.".into(),
                ..Default::default()
            }
        }
    }

    /// Fails to build a fetcher the first `failures` times.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    impl FetcherFactory for Flaky {
        fn fetcher_for(&self, _job: &CrawlJob) -> Result<Arc<dyn PageFetcher>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                anyhow::bail!("connection reset");
            }
            Ok(Arc::new(Slow))
        }
    }

    fn worker_config() -> WorkerConfig {
        WorkerConfig {
            concurrency: 2,
            max_attempts: 3,
            backoff_base_ms: 10,
            starts_per_second: 0,
            batch_size: 50,
        }
    }

    fn worker(store: Arc<InMemoryStore>, factory: Arc<dyn FetcherFactory>) -> CrawlWorker {
        let mut config = Config::default();
        config.crawl.politeness_ms = 0;
        CrawlWorker::new(&config, store, Arc::new(BroadcastPubSub::default()))
            .unwrap()
            .with_fetchers(factory)
    }

    async fn job(store: &InMemoryStore, url: &str) -> CrawlJob {
        let source = Source::new("agent", "project", SourceType::Website, url);
        store.create_source(&source).await.unwrap();
        CrawlJob {
            source_id: source.id,
            agent_id: "agent".into(),
            project_id: "project".into(),
            url: url.into(),
            crawl_subpages: false,
            max_pages: 1,
            include_paths: vec![],
            exclude_paths: vec![],
            slow: false,
            full_page_content: false,
        }
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff_base: Duration::from_millis(2000),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(2000));
        assert_eq!(policy.backoff(2), Duration::from_millis(4000));
        assert_eq!(policy.backoff(3), Duration::from_millis(8000));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let store = Arc::new(InMemoryStore::default());
        let crawl = job(&store, "https://slow.test").await;
        let factory = Arc::new(Flaky {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let worker = worker(store.clone(), factory);
        let policy = RetryPolicy::from_config(&worker_config());

        let record = run_with_retries(&worker, &policy, JobRecord::new(crawl.clone())).await;
        assert_eq!(record.status, JobStatus::Completed);
        assert_eq!(record.attempts, 3);

        let stored = store.get_job(&record.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);
        let source = store.get_source(&crawl.source_id).await.unwrap().unwrap();
        assert_eq!(source.status, SourceStatus::Ready);
    }

    #[tokio::test]
    async fn attempts_are_capped() {
        let store = Arc::new(InMemoryStore::default());
        let crawl = job(&store, "https://slow.test").await;
        let factory = Arc::new(Flaky {
            failures: 10,
            calls: AtomicUsize::new(0),
        });
        let worker = worker(store.clone(), factory.clone());
        let policy = RetryPolicy::from_config(&worker_config());

        let record = run_with_retries(&worker, &policy, JobRecord::new(crawl.clone())).await;
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 3);
        assert_eq!(factory.calls.load(Ordering::SeqCst), 3);
        assert!(record.last_error.unwrap().contains("connection reset"));

        let source = store.get_source(&crawl.source_id).await.unwrap().unwrap();
        assert_eq!(source.status, SourceStatus::Error);
    }

    #[tokio::test]
    async fn fatal_failure_is_not_retried() {
        let store = Arc::new(InMemoryStore::default());
        let crawl = job(&store, "ftp://example.com").await;
        let factory = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let worker = worker(store.clone(), factory);
        let policy = RetryPolicy::from_config(&worker_config());

        let record = run_with_retries(&worker, &policy, JobRecord::new(crawl.clone())).await;
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.attempts, 1);
        let source = store.get_source(&crawl.source_id).await.unwrap().unwrap();
        assert_eq!(source.status, SourceStatus::Error);
    }

    #[tokio::test]
    async fn busy_source_is_rejected_until_done() {
        let store = Arc::new(InMemoryStore::default());
        let crawl = job(&store, "https://slow.test").await;
        let factory = Arc::new(Flaky {
            failures: 0,
            calls: AtomicUsize::new(0),
        });
        let queue = JobQueue::connect(worker(store.clone(), factory), &worker_config());

        let first = queue.enqueue(crawl.clone()).await.unwrap();
        assert!(queue.is_active(&crawl.source_id));
        let err = queue.enqueue(crawl.clone()).await.unwrap_err();
        assert_eq!(
            err.downcast_ref::<QueueError>(),
            Some(&QueueError::SourceBusy(crawl.source_id.clone()))
        );

        queue.shutdown().await;
        assert!(!queue.is_active(&crawl.source_id));
        let stored = store.get_job(&first.id).await.unwrap().unwrap();
        assert_eq!(stored.status, JobStatus::Completed);

        let closed = queue.enqueue(crawl).await.unwrap_err();
        assert_eq!(closed.downcast_ref::<QueueError>(), Some(&QueueError::Closed));
    }

    /// Tracks how many fetches are in flight at once.
    #[derive(Default)]
    struct Gauge {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl PageFetcher for Gauge {
        async fn fetch(&self, url: &str) -> FetchedPage {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(150)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            FetchedPage {
                url: url.into(),
                content: "Measured page.".into(),
                ..Default::default()
            }
        }
    }

    struct Shared(Arc<Gauge>);

    impl FetcherFactory for Shared {
        fn fetcher_for(&self, _job: &CrawlJob) -> Result<Arc<dyn PageFetcher>> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn pool_runs_jobs_concurrently() {
        let store = Arc::new(InMemoryStore::default());
        let a = job(&store, "https://a.test").await;
        let b = job(&store, "https://b.test").await;
        let c = job(&store, "https://c.test").await;
        let gauge = Arc::new(Gauge::default());
        let queue = JobQueue::connect(
            worker(store.clone(), Arc::new(Shared(gauge.clone()))),
            &worker_config(),
        );

        for crawl in [&a, &b, &c] {
            queue.enqueue(crawl.clone()).await.unwrap();
        }
        queue.shutdown().await;

        assert_eq!(gauge.peak.load(Ordering::SeqCst), 2);
        for id in [&a.source_id, &b.source_id, &c.source_id] {
            let source = store.get_source(id).await.unwrap().unwrap();
            assert_eq!(source.status, SourceStatus::Ready);
        }
    }

    #[tokio::test]
    async fn limiter_spaces_starts() {
        let limiter = StartLimiter::new(20);
        let started = Instant::now();
        for _ in 0..3 {
            limiter.wait().await;
        }
        assert!(started.elapsed() >= Duration::from_millis(100));
    }
}
