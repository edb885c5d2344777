//! Crawl job execution.
//!
//! [`CrawlWorker::process`] runs one attempt of a [`CrawlJob`]:
//!
//! 1. source set to `processing`, chunks cleared, progress reset;
//! 2. a [`ProgressiveCrawl`] for the job runs to completion;
//! 3. source set to `ready` with the final crawl metadata.
//!
//! [`CrawlWorker::fail`] writes the terminal `error` state once the queue
//! gives up on a job. Status and metadata writes are best effort; clearing
//! chunks is not, since a retry must start from an empty source.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use ingest_harness_core::chunk::ChunkStrategy;
use ingest_harness_core::models::{
    CrawlJob, CrawlPhase, CrawlProgress, Source, SourceMetadata, SourceStatus, SourceType,
    SourceUpdate, WebsiteMetadata,
};
use ingest_harness_core::store::Store;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::{Config, CrawlConfig};
use crate::crawl::CrawlController;
use crate::error::JobError;
use crate::fetch::{HttpFetcher, PageFetcher};
use crate::orchestrator::{CrawlTotals, PageHook, ProgressiveCrawl};
use crate::persist::ChunkPersistence;
use crate::pubsub::{progress_topic, ProgressMessage, PubSub};
use crate::render::BrowserPool;

/// Builds the primary page fetcher for a job.
pub trait FetcherFactory: Send + Sync {
    fn fetcher_for(&self, job: &CrawlJob) -> Result<Arc<dyn PageFetcher>>;
}

pub struct HttpFetcherFactory {
    config: CrawlConfig,
}

impl HttpFetcherFactory {
    pub fn new(config: CrawlConfig) -> Self {
        Self { config }
    }
}

impl FetcherFactory for HttpFetcherFactory {
    fn fetcher_for(&self, job: &CrawlJob) -> Result<Arc<dyn PageFetcher>> {
        Ok(Arc::new(HttpFetcher::new(&self.config, job.full_page_content)?))
    }
}

#[derive(Clone)]
pub struct CrawlWorker {
    store: Arc<dyn Store>,
    pubsub: Arc<dyn PubSub>,
    fetchers: Arc<dyn FetcherFactory>,
    browser_pool: Option<BrowserPool>,
    crawl: CrawlConfig,
    strategy: ChunkStrategy,
    batch_size: usize,
    hook: Option<Arc<dyn PageHook>>,
}

impl CrawlWorker {
    pub fn new(config: &Config, store: Arc<dyn Store>, pubsub: Arc<dyn PubSub>) -> Result<Self> {
        let browser_pool = match &config.render {
            Some(render) => Some(BrowserPool::from_config(render, &config.crawl.user_agent)?),
            None => None,
        };
        Ok(Self {
            store,
            pubsub,
            fetchers: Arc::new(HttpFetcherFactory::new(config.crawl.clone())),
            browser_pool,
            crawl: config.crawl.clone(),
            strategy: config.chunking.website.clone(),
            batch_size: config.worker.batch_size,
            hook: None,
        })
    }

    pub fn with_fetchers(mut self, fetchers: Arc<dyn FetcherFactory>) -> Self {
        self.fetchers = fetchers;
        self
    }

    pub fn with_browser_pool(mut self, pool: Option<BrowserPool>) -> Self {
        self.browser_pool = pool;
        self
    }

    pub fn with_hook(mut self, hook: Option<Arc<dyn PageHook>>) -> Self {
        self.hook = hook;
        self
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Run one attempt of `job`.
    pub async fn process(&self, job: &CrawlJob) -> Result<CrawlTotals> {
        let source = match self.store.get_source(&job.source_id).await? {
            Some(source) => source,
            None => {
                return Err(JobError::Fatal(format!("source {} not found", job.source_id)).into())
            }
        };
        if source.source_type != SourceType::Website {
            return Err(JobError::Fatal(format!(
                "source {} is a {} source, not a website",
                source.id, source.source_type
            ))
            .into());
        }

        self.start(job, &source).await?;

        let fetcher = self.fetchers.fetcher_for(job)?;
        let controller = CrawlController::new(fetcher, self.crawl.clone())
            .with_browser_pool(self.browser_pool.clone());
        let crawl = ProgressiveCrawl::new(
            controller,
            ChunkPersistence::new(self.store.clone(), self.batch_size),
            self.store.clone(),
            self.pubsub.clone(),
            self.strategy.clone(),
        )
        .with_hook(self.hook.clone());

        let totals = crawl.run(job).await?;
        self.finish(job, &totals).await;
        Ok(totals)
    }

    async fn start(&self, job: &CrawlJob, source: &Source) -> Result<()> {
        let removed = self
            .store
            .delete_chunks(&job.source_id)
            .await
            .with_context(|| format!("failed to clear chunks of source {}", job.source_id))?;

        let metadata = WebsiteMetadata {
            crawl_progress: Some(CrawlProgress::start(job.max_pages)),
            max_pages: Some(job.max_pages),
            crawl_subpages: job.crawl_subpages,
            extra: extra_fields(source),
            ..Default::default()
        };
        self.update(
            &job.source_id,
            SourceUpdate {
                status: Some(SourceStatus::Processing),
                chunk_count: Some(0),
                size_bytes: Some(0),
                metadata: Some(SourceMetadata::Website(metadata)),
                error_message: Some(None),
            },
        )
        .await;

        info!(source_id = %job.source_id, url = %job.url, removed, "crawl job started");
        Ok(())
    }

    async fn finish(&self, job: &CrawlJob, totals: &CrawlTotals) {
        let chunk_count = match self.store.count_chunks(&job.source_id).await {
            Ok(count) => count,
            Err(e) => {
                warn!(source_id = %job.source_id, error = %e, "failed to count chunks");
                totals.chunks as i64
            }
        };
        let summary = &totals.summary;
        let progress = CrawlProgress {
            phase: CrawlPhase::Completed,
            pages_processed: summary.pages_processed,
            total_pages: job.max_pages.max(summary.pages_processed),
            current_url: None,
            discovered_links: summary.discovered_links.clone(),
            error: None,
        };
        let extra = self
            .current(&job.source_id)
            .await
            .map(|s| extra_fields(&s))
            .unwrap_or_default();
        let metadata = WebsiteMetadata {
            crawl_progress: Some(progress.clone()),
            pages_crawled: summary.visited.len(),
            crawled_pages: summary.visited.clone(),
            discovered_links: summary.discovered_links.clone(),
            crawl_errors: summary.errors.clone(),
            total_chunks: chunk_count.max(0) as usize,
            max_pages: Some(job.max_pages),
            crawl_subpages: job.crawl_subpages,
            completed_at: Some(Utc::now()),
            extra,
        };
        self.update(
            &job.source_id,
            SourceUpdate {
                status: Some(SourceStatus::Ready),
                chunk_count: Some(chunk_count),
                size_bytes: Some(totals.size_bytes as i64),
                metadata: Some(SourceMetadata::Website(metadata)),
                error_message: Some(None),
            },
        )
        .await;

        self.publish(job, SourceStatus::Ready, progress, chunk_count, totals.size_kb());
        info!(
            source_id = %job.source_id,
            pages = summary.visited.len(),
            errors = summary.errors.len(),
            chunks = chunk_count,
            "crawl job completed"
        );
    }

    /// Record the terminal failure of a job.
    ///
    /// A source that never reached `processing` is stepped through it first:
    /// `queued` and `pending` cannot move straight to `error`.
    pub async fn fail(&self, job: &CrawlJob, message: &str) {
        let current = self.current(&job.source_id).await;
        let (website, chunk_count, size_bytes) = match &current {
            Some(source) => (
                source.metadata.as_website().cloned(),
                source.chunk_count,
                source.size_bytes,
            ),
            None => (None, 0, 0),
        };

        let mut progress = website
            .as_ref()
            .and_then(|m| m.crawl_progress.clone())
            .unwrap_or_else(|| CrawlProgress::start(job.max_pages));
        progress.phase = CrawlPhase::Failed;
        progress.current_url = None;
        progress.error = Some(message.to_string());

        if let Some(source) = &current {
            if source.status != SourceStatus::Error
                && !source.status.can_transition_to(SourceStatus::Error)
            {
                self.update(&job.source_id, SourceUpdate::status(SourceStatus::Processing))
                    .await;
            }
            let metadata = website.map(|mut m| {
                m.crawl_progress = Some(progress.clone());
                SourceMetadata::Website(m)
            });
            self.update(
                &job.source_id,
                SourceUpdate {
                    status: Some(SourceStatus::Error),
                    metadata,
                    error_message: Some(Some(message.to_string())),
                    ..Default::default()
                },
            )
            .await;
        }

        self.publish(
            job,
            SourceStatus::Error,
            progress,
            chunk_count,
            size_bytes as f64 / 1024.0,
        );
        warn!(source_id = %job.source_id, error = message, "crawl job failed");
    }

    async fn current(&self, source_id: &str) -> Option<Source> {
        match self.store.get_source(source_id).await {
            Ok(source) => source,
            Err(e) => {
                warn!(source_id, error = %e, "failed to load source");
                None
            }
        }
    }

    async fn update(&self, source_id: &str, update: SourceUpdate) {
        if let Err(e) = self.store.update_source(source_id, &update).await {
            warn!(source_id, error = %format!("{:#}", e), "source update failed");
        }
    }

    fn publish(
        &self,
        job: &CrawlJob,
        status: SourceStatus,
        progress: CrawlProgress,
        chunk_count: i64,
        size_kb: f64,
    ) {
        self.pubsub.publish(
            &progress_topic(&job.source_id),
            ProgressMessage {
                source_id: job.source_id.clone(),
                status,
                progress,
                chunk_count,
                size_kb,
            }
            .to_value(),
        );
    }
}

fn extra_fields(source: &Source) -> Map<String, Value> {
    source
        .metadata
        .as_website()
        .map(|m| m.extra.clone())
        .unwrap_or_default()
}
