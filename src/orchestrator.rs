//! Progressive crawl: chunks land while the crawl is still running.
//!
//! [`ProgressiveCrawl::run`] drives a [`CrawlController`] and consumes its
//! events concurrently. Every completed page is appended to the source's
//! chunks right away, the source's running totals are refreshed, and a
//! [`ProgressMessage`] is published for live subscribers.
//!
//! When the controller has a render fallback, weak HTTP pages are held back
//! instead of stored. A successful render of the same URL replaces them;
//! the rest are stored once the crawl ends. Pages that were not weak are
//! stored from both passes, minus chunks that hash-dedup removes.
//!
//! Once the source holds [`MAX_CHUNKS`] chunks, later pages are still
//! crawled and reported but no longer stored.
//!
//! A persistence failure stops consumption, which drops the event receiver
//! and aborts the crawl at its next event. Pages persisted before that
//! point stay queryable.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use ingest_harness_core::chunk::{ChunkStrategy, MAX_CHUNKS};
use ingest_harness_core::models::{
    CrawlJob, CrawlPhase, CrawlProgress, SourceContext, SourceMetadata, SourceStatus, SourceUpdate,
};
use ingest_harness_core::store::Store;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::crawl::{CrawlController, CrawlEvent, CrawlOptions, CrawlSummary, CrawledPage};
use crate::persist::{ChunkPersistence, PageInfo, PersistOutcome};
use crate::pubsub::{progress_topic, ProgressMessage, PubSub};

const EVENT_BUFFER: usize = 32;

/// Per-page post-processing that runs off the crawl loop.
#[async_trait]
pub trait PageHook: Send + Sync {
    async fn on_page_complete(
        &self,
        source: &SourceContext,
        page: &CrawledPage,
        persisted: &PersistOutcome,
    );
}

/// Final totals of one crawl attempt.
#[derive(Debug, Clone, Default)]
pub struct CrawlTotals {
    /// Chunks inserted by this attempt.
    pub chunks: usize,
    /// Bytes of extracted text across successful pages.
    pub size_bytes: usize,
    pub pages_processed: usize,
    /// Successfully processed page URLs, in crawl order.
    pub processed_urls: Vec<String>,
    pub summary: CrawlSummary,
}

impl CrawlTotals {
    pub fn size_kb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0
    }
}

#[derive(Default)]
struct Running {
    chunks: usize,
    size_bytes: usize,
    chunk_count: i64,
    processed_urls: Vec<String>,
    /// Distinct URLs with a finished fetch, failed or not.
    visited: HashSet<String>,
    capped: bool,
}

pub struct ProgressiveCrawl {
    controller: CrawlController,
    persistence: ChunkPersistence,
    store: Arc<dyn Store>,
    pubsub: Arc<dyn PubSub>,
    strategy: ChunkStrategy,
    hook: Option<Arc<dyn PageHook>>,
}

impl ProgressiveCrawl {
    pub fn new(
        controller: CrawlController,
        persistence: ChunkPersistence,
        store: Arc<dyn Store>,
        pubsub: Arc<dyn PubSub>,
        strategy: ChunkStrategy,
    ) -> Self {
        Self {
            controller,
            persistence,
            store,
            pubsub,
            strategy,
            hook: None,
        }
    }

    pub fn with_hook(mut self, hook: Option<Arc<dyn PageHook>>) -> Self {
        self.hook = hook;
        self
    }

    pub async fn run(&self, job: &CrawlJob) -> Result<CrawlTotals> {
        let options = CrawlOptions::from(job);
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        let crawl = self.controller.run(&job.url, &options, tx);
        let consume = self.consume(job.context(), rx);
        let (crawled, consumed) = tokio::join!(crawl, consume);

        // Consumer first: its error is what made the controller abort.
        let running = consumed?;
        let summary = crawled?;

        info!(
            source_id = %job.source_id,
            pages = summary.pages_processed,
            chunks = running.chunks,
            "progressive crawl finished"
        );
        Ok(CrawlTotals {
            chunks: running.chunks,
            size_bytes: running.size_bytes,
            pages_processed: summary.pages_processed,
            processed_urls: running.processed_urls,
            summary,
        })
    }

    async fn consume(
        &self,
        source: SourceContext,
        mut events: mpsc::Receiver<CrawlEvent>,
    ) -> Result<Running> {
        let mut running = Running::default();
        let mut seen: HashSet<String> = HashSet::new();
        let defer_below = self.controller.fallback_threshold();
        let mut deferred: Vec<CrawledPage> = Vec::new();

        while let Some(event) = events.recv().await {
            let CrawlEvent { progress, page } = event;

            if let Some(page) = page {
                running.visited.insert(page.url.clone());
                if page.is_ok() && !page.content.trim().is_empty() {
                    match defer_below {
                        Some(min) if !page.rendered && page.is_weak(min) => {
                            debug!(url = %page.url, "weak page held for the render pass");
                            deferred.push(page);
                        }
                        _ => {
                            if page.rendered {
                                deferred.retain(|held| held.url != page.url);
                            }
                            self.store_page(&source, page, &mut running, &mut seen)
                                .await?;
                        }
                    }
                }
                self.record_progress(&source.source_id, &progress, &running)
                    .await;
            } else if progress.phase == CrawlPhase::Discovering {
                self.record_progress(&source.source_id, &progress, &running)
                    .await;
            }

            self.pubsub.publish(
                &progress_topic(&source.source_id),
                ProgressMessage {
                    source_id: source.source_id.clone(),
                    status: SourceStatus::Processing,
                    progress,
                    chunk_count: running.chunk_count,
                    size_kb: running.size_bytes as f64 / 1024.0,
                }
                .to_value(),
            );
        }

        // Weak pages the render pass did not replace.
        for page in deferred {
            self.store_page(&source, page, &mut running, &mut seen).await?;
        }

        Ok(running)
    }

    async fn store_page(
        &self,
        source: &SourceContext,
        page: CrawledPage,
        running: &mut Running,
        seen: &mut HashSet<String>,
    ) -> Result<()> {
        if running.capped {
            debug!(url = %page.url, "chunk ceiling reached, page not stored");
            return Ok(());
        }

        let info = PageInfo {
            url: page.url.clone(),
            title: page.title.clone(),
            crawled_at: Some(page.crawled_at),
            depth: Some(page.depth),
        };
        let outcome = self
            .persistence
            .append(source, &page.content, &self.strategy, Some(&info), Some(seen))
            .await?;

        running.chunks += outcome.inserted;
        running.size_bytes += page.content.len();
        running.chunk_count = outcome.chunk_count;
        running.processed_urls.push(page.url.clone());
        debug!(url = %page.url, inserted = outcome.inserted, "page persisted");

        if outcome.capped || outcome.chunk_count >= MAX_CHUNKS as i64 {
            info!(
                source_id = %source.source_id,
                url = %page.url,
                limit = MAX_CHUNKS,
                "chunk ceiling reached, later pages are not stored"
            );
            running.capped = true;
        }

        if let Some(hook) = &self.hook {
            let hook = hook.clone();
            let source = source.clone();
            tokio::spawn(async move {
                hook.on_page_complete(&source, &page, &outcome).await;
            });
        }
        Ok(())
    }

    /// Best effort: a failed write is logged and the crawl goes on.
    async fn record_progress(&self, source_id: &str, progress: &CrawlProgress, running: &Running) {
        let result = async {
            let Some(source) = self.store.get_source(source_id).await? else {
                anyhow::bail!("source not found");
            };
            let mut metadata = match source.metadata {
                SourceMetadata::Website(m) => m,
                other => anyhow::bail!("source has {} metadata", other.kind()),
            };
            metadata.crawl_progress = Some(progress.clone());
            metadata.pages_crawled = running.visited.len();
            metadata.total_chunks = running.chunk_count.max(0) as usize;
            self.store
                .update_source(
                    source_id,
                    &SourceUpdate {
                        size_bytes: Some(running.size_bytes as i64),
                        metadata: Some(SourceMetadata::Website(metadata)),
                        ..Default::default()
                    },
                )
                .await?;
            Ok::<(), anyhow::Error>(())
        }
        .await;

        if let Err(e) = result {
            warn!(source_id, error = %format!("{:#}", e), "failed to record crawl progress");
        }
    }
}
