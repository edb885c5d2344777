//! Source creation and ingestion.
//!
//! Websites are crawled asynchronously through the [`JobQueue`]; text, Q&A
//! and file sources are chunked inline in replace mode. Every path moves the
//! source through `processing` and ends in `ready` or `error`.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use ingest_harness_core::chunk::{ChunkStrategy, SplitOn};
use ingest_harness_core::models::{
    CrawlJob, FileMetadata, QaMetadata, Source, SourceMetadata, SourceStatus, SourceType,
    SourceUpdate, TextMetadata, WebsiteMetadata,
};
use ingest_harness_core::store::Store;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::config::Config;
use crate::extract::{extract_text, guess_content_type};
use crate::objects::{object_key, ObjectStore};
use crate::persist::ChunkPersistence;
use crate::queue::JobQueue;

/// Request to crawl a website.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CrawlRequest {
    pub url: String,
    pub agent_id: String,
    #[serde(default)]
    pub project_id: String,
    /// Falls back to `[crawl] default_max_pages`.
    #[serde(default)]
    pub max_pages: Option<usize>,
    #[serde(default = "default_true")]
    pub crawl_subpages: bool,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub slow: bool,
    #[serde(default)]
    pub full_page_content: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StartedCrawl {
    pub job_id: String,
    pub source_id: String,
}

pub struct SourceService {
    config: Arc<Config>,
    store: Arc<dyn Store>,
    objects: Arc<dyn ObjectStore>,
}

impl SourceService {
    pub fn new(config: Arc<Config>, store: Arc<dyn Store>, objects: Arc<dyn ObjectStore>) -> Self {
        Self {
            config,
            store,
            objects,
        }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Create a pending website source and the job that will crawl it.
    pub async fn create_website(&self, request: &CrawlRequest) -> Result<(Source, CrawlJob)> {
        if request.url.trim().is_empty() {
            bail!("url must not be empty");
        }
        if request.agent_id.trim().is_empty() {
            bail!("agent_id must not be empty");
        }
        let max_pages = request
            .max_pages
            .unwrap_or(self.config.crawl.default_max_pages)
            .max(1);

        let mut source = Source::new(
            &request.agent_id,
            &request.project_id,
            SourceType::Website,
            request.url.trim(),
        );
        // Kept on the source so a recrawl repeats them.
        let mut extra = Map::new();
        extra.insert("include_paths".into(), json!(request.include_paths));
        extra.insert("exclude_paths".into(), json!(request.exclude_paths));
        extra.insert("slow".into(), json!(request.slow));
        extra.insert("full_page_content".into(), json!(request.full_page_content));
        source.metadata = SourceMetadata::Website(WebsiteMetadata {
            max_pages: Some(max_pages),
            crawl_subpages: request.crawl_subpages,
            extra,
            ..Default::default()
        });
        self.store.create_source(&source).await?;

        let job = CrawlJob {
            source_id: source.id.clone(),
            agent_id: source.agent_id.clone(),
            project_id: source.project_id.clone(),
            url: source.origin.clone(),
            crawl_subpages: request.crawl_subpages,
            max_pages,
            include_paths: request.include_paths.clone(),
            exclude_paths: request.exclude_paths.clone(),
            slow: request.slow,
            full_page_content: request.full_page_content,
        };
        Ok((source, job))
    }

    /// Create a website source and enqueue its crawl. Returns immediately.
    pub async fn start_crawl(&self, queue: &JobQueue, request: &CrawlRequest) -> Result<StartedCrawl> {
        let (source, job) = self.create_website(request).await?;
        let record = queue.enqueue(job).await?;
        Ok(StartedCrawl {
            job_id: record.id,
            source_id: source.id,
        })
    }

    /// Rebuild the crawl job of an existing website source.
    pub async fn recrawl_job(&self, source_id: &str) -> Result<CrawlJob> {
        let source = self.require(source_id).await?;
        let Some(metadata) = source.metadata.as_website() else {
            bail!("source {} is a {} source and cannot be crawled", source.id, source.source_type);
        };
        let strings = |key: &str| -> Vec<String> {
            metadata
                .extra
                .get(key)
                .and_then(|v| serde_json::from_value(v.clone()).ok())
                .unwrap_or_default()
        };
        let flag = |key: &str| metadata.extra.get(key).and_then(Value::as_bool).unwrap_or(false);

        Ok(CrawlJob {
            source_id: source.id.clone(),
            agent_id: source.agent_id.clone(),
            project_id: source.project_id.clone(),
            url: source.origin.clone(),
            crawl_subpages: metadata.crawl_subpages,
            max_pages: metadata
                .max_pages
                .unwrap_or(self.config.crawl.default_max_pages),
            include_paths: strings("include_paths"),
            exclude_paths: strings("exclude_paths"),
            slow: flag("slow"),
            full_page_content: flag("full_page_content"),
        })
    }

    pub async fn recrawl(&self, queue: &JobQueue, source_id: &str) -> Result<StartedCrawl> {
        let job = self.recrawl_job(source_id).await?;
        let record = queue.enqueue(job).await?;
        Ok(StartedCrawl {
            job_id: record.id,
            source_id: source_id.to_string(),
        })
    }

    pub async fn ingest_text(
        &self,
        agent_id: &str,
        project_id: &str,
        title: &str,
        text: &str,
    ) -> Result<Source> {
        let mut source = Source::new(agent_id, project_id, SourceType::Text, title);
        source.metadata = SourceMetadata::Text(TextMetadata {
            title: Some(title.to_string()),
            ..Default::default()
        });
        self.store.create_source(&source).await?;
        let strategy = self.config.chunking.text.clone();
        self.process_inline(&source, text, &strategy, None).await
    }

    pub async fn ingest_qa(
        &self,
        agent_id: &str,
        project_id: &str,
        question: &str,
        answer: &str,
    ) -> Result<Source> {
        if question.trim().is_empty() || answer.trim().is_empty() {
            bail!("question and answer must not be empty");
        }
        let mut source = Source::new(agent_id, project_id, SourceType::Qa, question.trim());
        source.metadata = SourceMetadata::Qa(QaMetadata {
            question: question.trim().to_string(),
            ..Default::default()
        });
        self.store.create_source(&source).await?;
        let text = format!("Q: {}\n\nA: {}", question.trim(), answer.trim());
        let strategy = self.config.chunking.qa.clone();
        self.process_inline(&source, &text, &strategy, None).await
    }

    /// Store an uploaded file, extract its text and chunk it. PDFs are
    /// chunked page by page.
    pub async fn ingest_file(
        &self,
        agent_id: &str,
        project_id: &str,
        file_name: &str,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<Source> {
        let content_type = content_type
            .filter(|c| !c.trim().is_empty())
            .unwrap_or_else(|| guess_content_type(file_name))
            .to_string();

        let mut source = Source::new(agent_id, project_id, SourceType::File, file_name);
        let object_path = object_key(agent_id, &source.id, file_name);
        source.metadata = SourceMetadata::File(FileMetadata {
            object_path: object_path.clone(),
            file_name: file_name.to_string(),
            content_type: content_type.clone(),
            byte_size: bytes.len() as u64,
            ..Default::default()
        });
        source.size_bytes = bytes.len() as i64;
        self.store.create_source(&source).await?;

        if let Err(e) = self.objects.upload(bytes, &object_path).await {
            self.mark_error(&source.id, &format!("{:#}", e)).await;
            return Err(e);
        }

        let extracted = match extract_text(bytes, &content_type) {
            Ok(extracted) => extracted,
            Err(e) => {
                self.mark_error(&source.id, &e.to_string()).await;
                return Err(e).with_context(|| format!("failed to extract text from {}", file_name));
            }
        };

        let mut strategy = self.config.chunking.file.clone();
        if extracted.is_paged() {
            strategy = ChunkStrategy {
                split_on: SplitOn::Page,
                ..strategy
            };
        }
        let metadata = SourceMetadata::File(FileMetadata {
            object_path,
            file_name: file_name.to_string(),
            content_type,
            byte_size: bytes.len() as u64,
            pages: extracted.pages,
            ..Default::default()
        });
        self.process_inline(&source, &extracted.text, &strategy, Some(metadata))
            .await
    }

    /// Delete a source, its chunks, and its stored file if any.
    pub async fn delete(&self, source_id: &str) -> Result<bool> {
        let Some(source) = self.store.get_source(source_id).await? else {
            return Ok(false);
        };
        if let SourceMetadata::File(file) = &source.metadata {
            if !file.object_path.is_empty() {
                if let Err(e) = self.objects.delete(&file.object_path).await {
                    warn!(source_id, error = %e, "failed to delete stored file");
                }
            }
        }
        let deleted = self.store.delete_source(source_id).await?;
        info!(source_id, "source deleted");
        Ok(deleted)
    }

    async fn require(&self, source_id: &str) -> Result<Source> {
        match self.store.get_source(source_id).await? {
            Some(source) => Ok(source),
            None => bail!("source not found: {}", source_id),
        }
    }

    /// Replace-mode chunking for non-crawl sources.
    async fn process_inline(
        &self,
        source: &Source,
        text: &str,
        strategy: &ChunkStrategy,
        metadata: Option<SourceMetadata>,
    ) -> Result<Source> {
        self.store
            .update_source(&source.id, &SourceUpdate::status(SourceStatus::Processing))
            .await?;

        let persistence = ChunkPersistence::new(self.store.clone(), self.config.worker.batch_size);
        match persistence.replace(&source.context(), text, strategy).await {
            Ok(outcome) => {
                let size_bytes = match source.source_type {
                    SourceType::File => source.size_bytes,
                    _ => text.len() as i64,
                };
                let updated = self
                    .store
                    .update_source(
                        &source.id,
                        &SourceUpdate {
                            status: Some(SourceStatus::Ready),
                            chunk_count: Some(outcome.chunk_count),
                            size_bytes: Some(size_bytes),
                            metadata,
                            error_message: Some(None),
                        },
                    )
                    .await?;
                info!(
                    source_id = %source.id,
                    source_type = %source.source_type,
                    chunks = outcome.chunk_count,
                    "source ready"
                );
                Ok(updated)
            }
            Err(e) => {
                self.mark_error(&source.id, &format!("{:#}", e)).await;
                Err(e)
            }
        }
    }

    async fn mark_error(&self, source_id: &str, message: &str) {
        let update = SourceUpdate {
            status: Some(SourceStatus::Error),
            error_message: Some(Some(message.to_string())),
            ..Default::default()
        };
        let result = async {
            // Sources that never reached processing cannot go straight to error.
            self.store
                .update_source(source_id, &SourceUpdate::status(SourceStatus::Processing))
                .await?;
            self.store.update_source(source_id, &update).await
        }
        .await;
        if let Err(e) = result {
            warn!(source_id, error = %e, "failed to record source error");
        }
    }
}

/// Print sources as a table (CLI).
pub fn print_sources(sources: &[Source]) {
    println!(
        "{:<38} {:<8} {:<11} {:>7} {:>9}  ORIGIN",
        "ID", "TYPE", "STATUS", "CHUNKS", "SIZE_KB"
    );
    for source in sources {
        println!(
            "{:<38} {:<8} {:<11} {:>7} {:>9.1}  {}",
            source.id,
            source.source_type,
            source.status,
            source.chunk_count,
            source.size_kb(),
            source.origin
        );
    }
}
