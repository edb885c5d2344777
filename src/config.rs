//! TOML configuration.
//!
//! Every section except `[db]` is optional and falls back to the defaults
//! below. [`load_config`] reads and validates the file; invalid values are
//! rejected up front rather than surfacing mid-crawl.
//!
//! ```toml
//! [db]
//! path = "./data/ingest.sqlite"
//!
//! [chunking.website]
//! max_size = 2000
//! overlap = 200
//! min_size = 100
//! split_on = "sentence"
//!
//! [crawl]
//! politeness_ms = 1000
//!
//! [render]
//! endpoint = "http://localhost:3000"
//!
//! [worker]
//! concurrency = 2
//! ```

use anyhow::{Context, Result};
use ingest_harness_core::chunk::{ChunkStrategy, SplitOn};
use ingest_harness_core::models::SourceType;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub crawl: CrawlConfig,
    #[serde(default)]
    pub render: Option<RenderConfig>,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

impl Config {
    /// Chunk strategy profile for a source type.
    pub fn strategy_for(&self, source_type: SourceType) -> &ChunkStrategy {
        match source_type {
            SourceType::Website => &self.chunking.website,
            SourceType::Text => &self.chunking.text,
            SourceType::File => &self.chunking.file,
            SourceType::Qa => &self.chunking.qa,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/ingest.sqlite"),
        }
    }
}

/// Per-source-type chunking profiles.
///
/// Website content is noisier than hand-written text, so its profile uses
/// larger chunks and overlap.
#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_website_strategy")]
    pub website: ChunkStrategy,
    #[serde(default = "default_text_strategy")]
    pub text: ChunkStrategy,
    #[serde(default = "default_text_strategy")]
    pub file: ChunkStrategy,
    #[serde(default = "default_qa_strategy")]
    pub qa: ChunkStrategy,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            website: default_website_strategy(),
            text: default_text_strategy(),
            file: default_text_strategy(),
            qa: default_qa_strategy(),
        }
    }
}

fn default_website_strategy() -> ChunkStrategy {
    ChunkStrategy {
        max_size: 2000,
        overlap: 200,
        min_size: 100,
        split_on: SplitOn::Sentence,
    }
}

fn default_text_strategy() -> ChunkStrategy {
    ChunkStrategy::default()
}

fn default_qa_strategy() -> ChunkStrategy {
    ChunkStrategy {
        max_size: 500,
        overlap: 50,
        min_size: 0,
        split_on: SplitOn::Paragraph,
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CrawlConfig {
    pub user_agent: String,
    pub timeout_secs: u64,
    /// Delay between page fetches within one crawl.
    pub politeness_ms: u64,
    /// Delay used instead of `politeness_ms` for jobs flagged `slow`.
    pub slow_politeness_ms: u64,
    pub default_max_pages: usize,
    /// Response bodies beyond this many bytes are cut off.
    pub max_page_bytes: usize,
    /// A content container must yield more than this many characters to win
    /// over the full body text.
    pub min_container_chars: usize,
    /// Pages with less extracted text than this count as weak.
    pub weak_content_chars: usize,
    /// Fraction of weak or failed pages that triggers the render fallback.
    pub weak_page_ratio: f64,
    /// Cap on the discovered-link list kept in source metadata.
    pub discovered_links_limit: usize,
}

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 \
     (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            timeout_secs: 30,
            politeness_ms: 1000,
            slow_politeness_ms: 3000,
            default_max_pages: 50,
            max_page_bytes: 5 * 1024 * 1024,
            min_container_chars: 100,
            weak_content_chars: 500,
            weak_page_ratio: 0.5,
            discovered_links_limit: 500,
        }
    }
}

/// Headless rendering service used as the crawl fallback.
#[derive(Debug, Deserialize, Clone)]
pub struct RenderConfig {
    pub endpoint: String,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    #[serde(default = "default_render_timeout")]
    pub timeout_secs: u64,
}

fn default_max_instances() -> usize {
    2
}
fn default_render_timeout() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WorkerConfig {
    /// Crawl jobs running at the same time.
    pub concurrency: usize,
    pub max_attempts: u32,
    /// First retry delay; doubles on each further attempt.
    pub backoff_base_ms: u64,
    pub starts_per_second: u32,
    /// Chunk rows per insert batch.
    pub batch_size: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            max_attempts: 3,
            backoff_base_ms: 2000,
            starts_per_second: 5,
            batch_size: 50,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub objects_root: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            objects_root: PathBuf::from("./data/objects"),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:7340".to_string(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    parse_config(&content)
}

/// Parse and validate configuration from TOML text.
pub fn parse_config(content: &str) -> Result<Config> {
    let config: Config = toml::from_str(content).with_context(|| "Failed to parse config file")?;

    // Validate chunking
    for (name, strategy) in [
        ("website", &config.chunking.website),
        ("text", &config.chunking.text),
        ("file", &config.chunking.file),
        ("qa", &config.chunking.qa),
    ] {
        strategy
            .validate()
            .with_context(|| format!("invalid [chunking.{}]", name))?;
    }

    // Validate crawl
    if config.crawl.timeout_secs == 0 {
        anyhow::bail!("crawl.timeout_secs must be > 0");
    }
    if config.crawl.default_max_pages == 0 {
        anyhow::bail!("crawl.default_max_pages must be >= 1");
    }
    if config.crawl.max_page_bytes == 0 {
        anyhow::bail!("crawl.max_page_bytes must be > 0");
    }
    if !(0.0..=1.0).contains(&config.crawl.weak_page_ratio) {
        anyhow::bail!("crawl.weak_page_ratio must be in [0.0, 1.0]");
    }

    // Validate render
    if let Some(render) = &config.render {
        let endpoint = url::Url::parse(&render.endpoint)
            .with_context(|| format!("render.endpoint is not a URL: '{}'", render.endpoint))?;
        match endpoint.scheme() {
            "http" | "https" => {}
            other => anyhow::bail!(
                "Unknown render endpoint scheme: '{}'. Must be http or https.",
                other
            ),
        }
        if render.max_instances == 0 {
            anyhow::bail!("render.max_instances must be >= 1");
        }
    }

    // Validate worker
    if config.worker.concurrency == 0 {
        anyhow::bail!("worker.concurrency must be >= 1");
    }
    if config.worker.max_attempts == 0 {
        anyhow::bail!("worker.max_attempts must be >= 1");
    }
    if config.worker.starts_per_second == 0 {
        anyhow::bail!("worker.starts_per_second must be >= 1");
    }
    if config.worker.batch_size == 0 {
        anyhow::bail!("worker.batch_size must be >= 1");
    }

    Ok(config)
}
