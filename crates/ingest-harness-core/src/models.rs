//! Core data models for the ingestion pipeline.
//!
//! These types describe the sources, chunks, crawl progress, and jobs that
//! flow between the crawler, the chunk persistence layer, and storage.
//!
//! Free-form metadata is modelled as a tagged [`SourceMetadata`] variant per
//! source type. Each variant keeps a flattened `extra` map so fields written
//! by newer versions survive a round trip through older ones.

use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

// ═══════════════════════════════════════════════════════════════════════
// Sources
// ═══════════════════════════════════════════════════════════════════════

/// Kind of content a [`Source`] was created from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    Website,
    File,
    Text,
    Qa,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Website => "website",
            SourceType::File => "file",
            SourceType::Text => "text",
            SourceType::Qa => "qa",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "website" => Ok(SourceType::Website),
            "file" => Ok(SourceType::File),
            "text" => Ok(SourceType::Text),
            "qa" => Ok(SourceType::Qa),
            other => bail!("unknown source type: '{}'", other),
        }
    }
}

/// Processing status of a [`Source`].
///
/// Valid transitions:
///
/// ```text
/// pending ─┐
/// queued ──┼──▶ processing ──▶ ready
/// ready ───┤        │    ▲
/// error ───┘        │    └─ (retry restarts processing)
///                   └──────▶ error
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Pending,
    Processing,
    Queued,
    Ready,
    Error,
}

impl SourceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceStatus::Pending => "pending",
            SourceStatus::Processing => "processing",
            SourceStatus::Queued => "queued",
            SourceStatus::Ready => "ready",
            SourceStatus::Error => "error",
        }
    }

    /// Whether the status is an end state of a processing attempt.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SourceStatus::Ready | SourceStatus::Error)
    }

    /// Check whether moving from `self` to `next` is allowed.
    ///
    /// `processing → processing` is allowed because a retried job restarts
    /// from the top. Terminal states may be re-queued or re-processed
    /// (re-crawl), but never jump straight to the other terminal state.
    pub fn can_transition_to(&self, next: SourceStatus) -> bool {
        use SourceStatus::*;
        match (self, next) {
            (_, Processing) => true,
            (Processing, Ready) | (Processing, Error) => true,
            (Pending, Queued) | (Ready, Queued) | (Error, Queued) | (Queued, Queued) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(SourceStatus::Pending),
            "processing" => Ok(SourceStatus::Processing),
            "queued" => Ok(SourceStatus::Queued),
            "ready" => Ok(SourceStatus::Ready),
            "error" => Ok(SourceStatus::Error),
            other => bail!("unknown source status: '{}'", other),
        }
    }
}

/// A unit of ingestion: one website root, file, text blob, or Q&A pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub id: String,
    pub agent_id: String,
    pub project_id: String,
    pub source_type: SourceType,
    /// URL for websites, file name for files, title for text, question for Q&A.
    pub origin: String,
    pub status: SourceStatus,
    pub size_bytes: i64,
    pub chunk_count: i64,
    pub metadata: SourceMetadata,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Source {
    /// Create a new `pending` source with empty metadata for its type.
    pub fn new(
        agent_id: impl Into<String>,
        project_id: impl Into<String>,
        source_type: SourceType,
        origin: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            agent_id: agent_id.into(),
            project_id: project_id.into(),
            source_type,
            origin: origin.into(),
            status: SourceStatus::Pending,
            size_bytes: 0,
            chunk_count: 0,
            metadata: SourceMetadata::empty_for(source_type),
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Ownership triple used when stamping chunk rows.
    pub fn context(&self) -> SourceContext {
        SourceContext {
            source_id: self.id.clone(),
            agent_id: self.agent_id.clone(),
            project_id: self.project_id.clone(),
        }
    }

    /// Size in kilobytes, as shown to users.
    pub fn size_kb(&self) -> f64 {
        self.size_bytes as f64 / 1024.0
    }

    /// Boundary validation applied by stores before writing.
    pub fn validate(&self) -> Result<()> {
        if self.id.is_empty() {
            bail!("source id must not be empty");
        }
        if self.chunk_count < 0 {
            bail!("source {} has negative chunk_count", self.id);
        }
        self.metadata.check_kind(self.source_type)
    }
}

/// Identifies who owns the chunks written for a source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceContext {
    pub source_id: String,
    pub agent_id: String,
    pub project_id: String,
}

/// Partial update applied to a stored [`Source`].
///
/// `None` leaves a field untouched. `error_message: Some(None)` clears it.
#[derive(Debug, Clone, Default)]
pub struct SourceUpdate {
    pub status: Option<SourceStatus>,
    pub chunk_count: Option<i64>,
    pub size_bytes: Option<i64>,
    pub metadata: Option<SourceMetadata>,
    pub error_message: Option<Option<String>>,
}

impl SourceUpdate {
    pub fn status(status: SourceStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.chunk_count.is_none()
            && self.size_bytes.is_none()
            && self.metadata.is_none()
            && self.error_message.is_none()
    }

    /// Apply this update to an in-memory source.
    pub fn apply(&self, source: &mut Source) {
        if let Some(status) = self.status {
            source.status = status;
        }
        if let Some(count) = self.chunk_count {
            source.chunk_count = count;
        }
        if let Some(size) = self.size_bytes {
            source.size_bytes = size;
        }
        if let Some(metadata) = &self.metadata {
            source.metadata = metadata.clone();
        }
        if let Some(message) = &self.error_message {
            source.error_message = message.clone();
        }
        source.updated_at = Utc::now();
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Source metadata
// ═══════════════════════════════════════════════════════════════════════

/// Per-type metadata stored alongside a source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceMetadata {
    Website(WebsiteMetadata),
    File(FileMetadata),
    Text(TextMetadata),
    Qa(QaMetadata),
}

impl SourceMetadata {
    pub fn empty_for(source_type: SourceType) -> Self {
        match source_type {
            SourceType::Website => SourceMetadata::Website(WebsiteMetadata::default()),
            SourceType::File => SourceMetadata::File(FileMetadata::default()),
            SourceType::Text => SourceMetadata::Text(TextMetadata::default()),
            SourceType::Qa => SourceMetadata::Qa(QaMetadata::default()),
        }
    }

    pub fn kind(&self) -> SourceType {
        match self {
            SourceMetadata::Website(_) => SourceType::Website,
            SourceMetadata::File(_) => SourceType::File,
            SourceMetadata::Text(_) => SourceType::Text,
            SourceMetadata::Qa(_) => SourceType::Qa,
        }
    }

    pub fn check_kind(&self, expected: SourceType) -> Result<()> {
        if self.kind() != expected {
            bail!(
                "metadata kind '{}' does not match source type '{}'",
                self.kind(),
                expected
            );
        }
        Ok(())
    }

    pub fn as_website(&self) -> Option<&WebsiteMetadata> {
        match self {
            SourceMetadata::Website(m) => Some(m),
            _ => None,
        }
    }
}

/// Crawl state recorded on a website source.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebsiteMetadata {
    pub crawl_progress: Option<CrawlProgress>,
    pub pages_crawled: usize,
    pub crawled_pages: Vec<String>,
    pub discovered_links: Vec<String>,
    pub crawl_errors: Vec<PageError>,
    pub total_chunks: usize,
    pub max_pages: Option<usize>,
    pub crawl_subpages: bool,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileMetadata {
    pub object_path: String,
    pub file_name: String,
    pub content_type: String,
    pub byte_size: u64,
    pub pages: Option<usize>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TextMetadata {
    pub title: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QaMetadata {
    pub question: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A page that failed during a crawl. Recorded, never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageError {
    pub url: String,
    pub error: String,
}

// ═══════════════════════════════════════════════════════════════════════
// Crawl progress
// ═══════════════════════════════════════════════════════════════════════

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CrawlPhase {
    Discovering,
    Processing,
    Completed,
    Failed,
}

impl CrawlPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            CrawlPhase::Discovering => "discovering",
            CrawlPhase::Processing => "processing",
            CrawlPhase::Completed => "completed",
            CrawlPhase::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, CrawlPhase::Completed | CrawlPhase::Failed)
    }
}

/// Snapshot of a crawl attempt. `pages_processed` never decreases within one
/// attempt and starts at zero for each new attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlProgress {
    pub phase: CrawlPhase,
    pub pages_processed: usize,
    pub total_pages: usize,
    pub current_url: Option<String>,
    #[serde(default)]
    pub discovered_links: Vec<String>,
    pub error: Option<String>,
}

impl CrawlProgress {
    /// The `discovering` snapshot emitted once at the start of an attempt.
    pub fn start(total_pages: usize) -> Self {
        Self {
            phase: CrawlPhase::Discovering,
            pages_processed: 0,
            total_pages,
            current_url: None,
            discovered_links: Vec::new(),
            error: None,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Chunks
// ═══════════════════════════════════════════════════════════════════════

/// Position and provenance metadata stored with each chunk.
///
/// `start_char`/`end_char` are character offsets into the text the chunk was
/// cut from (for websites: the page's own extracted text).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub start_char: usize,
    pub end_char: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub page_title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crawled_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub depth: Option<u32>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub truncated: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A stored, positioned slice of a source's text. Never mutated after insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub id: String,
    pub source_id: String,
    pub agent_id: String,
    pub project_id: String,
    pub content: String,
    pub position: i64,
    pub token_estimate: i64,
    pub content_hash: String,
    pub metadata: ChunkMetadata,
    pub created_at: DateTime<Utc>,
}

impl ChunkRecord {
    pub fn validate(&self) -> Result<()> {
        if self.content.trim().is_empty() {
            bail!("chunk {} has empty content", self.id);
        }
        if self.position < 0 {
            bail!("chunk {} has negative position {}", self.id, self.position);
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Jobs
// ═══════════════════════════════════════════════════════════════════════

/// A queued request to crawl one website source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlJob {
    pub source_id: String,
    pub agent_id: String,
    pub project_id: String,
    pub url: String,
    pub crawl_subpages: bool,
    pub max_pages: usize,
    #[serde(default)]
    pub include_paths: Vec<String>,
    #[serde(default)]
    pub exclude_paths: Vec<String>,
    #[serde(default)]
    pub slow: bool,
    #[serde(default)]
    pub full_page_content: bool,
}

impl CrawlJob {
    pub fn context(&self) -> SourceContext {
        SourceContext {
            source_id: self.source_id.clone(),
            agent_id: self.agent_id.clone(),
            project_id: self.project_id.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Active,
    Retrying,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Active => "active",
            JobStatus::Retrying => "retrying",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

impl FromStr for JobStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "active" => Ok(JobStatus::Active),
            "retrying" => Ok(JobStatus::Retrying),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => bail!("unknown job status: '{}'", other),
        }
    }
}

/// Durable record of a [`CrawlJob`] and its attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub source_id: String,
    pub status: JobStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub job: CrawlJob,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    pub fn new(job: CrawlJob) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            source_id: job.source_id.clone(),
            status: JobStatus::Queued,
            attempts: 0,
            last_error: None,
            job,
            created_at: now,
            updated_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_transitions() {
        use SourceStatus::*;
        assert!(Pending.can_transition_to(Processing));
        assert!(Queued.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Ready));
        assert!(Processing.can_transition_to(Error));
        assert!(Processing.can_transition_to(Processing));
        assert!(Ready.can_transition_to(Processing));
        assert!(!Pending.can_transition_to(Ready));
        assert!(!Queued.can_transition_to(Error));
        assert!(!Ready.can_transition_to(Error));
    }

    #[test]
    fn status_round_trips_through_str() {
        for s in ["pending", "processing", "queued", "ready", "error"] {
            assert_eq!(s.parse::<SourceStatus>().unwrap().as_str(), s);
        }
        assert!("done".parse::<SourceStatus>().is_err());
    }

    #[test]
    fn new_source_has_matching_metadata() {
        let source = Source::new("agent", "project", SourceType::Website, "https://example.com");
        assert_eq!(source.status, SourceStatus::Pending);
        assert!(source.validate().is_ok());
        assert!(source.metadata.as_website().is_some());
    }

    #[test]
    fn mismatched_metadata_is_rejected() {
        let mut source = Source::new("agent", "project", SourceType::Text, "notes");
        source.metadata = SourceMetadata::Website(WebsiteMetadata::default());
        let err = source.validate().unwrap_err();
        assert!(err.to_string().contains("does not match"));
    }

    #[test]
    fn metadata_keeps_unknown_fields() {
        let json = r#"{"kind":"website","pages_crawled":3,"sitemap_used":true}"#;
        let meta: SourceMetadata = serde_json::from_str(json).unwrap();
        let website = meta.as_website().unwrap();
        assert_eq!(website.pages_crawled, 3);
        assert_eq!(website.extra.get("sitemap_used"), Some(&Value::Bool(true)));

        let back = serde_json::to_value(&meta).unwrap();
        assert_eq!(back["kind"], "website");
        assert_eq!(back["sitemap_used"], true);
    }

    #[test]
    fn chunk_metadata_omits_defaults() {
        let meta = ChunkMetadata {
            chunk_index: 0,
            total_chunks: 1,
            start_char: 0,
            end_char: 5,
            ..Default::default()
        };
        let json = serde_json::to_value(&meta).unwrap();
        assert!(json.get("truncated").is_none());
        assert!(json.get("page_url").is_none());
    }

    #[test]
    fn source_update_applies_fields() {
        let mut source = Source::new("a", "p", SourceType::Text, "t");
        let update = SourceUpdate {
            status: Some(SourceStatus::Processing),
            chunk_count: Some(4),
            error_message: Some(Some("boom".to_string())),
            ..Default::default()
        };
        update.apply(&mut source);
        assert_eq!(source.status, SourceStatus::Processing);
        assert_eq!(source.chunk_count, 4);
        assert_eq!(source.error_message.as_deref(), Some("boom"));

        SourceUpdate {
            error_message: Some(None),
            ..Default::default()
        }
        .apply(&mut source);
        assert!(source.error_message.is_none());
    }
}
