//! Storage abstraction for the ingestion pipeline.
//!
//! The [`Store`] trait defines every storage operation the crawler, chunk
//! persistence, and job worker need, so backends (SQLite, in-memory) are
//! interchangeable.
//!
//! Implementations must be `Send + Sync` to work with async runtimes and
//! must enforce the same boundary checks:
//!
//! - a source's [`SourceMetadata`](crate::models::SourceMetadata) variant
//!   matches its [`SourceType`](crate::models::SourceType);
//! - status changes follow [`SourceStatus::can_transition_to`];
//! - `(source_id, position)` is unique across chunk rows;
//! - chunk content is non-empty and positions are non-negative.

pub mod memory;

use anyhow::{bail, Result};
use async_trait::async_trait;

use crate::models::{ChunkRecord, JobRecord, Source, SourceStatus, SourceUpdate};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_source`](Store::create_source) | Insert a new source row |
/// | [`get_source`](Store::get_source) | Fetch a source by ID |
/// | [`list_sources`](Store::list_sources) | List sources, newest first |
/// | [`update_source`](Store::update_source) | Apply a partial update |
/// | [`delete_source`](Store::delete_source) | Delete a source and its chunks |
/// | [`insert_chunks`](Store::insert_chunks) | Insert one batch of chunk rows |
/// | [`delete_chunks`](Store::delete_chunks) | Delete all chunks of a source |
/// | [`max_position`](Store::max_position) | Highest chunk position of a source |
/// | [`count_chunks`](Store::count_chunks) | Number of chunk rows of a source |
/// | [`list_chunks`](Store::list_chunks) | Chunks ordered by position |
/// | [`upsert_job`](Store::upsert_job) | Insert or update a job record |
/// | [`get_job`](Store::get_job) | Fetch a job record by ID |
#[async_trait]
pub trait Store: Send + Sync {
    async fn create_source(&self, source: &Source) -> Result<()>;

    async fn get_source(&self, id: &str) -> Result<Option<Source>>;

    /// List sources, optionally restricted to one agent.
    async fn list_sources(&self, agent_id: Option<&str>) -> Result<Vec<Source>>;

    /// Apply `update` and return the stored result. Fails if the source is
    /// missing, the status change is not allowed, or the metadata variant
    /// does not match the source type.
    async fn update_source(&self, id: &str, update: &SourceUpdate) -> Result<Source>;

    /// Delete a source and all of its chunks. Returns `false` if it did not exist.
    async fn delete_source(&self, id: &str) -> Result<bool>;

    /// Insert one batch atomically: either every row lands or none do.
    async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<()>;

    /// Delete every chunk of a source, returning the number removed.
    async fn delete_chunks(&self, source_id: &str) -> Result<u64>;

    /// Highest stored position, or `None` when the source has no chunks.
    async fn max_position(&self, source_id: &str) -> Result<Option<i64>>;

    async fn count_chunks(&self, source_id: &str) -> Result<i64>;

    async fn list_chunks(
        &self,
        source_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ChunkRecord>>;

    async fn upsert_job(&self, job: &JobRecord) -> Result<()>;

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>>;
}

/// Shared check for [`Store::update_source`] implementations.
///
/// Validates the transition against the current row and returns the
/// updated copy without writing it.
pub fn apply_update(current: &Source, update: &SourceUpdate) -> Result<Source> {
    if let Some(next) = update.status {
        check_transition(current.status, next)?;
    }
    let mut updated = current.clone();
    update.apply(&mut updated);
    updated.validate()?;
    Ok(updated)
}

/// A status may be rewritten with itself; otherwise the lifecycle applies.
pub fn check_transition(current: SourceStatus, next: SourceStatus) -> Result<()> {
    if current != next && !current.can_transition_to(next) {
        bail!("invalid source status transition: {} -> {}", current, next);
    }
    Ok(())
}
