//! Chunk persistence.
//!
//! Turns extracted text into stored [`ChunkRecord`] rows for one source.
//!
//! - [`ChunkPersistence::replace`] clears the source's chunks and writes the
//!   new content at positions `0..N-1`. Used for text, Q&A and file sources.
//! - [`ChunkPersistence::append`] continues after the current maximum
//!   position. Used by progressive crawling, one page at a time.
//!
//! A source never holds more than [`MAX_CHUNKS`] rows. Chunks past the
//! ceiling are dropped, the last kept chunk is flagged `truncated`, and the
//! outcome reports `capped`.
//!
//! Rows are inserted in batches of `batch_size`. Each batch is atomic, the
//! call as a whole is not: after a failure the batches already written stay
//! in place, so callers recover with `append`. On success the source's
//! `chunk_count` is rewritten from the stored row count.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ingest_harness_core::chunk::{
    content_hash, estimate_tokens, split, ChunkStrategy, TextSegment, MAX_CHUNKS,
};
use ingest_harness_core::models::{ChunkMetadata, ChunkRecord, SourceContext, SourceUpdate};
use ingest_harness_core::store::Store;
use tracing::{debug, warn};
use uuid::Uuid;

/// Provenance of a crawled page, stamped on each of its chunks.
#[derive(Debug, Clone, Default)]
pub struct PageInfo {
    pub url: String,
    pub title: Option<String>,
    pub crawled_at: Option<DateTime<Utc>>,
    pub depth: Option<u32>,
}

/// What one persistence call wrote.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PersistOutcome {
    pub inserted: usize,
    /// Chunks dropped because an identical one was already written.
    pub duplicates: usize,
    /// Position of the first inserted chunk.
    pub first_position: Option<i64>,
    pub truncated: bool,
    /// The source hit [`MAX_CHUNKS`] and chunks were dropped.
    pub capped: bool,
    /// Stored row count for the source after the call.
    pub chunk_count: i64,
}

#[derive(Clone)]
pub struct ChunkPersistence {
    store: Arc<dyn Store>,
    batch_size: usize,
}

impl ChunkPersistence {
    pub fn new(store: Arc<dyn Store>, batch_size: usize) -> Self {
        Self {
            store,
            batch_size: batch_size.max(1),
        }
    }

    /// Delete every chunk of the source, then store `text` from position 0.
    pub async fn replace(
        &self,
        source: &SourceContext,
        text: &str,
        strategy: &ChunkStrategy,
    ) -> Result<PersistOutcome> {
        let removed = self
            .store
            .delete_chunks(&source.source_id)
            .await
            .with_context(|| format!("failed to clear chunks of source {}", source.source_id))?;
        debug!(source_id = %source.source_id, removed, "cleared chunks before replace");

        self.write(source, text, strategy, 0, None, None).await
    }

    /// Store `text` after the source's existing chunks.
    ///
    /// When `seen` is given, chunks whose hash is already in it are skipped
    /// and the hashes of inserted chunks are added to it.
    pub async fn append(
        &self,
        source: &SourceContext,
        text: &str,
        strategy: &ChunkStrategy,
        page: Option<&PageInfo>,
        seen: Option<&mut HashSet<String>>,
    ) -> Result<PersistOutcome> {
        let start = self
            .store
            .max_position(&source.source_id)
            .await
            .with_context(|| format!("failed to read max position of source {}", source.source_id))?
            .map(|max| max + 1)
            .unwrap_or(0);

        self.write(source, text, strategy, start, page, seen).await
    }

    async fn write(
        &self,
        source: &SourceContext,
        text: &str,
        strategy: &ChunkStrategy,
        start_position: i64,
        page: Option<&PageInfo>,
        seen: Option<&mut HashSet<String>>,
    ) -> Result<PersistOutcome> {
        let output = split(text, strategy);
        let (mut records, duplicates) =
            build_records(source, &output.segments, start_position, output.truncated, page, seen);

        let room = MAX_CHUNKS.saturating_sub(start_position.max(0) as usize);
        let capped = records.len() > room;
        if capped {
            warn!(
                source_id = %source.source_id,
                limit = MAX_CHUNKS,
                dropped = records.len() - room,
                "source reached the chunk ceiling, dropping remaining chunks"
            );
            records.truncate(room);
            let total = records.len();
            for record in &mut records {
                record.metadata.total_chunks = total;
            }
            if let Some(last) = records.last_mut() {
                last.metadata.truncated = true;
            }
        }

        for batch in records.chunks(self.batch_size) {
            self.store.insert_chunks(batch).await.with_context(|| {
                format!(
                    "failed to insert chunk batch at position {} for source {}",
                    batch.first().map(|c| c.position).unwrap_or(start_position),
                    source.source_id
                )
            })?;
        }

        let chunk_count = self.store.count_chunks(&source.source_id).await?;
        self.store
            .update_source(
                &source.source_id,
                &SourceUpdate {
                    chunk_count: Some(chunk_count),
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("failed to update chunk_count of source {}", source.source_id))?;

        debug!(
            source_id = %source.source_id,
            inserted = records.len(),
            duplicates,
            chunk_count,
            "chunks persisted"
        );

        Ok(PersistOutcome {
            inserted: records.len(),
            duplicates,
            first_position: records.first().map(|c| c.position),
            truncated: output.truncated || capped,
            capped,
            chunk_count,
        })
    }
}

/// Number segments into rows starting at `start_position`.
///
/// `chunk_index`/`total_chunks` describe the rows kept after dedup, so a
/// page's chunks always read `0..total` with no holes.
pub fn build_records(
    source: &SourceContext,
    segments: &[TextSegment],
    start_position: i64,
    truncated: bool,
    page: Option<&PageInfo>,
    mut seen: Option<&mut HashSet<String>>,
) -> (Vec<ChunkRecord>, usize) {
    let mut kept: Vec<(&TextSegment, String)> = Vec::with_capacity(segments.len());
    let mut duplicates = 0;
    for segment in segments {
        if segment.text.trim().is_empty() {
            continue;
        }
        let hash = content_hash(&segment.text);
        if let Some(seen) = seen.as_deref_mut() {
            if !seen.insert(hash.clone()) {
                duplicates += 1;
                continue;
            }
        }
        kept.push((segment, hash));
    }

    let total = kept.len();
    let now = Utc::now();
    let records = kept
        .into_iter()
        .enumerate()
        .map(|(i, (segment, hash))| ChunkRecord {
            id: Uuid::new_v4().to_string(),
            source_id: source.source_id.clone(),
            agent_id: source.agent_id.clone(),
            project_id: source.project_id.clone(),
            content: segment.text.clone(),
            position: start_position + i as i64,
            token_estimate: estimate_tokens(&segment.text) as i64,
            content_hash: hash,
            metadata: ChunkMetadata {
                chunk_index: i,
                total_chunks: total,
                start_char: segment.start,
                end_char: segment.end,
                page_url: page.map(|p| p.url.clone()),
                page_title: page.and_then(|p| p.title.clone()),
                crawled_at: page.and_then(|p| p.crawled_at),
                depth: page.and_then(|p| p.depth),
                truncated,
                ..Default::default()
            },
            created_at: now,
        })
        .collect();

    (records, duplicates)
}
