//! Source retrieval by ID.
//!
//! Fetches a source and its chunks in position order. Used by both the
//! `ingest get` CLI command and `GET /sources/{id}`.

use anyhow::{bail, Result};
use ingest_harness_core::models::{ChunkRecord, Source};
use ingest_harness_core::store::Store;
use serde::Serialize;

/// Default page size for chunk listings.
pub const DEFAULT_CHUNK_LIMIT: i64 = 100;

#[derive(Debug, Clone, Serialize)]
pub struct SourceResponse {
    #[serde(flatten)]
    pub source: Source,
    pub size_kb: f64,
}

impl From<Source> for SourceResponse {
    fn from(source: Source) -> Self {
        Self {
            size_kb: source.size_kb(),
            source,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkResponse {
    pub id: String,
    pub position: i64,
    pub content: String,
    pub token_estimate: i64,
    pub metadata: serde_json::Value,
}

impl From<ChunkRecord> for ChunkResponse {
    fn from(chunk: ChunkRecord) -> Self {
        Self {
            id: chunk.id,
            position: chunk.position,
            content: chunk.content,
            token_estimate: chunk.token_estimate,
            metadata: serde_json::to_value(&chunk.metadata).unwrap_or(serde_json::Value::Null),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChunkPage {
    pub source_id: String,
    pub total: i64,
    pub offset: i64,
    pub chunks: Vec<ChunkResponse>,
}

pub async fn get_source(store: &dyn Store, id: &str) -> Result<SourceResponse> {
    match store.get_source(id).await? {
        Some(source) => Ok(source.into()),
        None => bail!("source not found: {}", id),
    }
}

pub async fn get_chunks(store: &dyn Store, id: &str, offset: i64, limit: i64) -> Result<ChunkPage> {
    if store.get_source(id).await?.is_none() {
        bail!("source not found: {}", id);
    }
    let offset = offset.max(0);
    let limit = limit.clamp(1, 1000);
    let total = store.count_chunks(id).await?;
    let chunks = store
        .list_chunks(id, offset, limit)
        .await?
        .into_iter()
        .map(ChunkResponse::from)
        .collect();
    Ok(ChunkPage {
        source_id: id.to_string(),
        total,
        offset,
        chunks,
    })
}

/// CLI entry point: print a source and its chunks to stdout.
pub async fn run_get(store: &dyn Store, id: &str, show_chunks: bool) -> Result<()> {
    let response = get_source(store, id).await?;
    let source = &response.source;

    println!("--- Source ---");
    println!("id:           {}", source.id);
    println!("type:         {}", source.source_type);
    println!("origin:       {}", source.origin);
    println!("status:       {}", source.status);
    println!("agent_id:     {}", source.agent_id);
    println!("project_id:   {}", source.project_id);
    println!("chunks:       {}", source.chunk_count);
    println!("size_kb:      {:.1}", response.size_kb);
    if let Some(ref message) = source.error_message {
        println!("error:        {}", message);
    }
    println!("created_at:   {}", source.created_at.to_rfc3339());
    println!("updated_at:   {}", source.updated_at.to_rfc3339());
    println!(
        "metadata:     {}",
        serde_json::to_string(&source.metadata).unwrap_or_default()
    );

    if show_chunks {
        let page = get_chunks(store, id, 0, 1000).await?;
        println!();
        println!("--- Chunks ({} of {}) ---", page.chunks.len(), page.total);
        for chunk in &page.chunks {
            println!("[chunk {}] ~{} tokens", chunk.position, chunk.token_estimate);
            println!("{}", chunk.content);
            println!();
        }
    }

    Ok(())
}
