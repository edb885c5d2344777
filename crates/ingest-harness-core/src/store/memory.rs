//! In-memory [`Store`] implementation for tests and embedding.
//!
//! Uses `HashMap`/`BTreeMap` behind `std::sync::RwLock`. Chunks are keyed by
//! source and position, which gives ordered listing and the uniqueness
//! check for free.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::models::{ChunkRecord, JobRecord, Source, SourceUpdate};

use super::{apply_update, Store};

type ChunkMap = HashMap<String, BTreeMap<i64, ChunkRecord>>;

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    sources: RwLock<HashMap<String, Source>>,
    chunks: RwLock<ChunkMap>,
    jobs: RwLock<HashMap<String, JobRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create_source(&self, source: &Source) -> Result<()> {
        source.validate()?;
        let mut sources = write(&self.sources)?;
        if sources.contains_key(&source.id) {
            bail!("source {} already exists", source.id);
        }
        sources.insert(source.id.clone(), source.clone());
        Ok(())
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        Ok(read(&self.sources)?.get(id).cloned())
    }

    async fn list_sources(&self, agent_id: Option<&str>) -> Result<Vec<Source>> {
        let sources = read(&self.sources)?;
        let mut out: Vec<Source> = sources
            .values()
            .filter(|s| agent_id.map_or(true, |a| s.agent_id == a))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn update_source(&self, id: &str, update: &SourceUpdate) -> Result<Source> {
        let mut sources = write(&self.sources)?;
        let current = sources
            .get_mut(id)
            .ok_or_else(|| anyhow!("source not found: {}", id))?;
        let updated = apply_update(current, update)?;
        *current = updated.clone();
        Ok(updated)
    }

    async fn delete_source(&self, id: &str) -> Result<bool> {
        let removed = write(&self.sources)?.remove(id).is_some();
        write(&self.chunks)?.remove(id);
        Ok(removed)
    }

    async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<()> {
        let mut stored = write(&self.chunks)?;

        // Validate the whole batch before touching the map.
        let mut batch_positions: HashMap<&str, Vec<i64>> = HashMap::new();
        for chunk in chunks {
            chunk.validate()?;
            let taken = stored
                .get(&chunk.source_id)
                .is_some_and(|rows| rows.contains_key(&chunk.position));
            let positions = batch_positions.entry(&chunk.source_id).or_default();
            if taken || positions.contains(&chunk.position) {
                bail!(
                    "duplicate chunk position {} for source {}",
                    chunk.position,
                    chunk.source_id
                );
            }
            positions.push(chunk.position);
        }

        for chunk in chunks {
            stored
                .entry(chunk.source_id.clone())
                .or_default()
                .insert(chunk.position, chunk.clone());
        }
        Ok(())
    }

    async fn delete_chunks(&self, source_id: &str) -> Result<u64> {
        let removed = write(&self.chunks)?.remove(source_id);
        Ok(removed.map_or(0, |rows| rows.len() as u64))
    }

    async fn max_position(&self, source_id: &str) -> Result<Option<i64>> {
        let chunks = read(&self.chunks)?;
        Ok(chunks
            .get(source_id)
            .and_then(|rows| rows.keys().next_back().copied()))
    }

    async fn count_chunks(&self, source_id: &str) -> Result<i64> {
        let chunks = read(&self.chunks)?;
        Ok(chunks.get(source_id).map_or(0, |rows| rows.len() as i64))
    }

    async fn list_chunks(
        &self,
        source_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ChunkRecord>> {
        let chunks = read(&self.chunks)?;
        let Some(rows) = chunks.get(source_id) else {
            return Ok(Vec::new());
        };
        Ok(rows
            .values()
            .skip(offset.max(0) as usize)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn upsert_job(&self, job: &JobRecord) -> Result<()> {
        write(&self.jobs)?.insert(job.id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        Ok(read(&self.jobs)?.get(id).cloned())
    }
}
