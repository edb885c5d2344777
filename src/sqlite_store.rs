//! SQLite-backed [`Store`] implementation.
//!
//! Maps each [`Store`] operation onto the `sources`, `chunks`, and `jobs`
//! tables created by [`migrate`](crate::migrate). Tagged metadata and job
//! payloads are stored as JSON text; timestamps as RFC 3339 text.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use ingest_harness_core::models::{
    ChunkMetadata, ChunkRecord, CrawlJob, JobRecord, Source, SourceMetadata, SourceUpdate,
};
use ingest_harness_core::store::{apply_update, Store};

/// SQLite implementation of the [`Store`] trait.
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("invalid timestamp in database: '{}'", raw))?
        .with_timezone(&Utc))
}

fn source_from_row(row: &SqliteRow) -> Result<Source> {
    let metadata_json: String = row.get("metadata_json");
    let metadata: SourceMetadata =
        serde_json::from_str(&metadata_json).context("invalid source metadata in database")?;
    let source_type: String = row.get("source_type");
    let status: String = row.get("status");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(Source {
        id: row.get("id"),
        agent_id: row.get("agent_id"),
        project_id: row.get("project_id"),
        source_type: source_type.parse()?,
        origin: row.get("origin"),
        status: status.parse()?,
        size_bytes: row.get("size_bytes"),
        chunk_count: row.get("chunk_count"),
        metadata,
        error_message: row.get("error_message"),
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

fn chunk_from_row(row: &SqliteRow) -> Result<ChunkRecord> {
    let metadata_json: String = row.get("metadata_json");
    let metadata: ChunkMetadata =
        serde_json::from_str(&metadata_json).context("invalid chunk metadata in database")?;
    let created_at: String = row.get("created_at");

    Ok(ChunkRecord {
        id: row.get("id"),
        source_id: row.get("source_id"),
        agent_id: row.get("agent_id"),
        project_id: row.get("project_id"),
        content: row.get("content"),
        position: row.get("position"),
        token_estimate: row.get("token_estimate"),
        content_hash: row.get("hash"),
        metadata,
        created_at: parse_ts(&created_at)?,
    })
}

fn job_from_row(row: &SqliteRow) -> Result<JobRecord> {
    let job_json: String = row.get("job_json");
    let job: CrawlJob = serde_json::from_str(&job_json).context("invalid job payload in database")?;
    let status: String = row.get("status");
    let attempts: i64 = row.get("attempts");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");

    Ok(JobRecord {
        id: row.get("id"),
        source_id: row.get("source_id"),
        status: status.parse()?,
        attempts: u32::try_from(attempts).unwrap_or(0),
        last_error: row.get("last_error"),
        job,
        created_at: parse_ts(&created_at)?,
        updated_at: parse_ts(&updated_at)?,
    })
}

#[async_trait]
impl Store for SqliteStore {
    async fn create_source(&self, source: &Source) -> Result<()> {
        source.validate()?;
        sqlx::query(
            r#"
            INSERT INTO sources (id, agent_id, project_id, source_type, origin, status,
                                 size_bytes, chunk_count, metadata_json, error_message,
                                 created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&source.id)
        .bind(&source.agent_id)
        .bind(&source.project_id)
        .bind(source.source_type.as_str())
        .bind(&source.origin)
        .bind(source.status.as_str())
        .bind(source.size_bytes)
        .bind(source.chunk_count)
        .bind(serde_json::to_string(&source.metadata)?)
        .bind(&source.error_message)
        .bind(source.created_at.to_rfc3339())
        .bind(source.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .with_context(|| format!("Failed to insert source {}", source.id))?;
        Ok(())
    }

    async fn get_source(&self, id: &str) -> Result<Option<Source>> {
        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(source_from_row).transpose()
    }

    async fn list_sources(&self, agent_id: Option<&str>) -> Result<Vec<Source>> {
        let rows = match agent_id {
            Some(agent) => {
                sqlx::query(
                    "SELECT * FROM sources WHERE agent_id = ? ORDER BY created_at DESC, id",
                )
                .bind(agent)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM sources ORDER BY created_at DESC, id")
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.iter().map(source_from_row).collect()
    }

    async fn update_source(&self, id: &str, update: &SourceUpdate) -> Result<Source> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT * FROM sources WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| anyhow!("source not found: {}", id))?;
        let current = source_from_row(&row)?;
        let updated = apply_update(&current, update)?;

        sqlx::query(
            r#"
            UPDATE sources SET
                status = ?,
                size_bytes = ?,
                chunk_count = ?,
                metadata_json = ?,
                error_message = ?,
                updated_at = ?
            WHERE id = ?
            "#,
        )
        .bind(updated.status.as_str())
        .bind(updated.size_bytes)
        .bind(updated.chunk_count)
        .bind(serde_json::to_string(&updated.metadata)?)
        .bind(&updated.error_message)
        .bind(updated.updated_at.to_rfc3339())
        .bind(id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(updated)
    }

    async fn delete_source(&self, id: &str) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks WHERE source_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        let result = sqlx::query("DELETE FROM sources WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected() > 0)
    }

    async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<()> {
        for chunk in chunks {
            chunk.validate()?;
        }

        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            sqlx::query(
                r#"
                INSERT INTO chunks (id, source_id, agent_id, project_id, content, position,
                                    token_estimate, hash, metadata_json, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&chunk.id)
            .bind(&chunk.source_id)
            .bind(&chunk.agent_id)
            .bind(&chunk.project_id)
            .bind(&chunk.content)
            .bind(chunk.position)
            .bind(chunk.token_estimate)
            .bind(&chunk.content_hash)
            .bind(serde_json::to_string(&chunk.metadata)?)
            .bind(chunk.created_at.to_rfc3339())
            .execute(&mut *tx)
            .await
            .with_context(|| {
                format!(
                    "Failed to insert chunk at position {} for source {}",
                    chunk.position, chunk.source_id
                )
            })?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_chunks(&self, source_id: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM chunks WHERE source_id = ?")
            .bind(source_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn max_position(&self, source_id: &str) -> Result<Option<i64>> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(position) FROM chunks WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(max)
    }

    async fn count_chunks(&self, source_id: &str) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks WHERE source_id = ?")
            .bind(source_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn list_chunks(
        &self,
        source_id: &str,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<ChunkRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM chunks WHERE source_id = ? ORDER BY position ASC LIMIT ? OFFSET ?",
        )
        .bind(source_id)
        .bind(limit.max(0))
        .bind(offset.max(0))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(chunk_from_row).collect()
    }

    async fn upsert_job(&self, job: &JobRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (id, source_id, status, attempts, last_error, job_json,
                              created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                status = excluded.status,
                attempts = excluded.attempts,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&job.id)
        .bind(&job.source_id)
        .bind(job.status.as_str())
        .bind(i64::from(job.attempts))
        .bind(&job.last_error)
        .bind(serde_json::to_string(&job.job)?)
        .bind(job.created_at.to_rfc3339())
        .bind(job.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let row = sqlx::query("SELECT * FROM jobs WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ingest_harness_core::models::{SourceStatus, SourceType};
    use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
    use std::str::FromStr;

    async fn memory_store() -> SqliteStore {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .unwrap()
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .unwrap();
        crate::migrate::apply(&pool).await.unwrap();
        SqliteStore::new(pool)
    }

    fn chunk(source: &Source, position: i64) -> ChunkRecord {
        let content = format!("chunk number {}", position);
        ChunkRecord {
            id: uuid::Uuid::new_v4().to_string(),
            source_id: source.id.clone(),
            agent_id: source.agent_id.clone(),
            project_id: source.project_id.clone(),
            content_hash: ingest_harness_core::chunk::content_hash(&content),
            content,
            position,
            token_estimate: 3,
            metadata: ChunkMetadata {
                chunk_index: position as usize,
                total_chunks: 3,
                page_url: Some("https://a.test/".into()),
                ..Default::default()
            },
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn source_metadata_survives_round_trip() {
        let store = memory_store().await;
        let source = Source::new("agent", "project", SourceType::Website, "https://a.test");
        store.create_source(&source).await.unwrap();

        let mut metadata = source.metadata.clone();
        if let SourceMetadata::Website(web) = &mut metadata {
            web.pages_crawled = 2;
            web.crawled_pages = vec!["https://a.test/".into(), "https://a.test/b".into()];
        }
        store
            .update_source(
                &source.id,
                &SourceUpdate {
                    status: Some(SourceStatus::Processing),
                    metadata: Some(metadata),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let fetched = store.get_source(&source.id).await.unwrap().unwrap();
        assert_eq!(fetched.status, SourceStatus::Processing);
        assert_eq!(fetched.metadata.as_website().unwrap().pages_crawled, 2);
    }

    #[tokio::test]
    async fn unique_position_enforced_and_batch_rolled_back() {
        let store = memory_store().await;
        let source = Source::new("agent", "project", SourceType::Text, "notes");
        store.create_source(&source).await.unwrap();

        store
            .insert_chunks(&[chunk(&source, 0), chunk(&source, 1)])
            .await
            .unwrap();
        let dup = store
            .insert_chunks(&[chunk(&source, 2), chunk(&source, 1)])
            .await;
        assert!(dup.is_err());
        assert_eq!(store.count_chunks(&source.id).await.unwrap(), 2);
        assert_eq!(store.max_position(&source.id).await.unwrap(), Some(1));
    }

    #[tokio::test]
    async fn chunks_ordered_and_cascade_deleted() {
        let store = memory_store().await;
        let source = Source::new("agent", "project", SourceType::Text, "notes");
        store.create_source(&source).await.unwrap();
        store
            .insert_chunks(&[chunk(&source, 1), chunk(&source, 0), chunk(&source, 2)])
            .await
            .unwrap();

        let listed = store.list_chunks(&source.id, 0, 10).await.unwrap();
        let positions: Vec<i64> = listed.iter().map(|c| c.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(
            listed[0].metadata.page_url.as_deref(),
            Some("https://a.test/")
        );

        assert!(store.delete_source(&source.id).await.unwrap());
        assert_eq!(store.count_chunks(&source.id).await.unwrap(), 0);
        assert!(store.get_source(&source.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn max_position_of_empty_source_is_none() {
        let store = memory_store().await;
        assert_eq!(store.max_position("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn job_upsert_updates_status() {
        let store = memory_store().await;
        let mut record = JobRecord::new(CrawlJob {
            source_id: "s1".into(),
            agent_id: "a".into(),
            project_id: "p".into(),
            url: "https://a.test".into(),
            crawl_subpages: false,
            max_pages: 1,
            include_paths: vec![],
            exclude_paths: vec![],
            slow: false,
            full_page_content: false,
        });
        store.upsert_job(&record).await.unwrap();
        record.status = ingest_harness_core::models::JobStatus::Failed;
        record.attempts = 3;
        record.last_error = Some("boom".into());
        store.upsert_job(&record).await.unwrap();

        let fetched = store.get_job(&record.id).await.unwrap().unwrap();
        assert_eq!(fetched.attempts, 3);
        assert_eq!(fetched.last_error.as_deref(), Some("boom"));
        assert_eq!(fetched.job.url, "https://a.test");
    }
}
