//! libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a local libSQL database holding embedded
//! document chunks (for similarity search) and the history of batch runs.
//!
//! **Access rules:**
//! - pipeline tools: read-write via [`Storage::open`]
//! - query commands (`search`, `collections`, `runs`, `export`): read-only via
//!   [`Storage::open_readonly`]

mod migrations;

use std::path::Path;

use chrono::{DateTime, Utc};
use docflow_shared::{DocflowError, Metadata, Result};
use libsql::{Connection, Database, params};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

fn db_err(e: libsql::Error) -> DocflowError {
    DocflowError::Storage(e.to_string())
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DocflowError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(DocflowError::Storage(format!(
                "database not found: {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(db_err)?;
        let conn = db.connect().map_err(db_err)?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        DocflowError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => match rows.next().await {
                Ok(Some(row)) => row.get::<u32>(0).unwrap_or(0),
                _ => 0,
            },
            // table doesn't exist yet
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(DocflowError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Chunks
    // -----------------------------------------------------------------------

    /// Insert one embedded chunk. Returns the generated chunk id.
    pub async fn insert_chunk(&self, chunk: &ChunkRecord) -> Result<String> {
        self.check_writable()?;
        if chunk.embedding.is_empty() {
            return Err(DocflowError::validation("chunk embedding is empty"));
        }

        let id = Uuid::now_v7().to_string();
        let embedding = serde_json::to_string(&chunk.embedding)
            .map_err(|e| DocflowError::Storage(format!("encode embedding: {e}")))?;
        let metadata = serde_json::to_string(&chunk.metadata)
            .map_err(|e| DocflowError::Storage(format!("encode metadata: {e}")))?;
        let now = Utc::now().to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO chunks (id, collection, source_url, chunk_index, chunk_text, token_count,
                                     embedding, embedding_model, metadata_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id.as_str(),
                    chunk.collection.as_str(),
                    chunk.source_url.as_str(),
                    chunk.chunk_index as i64,
                    chunk.chunk_text.as_str(),
                    chunk.token_count as i64,
                    embedding.as_str(),
                    chunk.embedding_model.as_str(),
                    metadata.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(id)
    }

    /// Insert several chunks, returning how many were stored.
    pub async fn insert_chunks(&self, chunks: &[ChunkRecord]) -> Result<usize> {
        for chunk in chunks {
            self.insert_chunk(chunk).await?;
        }
        Ok(chunks.len())
    }

    /// Delete every chunk of `source_url` in `collection` (re-ingest support).
    pub async fn delete_source_chunks(&self, collection: &str, source_url: &str) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute(
                "DELETE FROM chunks WHERE collection = ?1 AND source_url = ?2",
                params![collection, source_url],
            )
            .await
            .map_err(db_err)
    }

    /// Rank stored chunks by cosine similarity to `query.embedding`.
    ///
    /// Similarity is computed in-process; chunks below `threshold` are
    /// dropped and at most `top_k` results are returned, best first.
    pub async fn similarity_search(&self, query: &SimilarityQuery) -> Result<Vec<ScoredChunk>> {
        query.validate()?;

        let mut rows = match &query.collection {
            Some(collection) => {
                self.conn
                    .query(
                        "SELECT id, collection, source_url, chunk_index, chunk_text, token_count,
                                embedding, metadata_json
                         FROM chunks WHERE collection = ?1",
                        params![collection.as_str()],
                    )
                    .await
            }
            None => {
                self.conn
                    .query(
                        "SELECT id, collection, source_url, chunk_index, chunk_text, token_count,
                                embedding, metadata_json
                         FROM chunks",
                        params![],
                    )
                    .await
            }
        }
        .map_err(db_err)?;

        let mut scored = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            let embedding: String = row.get(6).map_err(db_err)?;
            let embedding: Vec<f32> = serde_json::from_str(&embedding)
                .map_err(|e| DocflowError::Storage(format!("decode embedding: {e}")))?;
            let similarity = cosine_similarity(&query.embedding, &embedding);
            if similarity < query.threshold {
                continue;
            }

            let metadata = row
                .get::<String>(7)
                .ok()
                .and_then(|s| serde_json::from_str::<Metadata>(&s).ok())
                .unwrap_or_default();

            scored.push(ScoredChunk {
                id: row.get(0).map_err(db_err)?,
                collection: row.get(1).map_err(db_err)?,
                source_url: row.get(2).map_err(db_err)?,
                chunk_index: row.get::<i64>(3).map_err(db_err)? as usize,
                chunk_text: row.get(4).map_err(db_err)?,
                token_count: row.get::<i64>(5).map_err(db_err)? as usize,
                metadata,
                similarity,
            });
        }

        scored.sort_by(|a, b| b.similarity.total_cmp(&a.similarity));
        scored.truncate(query.top_k);
        Ok(scored)
    }

    /// All collections with chunk counts, ordered by name.
    pub async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let mut rows = self
            .conn
            .query(
                "SELECT collection, COUNT(*), COUNT(DISTINCT source_url), MIN(created_at), MAX(created_at)
                 FROM chunks GROUP BY collection ORDER BY collection",
                params![],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(CollectionInfo {
                name: row.get(0).map_err(db_err)?,
                chunk_count: row.get::<i64>(1).map_err(db_err)? as u64,
                unique_sources: row.get::<i64>(2).map_err(db_err)? as u64,
                first_added: parse_timestamp(&row.get::<String>(3).map_err(db_err)?)?,
                last_added: parse_timestamp(&row.get::<String>(4).map_err(db_err)?)?,
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Batch runs
    // -----------------------------------------------------------------------

    /// Store (or replace) the report of a finished batch run.
    pub async fn record_batch_run(&self, run: &BatchRunRecord) -> Result<()> {
        self.check_writable()?;
        let report = serde_json::to_string(&run.report)
            .map_err(|e| DocflowError::Storage(format!("encode report: {e}")))?;
        self.conn
            .execute(
                "INSERT INTO batch_runs (batch_id, tool, success, total_documents, successful_documents,
                                         failed_documents, report_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(batch_id) DO UPDATE SET
                   tool = excluded.tool,
                   success = excluded.success,
                   total_documents = excluded.total_documents,
                   successful_documents = excluded.successful_documents,
                   failed_documents = excluded.failed_documents,
                   report_json = excluded.report_json,
                   created_at = excluded.created_at",
                params![
                    run.batch_id.as_str(),
                    run.tool.as_str(),
                    i64::from(run.success),
                    run.total_documents as i64,
                    run.successful_documents as i64,
                    run.failed_documents as i64,
                    report.as_str(),
                    run.created_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(db_err)?;
        Ok(())
    }

    /// Most recent batch runs first.
    pub async fn list_batch_runs(&self, limit: u32) -> Result<Vec<BatchRunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT batch_id, tool, success, total_documents, successful_documents,
                        failed_documents, report_json, created_at
                 FROM batch_runs ORDER BY created_at DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(db_err)?;

        let mut results = Vec::new();
        while let Some(row) = rows.next().await.map_err(db_err)? {
            results.push(row_to_batch_run(&row)?);
        }
        Ok(results)
    }

    /// Look up one batch run by id.
    pub async fn get_batch_run(&self, batch_id: &str) -> Result<Option<BatchRunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT batch_id, tool, success, total_documents, successful_documents,
                        failed_documents, report_json, created_at
                 FROM batch_runs WHERE batch_id = ?1",
                params![batch_id],
            )
            .await
            .map_err(db_err)?;

        match rows.next().await.map_err(db_err)? {
            Some(row) => Ok(Some(row_to_batch_run(&row)?)),
            None => Ok(None),
        }
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// A chunk of converted text with its embedding, ready to store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkRecord {
    pub collection: String,
    pub source_url: String,
    pub chunk_index: usize,
    pub chunk_text: String,
    pub token_count: usize,
    pub embedding: Vec<f32>,
    pub embedding_model: String,
    #[serde(default)]
    pub metadata: Metadata,
}

/// Parameters of a similarity search.
#[derive(Debug, Clone)]
pub struct SimilarityQuery {
    pub embedding: Vec<f32>,
    /// Maximum number of results (must be positive).
    pub top_k: usize,
    /// Minimum cosine similarity in `[0, 1]`.
    pub threshold: f32,
    /// Restrict to one collection; `None` searches all.
    pub collection: Option<String>,
}

impl SimilarityQuery {
    pub const DEFAULT_TOP_K: usize = 5;
    pub const DEFAULT_THRESHOLD: f32 = 0.7;

    pub fn new(embedding: Vec<f32>) -> Self {
        Self {
            embedding,
            top_k: Self::DEFAULT_TOP_K,
            threshold: Self::DEFAULT_THRESHOLD,
            collection: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.embedding.is_empty() {
            return Err(DocflowError::validation("query embedding is empty"));
        }
        if self.top_k == 0 {
            return Err(DocflowError::validation("top_k must be a positive integer"));
        }
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(DocflowError::validation(
                "similarity threshold must be between 0 and 1",
            ));
        }
        Ok(())
    }
}

/// A stored chunk together with its similarity to the query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub id: String,
    pub collection: String,
    pub source_url: String,
    pub chunk_index: usize,
    pub chunk_text: String,
    pub token_count: usize,
    pub metadata: Metadata,
    pub similarity: f32,
}

/// Summary of one collection.
#[derive(Debug, Clone, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub chunk_count: u64,
    pub unique_sources: u64,
    pub first_added: DateTime<Utc>,
    pub last_added: DateTime<Utc>,
}

/// A stored pipeline report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRunRecord {
    pub batch_id: String,
    /// Pipeline tool that produced the run (`batch`, `folder`, ...).
    pub tool: String,
    pub success: bool,
    pub total_documents: usize,
    pub successful_documents: usize,
    pub failed_documents: usize,
    /// The full report as JSON.
    pub report: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Cosine similarity of two vectors; 0.0 when lengths differ or either is zero.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let (mut dot, mut norm_a, mut norm_b) = (0.0f32, 0.0f32, 0.0f32);
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DocflowError::Storage(format!("invalid date: {e}")))
}

fn row_to_batch_run(row: &libsql::Row) -> Result<BatchRunRecord> {
    let report: String = row.get(6).map_err(db_err)?;
    Ok(BatchRunRecord {
        batch_id: row.get(0).map_err(db_err)?,
        tool: row.get(1).map_err(db_err)?,
        success: row.get::<i64>(2).map_err(db_err)? != 0,
        total_documents: row.get::<i64>(3).map_err(db_err)? as usize,
        successful_documents: row.get::<i64>(4).map_err(db_err)? as usize,
        failed_documents: row.get::<i64>(5).map_err(db_err)? as usize,
        report: serde_json::from_str(&report)
            .map_err(|e| DocflowError::Storage(format!("decode report: {e}")))?,
        created_at: parse_timestamp(&row.get::<String>(7).map_err(db_err)?)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    async fn test_storage() -> (TempDir, Storage) {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::open(&dir.path().join("docflow.db"))
            .await
            .expect("open test db");
        (dir, storage)
    }

    fn chunk(collection: &str, source: &str, index: usize, embedding: Vec<f32>) -> ChunkRecord {
        ChunkRecord {
            collection: collection.into(),
            source_url: source.into(),
            chunk_index: index,
            chunk_text: format!("chunk {index} of {source}"),
            token_count: 4,
            embedding,
            embedding_model: "test-model".into(),
            metadata: Metadata::new(),
        }
    }

    fn run(batch_id: &str, success: bool, created_at: DateTime<Utc>) -> BatchRunRecord {
        BatchRunRecord {
            batch_id: batch_id.into(),
            tool: "folder".into(),
            success,
            total_documents: 3,
            successful_documents: if success { 3 } else { 2 },
            failed_documents: if success { 0 } else { 1 },
            report: json!({"batch_id": batch_id, "success": success}),
            created_at,
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let (_dir, storage) = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docflow.db");
        drop(Storage::open(&path).await.expect("first open"));
        let again = Storage::open(&path).await.expect("second open");
        assert_eq!(again.get_schema_version().await, 2);
    }

    #[test]
    fn cosine_basics() {
        assert!((cosine_similarity(&[1.0, 0.0], &[1.0, 0.0]) - 1.0).abs() < 1e-6);
        assert!(cosine_similarity(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
        assert_eq!(cosine_similarity(&[1.0], &[1.0, 0.0]), 0.0);
        assert_eq!(cosine_similarity(&[0.0, 0.0], &[1.0, 0.0]), 0.0);
    }

    #[tokio::test]
    async fn similarity_search_ranks_and_filters() {
        let (_dir, storage) = test_storage().await;
        storage
            .insert_chunks(&[
                chunk("docs", "https://a.dev/1", 0, vec![1.0, 0.0, 0.0]),
                chunk("docs", "https://a.dev/1", 1, vec![0.9, 0.1, 0.0]),
                chunk("docs", "https://a.dev/2", 0, vec![0.0, 1.0, 0.0]),
                chunk("blog", "https://b.dev/1", 0, vec![1.0, 0.0, 0.0]),
            ])
            .await
            .unwrap();

        let mut query = SimilarityQuery::new(vec![1.0, 0.0, 0.0]);
        query.collection = Some("docs".into());
        let hits = storage.similarity_search(&query).await.unwrap();
        assert_eq!(hits.len(), 2, "orthogonal chunk is below the threshold");
        assert_eq!(hits[0].chunk_index, 0);
        assert!(hits[0].similarity >= hits[1].similarity);
        assert!(hits.iter().all(|h| h.collection == "docs"));

        query.collection = None;
        query.top_k = 1;
        let hits = storage.similarity_search(&query).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert!((hits[0].similarity - 1.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn similarity_query_validated() {
        let (_dir, storage) = test_storage().await;
        let mut query = SimilarityQuery::new(vec![1.0]);
        query.top_k = 0;
        assert!(storage.similarity_search(&query).await.is_err());

        let mut query = SimilarityQuery::new(vec![1.0]);
        query.threshold = 1.5;
        assert!(storage.similarity_search(&query).await.is_err());

        assert!(storage.similarity_search(&SimilarityQuery::new(vec![])).await.is_err());
    }

    #[tokio::test]
    async fn collections_listed_with_counts() {
        let (_dir, storage) = test_storage().await;
        storage
            .insert_chunks(&[
                chunk("docs", "https://a.dev/1", 0, vec![1.0]),
                chunk("docs", "https://a.dev/1", 1, vec![1.0]),
                chunk("docs", "https://a.dev/2", 0, vec![1.0]),
                chunk("blog", "https://b.dev/1", 0, vec![1.0]),
            ])
            .await
            .unwrap();

        let collections = storage.list_collections().await.unwrap();
        assert_eq!(collections.len(), 2);
        assert_eq!(collections[0].name, "blog");
        assert_eq!(collections[1].name, "docs");
        assert_eq!(collections[1].chunk_count, 3);
        assert_eq!(collections[1].unique_sources, 2);

        let removed = storage
            .delete_source_chunks("docs", "https://a.dev/1")
            .await
            .unwrap();
        assert_eq!(removed, 2);
    }

    #[tokio::test]
    async fn batch_run_history() {
        let (_dir, storage) = test_storage().await;
        let earlier = Utc::now() - chrono::Duration::minutes(5);
        storage.record_batch_run(&run("b1", true, earlier)).await.unwrap();
        storage.record_batch_run(&run("b2", false, Utc::now())).await.unwrap();

        let runs = storage.list_batch_runs(10).await.unwrap();
        assert_eq!(runs.len(), 2);
        assert_eq!(runs[0].batch_id, "b2");
        assert!(!runs[0].success);
        assert_eq!(runs[0].failed_documents, 1);

        let found = storage.get_batch_run("b1").await.unwrap().unwrap();
        assert_eq!(found.report["batch_id"], "b1");
        assert!(storage.get_batch_run("missing").await.unwrap().is_none());

        // re-recording replaces
        storage.record_batch_run(&run("b1", false, earlier)).await.unwrap();
        assert!(!storage.get_batch_run("b1").await.unwrap().unwrap().success);
        assert_eq!(storage.list_batch_runs(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("docflow.db");
        let rw = Storage::open(&path).await.unwrap();
        rw.record_batch_run(&run("b1", true, Utc::now())).await.unwrap();
        drop(rw);

        let ro = Storage::open_readonly(&path).await.unwrap();
        assert_eq!(ro.list_batch_runs(10).await.unwrap().len(), 1);
        let err = ro
            .record_batch_run(&run("b2", true, Utc::now()))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read-only"));

        assert!(Storage::open_readonly(&dir.path().join("nope.db")).await.is_err());
    }
}
