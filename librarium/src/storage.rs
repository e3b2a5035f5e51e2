use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocumentStatus {
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "completed" => DocumentStatus::Completed,
            "failed" => DocumentStatus::Failed,
            _ => DocumentStatus::Processing,
        }
    }
}

/// Typed document metadata. Lives as a JSON column in the database but is
/// only (de)serialized at this persistence edge; everything above works
/// with the struct.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentMeta {
    pub source_name: Option<String>,
    pub domain: Option<String>,
    pub author: Option<String>,
    pub channel: Option<String>,
    pub reliability_score: Option<f64>,
    pub reliability_category: Option<String>,
    #[serde(default)]
    pub reliability_warnings: Vec<String>,
    pub language: Option<String>,
    pub content_preview: Option<String>,
    pub match_score: Option<f64>,
    /// "enriched" when scraped article text was appended, else "original"
    pub processing_mode: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentRecord {
    pub id: String,
    pub library_id: String,
    pub folder_id: Option<String>,
    pub title: String,
    pub content: String,
    pub source_type: String,
    pub source_url: Option<String>,
    pub status: DocumentStatus,
    pub progress: i64,
    pub chunk_count: i64,
    pub metadata: DocumentMeta,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewDocument {
    pub library_id: String,
    pub folder_id: Option<String>,
    pub title: String,
    pub content: String,
    pub source_type: String,
    pub source_url: Option<String>,
    pub metadata: DocumentMeta,
}

/// Which orchestrator produced an audit row; selects the audit table.
#[derive(Debug, Clone, Copy)]
pub enum IngestionOrigin {
    Newsletter,
    Email,
}

impl IngestionOrigin {
    fn table(self) -> &'static str {
        match self {
            IngestionOrigin::Newsletter => "ingestion_log",
            IngestionOrigin::Email => "email_ingestion_log",
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestionRecord {
    pub origin: IngestionOrigin,
    pub user_id: String,
    pub library_id: String,
    pub document_id: String,
    pub source: String,
    pub reliability_score: f64,
    pub match_score: f64,
}

/// SQLite-backed store for documents and append-only ingestion audit logs.
pub struct DocumentStore {
    pool: SqlitePool,
}

impl DocumentStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        info!("storage: ensuring DB schema (CREATE TABLE IF NOT EXISTS ...)");
        let stmts = [
            r#"
            CREATE TABLE IF NOT EXISTS knowledge_documents (
                id TEXT PRIMARY KEY,
                library_id TEXT NOT NULL,
                folder_id TEXT,
                title TEXT NOT NULL,
                content TEXT NOT NULL,
                source_type TEXT NOT NULL,
                source_url TEXT,
                status TEXT NOT NULL DEFAULT 'processing',
                progress INTEGER NOT NULL DEFAULT 0,
                chunk_count INTEGER NOT NULL DEFAULT 0,
                metadata TEXT,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );
            "#,
            r#"
            CREATE INDEX IF NOT EXISTS idx_documents_library
                ON knowledge_documents (library_id);
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS ingestion_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                library_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                source TEXT,
                reliability_score REAL,
                match_score REAL,
                created_at TIMESTAMP NOT NULL
            );
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS email_ingestion_log (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                library_id TEXT NOT NULL,
                document_id TEXT NOT NULL,
                source TEXT,
                reliability_score REAL,
                match_score REAL,
                created_at TIMESTAMP NOT NULL
            );
            "#,
        ];
        for stmt in stmts {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .context("failed to create schema")?;
        }
        Ok(())
    }

    /// Insert a new document row in `processing` state. Returns the id.
    pub async fn insert_document(&self, doc: &NewDocument) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let metadata_json =
            serde_json::to_string(&doc.metadata).context("failed to serialize document metadata")?;
        let now = Utc::now();

        sqlx::query(
            r#"
            INSERT INTO knowledge_documents
            (id, library_id, folder_id, title, content, source_type, source_url,
             status, progress, chunk_count, metadata, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, 'processing', 0, 0, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&doc.library_id)
        .bind(&doc.folder_id)
        .bind(&doc.title)
        .bind(&doc.content)
        .bind(&doc.source_type)
        .bind(&doc.source_url)
        .bind(&metadata_json)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .context("failed to insert document")?;

        Ok(id)
    }

    /// Progress only moves forward, and only while the document is still
    /// processing.
    pub async fn update_progress(&self, id: &str, progress: i64) -> Result<()> {
        sqlx::query(
            "UPDATE knowledge_documents
             SET progress = MAX(progress, ?), updated_at = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(progress.clamp(0, 100))
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to update progress")?;
        Ok(())
    }

    pub async fn mark_completed(&self, id: &str, chunk_count: i64) -> Result<()> {
        sqlx::query(
            "UPDATE knowledge_documents
             SET status = 'completed', progress = 100, chunk_count = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(chunk_count)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to mark document completed")?;
        Ok(())
    }

    /// Terminal failure: the error message is captured in the metadata so
    /// operators can see why without a separate log lookup.
    pub async fn mark_failed(&self, id: &str, error: &str) -> Result<()> {
        let mut meta = self
            .get_document(id)
            .await?
            .map(|d| d.metadata)
            .unwrap_or_default();
        meta.error = Some(error.to_string());
        let metadata_json = serde_json::to_string(&meta)?;

        sqlx::query(
            "UPDATE knowledge_documents
             SET status = 'failed', metadata = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(&metadata_json)
        .bind(Utc::now())
        .bind(id)
        .execute(&self.pool)
        .await
        .context("failed to mark document failed")?;
        Ok(())
    }

    pub async fn get_document(&self, id: &str) -> Result<Option<DocumentRecord>> {
        let row = sqlx::query("SELECT * FROM knowledge_documents WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("failed to fetch document")?;
        Ok(row.map(|r| row_to_document(&r)))
    }

    /// Batch lookup used by retrieval's orphan filtering. Missing ids are
    /// simply absent from the returned map.
    pub async fn get_documents_by_ids(
        &self,
        ids: &[String],
    ) -> Result<HashMap<String, DocumentRecord>> {
        if ids.is_empty() {
            return Ok(HashMap::new());
        }
        let placeholders = vec!["?"; ids.len()].join(", ");
        let query = format!(
            "SELECT * FROM knowledge_documents WHERE id IN ({})",
            placeholders
        );
        let mut q = sqlx::query(&query);
        for id in ids {
            q = q.bind(id);
        }
        let rows = q
            .fetch_all(&self.pool)
            .await
            .context("failed to batch-fetch documents")?;

        Ok(rows
            .iter()
            .map(|r| {
                let doc = row_to_document(r);
                (doc.id.clone(), doc)
            })
            .collect())
    }

    pub async fn delete_document(&self, id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM knowledge_documents WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await
            .context("failed to delete document")?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_documents(&self, library_id: &str) -> Result<Vec<DocumentRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM knowledge_documents WHERE library_id = ? ORDER BY created_at DESC",
        )
        .bind(library_id)
        .fetch_all(&self.pool)
        .await
        .context("failed to list documents")?;
        Ok(rows.iter().map(row_to_document).collect())
    }

    pub async fn count_documents(&self, library_id: &str) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM knowledge_documents WHERE library_id = ?",
        )
        .bind(library_id)
        .fetch_one(&self.pool)
        .await
        .context("failed to count documents")?;
        Ok(count)
    }

    /// Append-only audit row; failures are logged, never propagated, so a
    /// broken audit table cannot fail an otherwise successful ingestion.
    pub async fn record_ingestion(&self, record: &IngestionRecord) {
        let query = format!(
            "INSERT INTO {} (user_id, library_id, document_id, source, reliability_score, match_score, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
            record.origin.table()
        );
        let result = sqlx::query(&query)
            .bind(&record.user_id)
            .bind(&record.library_id)
            .bind(&record.document_id)
            .bind(&record.source)
            .bind(record.reliability_score)
            .bind(record.match_score)
            .bind(Utc::now())
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            warn!("storage: failed to record ingestion audit row: {}", e);
        }
    }
}

fn row_to_document(row: &sqlx::sqlite::SqliteRow) -> DocumentRecord {
    let metadata: DocumentMeta = row
        .get::<Option<String>, _>("metadata")
        .and_then(|raw| serde_json::from_str(&raw).ok())
        .unwrap_or_default();
    let status: String = row.get("status");

    DocumentRecord {
        id: row.get("id"),
        library_id: row.get("library_id"),
        folder_id: row.get("folder_id"),
        title: row.get("title"),
        content: row.get("content"),
        source_type: row.get("source_type"),
        source_url: row.get("source_url"),
        status: DocumentStatus::parse(&status),
        progress: row.get("progress"),
        chunk_count: row.get("chunk_count"),
        metadata,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_store() -> DocumentStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("memory pool");
        let store = DocumentStore::new(pool);
        store.ensure_schema().await.expect("schema");
        store
    }

    fn sample_doc() -> NewDocument {
        NewDocument {
            library_id: "L1".to_string(),
            folder_id: None,
            title: "Title".to_string(),
            content: "Body content".to_string(),
            source_type: "newsletter".to_string(),
            source_url: None,
            metadata: DocumentMeta {
                source_name: Some("Example Weekly".to_string()),
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn insert_and_fetch_roundtrip() {
        let store = test_store().await;
        let id = store.insert_document(&sample_doc()).await.unwrap();

        let doc = store.get_document(&id).await.unwrap().expect("found");
        assert_eq!(doc.status, DocumentStatus::Processing);
        assert_eq!(doc.progress, 0);
        assert_eq!(doc.metadata.source_name.as_deref(), Some("Example Weekly"));
    }

    #[tokio::test]
    async fn progress_is_monotone() {
        let store = test_store().await;
        let id = store.insert_document(&sample_doc()).await.unwrap();

        store.update_progress(&id, 60).await.unwrap();
        // A stale lower update must not move progress backwards
        store.update_progress(&id, 30).await.unwrap();

        let doc = store.get_document(&id).await.unwrap().unwrap();
        assert_eq!(doc.progress, 60);
    }

    #[tokio::test]
    async fn failure_captures_error_in_metadata() {
        let store = test_store().await;
        let id = store.insert_document(&sample_doc()).await.unwrap();

        store.mark_failed(&id, "embedding provider unreachable").await.unwrap();

        let doc = store.get_document(&id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Failed);
        assert_eq!(doc.metadata.error.as_deref(), Some("embedding provider unreachable"));
        // Pre-existing metadata survives the failure write
        assert_eq!(doc.metadata.source_name.as_deref(), Some("Example Weekly"));
    }

    #[tokio::test]
    async fn batch_lookup_skips_missing_ids() {
        let store = test_store().await;
        let id1 = store.insert_document(&sample_doc()).await.unwrap();
        let id2 = store.insert_document(&sample_doc()).await.unwrap();

        let found = store
            .get_documents_by_ids(&[id1.clone(), "missing".to_string(), id2.clone()])
            .await
            .unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains_key(&id1));
        assert!(!found.contains_key("missing"));
    }

    #[tokio::test]
    async fn completed_documents_ignore_progress_updates() {
        let store = test_store().await;
        let id = store.insert_document(&sample_doc()).await.unwrap();
        store.mark_completed(&id, 4).await.unwrap();
        store.update_progress(&id, 10).await.unwrap();

        let doc = store.get_document(&id).await.unwrap().unwrap();
        assert_eq!(doc.status, DocumentStatus::Completed);
        assert_eq!(doc.progress, 100);
        assert_eq!(doc.chunk_count, 4);
    }
}
