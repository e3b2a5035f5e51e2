use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::chunking::{self, ChunkOptions};
use crate::llm::LlmProvider;
use crate::storage::{DocumentStatus, DocumentStore, NewDocument};
use crate::vector::{SearchParams, VectorPoint, VectorStore};

#[derive(Debug, Clone)]
pub struct RetrievalSettings {
    pub chunk_options: ChunkOptions,
    pub default_top_k: usize,
    pub default_min_score: f32,
    pub max_context_tokens: usize,
}

impl Default for RetrievalSettings {
    fn default() -> Self {
        Self {
            chunk_options: ChunkOptions::default(),
            default_top_k: 5,
            default_min_score: 0.25,
            max_context_tokens: 2000,
        }
    }
}

/// Vector collection backing a library.
pub fn collection_name(library_id: &str) -> String {
    format!("library_{}", library_id)
}

#[derive(Debug, Clone)]
pub struct IngestReport {
    pub document_id: String,
    pub chunks_created: usize,
    pub status: DocumentStatus,
}

#[derive(Debug, Clone, Default)]
pub struct RetrieveOptions {
    pub library_ids: Vec<String>,
    pub top_k: Option<usize>,
    pub min_score: Option<f32>,
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentRef {
    pub id: String,
    pub file_name: String,
    pub source_type: String,
    pub library_id: String,
    pub folder_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub id: String,
    pub text: String,
    pub score: f32,
    pub document: DocumentRef,
    pub metadata: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub query: String,
    pub chunks: Vec<RetrievedChunk>,
    pub total_results: usize,
    pub searched_libraries: Vec<String>,
}

/// Orchestrates embedding, per-library vector search, ranking and context
/// assembly over the vector store and the relational document store.
pub struct RetrievalService {
    vectors: Arc<VectorStore>,
    documents: Arc<DocumentStore>,
    embedder: Arc<dyn LlmProvider>,
    settings: RetrievalSettings,
}

impl RetrievalService {
    pub fn new(
        vectors: Arc<VectorStore>,
        documents: Arc<DocumentStore>,
        embedder: Arc<dyn LlmProvider>,
        settings: RetrievalSettings,
    ) -> Self {
        Self {
            vectors,
            documents,
            embedder,
            settings,
        }
    }

    pub fn document_store(&self) -> &DocumentStore {
        &self.documents
    }

    /// Persist and index a document: chunk, embed all chunks in one batch
    /// call, upsert vectors, then mark the row completed.
    ///
    /// On any failure the document is marked `failed` with the error in its
    /// metadata, and the error is returned to the caller. A crash between
    /// the vector upsert and the completion write can leave the two stores
    /// inconsistent; there is no cross-store transaction.
    pub async fn ingest_document(&self, doc: NewDocument) -> Result<IngestReport> {
        let document_id = self.documents.insert_document(&doc).await?;

        match self.index_document(&document_id, &doc).await {
            Ok(chunks_created) => {
                self.documents
                    .mark_completed(&document_id, chunks_created as i64)
                    .await?;
                info!(
                    "retrieval: ingested document {} ({} chunks) into library {}",
                    document_id, chunks_created, doc.library_id
                );
                Ok(IngestReport {
                    document_id,
                    chunks_created,
                    status: DocumentStatus::Completed,
                })
            }
            Err(e) => {
                warn!("retrieval: ingestion failed for document {}: {}", document_id, e);
                self.documents
                    .mark_failed(&document_id, &e.to_string())
                    .await
                    .ok();
                Err(e)
            }
        }
    }

    async fn index_document(&self, document_id: &str, doc: &NewDocument) -> Result<usize> {
        let base_meta = serde_json::to_value(&doc.metadata)
            .context("failed to serialize document metadata for chunks")?;
        let chunks = chunking::chunk_document(
            document_id,
            &doc.content,
            &base_meta,
            &self.settings.chunk_options,
        );
        if chunks.is_empty() {
            return Ok(0);
        }

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self
            .embedder
            .embed_batch(&texts)
            .await
            .context("embedding provider failed")?;
        if vectors.len() != chunks.len() {
            anyhow::bail!(
                "embedding provider returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            );
        }
        self.documents.update_progress(document_id, 60).await?;

        let points: Vec<VectorPoint> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| VectorPoint {
                id: chunk.id.clone(),
                vector,
                payload: json!({
                    "document_id": chunk.document_id,
                    "library_id": doc.library_id,
                    "content": chunk.content,
                    "chunk_index": chunk.chunk_index,
                    "metadata": chunk.metadata,
                }),
            })
            .collect();

        self.vectors
            .upsert_points(&collection_name(&doc.library_id), &points)
            .await
            .context("vector upsert failed")?;

        Ok(chunks.len())
    }

    /// Semantic query across one or more libraries.
    ///
    /// The query is embedded once; libraries whose collection is missing or
    /// empty are logged and skipped, never an error. Merged results are
    /// sorted by score and cut to the global top-k, then any chunk whose
    /// parent document no longer exists is dropped (orphaned vectors).
    pub async fn retrieve(&self, query: &str, opts: &RetrieveOptions) -> Result<RetrievalResult> {
        let top_k = opts.top_k.unwrap_or(self.settings.default_top_k);
        let min_score = opts.min_score.unwrap_or(self.settings.default_min_score);

        let query_vector = self
            .embedder
            .embed_batch(&[query.to_string()])
            .await
            .context("query embedding failed")?
            .pop()
            .context("embedding provider returned no vector for query")?;

        let mut merged: Vec<(String, crate::vector::ScoredPoint)> = Vec::new();
        let mut searched_libraries = Vec::new();

        for library_id in &opts.library_ids {
            let collection = collection_name(library_id);
            match self.vectors.collection_info(&collection).await? {
                None => {
                    info!("retrieval: library {} has no collection, skipping", library_id);
                    continue;
                }
                Some(info) if info.points_count == 0 => {
                    info!("retrieval: library {} has no indexed points, skipping", library_id);
                    continue;
                }
                Some(_) => {}
            }

            let hits = self
                .vectors
                .search(
                    &collection,
                    &query_vector,
                    &SearchParams {
                        limit: top_k,
                        filter: None,
                        score_threshold: Some(min_score),
                    },
                )
                .await?;
            searched_libraries.push(library_id.clone());
            merged.extend(hits.into_iter().map(|h| (library_id.clone(), h)));
        }

        merged.sort_by(|a, b| b.1.score.partial_cmp(&a.1.score).unwrap_or(std::cmp::Ordering::Equal));
        merged.truncate(top_k);

        // Orphan filtering: resolve parent documents in one batch and drop
        // results whose document row is gone
        let mut doc_ids: Vec<String> = merged
            .iter()
            .filter_map(|(_, h)| h.payload.get("document_id").and_then(|v| v.as_str()))
            .map(str::to_string)
            .collect();
        doc_ids.sort();
        doc_ids.dedup();
        let documents = self.documents.get_documents_by_ids(&doc_ids).await?;

        let mut chunks = Vec::new();
        for (library_id, hit) in merged {
            let Some(document_id) = hit.payload.get("document_id").and_then(|v| v.as_str()) else {
                debug!("retrieval: dropping point {} without document_id payload", hit.id);
                continue;
            };
            let Some(doc) = documents.get(document_id) else {
                debug!(
                    "retrieval: dropping orphaned vector {} (document {} deleted)",
                    hit.id, document_id
                );
                continue;
            };

            let text = hit
                .payload
                .get("content")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string();
            let metadata = hit.payload.get("metadata").cloned().unwrap_or(json!({}));

            chunks.push(RetrievedChunk {
                id: hit.id,
                text,
                score: hit.score,
                document: DocumentRef {
                    id: doc.id.clone(),
                    file_name: doc.title.clone(),
                    source_type: doc.source_type.clone(),
                    library_id: library_id.clone(),
                    folder_id: doc.folder_id.clone(),
                },
                metadata,
            });
        }

        Ok(RetrievalResult {
            query: query.to_string(),
            total_results: chunks.len(),
            chunks,
            searched_libraries,
        })
    }

    /// Concatenate chunk texts under a rough token budget (4 chars ≈ 1
    /// token), truncating the last chunk rather than overflowing.
    pub fn generate_context(
        &self,
        chunks: &[RetrievedChunk],
        max_tokens: Option<usize>,
        separator: &str,
    ) -> String {
        let budget_chars = max_tokens.unwrap_or(self.settings.max_context_tokens) * 4;
        let mut out = String::new();

        for chunk in chunks {
            let remaining = budget_chars.saturating_sub(out.chars().count());
            if remaining == 0 {
                break;
            }
            if !out.is_empty() {
                out.push_str(separator);
            }
            if chunk.text.chars().count() <= remaining {
                out.push_str(&chunk.text);
            } else {
                let truncated: String = chunk.text.chars().take(remaining).collect();
                out.push_str(&truncated);
                break;
            }
        }
        out
    }

    /// Remove a document everywhere: its vectors first, then its row.
    pub async fn delete_document(&self, library_id: &str, document_id: &str) -> Result<bool> {
        self.vectors
            .delete_by_filter(
                &collection_name(library_id),
                json!({
                    "must": [{ "key": "document_id", "match": { "value": document_id } }]
                }),
            )
            .await?;
        self.documents.delete_document(document_id).await
    }

    /// Drop a library's entire vector collection.
    pub async fn delete_library_index(&self, library_id: &str) -> Result<()> {
        self.vectors
            .delete_collection(&collection_name(library_id))
            .await
    }

    /// Point count and dimension for a library's collection, if indexed.
    pub async fn library_index_info(
        &self,
        library_id: &str,
    ) -> Result<Option<crate::vector::CollectionInfo>> {
        self.vectors.collection_info(&collection_name(library_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_with_text(text: &str) -> RetrievedChunk {
        RetrievedChunk {
            id: "c1".to_string(),
            text: text.to_string(),
            score: 0.9,
            document: DocumentRef {
                id: "d1".to_string(),
                file_name: "t".to_string(),
                source_type: "newsletter".to_string(),
                library_id: "L1".to_string(),
                folder_id: None,
            },
            metadata: json!({}),
        }
    }

    fn service_for_context_tests() -> RetrievalService {
        // generate_context is pure; collaborators are never called
        struct NoopLlm;
        #[async_trait::async_trait]
        impl crate::llm::LlmProvider for NoopLlm {
            async fn generate(
                &self,
                _request: crate::llm::LlmRequest,
            ) -> Result<crate::llm::LlmResponse> {
                anyhow::bail!("not used")
            }
            async fn summarize(
                &self,
                _content: &str,
                _context: &crate::llm::SummaryContext,
            ) -> Result<crate::llm::ContentSummary> {
                anyhow::bail!("not used")
            }
            async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
                anyhow::bail!("not used")
            }
        }

        let pool_future = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect_lazy("sqlite::memory:")
            .expect("lazy pool");
        RetrievalService::new(
            Arc::new(VectorStore::new("http://localhost:6333", None)),
            Arc::new(DocumentStore::new(pool_future)),
            Arc::new(NoopLlm),
            RetrievalSettings::default(),
        )
    }

    #[tokio::test]
    async fn context_respects_token_budget() {
        let service = service_for_context_tests();
        let chunks = vec![
            chunk_with_text(&"a".repeat(300)),
            chunk_with_text(&"b".repeat(300)),
            chunk_with_text(&"c".repeat(300)),
        ];
        // 100 tokens ~= 400 chars: first chunk fits, second is truncated
        let context = service.generate_context(&chunks, Some(100), "\n---\n");
        assert!(context.chars().count() <= 400 + 5);
        assert!(context.contains("---"));
        assert!(!context.contains('c'));
    }

    #[tokio::test]
    async fn context_joins_with_separator_when_under_budget() {
        let service = service_for_context_tests();
        let chunks = vec![chunk_with_text("first"), chunk_with_text("second")];
        let context = service.generate_context(&chunks, Some(100), " | ");
        assert_eq!(context, "first | second");
    }

    #[test]
    fn collection_names_are_stable() {
        assert_eq!(collection_name("abc"), "library_abc");
    }
}
