use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Upsert batches are capped to bound single-request size.
const UPSERT_BATCH_SIZE: usize = 100;

/// A point ready for upsert. `id` must be a UUID (the vector database
/// rejects arbitrary composite strings as point ids).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorPoint {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: serde_json::Value,
}

/// A search hit, in the database's native ranking order.
#[derive(Debug, Clone, Deserialize)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    #[serde(default)]
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Copy)]
pub struct CollectionInfo {
    pub points_count: u64,
    pub dimension: usize,
}

#[derive(Debug, Clone, Default)]
pub struct SearchParams {
    pub limit: usize,
    pub filter: Option<serde_json::Value>,
    pub score_threshold: Option<f32>,
}

/// Thin lifecycle/CRUD client for a Qdrant-compatible vector database.
///
/// Collections are named per library; all vectors use cosine distance.
pub struct VectorStore {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
    timeout: Duration,
}

impl VectorStore {
    pub fn new(base_url: impl Into<String>, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_key,
            client: reqwest::Client::new(),
            timeout: Duration::from_secs(30),
        }
    }

    pub fn with_timeout(mut self, timeout_secs: u64) -> Self {
        self.timeout = Duration::from_secs(timeout_secs);
        self
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), path);
        let mut builder = self.client.request(method, url).timeout(self.timeout);
        if let Some(key) = &self.api_key {
            builder = builder.header("api-key", key);
        }
        builder
    }

    /// Point count and configured dimension, or None if the collection
    /// does not exist.
    pub async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let response = self
            .request(reqwest::Method::GET, &format!("/collections/{}", name))
            .send()
            .await
            .context("vector store: collection info request failed")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("vector store: collection info error {}: {}", status, body);
        }

        let body: CollectionInfoResponse = response
            .json()
            .await
            .context("vector store: failed to parse collection info")?;

        Ok(Some(CollectionInfo {
            points_count: body.result.points_count.unwrap_or(0),
            dimension: body.result.config.params.vectors.size,
        }))
    }

    /// Idempotent create. A collection that exists with a different vector
    /// dimension is deleted and recreated; every point it held is lost.
    pub async fn ensure_collection(&self, name: &str, dimension: usize) -> Result<()> {
        match self.collection_info(name).await? {
            Some(info) if info.dimension == dimension => {
                debug!("vector store: collection '{}' exists (dim {})", name, dimension);
                Ok(())
            }
            Some(info) => {
                warn!(
                    "vector store: collection '{}' has dimension {} but {} is required; \
                     deleting and recreating, ALL {} existing points will be lost",
                    name, info.dimension, dimension, info.points_count
                );
                self.delete_collection(name).await?;
                self.create_collection(name, dimension).await
            }
            None => self.create_collection(name, dimension).await,
        }
    }

    async fn create_collection(&self, name: &str, dimension: usize) -> Result<()> {
        let body = json!({
            "vectors": { "size": dimension, "distance": "Cosine" }
        });
        let response = self
            .request(reqwest::Method::PUT, &format!("/collections/{}", name))
            .json(&body)
            .send()
            .await
            .context("vector store: create collection request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("vector store: create collection error {}: {}", status, text);
        }
        info!("vector store: created collection '{}' (dim {})", name, dimension);
        Ok(())
    }

    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::DELETE, &format!("/collections/{}", name))
            .send()
            .await
            .context("vector store: delete collection request failed")?;

        // Deleting a missing collection is not an error
        if !response.status().is_success() && response.status() != reqwest::StatusCode::NOT_FOUND {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("vector store: delete collection error {}: {}", status, text);
        }
        Ok(())
    }

    /// Upsert points in batches of at most 100. If the collection does not
    /// exist (or exists with the wrong dimension), it is created with the
    /// dimension of the first point. Returns the number of points written.
    pub async fn upsert_points(&self, collection: &str, points: &[VectorPoint]) -> Result<usize> {
        let Some(first) = points.first() else {
            return Ok(0);
        };
        self.ensure_collection(collection, first.vector.len()).await?;

        for batch in points.chunks(UPSERT_BATCH_SIZE) {
            let body = json!({ "points": batch });
            let response = self
                .request(
                    reqwest::Method::PUT,
                    &format!("/collections/{}/points", collection),
                )
                .json(&body)
                .send()
                .await
                .context("vector store: upsert request failed")?;

            if !response.status().is_success() {
                let status = response.status();
                let text = response.text().await.unwrap_or_default();
                anyhow::bail!("vector store: upsert error {}: {}", status, text);
            }
        }

        debug!(
            "vector store: upserted {} points into '{}'",
            points.len(),
            collection
        );
        Ok(points.len())
    }

    /// Similarity search. A missing collection yields an empty result, not
    /// an error: callers treat "never indexed" the same as "no matches".
    pub async fn search(
        &self,
        collection: &str,
        vector: &[f32],
        params: &SearchParams,
    ) -> Result<Vec<ScoredPoint>> {
        let mut body = json!({
            "vector": vector,
            "limit": params.limit,
            "with_payload": true,
        });
        if let Some(filter) = &params.filter {
            body["filter"] = filter.clone();
        }
        if let Some(threshold) = params.score_threshold {
            body["score_threshold"] = json!(threshold);
        }

        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/search", collection),
            )
            .json(&body)
            .send()
            .await
            .context("vector store: search request failed")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            debug!("vector store: collection '{}' not found, returning empty", collection);
            return Ok(Vec::new());
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("vector store: search error {}: {}", status, text);
        }

        let body: SearchResponse = response
            .json()
            .await
            .context("vector store: failed to parse search response")?;
        Ok(body.result)
    }

    /// Delete specific points by id (document teardown).
    pub async fn delete_points(&self, collection: &str, ids: &[String]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        self.delete_request(collection, json!({ "points": ids })).await
    }

    /// Delete every point matching a payload filter (library teardown).
    pub async fn delete_by_filter(&self, collection: &str, filter: serde_json::Value) -> Result<()> {
        self.delete_request(collection, json!({ "filter": filter })).await
    }

    async fn delete_request(&self, collection: &str, body: serde_json::Value) -> Result<()> {
        let response = self
            .request(
                reqwest::Method::POST,
                &format!("/collections/{}/points/delete", collection),
            )
            .json(&body)
            .send()
            .await
            .context("vector store: delete points request failed")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(());
        }
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("vector store: delete points error {}: {}", status, text);
        }
        Ok(())
    }
}

// Wire format structures for the Qdrant-compatible REST API

#[derive(Debug, Deserialize)]
struct CollectionInfoResponse {
    result: CollectionInfoResult,
}

#[derive(Debug, Deserialize)]
struct CollectionInfoResult {
    #[serde(default)]
    points_count: Option<u64>,
    config: CollectionConfig,
}

#[derive(Debug, Deserialize)]
struct CollectionConfig {
    params: CollectionParams,
}

#[derive(Debug, Deserialize)]
struct CollectionParams {
    vectors: VectorParams,
}

#[derive(Debug, Deserialize)]
struct VectorParams {
    size: usize,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default)]
    result: Vec<ScoredPoint>,
}
