/*!
common/src/lib.rs

Shared configuration types and DB helper functions for Librarium.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader with default/override file merging
- Helpers to initialize the SQLite metadata database
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// Database configuration section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the sqlite database file (e.g. "data/librarium.db")
    pub path: String,
}

/// Vector database (Qdrant-compatible HTTP API) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VectorConfig {
    /// Base URL of the vector database, e.g. "http://localhost:6333"
    pub url: String,
    /// Env var holding the API key, if the deployment requires one
    pub api_key_env: Option<String>,
    /// Request timeout for vector store calls
    pub timeout_seconds: Option<u64>,
}

/// Remote LLM endpoint config (OpenAI-compatible chat/embeddings API)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
}

/// LLM top-level config grouping task-specific endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub adapter: Option<String>, // "remote", "none"
    // Fallback: single remote config used for every task
    pub remote: Option<RemoteLlmConfig>,
    // Task-specific overrides
    pub summarization: Option<RemoteLlmConfig>,
    pub embedding: Option<RemoteLlmConfig>,
}

/// Scraper / fetching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScraperConfig {
    pub fetch_timeout_seconds: Option<u64>,
    pub max_response_bytes: Option<u64>,
    /// Minimum extracted text length before fallback extractors run
    pub min_article_chars: Option<usize>,
    pub rate_limit_per_minute: Option<u32>,
    pub cache_ttl_seconds: Option<u64>,
    pub cache_capacity: Option<usize>,
    pub user_agent: Option<String>,
}

/// Content processing thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessingConfig {
    /// Content below this reliability score is skipped
    pub reliability_floor: Option<f64>,
    /// Library match score required for ingestion
    pub match_threshold: Option<f64>,
    /// Lower match threshold applied to URL-primary (enriched) content
    pub url_match_threshold: Option<f64>,
    pub summary_max_tokens: Option<usize>,
}

/// Chunking defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkingConfig {
    /// "fixed", "sentence", "paragraph" or "semantic"
    pub strategy: Option<String>,
    pub chunk_size: Option<usize>,
    pub overlap: Option<usize>,
}

/// Retrieval defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalConfig {
    pub top_k: Option<usize>,
    pub min_score: Option<f32>,
    pub max_context_tokens: Option<usize>,
}

/// Ingestion orchestrator settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestionConfig {
    pub newsletter_duplicate_window_hours: Option<i64>,
    pub email_duplicate_window_hours: Option<i64>,
    pub max_attachment_bytes: Option<usize>,
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub database: DatabaseConfig,
    pub vector: VectorConfig,
    pub llm: Option<LlmConfig>,
    pub scraper: Option<ScraperConfig>,
    pub processing: Option<ProcessingConfig>,
    pub chunking: Option<ChunkingConfig>,
    pub retrieval: Option<RetrievalConfig>,
    pub ingestion: Option<IngestionConfig>,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        if let Some(path) = default_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path).await
                    .with_context(|| format!("Failed to read default config: {}", path.display()))?;
                let val: toml::Value = toml::from_str(&data)
                    .context("Failed to parse default configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        if let Some(path) = override_path {
            if path.exists() {
                let data = tokio::fs::read_to_string(path).await
                    .with_context(|| format!("Failed to read override config: {}", path.display()))?;
                let val: toml::Value = toml::from_str(&data)
                    .context("Failed to parse override configuration")?;
                merge_toml(&mut config_value, val);
            }
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

/// Initialize an SQLite connection pool.
///
/// This function will create the parent directory if necessary, ensure the DB file exists
/// (attempting to create it if missing), and return a configured `SqlitePool`. Defaults are
/// conservative for resource-constrained deployments:
/// - max_connections: 5
/// - connection timeout default provided by `sqlx`
///
/// Example:
///   let pool = init_db_pool("data/librarium.db").await?;
pub async fn init_db_pool(path: &str) -> Result<SqlitePool> {
    // Ensure parent directory exists
    if let Some(parent) = Path::new(path).parent() {
        tokio::fs::create_dir_all(parent).await.with_context(|| {
            format!("Failed to create DB parent directory: {}", parent.display())
        })?;
    }

    // Try to create the DB file if it does not already exist. This gives a clearer error
    // earlier (filesystem permission or path issues) instead of only surfacing it via the
    // SQLite connection attempt.
    tokio::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(path)
        .await
        .with_context(|| format!("Failed to create or open DB file: {}", path))?;

    let options = SqliteConnectOptions::from_str(&format!("sqlite://{}", path))?
        .create_if_missing(true)
        .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("Failed to connect to sqlite database at path: {}", path))?;

    Ok(pool)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::SystemTime;

    #[tokio::test]
    async fn config_from_string_and_db_pool() {
        // Minimal TOML to test parsing and the Option-heavy sections
        let toml = r#"
            [database]
            path = "data/test.db"

            [vector]
            url = "http://localhost:6333"

            [processing]
            reliability_floor = 0.3
            match_threshold = 0.7

            [chunking]
            strategy = "paragraph"
            chunk_size = 1000
            overlap = 100
        "#;

        let cfg: Config = toml::from_str(toml).expect("parse config");
        assert_eq!(cfg.vector.url, "http://localhost:6333");
        assert_eq!(cfg.processing.as_ref().unwrap().reliability_floor, Some(0.3));
        assert_eq!(cfg.chunking.as_ref().unwrap().strategy.as_deref(), Some("paragraph"));
        assert!(cfg.llm.is_none());

        // Test DB pool initialization in a temporary directory under the OS temp dir
        let now = SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time")
            .as_millis();
        let dir = std::env::temp_dir().join(format!("librarium_test_{}", now));
        let _ = fs::create_dir_all(&dir);
        let db_path = dir.join("librarium.db");
        let db_path_str = db_path.to_string_lossy().to_string();

        let pool = init_db_pool(&db_path_str).await.expect("init pool");
        // Simple sanity: acquire a connection
        let conn = pool.acquire().await.expect("acquire conn");
        drop(conn);
    }

    #[tokio::test]
    async fn override_config_takes_precedence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");

        fs::write(
            &default_path,
            r#"
            [database]
            path = "data/default.db"

            [vector]
            url = "http://localhost:6333"

            [retrieval]
            top_k = 5
            "#,
        )
        .expect("write default");

        fs::write(
            &override_path,
            r#"
            [database]
            path = "data/override.db"
            "#,
        )
        .expect("write override");

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("load merged config");

        // Override wins where present, default fills the rest
        assert_eq!(cfg.database.path, "data/override.db");
        assert_eq!(cfg.vector.url, "http://localhost:6333");
        assert_eq!(cfg.retrieval.as_ref().unwrap().top_k, Some(5));
    }
}
