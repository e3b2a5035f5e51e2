/*
librarium - single-binary CLI around the ingestion/retrieval engine.
The composition root lives here: every service instance (scraper, source
reputation, providers, vector store, orchestrators) is constructed
explicitly and injected; nothing is a shared global.
*/

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use common::{Config, LlmConfig, RemoteLlmConfig};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

use librarium::chunking::{ChunkOptions, ChunkStrategy};
use librarium::ingestion::email::{EmailIngestor, EmailSettings};
use librarium::ingestion::newsletter::{NewsletterIngestor, NewsletterSettings};
use librarium::ingestion::{
    IngestNotifier, IngestionEvent, InboundMessage, LibraryMatch, LibraryMatcher, LibraryRef,
    MatchOptions,
};
use librarium::llm::remote::RemoteLlmProvider;
use librarium::llm::LlmProvider;
use librarium::processing::{ContentProcessor, ProcessorSettings};
use librarium::reliability::SourceReputation;
use librarium::retrieval::{RetrievalService, RetrievalSettings, RetrieveOptions};
use librarium::scraping::{Scraper, ScraperSettings};
use librarium::storage::DocumentStore;
use librarium::vector::VectorStore;

#[derive(Parser, Debug)]
#[command(name = "librarium", about = "Knowledge ingestion and retrieval engine")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create the database schema
    InitDb,
    /// Ingest a newsletter/broadcast message (JSON file, or stdin with -)
    Ingest {
        /// Message JSON: {user_id, content, sender?, subject?}
        #[arg(value_name = "FILE")]
        file: PathBuf,
        /// Target library id (stands in for the platform's library matcher)
        #[arg(long)]
        library: String,
    },
    /// Ingest an email message (JSON file with optional attachments)
    IngestEmail {
        #[arg(value_name = "FILE")]
        file: PathBuf,
        #[arg(long)]
        library: String,
    },
    /// Run a semantic query across libraries
    Retrieve {
        query: String,
        /// Comma-separated library ids
        #[arg(long, value_delimiter = ',')]
        libraries: Vec<String>,
        #[arg(long)]
        top_k: Option<usize>,
        #[arg(long)]
        min_score: Option<f32>,
    },
    /// Show index stats for a library
    Stats { library_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Layered config: defaults file merged with an override file
    let default_path = PathBuf::from("config.default.toml");
    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() {
            Some(p)
        } else {
            None
        }
    };
    let config = Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    .context("failed to load configuration")?;
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    let pool = common::init_db_pool(&config.database.path).await?;
    let documents = Arc::new(DocumentStore::new(pool));
    documents.ensure_schema().await?;

    if matches!(args.command, Command::InitDb) {
        info!("database initialized at {}", config.database.path);
        return Ok(());
    }

    // Composition root: build every service once, injected by Arc
    let engine = build_engine(&config, documents)?;

    match args.command {
        Command::InitDb => unreachable!("handled above"),
        Command::Ingest { file, library } => {
            let message = read_message(&file).await?;
            let ingestor = NewsletterIngestor::new(
                engine.processor.clone(),
                engine.retrieval.clone(),
                engine.scraper.clone(),
                Arc::new(FixedLibraryMatcher::new(library)),
                Some(Arc::new(LogNotifier)),
                NewsletterSettings {
                    duplicate_window_hours: config
                        .ingestion
                        .as_ref()
                        .and_then(|i| i.newsletter_duplicate_window_hours)
                        .unwrap_or(24),
                    match_threshold: config
                        .processing
                        .as_ref()
                        .and_then(|p| p.match_threshold)
                        .unwrap_or(0.60),
                    url_match_threshold: config
                        .processing
                        .as_ref()
                        .and_then(|p| p.url_match_threshold)
                        .unwrap_or(0.45),
                },
            );
            let outcome = ingestor.ingest(&message).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::IngestEmail { file, library } => {
            let message = read_message(&file).await?;
            let ingestor = EmailIngestor::new(
                engine.processor.clone(),
                engine.retrieval.clone(),
                engine.scraper.clone(),
                Arc::new(FixedLibraryMatcher::new(library)),
                Some(Arc::new(LogNotifier)),
                None,
                EmailSettings {
                    duplicate_window_hours: config
                        .ingestion
                        .as_ref()
                        .and_then(|i| i.email_duplicate_window_hours)
                        .unwrap_or(48),
                    match_threshold: config
                        .processing
                        .as_ref()
                        .and_then(|p| p.match_threshold)
                        .unwrap_or(0.60),
                    url_match_threshold: config
                        .processing
                        .as_ref()
                        .and_then(|p| p.url_match_threshold)
                        .unwrap_or(0.45),
                    max_attachment_bytes: config
                        .ingestion
                        .as_ref()
                        .and_then(|i| i.max_attachment_bytes)
                        .unwrap_or(2 * 1024 * 1024),
                },
            );
            let outcome = ingestor.ingest(&message).await;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
        Command::Retrieve {
            query,
            libraries,
            top_k,
            min_score,
        } => {
            let result = engine
                .retrieval
                .retrieve(
                    &query,
                    &RetrieveOptions {
                        library_ids: libraries,
                        top_k,
                        min_score,
                        user_id: None,
                    },
                )
                .await?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
        Command::Stats { library_id } => {
            let info = engine.retrieval.library_index_info(&library_id).await?;
            let documents = engine.retrieval.document_store().count_documents(&library_id).await?;
            match info {
                Some(info) => println!(
                    "library {}: {} documents, {} indexed points (dim {})",
                    library_id, documents, info.points_count, info.dimension
                ),
                None => println!("library {}: {} documents, no vector collection", library_id, documents),
            }
        }
    }

    Ok(())
}

/// Everything downstream of config + database, wired once.
struct Engine {
    scraper: Arc<Scraper>,
    processor: Arc<ContentProcessor>,
    retrieval: Arc<RetrievalService>,
}

fn build_engine(config: &Config, documents: Arc<DocumentStore>) -> Result<Engine> {
    let scraper = Arc::new(Scraper::new(ScraperSettings::from_config(
        config.scraper.as_ref(),
    ))?);
    let reputation = Arc::new(SourceReputation::new());

    let summarizer: Option<Arc<dyn LlmProvider>> = match &config.llm {
        Some(llm) => match create_llm_provider(llm, LlmTask::Summarization) {
            Ok(provider) => Some(Arc::from(provider)),
            Err(e) => {
                // The extractive fallback covers summarization; embeddings
                // have no fallback and fail later if actually needed
                error!("failed to initialize summarization provider: {}", e);
                None
            }
        },
        None => None,
    };
    let embedder: Arc<dyn LlmProvider> = {
        let llm = config
            .llm
            .as_ref()
            .context("[llm] configuration is required for embeddings")?;
        Arc::from(create_llm_provider(llm, LlmTask::Embedding)?)
    };

    let processing_cfg = config.processing.as_ref();
    let processor = Arc::new(ContentProcessor::new(
        reputation,
        scraper.clone(),
        summarizer,
        ProcessorSettings {
            reliability_floor: processing_cfg
                .and_then(|p| p.reliability_floor)
                .unwrap_or(0.30),
            scrape_threshold: processing_cfg.and_then(|p| p.match_threshold).unwrap_or(0.70),
            ..Default::default()
        },
    ));

    let api_key = config
        .vector
        .api_key_env
        .as_deref()
        .and_then(|env| std::env::var(env).ok());
    let vectors = Arc::new(
        VectorStore::new(config.vector.url.clone(), api_key)
            .with_timeout(config.vector.timeout_seconds.unwrap_or(30)),
    );

    let chunking_cfg = config.chunking.as_ref();
    let retrieval_cfg = config.retrieval.as_ref();
    let retrieval = Arc::new(RetrievalService::new(
        vectors,
        documents,
        embedder,
        RetrievalSettings {
            chunk_options: ChunkOptions {
                strategy: chunking_cfg
                    .and_then(|c| c.strategy.as_deref())
                    .map(str::parse)
                    .transpose()?
                    .unwrap_or(ChunkStrategy::Paragraph),
                chunk_size: chunking_cfg.and_then(|c| c.chunk_size).unwrap_or(1000),
                overlap: chunking_cfg.and_then(|c| c.overlap).unwrap_or(100),
            },
            default_top_k: retrieval_cfg.and_then(|r| r.top_k).unwrap_or(5),
            default_min_score: retrieval_cfg.and_then(|r| r.min_score).unwrap_or(0.25),
            max_context_tokens: retrieval_cfg
                .and_then(|r| r.max_context_tokens)
                .unwrap_or(2000),
        },
    ));

    Ok(Engine {
        scraper,
        processor,
        retrieval,
    })
}

/// Which endpoint configuration a provider should be built from.
#[derive(Debug, Clone, Copy)]
enum LlmTask {
    Summarization,
    Embedding,
}

/// Create an LLM provider for a task from the layered llm config.
fn create_llm_provider(llm_config: &LlmConfig, task: LlmTask) -> Result<Box<dyn LlmProvider>> {
    let adapter = llm_config.adapter.as_deref().unwrap_or("none");
    match adapter {
        "remote" => {
            let endpoint_config: Option<&RemoteLlmConfig> = match task {
                LlmTask::Summarization => llm_config
                    .summarization
                    .as_ref()
                    .or(llm_config.remote.as_ref()),
                LlmTask::Embedding => llm_config.embedding.as_ref().or(llm_config.remote.as_ref()),
            };
            let remote_config = endpoint_config
                .with_context(|| format!("no llm config found for task {:?}", task))?;

            let api_key_env = remote_config
                .api_key_env
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("Missing api_key_env in remote llm config"))?;
            let api_key = std::env::var(api_key_env)
                .with_context(|| format!("LLM API key env var '{}' not set", api_key_env))?;

            let model = remote_config
                .model
                .clone()
                .unwrap_or_else(|| "gpt-4o-mini".to_string());
            let api_url = remote_config
                .api_url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434/v1/chat/completions".to_string());

            let provider = RemoteLlmProvider::new(api_url, api_key, model).with_defaults(
                remote_config.timeout_seconds.unwrap_or(30),
                remote_config.max_tokens.unwrap_or(800),
            );
            Ok(Box::new(provider))
        }
        "none" => anyhow::bail!("llm adapter 'none' cannot serve task {:?}", task),
        other => anyhow::bail!("Unknown LLM adapter type: {}", other),
    }
}

async fn read_message(path: &PathBuf) -> Result<InboundMessage> {
    let raw = if path.as_os_str() == "-" {
        use tokio::io::AsyncReadExt;
        let mut buf = String::new();
        tokio::io::stdin().read_to_string(&mut buf).await?;
        buf
    } else {
        tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read message file: {}", path.display()))?
    };
    serde_json::from_str(&raw).context("failed to parse message JSON")
}

/// CLI stand-in for the platform's library matcher: every message goes to
/// the library named on the command line, with full confidence.
struct FixedLibraryMatcher {
    library_id: String,
}

impl FixedLibraryMatcher {
    fn new(library_id: String) -> Self {
        Self { library_id }
    }
}

#[async_trait]
impl LibraryMatcher for FixedLibraryMatcher {
    async fn match_library(
        &self,
        _content: &str,
        _user_id: &str,
        _options: &MatchOptions,
    ) -> Result<LibraryMatch> {
        Ok(LibraryMatch {
            matched: true,
            library: Some(LibraryRef {
                id: self.library_id.clone(),
                name: self.library_id.clone(),
                description: None,
            }),
            score: 1.0,
            reason: Some("fixed target library".to_string()),
        })
    }
}

/// Notification collaborator that just logs; the platform wires a real
/// realtime channel here.
struct LogNotifier;

#[async_trait]
impl IngestNotifier for LogNotifier {
    async fn notify_ingested(&self, event: IngestionEvent) {
        info!(
            "ingested document {} into library {} for user {}: {}",
            event.document_id, event.library_id, event.user_id, event.summary
        );
    }
}
