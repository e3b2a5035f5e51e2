use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tracing::{info, warn};

use crate::reliability::ChannelKind;
use crate::scraping::{first_url, ScrapedArticle, Scraper};

pub mod email;
pub mod newsletter;

/// Inbound message as delivered by a transport adapter (messaging platform
/// webhook, mail gateway). Validation happens in the orchestrators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub user_id: String,
    pub content: String,
    pub sender: Option<String>,
    pub subject: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub mime_type: Option<String>,
    #[serde(default)]
    pub data: Vec<u8>,
}

/// Terminal result of one ingestion attempt. Skips are first-class results,
/// not errors: the pipeline short-circuits on the first failing condition.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum IngestOutcome {
    Success {
        document_id: String,
        library_id: String,
        chunks_created: usize,
    },
    SkippedLowReliability {
        score: f64,
    },
    SkippedNoLibraryMatch {
        best_score: f64,
    },
    SkippedDuplicate {
        original_document_id: String,
    },
    SkippedSpam {
        reason: String,
    },
    Failed {
        error: String,
    },
}

impl IngestOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            IngestOutcome::Success { .. } => "success",
            IngestOutcome::SkippedLowReliability { .. } => "skipped_low_reliability",
            IngestOutcome::SkippedNoLibraryMatch { .. } => "skipped_no_library_match",
            IngestOutcome::SkippedDuplicate { .. } => "skipped_duplicate",
            IngestOutcome::SkippedSpam { .. } => "skipped_spam",
            IngestOutcome::Failed { .. } => "failed",
        }
    }
}

/// External library-matching collaborator, consumed through its contract.
#[derive(Debug, Clone, Deserialize)]
pub struct LibraryRef {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LibraryMatch {
    pub matched: bool,
    pub library: Option<LibraryRef>,
    pub score: f64,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MatchOptions {
    pub source: Option<String>,
    pub min_score: Option<f64>,
}

#[async_trait]
pub trait LibraryMatcher: Send + Sync {
    async fn match_library(
        &self,
        content: &str,
        user_id: &str,
        options: &MatchOptions,
    ) -> anyhow::Result<LibraryMatch>;
}

/// Fire-and-forget downstream notification on successful ingestion.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionEvent {
    pub user_id: String,
    pub library_id: String,
    pub document_id: String,
    pub summary: String,
}

#[async_trait]
pub trait IngestNotifier: Send + Sync {
    async fn notify_ingested(&self, event: IngestionEvent);
}

/// External parser for binary attachment formats (pdf/doc/docx).
#[async_trait]
pub trait AttachmentParser: Send + Sync {
    fn supports(&self, extension: &str) -> bool;
    async fn extract_text(&self, file_name: &str, data: &[u8]) -> anyhow::Result<String>;
}

#[derive(Debug, Clone)]
pub struct DuplicateEntry {
    pub document_id: String,
    pub seen_at: DateTime<Utc>,
}

/// Per-user content fingerprint cache for duplicate detection.
///
/// The fingerprint is approximate and non-cryptographic: the normalized
/// first 100 characters plus the word count. Entries older than the window
/// are evicted lazily on access. The cache is process-local; duplicates can
/// slip through across horizontally scaled instances.
pub struct DuplicateCache {
    window: Duration,
    entries: Mutex<HashMap<(String, String), DuplicateEntry>>,
}

impl DuplicateCache {
    pub fn new(window_hours: i64) -> Self {
        Self {
            window: Duration::hours(window_hours),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Normalized-prefix + word-count fingerprint.
    pub fn fingerprint(content: &str) -> String {
        let normalized: String = content
            .to_lowercase()
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ");
        let prefix: String = normalized.chars().take(100).collect();
        let word_count = normalized.split_whitespace().count();
        format!("{}|{}", prefix, word_count)
    }

    pub fn check(&self, user_id: &str, content: &str) -> Option<DuplicateEntry> {
        self.check_at(user_id, content, Utc::now())
    }

    fn check_at(&self, user_id: &str, content: &str, now: DateTime<Utc>) -> Option<DuplicateEntry> {
        let key = (user_id.to_string(), Self::fingerprint(content));
        let mut entries = self.entries.lock().ok()?;
        match entries.get(&key) {
            Some(entry) if now - entry.seen_at <= self.window => Some(entry.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Last-write-wins under concurrent ingestion for the same key; racing
    /// callers are an accepted duplicate risk, not corrected by locking.
    pub fn record(&self, user_id: &str, content: &str, document_id: &str) {
        let key = (user_id.to_string(), Self::fingerprint(content));
        if let Ok(mut entries) = self.entries.lock() {
            entries.insert(
                key,
                DuplicateEntry {
                    document_id: document_id.to_string(),
                    seen_at: Utc::now(),
                },
            );
        }
    }
}

/// Source subtype from the sender address pattern.
pub fn detect_channel(sender: Option<&str>) -> ChannelKind {
    let Some(sender) = sender else {
        return ChannelKind::Direct;
    };
    let lower = sender.to_lowercase();
    if lower.contains("newsletter") || lower.contains("digest") || lower.starts_with("news@") {
        ChannelKind::Newsletter
    } else if lower.contains("@broadcast") || lower.contains("broadcast") {
        ChannelKind::Broadcast
    } else if lower.ends_with("@g.us") || lower.contains("group") {
        ChannelKind::Group
    } else {
        ChannelKind::Direct
    }
}

/// Content string rebuilt around a scraped article. The enriched text is
/// what gets matched and processed; the original message is preserved by
/// the caller.
#[derive(Debug, Clone)]
pub struct EnrichedContent {
    pub text: String,
    pub url: String,
    pub domain: String,
    pub scraped_title: Option<String>,
}

/// Scrape the first URL in the content and build the enriched document
/// text: original context line, source attribution, description, full
/// article, source URL. Returns None when there is no URL or the scrape
/// fails (callers proceed with the original content).
pub async fn enrich_from_url(scraper: &Scraper, content: &str) -> Option<EnrichedContent> {
    let url = first_url(content)?;
    match scraper.scrape(&url).await {
        Ok(article) => Some(build_enriched(content, &url, article)),
        Err(e) => {
            warn!("ingestion: enrichment scrape failed for {}: {}", url, e);
            None
        }
    }
}

fn build_enriched(original: &str, url: &str, article: ScrapedArticle) -> EnrichedContent {
    let mut text = String::new();
    let context_line = original.trim();
    if !context_line.is_empty() {
        text.push_str(context_line);
        text.push_str("\n\n");
    }
    if let Some(title) = &article.title {
        text.push_str(&format!("Source: {} ({})\n\n", title, article.domain));
    } else {
        text.push_str(&format!("Source: {}\n\n", article.domain));
    }
    if let Some(description) = &article.description {
        text.push_str(description);
        text.push_str("\n\n");
    }
    text.push_str(&article.content);
    text.push_str(&format!("\n\nURL: {}", url));

    info!(
        "ingestion: enriched message with article from {} ({} chars)",
        article.domain,
        text.len()
    );
    EnrichedContent {
        text,
        url: url.to_string(),
        domain: article.domain,
        scraped_title: article.title,
    }
}
