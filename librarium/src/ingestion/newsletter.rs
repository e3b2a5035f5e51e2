use std::sync::Arc;
use tracing::{info, warn};

use super::{
    detect_channel, enrich_from_url, DuplicateCache, IngestNotifier, IngestOutcome,
    IngestionEvent, InboundMessage, LibraryMatcher, MatchOptions,
};
use crate::processing::ContentProcessor;
use crate::reliability::SourceIdentity;
use crate::retrieval::RetrievalService;
use crate::scraping::{is_url_primary, Scraper};
use crate::storage::{IngestionOrigin, IngestionRecord, NewDocument};

#[derive(Debug, Clone)]
pub struct NewsletterSettings {
    pub duplicate_window_hours: i64,
    /// Library match score required for plain content
    pub match_threshold: f64,
    /// Lower threshold for URL-primary content that was enriched: the
    /// scraped article carries enough signal even at lower similarity
    pub url_match_threshold: f64,
}

impl Default for NewsletterSettings {
    fn default() -> Self {
        Self {
            duplicate_window_hours: 24,
            match_threshold: 0.60,
            url_match_threshold: 0.45,
        }
    }
}

/// Newsletter/broadcast ingestion orchestrator: runs the full pipeline from
/// raw message to indexed document, short-circuiting on the first skip
/// condition.
pub struct NewsletterIngestor {
    processor: Arc<ContentProcessor>,
    retrieval: Arc<RetrievalService>,
    scraper: Arc<Scraper>,
    matcher: Arc<dyn LibraryMatcher>,
    notifier: Option<Arc<dyn IngestNotifier>>,
    duplicates: DuplicateCache,
    settings: NewsletterSettings,
}

impl NewsletterIngestor {
    pub fn new(
        processor: Arc<ContentProcessor>,
        retrieval: Arc<RetrievalService>,
        scraper: Arc<Scraper>,
        matcher: Arc<dyn LibraryMatcher>,
        notifier: Option<Arc<dyn IngestNotifier>>,
        settings: NewsletterSettings,
    ) -> Self {
        let duplicates = DuplicateCache::new(settings.duplicate_window_hours);
        Self {
            processor,
            retrieval,
            scraper,
            matcher,
            notifier,
            duplicates,
            settings,
        }
    }

    pub async fn ingest(&self, message: &InboundMessage) -> IngestOutcome {
        // 1. Required fields; input errors fail fast with no partial writes
        if message.content.trim().is_empty() {
            return IngestOutcome::Failed {
                error: "missing required field: content".to_string(),
            };
        }
        if message.user_id.trim().is_empty() {
            return IngestOutcome::Failed {
                error: "missing required field: user_id".to_string(),
            };
        }

        // 2. Source subtype from the sender address pattern
        let channel = detect_channel(message.sender.as_deref());

        // 3. URL-primary messages get auto-scraped into an enriched string;
        //    the original content is preserved for dedup and preview
        let enrichment = if is_url_primary(&message.content) {
            enrich_from_url(&self.scraper, &message.content).await
        } else {
            None
        };
        let enriched = enrichment.is_some();
        let working_content = enrichment
            .as_ref()
            .map(|e| e.text.clone())
            .unwrap_or_else(|| message.content.clone());

        // 4. Per-user duplicate check within the configured window
        if let Some(entry) = self.duplicates.check(&message.user_id, &message.content) {
            info!(
                "newsletter: duplicate content for user {}, original document {}",
                message.user_id, entry.document_id
            );
            return IngestOutcome::SkippedDuplicate {
                original_document_id: entry.document_id,
            };
        }

        // 5. Library matching, with the lower threshold after enrichment
        let threshold = if enriched {
            self.settings.url_match_threshold
        } else {
            self.settings.match_threshold
        };
        let library_match = match self
            .matcher
            .match_library(
                &working_content,
                &message.user_id,
                &MatchOptions {
                    source: Some("newsletter".to_string()),
                    min_score: Some(threshold),
                },
            )
            .await
        {
            Ok(m) => m,
            Err(e) => {
                return IngestOutcome::Failed {
                    error: format!("library matcher failed: {}", e),
                }
            }
        };
        let library = match &library_match.library {
            Some(library) if library_match.matched && library_match.score >= threshold => {
                library.clone()
            }
            _ => {
                info!(
                    "newsletter: no library match for user {} (best score {:.2})",
                    message.user_id, library_match.score
                );
                return IngestOutcome::SkippedNoLibraryMatch {
                    best_score: library_match.score,
                };
            }
        };

        // 6. Content processing (reliability gate, summarization)
        let identity = SourceIdentity {
            domain: enrichment.as_ref().map(|e| e.domain.clone()),
            channel: Some(channel),
            author: message.sender.clone(),
        };
        let processed = self
            .processor
            .process(&working_content, &identity, library_match.score, enriched)
            .await;
        if !processed.processed {
            return IngestOutcome::SkippedLowReliability {
                score: processed.reliability.score,
            };
        }

        // 7. Persist and index
        let title = if processed.title.is_empty() {
            message
                .subject
                .clone()
                .unwrap_or_else(|| "Untitled message".to_string())
        } else {
            processed.title.clone()
        };
        let document_content = if processed.summary.is_empty() {
            processed.content.clone()
        } else {
            format!("{}\n\n{}", processed.summary, processed.content)
        };
        let doc = NewDocument {
            library_id: library.id.clone(),
            folder_id: None,
            title: title.clone(),
            content: document_content,
            source_type: format!("newsletter_{}", channel.as_str()),
            source_url: enrichment.as_ref().map(|e| e.url.clone()),
            metadata: processed.metadata.clone(),
        };

        let report = match self.retrieval.ingest_document(doc).await {
            Ok(report) => report,
            Err(e) => {
                warn!("newsletter: ingestion failed for user {}: {}", message.user_id, e);
                return IngestOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        // 8. Audit, dedup record, downstream notification
        self.retrieval
            .document_store()
            .record_ingestion(&IngestionRecord {
                origin: IngestionOrigin::Newsletter,
                user_id: message.user_id.clone(),
                library_id: library.id.clone(),
                document_id: report.document_id.clone(),
                source: message
                    .sender
                    .clone()
                    .or_else(|| enrichment.as_ref().map(|e| e.domain.clone()))
                    .unwrap_or_default(),
                reliability_score: processed.reliability.score,
                match_score: library_match.score,
            })
            .await;

        self.duplicates
            .record(&message.user_id, &message.content, &report.document_id);

        if let Some(notifier) = &self.notifier {
            let notifier = notifier.clone();
            let event = IngestionEvent {
                user_id: message.user_id.clone(),
                library_id: library.id.clone(),
                document_id: report.document_id.clone(),
                summary: title.clone(),
            };
            // Fire-and-forget: notification failures never affect the result
            tokio::spawn(async move {
                notifier.notify_ingested(event).await;
            });
        }

        IngestOutcome::Success {
            document_id: report.document_id,
            library_id: library.id,
            chunks_created: report.chunks_created,
        }
    }

    /// Ingest a batch strictly sequentially: dedup ordering stays
    /// deterministic and one item's failure never aborts the rest.
    pub async fn ingest_batch(&self, messages: &[InboundMessage]) -> Vec<IngestOutcome> {
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            outcomes.push(self.ingest(message).await);
        }
        outcomes
    }
}
