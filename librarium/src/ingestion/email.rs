use std::sync::Arc;
use tracing::{info, warn};

use super::{
    enrich_from_url, AttachmentParser, DuplicateCache, IngestNotifier, IngestOutcome,
    IngestionEvent, InboundMessage, LibraryMatcher, MatchOptions,
};
use crate::processing::ContentProcessor;
use crate::reliability::{ChannelKind, SourceIdentity};
use crate::retrieval::RetrievalService;
use crate::scraping::Scraper;
use crate::storage::{IngestionOrigin, IngestionRecord, NewDocument};

/// Sender domains that exist to send bulk mail. A bulk sender alone is not
/// spam (legitimate newsletters use them); combined with promotional
/// subject words it is.
const BULK_SENDER_DOMAINS: &[&str] = &[
    "mailchimp.com",
    "mailchi.mp",
    "sendgrid.net",
    "constantcontact.com",
    "campaign-archive.com",
    "substackcdn.com",
    "mailjet.com",
    "sendinblue.com",
];

const PROMO_SUBJECT_WORDS: &[&str] = &[
    "% off",
    "sale",
    "discount",
    "free shipping",
    "limited time",
    "act now",
    "buy now",
    "last chance",
    "winner",
    "exclusive offer",
    "deal of",
];

#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub duplicate_window_hours: i64,
    pub match_threshold: f64,
    /// Lower threshold once the body was enriched with a scraped article
    pub url_match_threshold: f64,
    pub max_attachment_bytes: usize,
}

impl Default for EmailSettings {
    fn default() -> Self {
        Self {
            duplicate_window_hours: 48,
            match_threshold: 0.60,
            url_match_threshold: 0.45,
            max_attachment_bytes: 2 * 1024 * 1024,
        }
    }
}

/// Email ingestion orchestrator. Same pipeline as newsletter ingestion plus
/// spam/marketing filtering and attachment text extraction.
pub struct EmailIngestor {
    processor: Arc<ContentProcessor>,
    retrieval: Arc<RetrievalService>,
    scraper: Arc<Scraper>,
    matcher: Arc<dyn LibraryMatcher>,
    notifier: Option<Arc<dyn IngestNotifier>>,
    attachment_parser: Option<Arc<dyn AttachmentParser>>,
    duplicates: DuplicateCache,
    settings: EmailSettings,
}

impl EmailIngestor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        processor: Arc<ContentProcessor>,
        retrieval: Arc<RetrievalService>,
        scraper: Arc<Scraper>,
        matcher: Arc<dyn LibraryMatcher>,
        notifier: Option<Arc<dyn IngestNotifier>>,
        attachment_parser: Option<Arc<dyn AttachmentParser>>,
        settings: EmailSettings,
    ) -> Self {
        let duplicates = DuplicateCache::new(settings.duplicate_window_hours);
        Self {
            processor,
            retrieval,
            scraper,
            matcher,
            notifier,
            attachment_parser,
            duplicates,
            settings,
        }
    }

    pub async fn ingest(&self, message: &InboundMessage) -> IngestOutcome {
        // 1. Required fields
        if message.content.trim().is_empty() && message.attachments.is_empty() {
            return IngestOutcome::Failed {
                error: "missing required field: content".to_string(),
            };
        }
        if message.user_id.trim().is_empty() {
            return IngestOutcome::Failed {
                error: "missing required field: user_id".to_string(),
            };
        }

        // 2. Spam / marketing detection is a hard skip
        if let Some(reason) = spam_reason(message.sender.as_deref(), message.subject.as_deref()) {
            info!("email: skipping spam from {:?}: {}", message.sender, reason);
            return IngestOutcome::SkippedSpam { reason };
        }

        // 3. Email bodies are always treated as enrichable: any linked
        //    article gets scraped regardless of URL-primary proportions
        let enrichment = enrich_from_url(&self.scraper, &message.content).await;
        let enriched = enrichment.is_some();
        let working_content = enrichment
            .as_ref()
            .map(|e| e.text.clone())
            .unwrap_or_else(|| message.content.clone());

        // 4. Duplicate check on the original body
        if let Some(entry) = self.duplicates.check(&message.user_id, &message.content) {
            info!(
                "email: duplicate content for user {}, original document {}",
                message.user_id, entry.document_id
            );
            return IngestOutcome::SkippedDuplicate {
                original_document_id: entry.document_id,
            };
        }

        // 5. Library matching
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
                    source: Some("email".to_string()),
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
                return IngestOutcome::SkippedNoLibraryMatch {
                    best_score: library_match.score,
                }
            }
        };

        // 6. Content processing
        let sender_domain = message
            .sender
            .as_deref()
            .and_then(|s| s.rsplit('@').next())
            .map(|d| d.to_lowercase());
        let identity = SourceIdentity {
            domain: enrichment
                .as_ref()
                .map(|e| e.domain.clone())
                .or(sender_domain),
            channel: Some(ChannelKind::Direct),
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

        // 7. Attachment text, appended under its own section
        let attachment_section = self.extract_attachments(message).await;

        let title = if processed.title.is_empty() {
            message
                .subject
                .clone()
                .unwrap_or_else(|| "Untitled email".to_string())
        } else {
            processed.title.clone()
        };
        let mut document_content = if processed.summary.is_empty() {
            processed.content.clone()
        } else {
            format!("{}\n\n{}", processed.summary, processed.content)
        };
        if let Some(section) = attachment_section {
            document_content.push_str("\n\nAttachments:\n");
            document_content.push_str(&section);
        }

        // 8. Persist, index, audit, notify
        let doc = NewDocument {
            library_id: library.id.clone(),
            folder_id: None,
            title: title.clone(),
            content: document_content,
            source_type: "email".to_string(),
            source_url: enrichment.as_ref().map(|e| e.url.clone()),
            metadata: processed.metadata.clone(),
        };

        let report = match self.retrieval.ingest_document(doc).await {
            Ok(report) => report,
            Err(e) => {
                warn!("email: ingestion failed for user {}: {}", message.user_id, e);
                return IngestOutcome::Failed {
                    error: e.to_string(),
                };
            }
        };

        self.retrieval
            .document_store()
            .record_ingestion(&IngestionRecord {
                origin: IngestionOrigin::Email,
                user_id: message.user_id.clone(),
                library_id: library.id.clone(),
                document_id: report.document_id.clone(),
                source: message.sender.clone().unwrap_or_default(),
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
                summary: message.subject.clone().unwrap_or(title),
            };
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

    /// Sequential batch ingestion; per-item failures are isolated.
    pub async fn ingest_batch(&self, messages: &[InboundMessage]) -> Vec<IngestOutcome> {
        let mut outcomes = Vec::with_capacity(messages.len());
        for message in messages {
            outcomes.push(self.ingest(message).await);
        }
        outcomes
    }

    /// Extract text from supported attachments within the size cap:
    /// txt/md/csv are read directly, binary document formats go through the
    /// external parser collaborator when one is configured.
    async fn extract_attachments(&self, message: &InboundMessage) -> Option<String> {
        if message.attachments.is_empty() {
            return None;
        }
        let mut sections = Vec::new();

        for attachment in &message.attachments {
            if attachment.data.len() > self.settings.max_attachment_bytes {
                warn!(
                    "email: skipping oversized attachment {} ({} bytes)",
                    attachment.file_name,
                    attachment.data.len()
                );
                continue;
            }
            let extension = attachment
                .file_name
                .rsplit('.')
                .next()
                .unwrap_or_default()
                .to_lowercase();

            let text = match extension.as_str() {
                "txt" | "md" | "csv" => {
                    Some(String::from_utf8_lossy(&attachment.data).into_owned())
                }
                "pdf" | "doc" | "docx" => match &self.attachment_parser {
                    Some(parser) if parser.supports(&extension) => {
                        match parser
                            .extract_text(&attachment.file_name, &attachment.data)
                            .await
                        {
                            Ok(text) => Some(text),
                            Err(e) => {
                                warn!(
                                    "email: attachment parser failed for {}: {}",
                                    attachment.file_name, e
                                );
                                None
                            }
                        }
                    }
                    _ => {
                        info!(
                            "email: no parser for attachment {}, skipping",
                            attachment.file_name
                        );
                        None
                    }
                },
                _ => None,
            };

            if let Some(text) = text {
                let trimmed = text.trim();
                if !trimmed.is_empty() {
                    sections.push(format!("### {}\n{}", attachment.file_name, trimmed));
                }
            }
        }

        if sections.is_empty() {
            None
        } else {
            Some(sections.join("\n\n"))
        }
    }
}

/// Spam heuristic: a bulk-sender domain combined with a promotional
/// subject line. Either alone passes.
fn spam_reason(sender: Option<&str>, subject: Option<&str>) -> Option<String> {
    let sender = sender?.to_lowercase();
    let subject = subject.unwrap_or_default().to_lowercase();

    let bulk = BULK_SENDER_DOMAINS.iter().find(|d| sender.contains(*d))?;
    let promo = PROMO_SUBJECT_WORDS.iter().find(|w| subject.contains(*w))?;

    Some(format!(
        "bulk sender '{}' with promotional subject ('{}')",
        bulk, promo
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spam_requires_both_signals() {
        // Bulk sender + promo subject: spam
        assert!(spam_reason(
            Some("blast@em1234.mailchimp.com"),
            Some("Last chance: 50% off everything")
        )
        .is_some());
        // Bulk sender, editorial subject: not spam
        assert!(spam_reason(
            Some("updates@em1234.mailchimp.com"),
            Some("This week in city council")
        )
        .is_none());
        // Normal sender, promo subject: not spam
        assert!(spam_reason(Some("friend@example.com"), Some("huge sale at the bakery")).is_none());
        // No sender at all
        assert!(spam_reason(None, Some("sale")).is_none());
    }
}
