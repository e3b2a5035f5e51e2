use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

use librarium::ingestion::email::{EmailIngestor, EmailSettings};
use librarium::ingestion::newsletter::{NewsletterIngestor, NewsletterSettings};
use librarium::ingestion::{
    Attachment, InboundMessage, IngestOutcome, LibraryMatch, LibraryMatcher, LibraryRef,
    MatchOptions,
};
use librarium::llm::{ContentSummary, LlmProvider, LlmRequest, LlmResponse, SummaryContext};
use librarium::processing::{ContentProcessor, ProcessorSettings};
use librarium::reliability::SourceReputation;
use librarium::retrieval::{RetrievalService, RetrievalSettings, RetrieveOptions};
use librarium::scraping::{Scraper, ScraperSettings};
use librarium::storage::{DocumentMeta, DocumentStore, DocumentStatus, NewDocument};
use librarium::vector::VectorStore;

/// Deterministic 3-dim embedder; no summarization or generation.
struct FakeEmbedder;

#[async_trait]
impl LlmProvider for FakeEmbedder {
    async fn generate(&self, _request: LlmRequest) -> Result<LlmResponse> {
        anyhow::bail!("not supported in tests")
    }
    async fn summarize(&self, _content: &str, _context: &SummaryContext) -> Result<ContentSummary> {
        anyhow::bail!("not supported in tests")
    }
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts
            .iter()
            .map(|t| {
                vec![
                    t.chars().count() as f32,
                    t.split_whitespace().count() as f32,
                    1.0,
                ]
            })
            .collect())
    }
}

/// Matcher collaborator with a fixed answer.
struct FakeMatcher {
    matched: bool,
    score: f64,
    library_id: &'static str,
}

#[async_trait]
impl LibraryMatcher for FakeMatcher {
    async fn match_library(
        &self,
        _content: &str,
        _user_id: &str,
        _options: &MatchOptions,
    ) -> Result<LibraryMatch> {
        Ok(LibraryMatch {
            matched: self.matched,
            library: self.matched.then(|| LibraryRef {
                id: self.library_id.to_string(),
                name: "Test Library".to_string(),
                description: None,
            }),
            score: self.score,
            reason: None,
        })
    }
}

struct TestHarness {
    documents: Arc<DocumentStore>,
    retrieval: Arc<RetrievalService>,
    processor: Arc<ContentProcessor>,
    scraper: Arc<Scraper>,
    _server: mockito::ServerGuard,
}

/// Wire the full stack against an in-memory sqlite store and a permissive
/// mock vector database (collections always "missing", creates and upserts
/// always acknowledged).
async fn harness() -> TestHarness {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", mockito::Matcher::Regex("^/collections/[^/]+$".to_string()))
        .with_status(404)
        .create_async()
        .await;
    server
        .mock("PUT", mockito::Matcher::Regex("^/collections/[^/]+$".to_string()))
        .with_status(200)
        .with_body(r#"{"result": true}"#)
        .create_async()
        .await;
    server
        .mock("PUT", mockito::Matcher::Regex("^/collections/[^/]+/points$".to_string()))
        .with_status(200)
        .with_body(r#"{"result": {"status": "acknowledged"}}"#)
        .create_async()
        .await;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("memory pool");
    let documents = Arc::new(DocumentStore::new(pool));
    documents.ensure_schema().await.expect("schema");

    let scraper = Arc::new(Scraper::new(ScraperSettings::default()).expect("scraper"));
    let processor = Arc::new(ContentProcessor::new(
        Arc::new(SourceReputation::new()),
        scraper.clone(),
        None,
        ProcessorSettings::default(),
    ));
    let retrieval = Arc::new(RetrievalService::new(
        Arc::new(VectorStore::new(server.url(), None)),
        documents.clone(),
        Arc::new(FakeEmbedder),
        RetrievalSettings::default(),
    ));

    TestHarness {
        documents,
        retrieval,
        processor,
        scraper,
        _server: server,
    }
}

fn newsletter_ingestor(h: &TestHarness, matcher: FakeMatcher) -> NewsletterIngestor {
    NewsletterIngestor::new(
        h.processor.clone(),
        h.retrieval.clone(),
        h.scraper.clone(),
        Arc::new(matcher),
        None,
        NewsletterSettings::default(),
    )
}

fn email_ingestor(h: &TestHarness, matcher: FakeMatcher) -> EmailIngestor {
    EmailIngestor::new(
        h.processor.clone(),
        h.retrieval.clone(),
        h.scraper.clone(),
        Arc::new(matcher),
        None,
        None,
        EmailSettings::default(),
    )
}

fn newsletter_message(content: &str) -> InboundMessage {
    InboundMessage {
        user_id: "user-1".to_string(),
        content: content.to_string(),
        sender: Some("weekly-newsletter@example.com".to_string()),
        subject: Some("This week".to_string()),
        attachments: Vec::new(),
    }
}

const PLAIN_CONTENT: &str = "The museum opens its new wing in April after two years of \
    construction. Tickets go on sale Monday morning. Director Ana Ruiz expects record \
    attendance through the summer season, with school visits already fully booked.";

#[tokio::test]
async fn newsletter_ingests_then_skips_duplicate() {
    let h = harness().await;
    let ingestor = newsletter_ingestor(
        &h,
        FakeMatcher {
            matched: true,
            score: 0.9,
            library_id: "LIB1",
        },
    );
    let message = newsletter_message(PLAIN_CONTENT);

    let first = ingestor.ingest(&message).await;
    let IngestOutcome::Success {
        document_id,
        library_id,
        chunks_created,
    } = &first
    else {
        panic!("expected success, got {:?}", first.as_str());
    };
    assert_eq!(library_id, "LIB1");
    assert!(*chunks_created > 0);

    // The document row is completed with its chunk count recorded
    let doc = h
        .documents
        .get_document(document_id)
        .await
        .unwrap()
        .expect("document exists");
    assert_eq!(doc.status, DocumentStatus::Completed);
    assert_eq!(doc.progress, 100);
    assert_eq!(doc.chunk_count, *chunks_created as i64);
    assert_eq!(doc.metadata.channel.as_deref(), Some("newsletter"));

    // Identical content within the window: second call is a typed skip
    // referencing the first document
    let second = ingestor.ingest(&message).await;
    match second {
        IngestOutcome::SkippedDuplicate {
            original_document_id,
        } => assert_eq!(&original_document_id, document_id),
        other => panic!("expected duplicate skip, got {:?}", other.as_str()),
    }
}

#[tokio::test]
async fn newsletter_skips_unmatched_content() {
    let h = harness().await;
    let ingestor = newsletter_ingestor(
        &h,
        FakeMatcher {
            matched: false,
            score: 0.21,
            library_id: "LIB1",
        },
    );

    let outcome = ingestor.ingest(&newsletter_message(PLAIN_CONTENT)).await;
    match outcome {
        IngestOutcome::SkippedNoLibraryMatch { best_score } => {
            assert!((best_score - 0.21).abs() < 1e-9)
        }
        other => panic!("expected no-match skip, got {:?}", other.as_str()),
    }
    // Nothing was written
    assert_eq!(h.documents.count_documents("LIB1").await.unwrap(), 0);
}

#[tokio::test]
async fn newsletter_skips_low_reliability_content() {
    let h = harness().await;
    let ingestor = newsletter_ingestor(
        &h,
        FakeMatcher {
            matched: true,
            score: 0.65,
            library_id: "LIB1",
        },
    );

    // Group channel base (0.45) minus multi-URL (0.10) and forwarded (0.15)
    // penalties lands below the 0.30 floor. The long tail of text keeps the
    // message from being URL-primary, so nothing is scraped.
    let filler = "Plenty of ordinary commentary text follows the links to keep this \
        message from being dominated by its URLs in any way. "
        .repeat(3);
    let content = format!(
        "Fwd: must read https://a.example/1 https://b.example/2 https://c.example/3 {}",
        filler
    );
    let mut message = newsletter_message(&content);
    message.sender = Some("friends-group@g.us".to_string());

    let outcome = ingestor.ingest(&message).await;
    match outcome {
        IngestOutcome::SkippedLowReliability { score } => assert!(score < 0.30),
        other => panic!("expected low-reliability skip, got {:?}", other.as_str()),
    }
}

#[tokio::test]
async fn email_spam_is_hard_skipped() {
    let h = harness().await;
    let ingestor = email_ingestor(
        &h,
        FakeMatcher {
            matched: true,
            score: 0.9,
            library_id: "LIB1",
        },
    );

    let message = InboundMessage {
        user_id: "user-1".to_string(),
        content: "Our biggest discounts of the year are waiting for you!".to_string(),
        sender: Some("blast@em123.mailchimp.com".to_string()),
        subject: Some("Last chance: 50% off everything".to_string()),
        attachments: Vec::new(),
    };

    let outcome = ingestor.ingest(&message).await;
    assert_eq!(outcome.as_str(), "skipped_spam");
}

#[tokio::test]
async fn email_appends_text_attachments() {
    let h = harness().await;
    let ingestor = email_ingestor(
        &h,
        FakeMatcher {
            matched: true,
            score: 0.9,
            library_id: "LIB1",
        },
    );

    let message = InboundMessage {
        user_id: "user-1".to_string(),
        content: PLAIN_CONTENT.to_string(),
        sender: Some("curator@example.com".to_string()),
        subject: Some("Museum notes".to_string()),
        attachments: vec![
            Attachment {
                file_name: "notes.txt".to_string(),
                mime_type: Some("text/plain".to_string()),
                data: b"Opening hours move to 9am from May.".to_vec(),
            },
            // No parser configured for binary formats: silently skipped
            Attachment {
                file_name: "brochure.pdf".to_string(),
                mime_type: Some("application/pdf".to_string()),
                data: b"%PDF-1.4 fake".to_vec(),
            },
        ],
    };

    let outcome = ingestor.ingest(&message).await;
    let IngestOutcome::Success { document_id, .. } = outcome else {
        panic!("expected success, got {:?}", outcome.as_str());
    };

    let doc = h.documents.get_document(&document_id).await.unwrap().unwrap();
    assert!(doc.content.contains("Attachments:"));
    assert!(doc.content.contains("### notes.txt"));
    assert!(doc.content.contains("Opening hours move to 9am"));
    assert!(!doc.content.contains("%PDF"));
}

#[tokio::test]
async fn batch_isolates_per_item_failures() {
    let h = harness().await;
    let ingestor = newsletter_ingestor(
        &h,
        FakeMatcher {
            matched: true,
            score: 0.9,
            library_id: "LIB1",
        },
    );

    let invalid = InboundMessage {
        user_id: "user-1".to_string(),
        content: "   ".to_string(),
        sender: None,
        subject: None,
        attachments: Vec::new(),
    };
    let valid = newsletter_message(PLAIN_CONTENT);

    let outcomes = ingestor.ingest_batch(&[invalid, valid]).await;
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].as_str(), "failed");
    assert_eq!(outcomes[1].as_str(), "success");
}

#[tokio::test]
async fn retrieval_filters_orphans_and_skips_missing_collections() {
    // Dedicated mock server: retrieval needs collection info + search hits
    let mut server = mockito::Server::new_async().await;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("memory pool");
    let documents = Arc::new(DocumentStore::new(pool));
    documents.ensure_schema().await.expect("schema");

    // One real document; the second search hit references a deleted one
    let doc_id = documents
        .insert_document(&NewDocument {
            library_id: "L2".to_string(),
            folder_id: None,
            title: "Museum wing".to_string(),
            content: "Body".to_string(),
            source_type: "newsletter".to_string(),
            source_url: None,
            metadata: DocumentMeta::default(),
        })
        .await
        .unwrap();

    // L1 has no collection at all
    server
        .mock("GET", "/collections/library_L1")
        .with_status(404)
        .create_async()
        .await;
    // L2 exists with points
    server
        .mock("GET", "/collections/library_L2")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            r#"{"result": {"points_count": 2,
                "config": {"params": {"vectors": {"size": 3, "distance": "Cosine"}}}}}"#,
        )
        .create_async()
        .await;
    server
        .mock("POST", "/collections/library_L2/points/search")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(format!(
            r#"{{"result": [
                {{"id": "c-live", "score": 0.9,
                  "payload": {{"document_id": "{}", "library_id": "L2", "content": "live chunk", "chunk_index": 0, "metadata": {{}}}}}},
                {{"id": "c-orphan", "score": 0.8,
                  "payload": {{"document_id": "deleted-doc", "library_id": "L2", "content": "orphan chunk", "chunk_index": 0, "metadata": {{}}}}}}
            ]}}"#,
            doc_id
        ))
        .create_async()
        .await;

    let retrieval = RetrievalService::new(
        Arc::new(VectorStore::new(server.url(), None)),
        documents,
        Arc::new(FakeEmbedder),
        RetrievalSettings::default(),
    );

    let result = retrieval
        .retrieve(
            "museum",
            &RetrieveOptions {
                library_ids: vec!["L1".to_string(), "L2".to_string()],
                top_k: Some(5),
                min_score: None,
                user_id: None,
            },
        )
        .await
        .expect("retrieve");

    // L1 was skipped without an error; the orphaned hit was dropped
    assert_eq!(result.searched_libraries, vec!["L2".to_string()]);
    assert_eq!(result.total_results, 1);
    assert_eq!(result.chunks.len(), 1);
    assert_eq!(result.chunks[0].id, "c-live");
    assert_eq!(result.chunks[0].document.id, doc_id);
    assert_eq!(result.chunks[0].document.file_name, "Museum wing");
}

#[tokio::test]
async fn failed_indexing_marks_document_failed() {
    // Vector store that rejects every upsert
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", mockito::Matcher::Regex("^/collections/[^/]+$".to_string()))
        .with_status(404)
        .create_async()
        .await;
    server
        .mock("PUT", mockito::Matcher::Regex("^/collections/[^/]+$".to_string()))
        .with_status(200)
        .with_body(r#"{"result": true}"#)
        .create_async()
        .await;
    server
        .mock("PUT", mockito::Matcher::Regex("^/collections/[^/]+/points$".to_string()))
        .with_status(500)
        .with_body(r#"{"status": {"error": "disk full"}}"#)
        .create_async()
        .await;

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("memory pool");
    let documents = Arc::new(DocumentStore::new(pool));
    documents.ensure_schema().await.expect("schema");

    let retrieval = RetrievalService::new(
        Arc::new(VectorStore::new(server.url(), None)),
        documents.clone(),
        Arc::new(FakeEmbedder),
        RetrievalSettings::default(),
    );

    let result = retrieval
        .ingest_document(NewDocument {
            library_id: "L1".to_string(),
            folder_id: None,
            title: "Doomed".to_string(),
            content: PLAIN_CONTENT.to_string(),
            source_type: "newsletter".to_string(),
            source_url: None,
            metadata: DocumentMeta::default(),
        })
        .await;
    assert!(result.is_err());

    // The row exists, marked failed, with the error captured in metadata
    let all = documents.list_documents("L1").await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].status, DocumentStatus::Failed);
    let error = all[0].metadata.error.as_deref().expect("error recorded");
    assert!(error.contains("vector upsert failed"));
}
