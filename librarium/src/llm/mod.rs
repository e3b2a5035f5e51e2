use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Core trait for LLM providers (summarization + embeddings).
///
/// Injected as `Arc<dyn LlmProvider>` by the composition root; the
/// summarizer wraps every call with a deterministic extractive fallback,
/// so a provider failure never aborts ingestion.
#[async_trait::async_trait]
pub trait LlmProvider: Send + Sync {
    /// Generate completion for a given prompt
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse>;

    /// Produce a fact-constrained structured summary of content
    async fn summarize(&self, content: &str, context: &SummaryContext) -> Result<ContentSummary>;

    /// Generate vector embeddings, one per input text, in one batch call
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;
}

/// Request structure for LLM generation
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub prompt: String,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    pub timeout_seconds: Option<u64>,
}

/// Response from LLM generation
#[derive(Debug, Clone)]
pub struct LlmResponse {
    pub content: String,
    pub usage: UsageMetadata,
    pub model: String,
}

/// Attribution passed to the summarizer; also used by the extractive
/// fallback to prefix its summary.
#[derive(Debug, Clone, Default)]
pub struct SummaryContext {
    pub source_name: Option<String>,
    pub domain: Option<String>,
}

impl SummaryContext {
    pub fn attribution(&self) -> Option<String> {
        self.source_name
            .clone()
            .or_else(|| self.domain.clone())
    }
}

/// Structured summary under the anti-hallucination contract: facts only,
/// numbers/dates/names verbatim, uncertain claims marked `[unverified]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContentSummary {
    pub title: String,
    pub summary: String,
    #[serde(default)]
    pub key_facts: Vec<String>,
    #[serde(default)]
    pub entities: Vec<String>,
    /// Provider-reported confidence; the extractive fallback reports low
    pub confidence: f64,
    #[serde(default)]
    pub warnings: Vec<String>,
    /// Usage metadata for tracking
    #[serde(skip)]
    pub usage: UsageMetadata,
}

/// Token usage metadata
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UsageMetadata {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

pub mod remote;
pub mod summarizer;

/// Helper to extract JSON from text that might contain markdown backticks or preamble
pub fn extract_json_from_text(text: &str) -> Option<String> {
    // 1. Try to find content between ```json and ```
    if let Some(start) = text.find("```json") {
        let rest = &text[start + 7..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 2. Try to find content between ``` and ```
    if let Some(start) = text.find("```") {
        let rest = &text[start + 3..];
        if let Some(end) = rest.find("```") {
            return Some(rest[..end].trim().to_string());
        }
    }

    // 3. Try to find the first '{' and last '}'
    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        return Some(text[start..=end].to_string());
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_extraction_handles_fences_and_preamble() {
        let fenced = "Here you go:\n```json\n{\"title\": \"T\"}\n```";
        assert_eq!(extract_json_from_text(fenced).unwrap(), "{\"title\": \"T\"}");

        let bare = "Sure! {\"title\": \"T\", \"summary\": \"S\"} hope that helps";
        assert_eq!(
            extract_json_from_text(bare).unwrap(),
            "{\"title\": \"T\", \"summary\": \"S\"}"
        );

        assert!(extract_json_from_text("no json at all").is_none());
    }
}
