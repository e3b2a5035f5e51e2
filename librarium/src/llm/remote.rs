use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::{ContentSummary, LlmProvider, LlmRequest, LlmResponse, SummaryContext, UsageMetadata};

/// Remote LLM provider using an OpenAI-compatible HTTP API
pub struct RemoteLlmProvider {
    base_url: String,
    api_key: String,
    model: String,
    default_timeout: Duration,
    default_max_tokens: usize,
    client: reqwest::Client,
}

impl RemoteLlmProvider {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
            default_timeout: Duration::from_secs(30),
            default_max_tokens: 800,
            client: reqwest::Client::new(),
        }
    }

    pub fn with_defaults(mut self, timeout_secs: u64, max_tokens: usize) -> Self {
        self.default_timeout = Duration::from_secs(timeout_secs);
        self.default_max_tokens = max_tokens;
        self
    }
}

#[async_trait::async_trait]
impl LlmProvider for RemoteLlmProvider {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        let timeout = request
            .timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout);

        let max_tokens = request.max_tokens.unwrap_or(self.default_max_tokens);

        // Build OpenAI-compatible request
        let req_body = OpenAiRequest {
            model: self.model.clone(),
            messages: vec![Message {
                role: "user".to_string(),
                content: request.prompt,
            }],
            max_tokens: Some(max_tokens),
            temperature: request.temperature,
        };

        // Make HTTP request with timeout
        let response = tokio::time::timeout(
            timeout,
            self.client
                .post(&self.base_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&req_body)
                .send(),
        )
        .await
        .context("LLM request timed out")?
        .context("LLM HTTP request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("LLM API error {}: {}", status, body);
        }

        let resp_body: OpenAiResponse = response
            .json()
            .await
            .context("Failed to parse LLM response")?;

        let choice = resp_body
            .choices
            .first()
            .context("LLM response has no choices")?;

        let usage = UsageMetadata {
            prompt_tokens: resp_body.usage.prompt_tokens.unwrap_or(0),
            completion_tokens: resp_body.usage.completion_tokens.unwrap_or(0),
            total_tokens: resp_body.usage.total_tokens.unwrap_or(0),
        };

        Ok(LlmResponse {
            content: choice.message.content.clone(),
            usage,
            model: resp_body.model.unwrap_or_else(|| self.model.clone()),
        })
    }

    async fn summarize(&self, content: &str, context: &SummaryContext) -> Result<ContentSummary> {
        let attribution = context
            .attribution()
            .map(|a| format!("Source: {}\n\n", a))
            .unwrap_or_default();

        let prompt = format!(
            r#"You are a knowledge-base summarizer. Extract ONLY facts that are present in the source content.

STRICT RULES:
1. Do NOT add information that is not in the source
2. Preserve all numbers, dates and proper names VERBATIM
3. Mark any fact you are not certain about with [unverified]
4. Ignore markdown formatting characters, extract text content only
5. KEEP THE ORIGINAL LANGUAGE - do not translate

OUTPUT FORMAT (strict JSON, no prose around it):
{{
  "title": "short factual title (max 100 chars)",
  "summary": "2-4 sentence factual summary",
  "key_facts": ["fact 1", "fact 2"],
  "entities": ["person/org/place names appearing in the source"],
  "confidence": 0.0,
  "warnings": ["any caveat about the source content"]
}}

{}CONTENT TO SUMMARIZE:
{}
"#,
            attribution, content
        );

        let request = LlmRequest {
            prompt,
            max_tokens: Some(self.default_max_tokens),
            // Low temperature: the contract is extraction, not invention
            temperature: Some(0.2),
            timeout_seconds: None,
        };

        let response = self.generate(request).await?;

        // Robust JSON extraction: handle markdown backticks, preamble, etc.
        let cleaned_json = super::extract_json_from_text(&response.content)
            .context("No valid JSON found in LLM summary response")?;

        let mut summary: ContentSummary = serde_json::from_str(&cleaned_json)
            .context(format!("Failed to parse LLM summary as JSON. Input was: {}", cleaned_json))?;

        summary.confidence = summary.confidence.clamp(0.0, 1.0);
        summary.usage = response.usage;
        Ok(summary)
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Infer embedding URL from base_url (chat endpoint)
        // e.g. http://localhost:11434/v1/chat/completions -> http://localhost:11434/v1/embeddings
        let embedding_url = if self.base_url.ends_with("/embeddings") {
            self.base_url.clone()
        } else if self.base_url.ends_with("/chat/completions") {
            self.base_url.replace("/chat/completions", "/embeddings")
        } else if self.base_url.ends_with("/completions") {
            self.base_url.replace("/completions", "/embeddings")
        } else if self.base_url.ends_with("/v1") {
            format!("{}/embeddings", self.base_url)
        } else {
            format!("{}/embeddings", self.base_url.trim_end_matches('/'))
        };

        let req_body = EmbeddingRequest {
            model: self.model.clone(),
            input: texts.to_vec(),
        };

        let response = tokio::time::timeout(
            self.default_timeout,
            self.client
                .post(&embedding_url)
                .header("Authorization", format!("Bearer {}", self.api_key))
                .header("Content-Type", "application/json")
                .json(&req_body)
                .send(),
        )
        .await
        .context("Embedding request timed out")?
        .context("Embedding HTTP request failed")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Embedding API error {}: {} (URL: {})", status, body, embedding_url);
        }

        let resp_body: EmbeddingResponse = response
            .json()
            .await
            .context("Failed to parse embedding response")?;

        if resp_body.data.len() != texts.len() {
            anyhow::bail!(
                "Embedding response has {} vectors for {} inputs",
                resp_body.data.len(),
                texts.len()
            );
        }

        // The API is allowed to return entries out of order; index restores it
        let mut data = resp_body.data;
        data.sort_by_key(|d| d.index.unwrap_or(0));
        Ok(data.into_iter().map(|d| d.embedding).collect())
    }
}

// OpenAI API request/response structures
#[derive(Debug, Serialize)]
struct OpenAiRequest {
    model: String,
    messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAiResponse {
    model: Option<String>,
    choices: Vec<Choice>,
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: Message,
}

#[derive(Debug, Deserialize)]
struct Usage {
    #[serde(default)]
    prompt_tokens: Option<usize>,
    #[serde(default)]
    completion_tokens: Option<usize>,
    #[serde(default)]
    total_tokens: Option<usize>,
}

#[derive(Debug, Serialize)]
struct EmbeddingRequest {
    model: String,
    input: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}
