// Summarizer with deterministic fallback
use tracing::{info, warn};

use super::{ContentSummary, LlmProvider, SummaryContext, UsageMetadata};

/// Confidence reported by the extractive fallback.
const FALLBACK_CONFIDENCE: f64 = 0.4;

/// Characters of source text carried into the fallback summary.
const FALLBACK_SUMMARY_CHARS: usize = 400;

/// Summarize under the anti-hallucination contract, degrading to a
/// deterministic extractive summary when the provider is absent, fails,
/// or returns something unparseable. Never errors: a summary always
/// comes back, tagged with lower confidence on the fallback path.
pub async fn summarize_content(
    provider: Option<&dyn LlmProvider>,
    content: &str,
    context: &SummaryContext,
) -> ContentSummary {
    match provider {
        Some(p) => match p.summarize(content, context).await {
            Ok(summary) => {
                info!(
                    "summarizer: provider summary ok ({} facts, {} tokens)",
                    summary.key_facts.len(),
                    summary.usage.total_tokens
                );
                summary
            }
            Err(e) => {
                warn!("summarizer: provider failed: {}, using extractive fallback", e);
                extractive_summary(content, context)
            }
        },
        None => extractive_summary(content, context),
    }
}

/// Deterministic extractive summary: first substantive sentence as the
/// title, a bounded prefix of the content (with attribution) as the
/// summary, capitalized words as candidate entities.
pub fn extractive_summary(text: &str, context: &SummaryContext) -> ContentSummary {
    let sentences: Vec<&str> = text
        .split(['.', '!', '?'])
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .collect();

    let title = sentences
        .iter()
        .find(|s| s.split_whitespace().count() >= 3)
        .or(sentences.first())
        .map(|s| truncate(s, 100))
        .unwrap_or_else(|| "Untitled content".to_string());

    let body: String = text.chars().take(FALLBACK_SUMMARY_CHARS).collect();
    let summary = match context.attribution() {
        Some(attribution) => format!("From {}: {}", attribution, body.trim()),
        None => body.trim().to_string(),
    };

    let key_facts = sentences
        .iter()
        .skip(1)
        .take(3)
        .map(|s| truncate(s, 200))
        .collect();

    ContentSummary {
        title,
        summary,
        key_facts,
        entities: capitalized_entities(text),
        confidence: FALLBACK_CONFIDENCE,
        warnings: vec!["extractive fallback: no model-verified summary".to_string()],
        usage: UsageMetadata::default(),
    }
}

/// Capitalized-word heuristic: words starting uppercase that don't open a
/// sentence, deduplicated in order of first appearance.
fn capitalized_entities(text: &str) -> Vec<String> {
    let mut entities: Vec<String> = Vec::new();
    let mut sentence_start = true;

    for word in text.split_whitespace() {
        let cleaned: String = word
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_string();
        let is_capitalized = cleaned
            .chars()
            .next()
            .map(|c| c.is_uppercase())
            .unwrap_or(false);

        if is_capitalized && !sentence_start && cleaned.chars().count() > 2 {
            if !entities.contains(&cleaned) {
                entities.push(cleaned.clone());
            }
        }

        sentence_start = word.ends_with(['.', '!', '?', ':']);
        if entities.len() >= 10 {
            break;
        }
    }
    entities
}

fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max_len - 3).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extractive_summary_shape() {
        let ctx = SummaryContext {
            source_name: Some("Example Weekly".to_string()),
            domain: None,
        };
        let text = "The council approved the budget on Tuesday. Spending rises by 4 percent. \
                    Mayor Dana Velez praised the outcome. A final vote follows in June.";

        let summary = extractive_summary(text, &ctx);

        assert_eq!(summary.title, "The council approved the budget on Tuesday");
        assert!(summary.summary.starts_with("From Example Weekly:"));
        assert_eq!(summary.key_facts.len(), 3);
        assert!((summary.confidence - FALLBACK_CONFIDENCE).abs() < 1e-9);
        assert!(!summary.warnings.is_empty());
        // Mid-sentence capitalized words are picked up as entities
        assert!(summary.entities.iter().any(|e| e == "Dana" || e == "Velez"));
    }

    #[test]
    fn extractive_summary_truncates_long_title() {
        let long_sentence = "word ".repeat(60);
        let text = format!("{}. Second sentence here.", long_sentence.trim());
        let summary = extractive_summary(&text, &SummaryContext::default());
        assert!(summary.title.chars().count() <= 100);
        assert!(summary.title.ends_with("..."));
    }

    #[tokio::test]
    async fn missing_provider_uses_fallback() {
        let summary = summarize_content(None, "Something happened today. Details follow.", &SummaryContext::default()).await;
        assert!((summary.confidence - FALLBACK_CONFIDENCE).abs() < 1e-9);
    }
}
