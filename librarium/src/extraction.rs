use scraper::{Html, Selector};
use tracing::debug;

/// One strategy for pulling readable article text out of fetched HTML.
///
/// Strategies are ordered: standard DOM extraction runs first, and the
/// framework-JSON and JSON-LD extractors only run when it comes up short.
/// Each strategy is independent so it can be tested and replaced on its own.
pub trait ArticleExtractor: Send + Sync {
    fn name(&self) -> &'static str;
    fn extract(&self, html: &str) -> Option<String>;
}

/// Run the extraction chain: standard HTML first; when the result is below
/// `min_chars`, try the fallback extractors and keep whichever strategy
/// yields the most text.
pub fn extract_article_text(html: &str, min_chars: usize) -> Option<String> {
    let standard = StandardHtmlExtractor.extract(html);
    if let Some(text) = &standard {
        if text.chars().count() >= min_chars {
            return standard;
        }
    }

    let fallbacks: [&dyn ArticleExtractor; 2] = [&EmbeddedJsonExtractor, &JsonLdExtractor];
    let mut best = standard;
    for extractor in fallbacks {
        if let Some(text) = extractor.extract(html) {
            let better = best
                .as_ref()
                .map(|b| text.chars().count() > b.chars().count())
                .unwrap_or(true);
            if better {
                debug!("extraction: '{}' produced {} chars", extractor.name(), text.len());
                best = Some(text);
            }
        }
    }
    best.filter(|t| !t.trim().is_empty())
}

/// Standard DOM extraction: prefer `<article>`, then `<main>`, then a
/// content-class container, and convert the markup to plain text with
/// paragraph normalization and entity decoding.
pub struct StandardHtmlExtractor;

const CONTENT_SELECTORS: &[&str] = &[
    "article",
    "main",
    "div.article-body",
    "div.post-content",
    "div.entry-content",
    "div.story-body",
    "div.content",
    "#content",
];

impl ArticleExtractor for StandardHtmlExtractor {
    fn name(&self) -> &'static str {
        "standard_html"
    }

    fn extract(&self, html: &str) -> Option<String> {
        let document = Html::parse_document(html);

        for selector_str in CONTENT_SELECTORS {
            let Ok(selector) = Selector::parse(selector_str) else {
                continue;
            };
            if let Some(element) = document.select(&selector).next() {
                let text = fragment_to_text(&element.html());
                if !text.trim().is_empty() {
                    return Some(text);
                }
            }
        }

        // Fallback: whole body, boilerplate stripped by the text converter
        let body_selector = Selector::parse("body").ok()?;
        let body = document.select(&body_selector).next()?;
        let text = fragment_to_text(&body.html());
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

/// Strip non-content elements, then render to plain text. `html2text`
/// handles entity decoding and paragraph/list normalization; script, style
/// and navigation markup is removed beforehand so none of it leaks into
/// the text stream.
fn fragment_to_text(fragment_html: &str) -> String {
    let document = Html::parse_fragment(fragment_html);
    let mut cleaned = fragment_html.to_string();
    for selector_str in ["script", "style", "noscript", "nav", "header", "footer", "aside", "iframe", "form"] {
        if let Ok(selector) = Selector::parse(selector_str) {
            for element in document.select(&selector) {
                cleaned = cleaned.replace(&element.html(), "");
            }
        }
    }

    let text = html2text::from_read(cleaned.as_bytes(), 100).unwrap_or_default();
    normalize_text(&text)
}

/// Collapse runs of blank lines and trim trailing spaces per line.
fn normalize_text(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0;
    for line in text.lines() {
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(trimmed);
        out.push('\n');
    }
    out.trim().to_string()
}

/// Fallback for JS-framework pages whose article text lives in hydration
/// payloads or `data-*` JSON attributes rather than rendered markup.
pub struct EmbeddedJsonExtractor;

const ARTICLE_KEYS: &[&str] = &["articleBody", "article_body", "body", "content", "text"];
const MIN_EMBEDDED_LEN: usize = 200;

impl ArticleExtractor for EmbeddedJsonExtractor {
    fn name(&self) -> &'static str {
        "embedded_json"
    }

    fn extract(&self, html: &str) -> Option<String> {
        let document = Html::parse_document(html);
        let mut best: Option<String> = None;

        // Framework hydration payloads (Next.js, Nuxt, and similar)
        for selector_str in ["script#__NEXT_DATA__", "script#__NUXT_DATA__"] {
            if let Ok(selector) = Selector::parse(selector_str) {
                for element in document.select(&selector) {
                    let raw: String = element.text().collect();
                    consider_json(&raw, &mut best);
                }
            }
        }

        // Component-props and generic data-* JSON attributes
        if let Ok(selector) = Selector::parse("[data-props], [data-page], [data-article], [data-content]") {
            for element in document.select(&selector) {
                for (name, value) in element.value().attrs() {
                    if name.starts_with("data-") && value.trim_start().starts_with('{') {
                        consider_json(value, &mut best);
                    }
                }
            }
        }

        best
    }
}

fn consider_json(raw: &str, best: &mut Option<String>) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(raw) else {
        return;
    };
    if let Some(text) = longest_article_string(&value) {
        let candidate = if text.contains('<') {
            // Embedded values are frequently HTML themselves
            fragment_to_text(&text)
        } else {
            normalize_text(&text)
        };
        let better = best
            .as_ref()
            .map(|b| candidate.chars().count() > b.chars().count())
            .unwrap_or(true);
        if better && candidate.chars().count() >= MIN_EMBEDDED_LEN {
            *best = Some(candidate);
        }
    }
}

/// Walk a JSON tree looking for the longest string under an article-ish key.
fn longest_article_string(value: &serde_json::Value) -> Option<String> {
    let mut best: Option<String> = None;
    walk_json(value, &mut best);
    best
}

fn walk_json(value: &serde_json::Value, best: &mut Option<String>) {
    match value {
        serde_json::Value::Object(map) => {
            for (key, v) in map {
                if ARTICLE_KEYS.contains(&key.as_str()) {
                    if let Some(s) = v.as_str() {
                        if s.len() >= MIN_EMBEDDED_LEN
                            && best.as_ref().map(|b| s.len() > b.len()).unwrap_or(true)
                        {
                            *best = Some(s.to_string());
                        }
                    }
                }
                walk_json(v, best);
            }
        }
        serde_json::Value::Array(items) => {
            for item in items {
                walk_json(item, best);
            }
        }
        _ => {}
    }
}

/// Schema.org JSON-LD blocks carrying `articleBody`.
pub struct JsonLdExtractor;

impl ArticleExtractor for JsonLdExtractor {
    fn name(&self) -> &'static str {
        "json_ld"
    }

    fn extract(&self, html: &str) -> Option<String> {
        let document = Html::parse_document(html);
        let selector = Selector::parse(r#"script[type="application/ld+json"]"#).ok()?;

        let mut best: Option<String> = None;
        for element in document.select(&selector) {
            let raw: String = element.text().collect();
            let Ok(value) = serde_json::from_str::<serde_json::Value>(&raw) else {
                continue;
            };
            // The payload may be a single object, an array, or an @graph
            let candidates: Vec<&serde_json::Value> = match &value {
                serde_json::Value::Array(items) => items.iter().collect(),
                serde_json::Value::Object(map) => match map.get("@graph") {
                    Some(serde_json::Value::Array(items)) => items.iter().collect(),
                    _ => vec![&value],
                },
                _ => continue,
            };
            for candidate in candidates {
                if let Some(body) = candidate.get("articleBody").and_then(|b| b.as_str()) {
                    let text = normalize_text(body);
                    if best.as_ref().map(|b| text.len() > b.len()).unwrap_or(true) {
                        best = Some(text);
                    }
                }
            }
        }
        best.filter(|t| !t.is_empty())
    }
}
