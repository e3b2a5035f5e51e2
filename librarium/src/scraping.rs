use scraper::{Html, Selector};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};
use url::Url;

use crate::extraction;
use crate::reliability;

/// Fraction of cache entries evicted (oldest first) when the cache is full.
const CACHE_EVICT_FRACTION: f64 = 0.2;

/// Errors surfaced as typed results; nothing here crosses the scraper
/// boundary as a panic or an opaque failure.
#[derive(Debug, Clone, Error)]
pub enum ScrapeError {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("rate limited for domain {0}")]
    RateLimited(String),
    #[error("request timed out")]
    Timeout,
    #[error("http error {status}")]
    Http { status: u16 },
    #[error("unsupported content type: {0}")]
    UnsupportedContentType(String),
    #[error("response larger than {0} bytes")]
    TooLarge(u64),
    #[error("no readable article content found")]
    EmptyContent,
    #[error("network error: {0}")]
    Network(String),
}

impl ScrapeError {
    /// Stable machine-readable error kind for logs and audit rows.
    pub fn kind(&self) -> &'static str {
        match self {
            ScrapeError::InvalidUrl(_) => "invalid_url",
            ScrapeError::RateLimited(_) => "rate_limited",
            ScrapeError::Timeout => "timeout",
            ScrapeError::Http { .. } => "http_error",
            ScrapeError::UnsupportedContentType(_) => "unsupported_content_type",
            ScrapeError::TooLarge(_) => "too_large",
            ScrapeError::EmptyContent => "empty_content",
            ScrapeError::Network(_) => "network_error",
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            ScrapeError::Http { status } => Some(*status),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapedArticle {
    pub url: String,
    pub domain: String,
    pub title: Option<String>,
    pub content: String,
    pub description: Option<String>,
    pub author: Option<String>,
    pub publish_date: Option<String>,
    /// Static trust score for the resolved domain
    pub reliability: f64,
    pub processing_time_ms: u64,
}

#[derive(Debug, Clone)]
pub struct ScraperSettings {
    pub fetch_timeout: Duration,
    pub max_response_bytes: u64,
    pub min_article_chars: usize,
    pub rate_limit_per_minute: u32,
    pub cache_ttl: Duration,
    pub cache_capacity: usize,
    pub user_agent: String,
}

impl Default for ScraperSettings {
    fn default() -> Self {
        Self {
            fetch_timeout: Duration::from_secs(15),
            max_response_bytes: 5 * 1024 * 1024,
            min_article_chars: 250,
            rate_limit_per_minute: 5,
            cache_ttl: Duration::from_secs(3600),
            cache_capacity: 500,
            user_agent: "Librarium/0.1.0".to_string(),
        }
    }
}

impl ScraperSettings {
    pub fn from_config(cfg: Option<&common::ScraperConfig>) -> Self {
        let defaults = Self::default();
        let Some(cfg) = cfg else { return defaults };
        Self {
            fetch_timeout: cfg
                .fetch_timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            max_response_bytes: cfg.max_response_bytes.unwrap_or(defaults.max_response_bytes),
            min_article_chars: cfg.min_article_chars.unwrap_or(defaults.min_article_chars),
            rate_limit_per_minute: cfg
                .rate_limit_per_minute
                .unwrap_or(defaults.rate_limit_per_minute),
            cache_ttl: cfg
                .cache_ttl_seconds
                .map(Duration::from_secs)
                .unwrap_or(defaults.cache_ttl),
            cache_capacity: cfg.cache_capacity.unwrap_or(defaults.cache_capacity),
            user_agent: cfg.user_agent.clone().unwrap_or(defaults.user_agent),
        }
    }
}

struct CacheEntry {
    article: ScrapedArticle,
    fetched_at: Instant,
}

struct RateWindow {
    count: u32,
    window_start: Instant,
}

/// Fetches and extracts readable article text from URLs. Owns its result
/// cache and per-domain fixed-window rate limiter; construct one instance
/// at the composition root and share it.
pub struct Scraper {
    client: reqwest::Client,
    settings: ScraperSettings,
    cache: Mutex<HashMap<String, CacheEntry>>,
    rate: Mutex<HashMap<String, RateWindow>>,
}

impl Scraper {
    pub fn new(settings: ScraperSettings) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.fetch_timeout)
            .user_agent(settings.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build reqwest client: {}", e))?;

        Ok(Self {
            client,
            settings,
            cache: Mutex::new(HashMap::new()),
            rate: Mutex::new(HashMap::new()),
        })
    }

    /// Fetch a URL and extract its article content.
    ///
    /// Results are cached per URL for the configured TTL. Requests beyond
    /// the per-domain window fail fast with `RateLimited` and are not
    /// retried here.
    pub async fn scrape(&self, url: &str) -> Result<ScrapedArticle, ScrapeError> {
        let started = Instant::now();

        let parsed = Url::parse(url).map_err(|_| ScrapeError::InvalidUrl(url.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ScrapeError::InvalidUrl(url.to_string()));
        }
        let domain = parsed
            .host_str()
            .map(|d| d.trim_start_matches("www.").to_lowercase())
            .ok_or_else(|| ScrapeError::InvalidUrl(url.to_string()))?;

        if let Some(cached) = self.cache_get(url) {
            debug!("scraper: cache hit for {}", url);
            return Ok(cached);
        }

        self.check_rate_limit(&domain)?;

        let html = self.fetch(url).await?;

        let content = extraction::extract_article_text(&html, self.settings.min_article_chars)
            .ok_or(ScrapeError::EmptyContent)?;

        let document = Html::parse_document(&html);
        let meta = PageMeta::from_document(&document);

        let article = ScrapedArticle {
            url: url.to_string(),
            domain: domain.clone(),
            title: meta.title,
            content,
            description: meta.description,
            author: meta.author,
            publish_date: meta.publish_date,
            reliability: reliability::domain_base_score(&domain),
            processing_time_ms: started.elapsed().as_millis() as u64,
        };

        info!(
            "scraper: extracted {} chars from {} in {}ms",
            article.content.len(),
            url,
            article.processing_time_ms
        );
        self.cache_put(url, article.clone());
        Ok(article)
    }

    async fn fetch(&self, url: &str) -> Result<String, ScrapeError> {
        let response = self.client.get(url).send().await.map_err(|e| {
            if e.is_timeout() {
                ScrapeError::Timeout
            } else {
                ScrapeError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ScrapeError::Http {
                status: status.as_u16(),
            });
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("text/html")
            .to_string();
        if !is_text_content_type(&content_type) {
            return Err(ScrapeError::UnsupportedContentType(content_type));
        }

        if let Some(length) = response.content_length() {
            if length > self.settings.max_response_bytes {
                return Err(ScrapeError::TooLarge(self.settings.max_response_bytes));
            }
        }

        let bytes = response.bytes().await.map_err(|e| {
            if e.is_timeout() {
                ScrapeError::Timeout
            } else {
                ScrapeError::Network(e.to_string())
            }
        })?;

        // Servers without Content-Length still get capped
        let capped = if bytes.len() as u64 > self.settings.max_response_bytes {
            warn!(
                "scraper: truncating {}-byte response from {} to cap",
                bytes.len(),
                url
            );
            &bytes[..self.settings.max_response_bytes as usize]
        } else {
            &bytes[..]
        };

        Ok(String::from_utf8_lossy(capped).into_owned())
    }

    fn check_rate_limit(&self, domain: &str) -> Result<(), ScrapeError> {
        let mut rate = match self.rate.lock() {
            Ok(guard) => guard,
            Err(_) => return Ok(()),
        };
        let now = Instant::now();
        let window = rate.entry(domain.to_string()).or_insert(RateWindow {
            count: 0,
            window_start: now,
        });

        if now.duration_since(window.window_start) > Duration::from_secs(60) {
            window.count = 0;
            window.window_start = now;
        }

        if window.count >= self.settings.rate_limit_per_minute {
            warn!("scraper: rate limit reached for domain {}", domain);
            return Err(ScrapeError::RateLimited(domain.to_string()));
        }
        window.count += 1;
        Ok(())
    }

    fn cache_get(&self, url: &str) -> Option<ScrapedArticle> {
        let mut cache = self.cache.lock().ok()?;
        match cache.get(url) {
            Some(entry) if entry.fetched_at.elapsed() <= self.settings.cache_ttl => {
                Some(entry.article.clone())
            }
            Some(_) => {
                // Expired entries are evicted on access
                cache.remove(url);
                None
            }
            None => None,
        }
    }

    fn cache_put(&self, url: &str, article: ScrapedArticle) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        if cache.len() >= self.settings.cache_capacity {
            // Bulk-evict the oldest entries instead of churning one by one
            let evict_count =
                ((cache.len() as f64 * CACHE_EVICT_FRACTION).ceil() as usize).max(1);
            let mut by_age: Vec<(String, Instant)> = cache
                .iter()
                .map(|(k, v)| (k.clone(), v.fetched_at))
                .collect();
            by_age.sort_by_key(|(_, at)| *at);
            for (key, _) in by_age.into_iter().take(evict_count) {
                cache.remove(&key);
            }
        }
        cache.insert(
            url.to_string(),
            CacheEntry {
                article,
                fetched_at: Instant::now(),
            },
        );
    }
}

fn is_text_content_type(content_type: &str) -> bool {
    let ct = content_type.to_lowercase();
    ct.contains("text/html")
        || ct.contains("application/xhtml")
        || ct.contains("text/plain")
        || ct.contains("text/xml")
}

/// Title/description/author/date read from meta tags with fallback chains:
/// Open Graph, then Twitter Card, then document-level tags.
struct PageMeta {
    title: Option<String>,
    description: Option<String>,
    author: Option<String>,
    publish_date: Option<String>,
}

impl PageMeta {
    fn from_document(document: &Html) -> Self {
        Self {
            title: meta_content(document, &[r#"meta[property="og:title"]"#, r#"meta[name="twitter:title"]"#])
                .or_else(|| element_text(document, "title")),
            description: meta_content(
                document,
                &[
                    r#"meta[property="og:description"]"#,
                    r#"meta[name="twitter:description"]"#,
                    r#"meta[name="description"]"#,
                ],
            ),
            author: meta_content(
                document,
                &[
                    r#"meta[name="author"]"#,
                    r#"meta[property="article:author"]"#,
                ],
            ),
            publish_date: meta_content(
                document,
                &[
                    r#"meta[property="article:published_time"]"#,
                    r#"meta[name="date"]"#,
                    r#"meta[itemprop="datePublished"]"#,
                ],
            )
            .or_else(|| attr_value(document, "time[datetime]", "datetime")),
        }
    }
}

fn meta_content(document: &Html, selectors: &[&str]) -> Option<String> {
    for selector_str in selectors {
        let Ok(selector) = Selector::parse(selector_str) else {
            continue;
        };
        if let Some(value) = document
            .select(&selector)
            .next()
            .and_then(|el| el.value().attr("content"))
        {
            let trimmed = value.trim();
            if !trimmed.is_empty() {
                return Some(trimmed.to_string());
            }
        }
    }
    None
}

fn element_text(document: &Html, selector_str: &str) -> Option<String> {
    let selector = Selector::parse(selector_str).ok()?;
    document
        .select(&selector)
        .next()
        .map(|el| el.text().collect::<String>().trim().to_string())
        .filter(|t| !t.is_empty())
}

fn attr_value(document: &Html, selector_str: &str, attr: &str) -> Option<String> {
    let selector = Selector::parse(selector_str).ok()?;
    document
        .select(&selector)
        .next()
        .and_then(|el| el.value().attr(attr))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// The first http(s) URL appearing in free text, if any.
pub fn first_url(content: &str) -> Option<String> {
    content
        .split_whitespace()
        .find(|w| w.starts_with("http://") || w.starts_with("https://"))
        .map(|w| w.trim_end_matches([',', ';', ')', ']', '.']).to_string())
}

/// A message is URL-primary when its payload is dominated by a single URL:
/// the URL takes up more than 60% of the content, or whatever surrounds it
/// is under 150 characters. URL-primary content is auto-scraped and matched
/// against a lower library-match threshold.
pub fn is_url_primary(content: &str) -> bool {
    let Some(url) = first_url(content) else {
        return false;
    };
    let total = content.trim().chars().count();
    if total == 0 {
        return false;
    }
    let url_len = url.chars().count();
    let remainder = total.saturating_sub(url_len);
    url_len as f64 > total as f64 * 0.6 || remainder < 150
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_primary_detection() {
        // Bare URL
        assert!(is_url_primary("https://example.com/some/long/article-path-here"));
        // Short framing text around a URL
        assert!(is_url_primary("check this out https://example.com/article"));
        // Long substantive text with an incidental link
        let long_text = format!(
            "{} https://example.com/a",
            "Substantial original commentary that stands on its own. ".repeat(5)
        );
        assert!(!is_url_primary(&long_text));
        // No URL at all
        assert!(!is_url_primary("just a plain message"));
    }

    #[test]
    fn first_url_strips_trailing_punctuation() {
        assert_eq!(
            first_url("read https://example.com/a, then reply").as_deref(),
            Some("https://example.com/a")
        );
        assert!(first_url("no links here").is_none());
    }

    #[test]
    fn page_meta_fallback_chain() {
        let html = r#"<html><head>
            <title>Doc Title</title>
            <meta property="og:description" content="OG description">
            <meta name="author" content="Jane Writer">
            <meta property="article:published_time" content="2024-03-01T10:00:00Z">
        </head><body></body></html>"#;
        let document = Html::parse_document(html);
        let meta = PageMeta::from_document(&document);
        // No og:title, falls through to <title>
        assert_eq!(meta.title.as_deref(), Some("Doc Title"));
        assert_eq!(meta.description.as_deref(), Some("OG description"));
        assert_eq!(meta.author.as_deref(), Some("Jane Writer"));
        assert_eq!(meta.publish_date.as_deref(), Some("2024-03-01T10:00:00Z"));
    }

    #[tokio::test]
    async fn rate_limit_fails_fast() {
        let settings = ScraperSettings {
            rate_limit_per_minute: 2,
            ..Default::default()
        };
        let scraper = Scraper::new(settings).unwrap();
        assert!(scraper.check_rate_limit("example.com").is_ok());
        assert!(scraper.check_rate_limit("example.com").is_ok());
        let err = scraper.check_rate_limit("example.com").unwrap_err();
        assert_eq!(err.kind(), "rate_limited");
        // Other domains are unaffected
        assert!(scraper.check_rate_limit("other.org").is_ok());
    }

    #[test]
    fn cache_evicts_oldest_fifth_when_full() {
        let settings = ScraperSettings {
            cache_capacity: 10,
            ..Default::default()
        };
        let scraper = Scraper::new(settings).unwrap();
        let article = |u: &str| ScrapedArticle {
            url: u.to_string(),
            domain: "example.com".to_string(),
            title: None,
            content: "body".to_string(),
            description: None,
            author: None,
            publish_date: None,
            reliability: 0.5,
            processing_time_ms: 1,
        };
        for i in 0..10 {
            let url = format!("https://example.com/{}", i);
            scraper.cache_put(&url, article(&url));
        }
        // Inserting into a full cache evicts the oldest 20% first
        scraper.cache_put("https://example.com/new", article("https://example.com/new"));
        let cache = scraper.cache.lock().unwrap();
        assert_eq!(cache.len(), 9); // 10 - 2 evicted + 1 inserted
        assert!(cache.contains_key("https://example.com/new"));
    }

    #[test]
    fn content_type_gate() {
        assert!(is_text_content_type("text/html; charset=utf-8"));
        assert!(is_text_content_type("application/xhtml+xml"));
        assert!(!is_text_content_type("application/pdf"));
        assert!(!is_text_content_type("image/png"));
    }
}
