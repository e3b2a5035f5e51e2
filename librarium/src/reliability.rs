use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use tracing::debug;

/// Reliability bands derived from the blended score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReliabilityCategory {
    HighlyReliable,
    Reliable,
    ModeratelyReliable,
    Questionable,
    Unreliable,
}

impl ReliabilityCategory {
    pub fn from_score(score: f64) -> Self {
        if score >= 0.85 {
            ReliabilityCategory::HighlyReliable
        } else if score >= 0.70 {
            ReliabilityCategory::Reliable
        } else if score >= 0.55 {
            ReliabilityCategory::ModeratelyReliable
        } else if score >= 0.40 {
            ReliabilityCategory::Questionable
        } else {
            ReliabilityCategory::Unreliable
        }
    }
}

impl std::fmt::Display for ReliabilityCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReliabilityCategory::HighlyReliable => "highly_reliable",
            ReliabilityCategory::Reliable => "reliable",
            ReliabilityCategory::ModeratelyReliable => "moderately_reliable",
            ReliabilityCategory::Questionable => "questionable",
            ReliabilityCategory::Unreliable => "unreliable",
        };
        write!(f, "{}", s)
    }
}

/// One contribution to the final score, in application order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityFactor {
    pub factor: String,
    pub value: String,
    pub impact: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReliabilityAssessment {
    /// Always clamped to [0, 1]
    pub score: f64,
    pub category: ReliabilityCategory,
    pub factors: Vec<ReliabilityFactor>,
    pub warnings: Vec<String>,
    pub domain: Option<String>,
}

/// Messaging-channel source pattern used when no URL domain is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Newsletter,
    Broadcast,
    Group,
    Direct,
}

impl ChannelKind {
    fn base_score(self) -> f64 {
        match self {
            ChannelKind::Newsletter => 0.55,
            ChannelKind::Broadcast => 0.50,
            ChannelKind::Group => 0.45,
            ChannelKind::Direct => 0.50,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChannelKind::Newsletter => "newsletter",
            ChannelKind::Broadcast => "broadcast",
            ChannelKind::Group => "group",
            ChannelKind::Direct => "direct",
        }
    }
}

/// Who the content came from: a web domain, a messaging channel, an author.
#[derive(Debug, Clone, Default)]
pub struct SourceIdentity {
    pub domain: Option<String>,
    pub channel: Option<ChannelKind>,
    pub author: Option<String>,
}

impl SourceIdentity {
    /// History key: domain wins over author, author over channel.
    pub fn history_key(&self) -> String {
        if let Some(d) = &self.domain {
            return d.clone();
        }
        if let Some(a) = &self.author {
            return format!("author:{}", a);
        }
        match self.channel {
            Some(c) => format!("channel:{}", c.as_str()),
            None => "unknown".to_string(),
        }
    }
}

/// Static trust entry for a curated domain.
#[derive(Debug, Clone, Copy)]
pub struct DomainTrust {
    pub score: f64,
    pub kind: &'static str,
    pub name: &'static str,
}

// Curated source table. Scores are editorial judgments, not measurements;
// the history blend corrects for sources that drift over time.
const DOMAIN_TABLE: &[(&str, f64, &str, &str)] = &[
    // News agencies
    ("reuters.com", 0.92, "news_agency", "Reuters"),
    ("apnews.com", 0.92, "news_agency", "Associated Press"),
    ("afp.com", 0.90, "news_agency", "Agence France-Presse"),
    ("bloomberg.com", 0.87, "news_agency", "Bloomberg"),
    ("dpa.com", 0.87, "news_agency", "DPA"),
    // Broadcasters and newspapers
    ("bbc.com", 0.88, "newspaper", "BBC"),
    ("bbc.co.uk", 0.88, "newspaper", "BBC"),
    ("nytimes.com", 0.85, "newspaper", "The New York Times"),
    ("washingtonpost.com", 0.85, "newspaper", "The Washington Post"),
    ("theguardian.com", 0.84, "newspaper", "The Guardian"),
    ("wsj.com", 0.85, "newspaper", "The Wall Street Journal"),
    ("economist.com", 0.86, "newspaper", "The Economist"),
    ("ft.com", 0.86, "newspaper", "Financial Times"),
    ("npr.org", 0.84, "newspaper", "NPR"),
    // Regional sources (also consulted by the scraper for resolved domains)
    ("lemonde.fr", 0.85, "newspaper", "Le Monde"),
    ("spiegel.de", 0.83, "newspaper", "Der Spiegel"),
    ("elpais.com", 0.83, "newspaper", "El País"),
    ("asahi.com", 0.82, "newspaper", "Asahi Shimbun"),
    ("corriere.it", 0.80, "newspaper", "Corriere della Sera"),
    ("folha.uol.com.br", 0.78, "newspaper", "Folha de S.Paulo"),
    ("timesofindia.indiatimes.com", 0.72, "newspaper", "The Times of India"),
    // Government
    ("europa.eu", 0.88, "government", "European Union"),
    ("un.org", 0.88, "government", "United Nations"),
    ("who.int", 0.88, "government", "World Health Organization"),
    // Email providers (identity only says who relays, not who writes)
    ("gmail.com", 0.50, "email_provider", "Gmail"),
    ("outlook.com", 0.50, "email_provider", "Outlook"),
    ("yahoo.com", 0.45, "email_provider", "Yahoo Mail"),
    ("protonmail.com", 0.50, "email_provider", "Proton Mail"),
    // Social platforms
    ("twitter.com", 0.35, "social_media", "Twitter/X"),
    ("x.com", 0.35, "social_media", "Twitter/X"),
    ("facebook.com", 0.35, "social_media", "Facebook"),
    ("instagram.com", 0.32, "social_media", "Instagram"),
    ("tiktok.com", 0.30, "social_media", "TikTok"),
    ("t.me", 0.30, "social_media", "Telegram"),
    ("reddit.com", 0.40, "social_media", "Reddit"),
    ("medium.com", 0.45, "social_media", "Medium"),
    // Enterprise / institutional
    ("microsoft.com", 0.75, "enterprise", "Microsoft"),
    ("google.com", 0.75, "enterprise", "Google"),
    ("apple.com", 0.75, "enterprise", "Apple"),
    ("ibm.com", 0.72, "enterprise", "IBM"),
    ("nature.com", 0.90, "enterprise", "Nature"),
    ("arxiv.org", 0.78, "enterprise", "arXiv"),
];

/// Platforms that get a warning attached but no score penalty.
const LOW_TRUST_PLATFORMS: &[&str] = &["t.me", "tiktok.com", "4chan.org", "gab.com", "rumble.com"];

const HISTORY_LIMIT: usize = 20;
const HISTORY_DECAY: f64 = 0.9;
const HISTORY_WEIGHT: f64 = 0.3;

const MULTI_URL_PENALTY: f64 = -0.10;
const FORWARDED_PENALTY: f64 = -0.15;

/// Look up a curated domain, matching registrable suffixes so that
/// `www.reuters.com` and `live.reuters.com` resolve to `reuters.com`.
pub fn lookup_domain(domain: &str) -> Option<DomainTrust> {
    let domain = domain.to_lowercase();
    DOMAIN_TABLE
        .iter()
        .find(|(d, _, _, _)| domain == *d || domain.ends_with(&format!(".{}", d)))
        .map(|&(_, score, kind, name)| DomainTrust { score, kind, name })
}

/// Static trust score for a domain: curated table first, TLD fallback,
/// 0.5 for the unknown rest. The scraper uses this for resolved domains;
/// `SourceReputation::assess` layers history and penalties on top of it.
pub fn domain_base_score(domain: &str) -> f64 {
    if let Some(trust) = lookup_domain(domain) {
        return trust.score;
    }
    tld_score(domain).map(|(score, _)| score).unwrap_or(0.50)
}

/// TLD-level fallback for domains not in the curated table.
fn tld_score(domain: &str) -> Option<(f64, &'static str)> {
    let tld = domain.rsplit('.').next()?;
    match tld {
        "gov" | "mil" => Some((0.80, "government_tld")),
        "edu" => Some((0.75, "education_tld")),
        "int" => Some((0.70, "international_tld")),
        "org" => Some((0.60, "organization_tld")),
        _ => None,
    }
}

/// Count of http(s) URLs appearing in the content.
pub fn count_urls(content: &str) -> usize {
    content
        .split_whitespace()
        .filter(|w| w.starts_with("http://") || w.starts_with("https://"))
        .count()
}

fn has_forwarded_markers(content: &str) -> bool {
    let lower = content.to_lowercase();
    lower.contains("---------- forwarded message")
        || lower.contains("begin forwarded message")
        || lower.starts_with("fwd:")
        || lower.starts_with("fw:")
        || lower.contains("\nfwd:")
}

/// Source reputation service: static trust lookup blended with a per-source
/// score history. Owns its history map; construct once and share.
pub struct SourceReputation {
    history: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl SourceReputation {
    pub fn new() -> Self {
        Self {
            history: Mutex::new(HashMap::new()),
        }
    }

    /// Assess content from the given source.
    ///
    /// The current observation is the static base score plus deterministic
    /// penalties; the returned score blends it 70/30 with the exponentially
    /// weighted history for the same source key. The observation (not the
    /// blend) is recorded into the history.
    pub fn assess(&self, content: &str, identity: &SourceIdentity) -> ReliabilityAssessment {
        let mut factors = Vec::new();
        let mut warnings = Vec::new();

        // 1. Base score from domain, TLD, or channel pattern
        let base = if let Some(domain) = identity.domain.as_deref() {
            if let Some(trust) = lookup_domain(domain) {
                factors.push(ReliabilityFactor {
                    factor: "domain_reputation".to_string(),
                    value: format!("{} ({})", trust.name, trust.kind),
                    impact: trust.score,
                });
                trust.score
            } else if let Some((score, kind)) = tld_score(domain) {
                factors.push(ReliabilityFactor {
                    factor: "tld_reputation".to_string(),
                    value: kind.to_string(),
                    impact: score,
                });
                score
            } else {
                factors.push(ReliabilityFactor {
                    factor: "unknown_domain".to_string(),
                    value: domain.to_string(),
                    impact: 0.50,
                });
                0.50
            }
        } else if let Some(channel) = identity.channel {
            let score = channel.base_score();
            factors.push(ReliabilityFactor {
                factor: "channel_pattern".to_string(),
                value: channel.as_str().to_string(),
                impact: score,
            });
            score
        } else {
            factors.push(ReliabilityFactor {
                factor: "unknown_source".to_string(),
                value: String::new(),
                impact: 0.40,
            });
            0.40
        };

        // 2. Deterministic penalties
        let mut observation = base;

        let url_count = count_urls(content);
        if url_count > 2 {
            observation += MULTI_URL_PENALTY;
            factors.push(ReliabilityFactor {
                factor: "multiple_urls".to_string(),
                value: url_count.to_string(),
                impact: MULTI_URL_PENALTY,
            });
            warnings.push("aggregated content: message contains multiple links".to_string());
        }

        if has_forwarded_markers(content) {
            observation += FORWARDED_PENALTY;
            factors.push(ReliabilityFactor {
                factor: "forwarded_message".to_string(),
                value: "forwarded markers present".to_string(),
                impact: FORWARDED_PENALTY,
            });
            warnings.push("forwarded content: original source unclear".to_string());
        }

        let lower = content.to_lowercase();
        for platform in LOW_TRUST_PLATFORMS {
            let is_own_domain = identity
                .domain
                .as_deref()
                .map(|d| d == *platform || d.ends_with(&format!(".{}", platform)))
                .unwrap_or(false);
            if is_own_domain || lower.contains(platform) {
                warnings.push(format!("references low-trust platform: {}", platform));
                break;
            }
        }

        let observation = observation.clamp(0.0, 1.0);

        // 3. Blend with history, then record the observation
        let key = identity.history_key();
        let score = match self.historical_average(&key) {
            Some(hist) => {
                let blended = (1.0 - HISTORY_WEIGHT) * observation + HISTORY_WEIGHT * hist;
                factors.push(ReliabilityFactor {
                    factor: "source_history".to_string(),
                    value: format!("{:.2}", hist),
                    impact: blended - observation,
                });
                blended
            }
            None => observation,
        };
        let score = score.clamp(0.0, 1.0);

        self.record(&key, observation);
        debug!(
            "reliability: key={} base={:.2} observation={:.2} final={:.2}",
            key, base, observation, score
        );

        ReliabilityAssessment {
            score,
            category: ReliabilityCategory::from_score(score),
            factors,
            warnings,
            domain: identity.domain.clone(),
        }
    }

    /// Exponentially weighted average of recorded scores, decay 0.9 per step
    /// from newest to oldest.
    fn historical_average(&self, key: &str) -> Option<f64> {
        let history = self.history.lock().ok()?;
        let scores = history.get(key)?;
        if scores.is_empty() {
            return None;
        }
        let mut weight = 1.0;
        let mut weighted_sum = 0.0;
        let mut weight_sum = 0.0;
        for score in scores.iter().rev() {
            weighted_sum += weight * score;
            weight_sum += weight;
            weight *= HISTORY_DECAY;
        }
        Some(weighted_sum / weight_sum)
    }

    fn record(&self, key: &str, score: f64) {
        if let Ok(mut history) = self.history.lock() {
            let entry = history.entry(key.to_string()).or_default();
            entry.push_back(score);
            while entry.len() > HISTORY_LIMIT {
                entry.pop_front();
            }
        }
    }
}

impl Default for SourceReputation {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn domain_identity(domain: &str) -> SourceIdentity {
        SourceIdentity {
            domain: Some(domain.to_string()),
            channel: None,
            author: None,
        }
    }

    #[test]
    fn curated_domain_lookup_matches_subdomains() {
        assert!(lookup_domain("reuters.com").is_some());
        assert!(lookup_domain("www.reuters.com").is_some());
        assert!(lookup_domain("live.bbc.co.uk").is_some());
        assert!(lookup_domain("example.com").is_none());
        // No accidental suffix matching on unrelated domains
        assert!(lookup_domain("notreuters.com").is_none());
    }

    #[test]
    fn category_bands() {
        assert_eq!(ReliabilityCategory::from_score(0.9), ReliabilityCategory::HighlyReliable);
        assert_eq!(ReliabilityCategory::from_score(0.85), ReliabilityCategory::HighlyReliable);
        assert_eq!(ReliabilityCategory::from_score(0.75), ReliabilityCategory::Reliable);
        assert_eq!(ReliabilityCategory::from_score(0.60), ReliabilityCategory::ModeratelyReliable);
        assert_eq!(ReliabilityCategory::from_score(0.45), ReliabilityCategory::Questionable);
        assert_eq!(ReliabilityCategory::from_score(0.1), ReliabilityCategory::Unreliable);
    }

    #[test]
    fn penalties_reduce_base_score_and_warn() {
        let reputation = SourceReputation::new();
        let content = "Fwd: big news https://a.example https://b.example https://c.example";
        let assessment = reputation.assess(content, &domain_identity("reuters.com"));

        let base = lookup_domain("reuters.com").unwrap().score;
        // 3 URLs (-0.10) + forwarded markers (-0.15)
        assert!(assessment.score <= base - 0.25 + 1e-9);
        assert!(assessment.score < base);
        assert!(assessment
            .warnings
            .iter()
            .any(|w| w.contains("aggregated content")));
        assert!(assessment.warnings.iter().any(|w| w.contains("forwarded")));
        assert!(assessment
            .factors
            .iter()
            .any(|f| f.factor == "multiple_urls" && (f.impact - MULTI_URL_PENALTY).abs() < 1e-9));
    }

    #[test]
    fn score_always_clamped() {
        let reputation = SourceReputation::new();
        // Unknown source + every penalty stacked
        let content = "Fwd: ---------- Forwarded message ---------- \
                       https://a https://b https://c https://d https://e on t.me";
        for _ in 0..5 {
            let assessment = reputation.assess(
                content,
                &SourceIdentity {
                    domain: None,
                    channel: Some(ChannelKind::Group),
                    author: None,
                },
            );
            assert!((0.0..=1.0).contains(&assessment.score));
        }
    }

    #[test]
    fn history_blends_seventy_thirty() {
        let reputation = SourceReputation::new();
        let identity = domain_identity("example-blog.net");

        // First observation: unknown domain, no penalties -> 0.50, no history
        let first = reputation.assess("plain text update", &identity);
        assert!((first.score - 0.50).abs() < 1e-9);

        // Second observation carries penalties; blend pulls it back toward
        // the recorded 0.50 history: 0.7 * 0.25 + 0.3 * 0.50
        let content = "Fwd: look https://a https://b https://c";
        let second = reputation.assess(content, &identity);
        let expected = 0.7 * 0.25 + 0.3 * 0.50;
        assert!((second.score - expected).abs() < 1e-6);
        assert!(second.factors.iter().any(|f| f.factor == "source_history"));
    }

    #[test]
    fn history_is_capped_at_twenty() {
        let reputation = SourceReputation::new();
        let identity = domain_identity("cap-test.net");
        for _ in 0..30 {
            reputation.assess("hello", &identity);
        }
        let history = reputation.history.lock().unwrap();
        assert_eq!(history.get("cap-test.net").unwrap().len(), HISTORY_LIMIT);
    }

    #[test]
    fn tld_fallback_applies() {
        let reputation = SourceReputation::new();
        let assessment = reputation.assess("report", &domain_identity("records.census.gov"));
        assert!((assessment.score - 0.80).abs() < 1e-9);
        assert!(assessment.factors.iter().any(|f| f.factor == "tld_reputation"));
    }

    #[test]
    fn low_trust_platform_warns_without_penalty() {
        let reputation = SourceReputation::new();
        let assessment = reputation.assess(
            "see the clip on tiktok.com today",
            &domain_identity("nytimes.com"),
        );
        let base = lookup_domain("nytimes.com").unwrap().score;
        assert!((assessment.score - base).abs() < 1e-9);
        assert!(assessment.warnings.iter().any(|w| w.contains("low-trust")));
    }
}
