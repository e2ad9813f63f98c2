//! Fact quality scoring.
//!
//! ```text
//! quality = clamp01((0.4·confidence + 0.3·reputation + 0.15·0.8 + 0.15·relevance)
//!                   × (1 − age_penalty))
//! ```
//!
//! The domain table and phrase indicators are hard-coded so that a score is
//! reproducible from the fact alone.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const CONFIDENCE_WEIGHT: f64 = 0.4;
const REPUTATION_WEIGHT: f64 = 0.3;
const CONSISTENCY_WEIGHT: f64 = 0.15;
const RELEVANCE_WEIGHT: f64 = 0.15;
const EXTRACTION_CONSISTENCY: f64 = 0.8;

const UNKNOWN_DOMAIN: f64 = 0.6;
const MISSING_URL: f64 = 0.5;
const BASE_RELEVANCE: f64 = 0.7;

const TRUSTED_DOMAINS: &[(&str, f64)] = &[
    ("tesla.com", 0.95),
    ("nrel.gov", 0.9),
    ("eia.gov", 0.9),
    ("energy.gov", 0.9),
    ("doe.gov", 0.9),
    ("irena.org", 0.85),
    ("iea.org", 0.85),
    ("lazard.com", 0.8),
    ("bloomberg.com", 0.75),
    ("greentechmedia.com", 0.7),
    ("pv-magazine.com", 0.7),
    ("energystorage.news", 0.65),
];

/// Phrases found in the span.
const SPAN_PHRASES: &[(&str, f64)] = &[
    ("official specification", 0.2),
    ("technical datasheet", 0.15),
    ("manufacturer specification", 0.15),
    ("certified performance", 0.1),
    ("laboratory tested", 0.1),
    ("independently verified", 0.1),
    ("according to", 0.05),
    ("as per", 0.05),
    ("approximately", -0.1),
    ("around", -0.1),
    ("roughly", -0.1),
    ("estimated", -0.15),
    ("rumored", -0.3),
    ("allegedly", -0.3),
    ("unconfirmed", -0.3),
    ("speculation", -0.4),
];

/// Phrases found in either the span or the document title.
const CONTEXT_PHRASES: &[(&str, f64)] = &[
    ("table", 0.1),
    ("specification", 0.1),
    ("datasheet", 0.15),
    ("manual", 0.1),
    ("documentation", 0.05),
    ("press release", -0.05),
    ("blog", -0.1),
    ("forum", -0.2),
];

/// Everything the scorer looks at for one candidate.
#[derive(Debug, Clone, Default)]
pub struct QualityInput<'a> {
    pub confidence: f64,
    pub source_url: Option<&'a str>,
    pub span: &'a str,
    pub title: Option<&'a str>,
    pub published_at: Option<DateTime<Utc>>,
    pub extracted_at: Option<DateTime<Utc>>,
}

/// Component scores, kept for logging and the API.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityBreakdown {
    pub confidence: f64,
    pub reputation: f64,
    pub relevance: f64,
    pub age_penalty: f64,
    pub overall: f64,
}

pub fn score(input: &QualityInput<'_>) -> QualityBreakdown {
    let confidence = clamp01(input.confidence);
    let reputation = domain_reputation(input.source_url);
    let relevance = context_relevance(input.span, input.title);
    let age_penalty = match (input.published_at, input.extracted_at) {
        (Some(published), Some(extracted)) => age_penalty(published, extracted),
        _ => 0.0,
    };

    let weighted = CONFIDENCE_WEIGHT * confidence
        + REPUTATION_WEIGHT * reputation
        + CONSISTENCY_WEIGHT * EXTRACTION_CONSISTENCY
        + RELEVANCE_WEIGHT * relevance;

    QualityBreakdown {
        confidence,
        reputation,
        relevance,
        age_penalty,
        overall: clamp01(weighted * (1.0 - age_penalty)),
    }
}

/// Reputation of the URL's host. Subdomains inherit their parent's score
/// and a leading `www.` is ignored.
pub fn domain_reputation(source_url: Option<&str>) -> f64 {
    let Some(raw) = source_url.filter(|u| !u.trim().is_empty()) else {
        return MISSING_URL;
    };
    let Some(host) = url::Url::parse(raw.trim())
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_ascii_lowercase()))
    else {
        return MISSING_URL;
    };
    let host = host.strip_prefix("www.").unwrap_or(&host);

    TRUSTED_DOMAINS
        .iter()
        .find(|(domain, _)| {
            host == *domain
                || host
                    .strip_suffix(domain)
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
        .map(|(_, s)| *s)
        .unwrap_or(UNKNOWN_DOMAIN)
}

pub fn context_relevance(span: &str, title: Option<&str>) -> f64 {
    let span = span.to_lowercase();
    let title = title.unwrap_or_default().to_lowercase();

    let mut relevance = BASE_RELEVANCE;
    for (phrase, delta) in SPAN_PHRASES {
        if span.contains(phrase) {
            relevance += delta;
        }
    }
    for (phrase, delta) in CONTEXT_PHRASES {
        if span.contains(phrase) || title.contains(phrase) {
            relevance += delta;
        }
    }
    clamp01(relevance)
}

/// `min(0.5, 0.05 × age_years)`; zero for documents dated after extraction.
pub fn age_penalty(published_at: DateTime<Utc>, extracted_at: DateTime<Utc>) -> f64 {
    let seconds = (extracted_at - published_at).num_seconds();
    if seconds <= 0 {
        return 0.0;
    }
    let years = seconds as f64 / (365.25 * 86_400.0);
    (0.05 * years).min(0.5)
}

fn clamp01(x: f64) -> f64 {
    if x.is_nan() {
        0.0
    } else {
        x.clamp(0.0, 1.0)
    }
}
