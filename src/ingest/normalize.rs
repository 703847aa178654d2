use chrono::{DateTime, NaiveDateTime, Utc};
use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{AppError, Result};
use crate::matcher;
use crate::models::NegativeRule;

const TITLE_TERM_BOOST: f64 = 0.35;
const CONTENT_TERM_BOOST: f64 = 0.10;
const MIN_TERM_CHARS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedUrl {
    pub normalized: String,
    pub hash: String,
    pub domain: String,
}

/// Canonical form used for deduplication: lower-cased scheme and host, no
/// query, no fragment, and `/` for an empty path. Only http(s) is accepted.
pub fn normalize_url(raw: &str) -> Result<NormalizedUrl> {
    let mut url = Url::parse(raw.trim()).map_err(|e| AppError::InvalidUrl(format!("{raw}: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(AppError::InvalidUrl(format!(
            "{raw}: unsupported scheme {}",
            url.scheme()
        )));
    }
    let domain = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| AppError::InvalidUrl(format!("{raw}: missing host")))?
        .to_lowercase();

    url.set_fragment(None);
    url.set_query(None);
    if url.path().is_empty() {
        url.set_path("/");
    }

    let normalized = url.to_string();
    let hash = hex::encode(Sha256::digest(normalized.as_bytes()));
    Ok(NormalizedUrl {
        normalized,
        hash,
        domain,
    })
}

/// First parseable date among the candidates, or `None`.
pub fn parse_published(candidates: &[Option<&str>]) -> Option<DateTime<Utc>> {
    candidates
        .iter()
        .flatten()
        .map(|v| v.trim())
        .filter(|v| !v.is_empty() && *v != "null")
        .find_map(parse_date)
}

fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(|naive| naive.and_utc())
}

/// Extra score for query terms that show up in the title or content.
pub fn term_boost(query: &str, title: &str, content: &str) -> f64 {
    let title = title.to_lowercase();
    let content = content.to_lowercase();
    query
        .to_lowercase()
        .split_whitespace()
        .filter(|term| term.chars().count() >= MIN_TERM_CHARS)
        .map(|term| {
            let mut boost = 0.0;
            if title.contains(term) {
                boost += TITLE_TERM_BOOST;
            }
            if content.contains(term) {
                boost += CONTENT_TERM_BOOST;
            }
            boost
        })
        .sum()
}

/// Sum of penalties of the rules matching the article, and which rules matched.
pub fn compute_penalty(
    rules: &[NegativeRule],
    title: &str,
    content: &str,
    domain: &str,
    url: &str,
) -> (f64, Vec<i64>) {
    let mut penalty = 0.0;
    let mut matched = Vec::new();
    for rule in rules {
        if matcher::matches(&rule.pattern, title, content, domain, url) {
            penalty += rule.penalty;
            if rule.id > 0 {
                matched.push(rule.id);
            }
        }
    }
    (penalty, matched)
}

/// Backends sometimes send the literal string "null" for a missing image.
pub fn clean_thumbnail(candidates: &[Option<&str>]) -> String {
    candidates
        .iter()
        .flatten()
        .map(|v| v.trim())
        .find(|v| !v.is_empty())
        .filter(|v| *v != "null")
        .unwrap_or_default()
        .to_string()
}
