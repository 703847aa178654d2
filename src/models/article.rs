use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArticleStatus {
    #[default]
    Unread,
    Seen,
    Read,
    Useful,
    Hidden,
}

impl ArticleStatus {
    pub const ALL: [ArticleStatus; 5] = [
        ArticleStatus::Unread,
        ArticleStatus::Seen,
        ArticleStatus::Read,
        ArticleStatus::Useful,
        ArticleStatus::Hidden,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ArticleStatus::Unread => "unread",
            ArticleStatus::Seen => "seen",
            ArticleStatus::Read => "read",
            ArticleStatus::Useful => "useful",
            ArticleStatus::Hidden => "hidden",
        }
    }

    /// Statuses reachable from `self`. Nothing ever leads back to unread.
    pub fn allowed_targets(&self) -> &'static [ArticleStatus] {
        use ArticleStatus::*;
        match self {
            Unread => &[Seen, Read, Useful, Hidden],
            Seen => &[Read, Useful, Hidden],
            Read => &[Useful, Hidden],
            Useful | Hidden => &[],
        }
    }

    pub fn can_transition_to(&self, target: ArticleStatus) -> bool {
        self.allowed_targets().contains(&target)
    }
}

impl fmt::Display for ArticleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ArticleStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ArticleStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AppError::InvalidInput(format!("unknown article status {s:?}")))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Article {
    pub id: i64,
    pub url: String,
    pub normalized_url: String,
    pub url_hash: String,
    pub title: String,
    pub content: String,
    pub thumbnail_url: String,
    pub source_domain: String,
    /// Falls back to `ingested_at` when the backend gave no date.
    pub published_at: DateTime<Utc>,
    pub ingested_at: DateTime<Utc>,
    pub status: ArticleStatus,
    pub score: f64,
    pub hit_count: i64,
    pub engine_count: i64,
    pub searx_score: f64,
}

/// One sighting of an article by the ingester, ready to be merged into the store.
#[derive(Debug, Clone)]
pub struct ArticleHit {
    pub url: String,
    pub normalized_url: String,
    pub url_hash: String,
    pub title: String,
    pub content: String,
    pub thumbnail_url: String,
    pub source_domain: String,
    pub published_at: Option<DateTime<Utc>>,
    pub ingested_at: DateTime<Utc>,
    pub topic_id: Option<i64>,
    pub topic_weight: f64,
    pub engine_count: i64,
    pub searx_score: f64,
    pub term_boost: f64,
    pub penalty: f64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatusCounts {
    pub unread: i64,
    pub seen: i64,
    pub read: i64,
    pub useful: i64,
    pub hidden: i64,
}

impl StatusCounts {
    pub fn add(&mut self, status: ArticleStatus, count: i64) {
        match status {
            ArticleStatus::Unread => self.unread += count,
            ArticleStatus::Seen => self.seen += count,
            ArticleStatus::Read => self.read += count,
            ArticleStatus::Useful => self.useful += count,
            ArticleStatus::Hidden => self.hidden += count,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DedupeStats {
    pub same_batch_hidden: i64,
    pub historical_hidden: i64,
}

impl DedupeStats {
    pub fn total(&self) -> i64 {
        self.same_batch_hidden + self.historical_hidden
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unread_reaches_every_triage_status() {
        for target in [
            ArticleStatus::Seen,
            ArticleStatus::Read,
            ArticleStatus::Useful,
            ArticleStatus::Hidden,
        ] {
            assert!(ArticleStatus::Unread.can_transition_to(target));
        }
    }

    #[test]
    fn nothing_returns_to_unread() {
        for status in ArticleStatus::ALL {
            assert!(!status.can_transition_to(ArticleStatus::Unread));
        }
    }

    #[test]
    fn terminal_statuses_stay_put() {
        assert!(!ArticleStatus::Hidden.can_transition_to(ArticleStatus::Useful));
        assert!(!ArticleStatus::Useful.can_transition_to(ArticleStatus::Hidden));
        assert!(!ArticleStatus::Read.can_transition_to(ArticleStatus::Seen));
    }

    #[test]
    fn status_string_round_trip() {
        for status in ArticleStatus::ALL {
            assert_eq!(status.as_str().parse::<ArticleStatus>().unwrap(), status);
        }
        assert!("archived".parse::<ArticleStatus>().is_err());
    }
}
