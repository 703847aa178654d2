//! Title-based duplicate detection.
//!
//! Two keys are used. The dedupe key (letters and digits only, truncated)
//! groups near-identical headlines for hiding at ingestion time. The looser
//! subject key only collapses repeats while a feed page is built and never
//! touches stored state.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rusqlite::params;

use crate::config::MIN_DEDUPE_KEY_CHARS;
use crate::error::Result;
use crate::models::DedupeStats;

use super::repository::{add_to_setting, format_timestamp, Repository, DEDUPE_HIDDEN_TOTAL};

/// Lower-cased letters and digits of `title`, cut to `max_chars` characters.
pub fn dedupe_title_key(title: &str, max_chars: usize) -> String {
    title
        .trim()
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric())
        .take(max_chars)
        .collect()
}

/// Lower-cased letters and digits with every other run collapsed to a space.
pub fn subject_key(title: &str) -> String {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|word| !word.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[derive(Debug, Clone)]
pub struct DedupeCandidate {
    pub id: i64,
    pub title: String,
    pub score: f64,
}

/// Decide which unread candidates to hide.
///
/// Groups whose key also belongs to an already-triaged article are hidden
/// entirely. Other groups keep their best member (highest score, then
/// lowest id) and hide the rest.
pub fn plan_title_dedupe<'a>(
    candidates: Vec<DedupeCandidate>,
    triaged_titles: impl IntoIterator<Item = &'a str>,
    key_chars: usize,
) -> (Vec<i64>, DedupeStats) {
    let key_chars = key_chars.max(MIN_DEDUPE_KEY_CHARS);

    let mut groups: HashMap<String, Vec<DedupeCandidate>> = HashMap::new();
    for candidate in candidates {
        let key = dedupe_title_key(&candidate.title, key_chars);
        if key.is_empty() {
            continue;
        }
        groups.entry(key).or_default().push(candidate);
    }
    if groups.is_empty() {
        return (Vec::new(), DedupeStats::default());
    }

    let historical: HashSet<String> = triaged_titles
        .into_iter()
        .map(|title| dedupe_title_key(title, key_chars))
        .filter(|key| groups.contains_key(key))
        .collect();

    let mut hide = Vec::new();
    let mut stats = DedupeStats::default();
    for (key, mut items) in groups {
        if historical.contains(&key) {
            stats.historical_hidden += items.len() as i64;
            hide.extend(items.iter().map(|item| item.id));
            continue;
        }
        if items.len() < 2 {
            continue;
        }
        items.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        stats.same_batch_hidden += (items.len() - 1) as i64;
        hide.extend(items[1..].iter().map(|item| item.id));
    }
    hide.sort_unstable();
    (hide, stats)
}

impl Repository {
    /// Dedupe among unread articles touched by the run stamped `ingested_at`.
    pub async fn hide_ingest_title_duplicates(
        &self,
        ingested_at: DateTime<Utc>,
        key_chars: usize,
    ) -> Result<DedupeStats> {
        self.dedupe_pass(Some(format_timestamp(ingested_at)), key_chars)
            .await
    }

    /// Dedupe across every unread article.
    pub async fn hide_all_unread_title_duplicates(&self, key_chars: usize) -> Result<DedupeStats> {
        self.dedupe_pass(None, key_chars).await
    }

    async fn dedupe_pass(&self, run_stamp: Option<String>, key_chars: usize) -> Result<DedupeStats> {
        let stats = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let candidates = {
                    let mut stmt = tx.prepare(
                        r#"SELECT id, title, score FROM articles
                           WHERE status = 'unread' AND (?1 IS NULL OR ingested_at = ?1)"#,
                    )?;
                    let rows = stmt
                        .query_map(params![run_stamp], |row| {
                            Ok(DedupeCandidate {
                                id: row.get(0)?,
                                title: row.get(1)?,
                                score: row.get(2)?,
                            })
                        })?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                };
                if candidates.is_empty() {
                    return Ok(DedupeStats::default());
                }

                let triaged = {
                    let mut stmt = tx.prepare("SELECT title FROM articles WHERE status <> 'unread'")?;
                    let rows = stmt
                        .query_map([], |row| row.get::<_, String>(0))?
                        .collect::<std::result::Result<Vec<_>, _>>()?;
                    rows
                };

                let (hide, stats) =
                    plan_title_dedupe(candidates, triaged.iter().map(String::as_str), key_chars);
                if hide.is_empty() {
                    return Ok(stats);
                }

                {
                    let mut stmt = tx.prepare(
                        r#"UPDATE articles SET status = 'hidden', updated_at = datetime('now')
                           WHERE id = ?1 AND status = 'unread'"#,
                    )?;
                    for id in &hide {
                        stmt.execute(params![id])?;
                    }
                }
                add_to_setting(&tx, DEDUPE_HIDDEN_TOTAL, stats.total())?;
                tx.commit()?;
                Ok(stats)
            })
            .await?;

        if stats.total() > 0 {
            tracing::info!(
                same_batch = stats.same_batch_hidden,
                historical = stats.historical_hidden,
                "hid duplicate titles"
            );
        }
        Ok(stats)
    }
}
