use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, OptionalExtension, Row};
use tokio_rusqlite::Connection;

use crate::error::{AppError, Result};
use crate::matcher;
use crate::models::{
    effective_penalty, Article, ArticleHit, ArticleStatus, NegativeRule, NewNegativeRule,
    NewTopic, StatusCounts, Topic, TopicStats,
};

use super::dedupe::subject_key;
use super::schema::{ADDED_COLUMNS, PRAGMAS, SCHEMA};
use super::scoring::{hit_contribution, HIDE_PENALTY, USEFUL_BONUS};

pub(super) const DEDUPE_HIDDEN_TOTAL: &str = "dedupe_hidden_total";

const ARTICLE_COLUMNS: &str = r#"id, url, normalized_url, url_hash, title, content, thumbnail_url,
    source_domain, COALESCE(published_at, ingested_at), ingested_at,
    status, score, hit_count, engine_count, searx_score"#;

/// Outcome of saving a negative rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RuleUpdate {
    pub id: i64,
    /// Change in effective penalty versus what was stored before.
    pub delta: f64,
    /// Unread articles whose score moved by `-delta`.
    pub matched: i64,
}

pub struct Repository {
    pub(super) conn: Connection,
}

impl Repository {
    pub async fn new(db_path: &str) -> Result<Self> {
        let conn = Connection::open(db_path).await?;

        conn.call(|conn| {
            conn.execute_batch(PRAGMAS)?;
            conn.execute_batch(SCHEMA)?;
            for (table, column, ddl) in ADDED_COLUMNS {
                ensure_column(conn, table, column, ddl)?;
            }
            Ok(())
        })
        .await?;

        Ok(Self { conn })
    }

    // Topic operations

    pub async fn list_topics(&self) -> Result<Vec<Topic>> {
        self.query_topics("SELECT id, query, weight, enabled FROM topics ORDER BY id")
            .await
    }

    pub async fn list_enabled_topics(&self) -> Result<Vec<Topic>> {
        self.query_topics(
            "SELECT id, query, weight, enabled FROM topics WHERE enabled = 1 ORDER BY id",
        )
        .await
    }

    async fn query_topics(&self, sql: &'static str) -> Result<Vec<Topic>> {
        let topics = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let topics = stmt
                    .query_map([], topic_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(topics)
            })
            .await?;
        Ok(topics)
    }

    /// Insert a topic, or update weight/enabled of the topic with the same query.
    pub async fn upsert_topic(&self, topic: NewTopic) -> Result<i64> {
        let query = topic.query.trim().to_string();
        if query.is_empty() {
            return Err(AppError::InvalidInput("empty topic query".to_string()));
        }
        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"INSERT INTO topics (query, weight, enabled)
                       VALUES (?1, ?2, ?3)
                       ON CONFLICT(query) DO UPDATE SET
                           weight = excluded.weight,
                           enabled = excluded.enabled,
                           updated_at = datetime('now')"#,
                    params![query, topic.weight, topic.enabled],
                )?;
                let id: i64 = tx.query_row(
                    "SELECT id FROM topics WHERE query = ?1",
                    params![query],
                    |row| row.get(0),
                )?;
                tx.commit()?;
                Ok(id)
            })
            .await?;
        Ok(id)
    }

    /// Deletes the topic; its article associations go with it.
    pub async fn delete_topic(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute("DELETE FROM article_topics WHERE topic_id = ?1", params![id])?;
                let n = tx.execute("DELETE FROM topics WHERE id = ?1", params![id])?;
                tx.commit()?;
                Ok(n > 0)
            })
            .await?;
        Ok(deleted)
    }

    pub async fn topic_stats(&self) -> Result<HashMap<i64, TopicStats>> {
        let stats = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    r#"SELECT at.topic_id,
                              COUNT(*),
                              SUM(CASE WHEN a.status = 'unread' THEN 1 ELSE 0 END)
                       FROM article_topics at
                       JOIN articles a ON a.id = at.article_id
                       GROUP BY at.topic_id"#,
                )?;
                let stats = stmt
                    .query_map([], |row| {
                        Ok((
                            row.get::<_, i64>(0)?,
                            TopicStats {
                                total: row.get(1)?,
                                unread: row.get(2)?,
                            },
                        ))
                    })?
                    .collect::<std::result::Result<HashMap<_, _>, _>>()?;
                Ok(stats)
            })
            .await?;
        Ok(stats)
    }

    // Negative rule operations

    pub async fn list_negative_rules(&self) -> Result<Vec<NegativeRule>> {
        self.query_rules(
            "SELECT id, pattern, penalty, enabled, applied_count FROM negative_rules ORDER BY id",
        )
        .await
    }

    pub async fn list_enabled_negative_rules(&self) -> Result<Vec<NegativeRule>> {
        self.query_rules(
            "SELECT id, pattern, penalty, enabled, applied_count FROM negative_rules WHERE enabled = 1 ORDER BY id",
        )
        .await
    }

    async fn query_rules(&self, sql: &'static str) -> Result<Vec<NegativeRule>> {
        let rules = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(sql)?;
                let rules = stmt
                    .query_map([], rule_from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rules)
            })
            .await?;
        Ok(rules)
    }

    /// Save a rule and retroactively apply the change in its effective
    /// penalty to unread articles, all in one transaction.
    pub async fn upsert_negative_rule(&self, rule: NewNegativeRule) -> Result<RuleUpdate> {
        let pattern = matcher::normalize_pattern(&rule.pattern);
        if pattern.is_empty() {
            return Err(AppError::InvalidInput("empty pattern".to_string()));
        }
        let update = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let update = save_rule(&tx, &pattern, rule.penalty, rule.enabled)?;
                tx.commit()?;
                Ok(update)
            })
            .await?;

        tracing::info!(
            rule_id = update.id,
            delta = update.delta,
            matched = update.matched,
            "negative rule saved"
        );
        Ok(update)
    }

    pub async fn delete_negative_rule(&self, id: i64) -> Result<bool> {
        let deleted = self
            .conn
            .call(move |conn| {
                let n = conn.execute("DELETE FROM negative_rules WHERE id = ?1", params![id])?;
                Ok(n > 0)
            })
            .await?;
        Ok(deleted)
    }

    /// Add per-rule match counts gathered during an ingestion run.
    pub async fn increment_rule_applied_counts(&self, counts: HashMap<i64, i64>) -> Result<()> {
        if counts.is_empty() {
            return Ok(());
        }
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                {
                    let mut stmt = tx.prepare(
                        r#"UPDATE negative_rules
                           SET applied_count = applied_count + ?1, updated_at = datetime('now')
                           WHERE id = ?2"#,
                    )?;
                    for (id, n) in counts {
                        if id > 0 && n > 0 {
                            stmt.execute(params![n, id])?;
                        }
                    }
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    // Article operations

    /// Merge one sighting into the store. New URLs are inserted; known URLs
    /// accumulate score and hit count. Returns the article id.
    pub async fn upsert_article_hit(&self, hit: ArticleHit) -> Result<i64> {
        let contribution = hit_contribution(&hit);
        let id = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"INSERT INTO articles (url, normalized_url, url_hash, title, content, thumbnail_url,
                                             source_domain, published_at, ingested_at, status, score,
                                             hit_count, engine_count, searx_score)
                       VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 'unread', ?10, 1, ?11, ?12)
                       ON CONFLICT(url_hash) DO UPDATE SET
                           title = excluded.title,
                           content = excluded.content,
                           thumbnail_url = CASE WHEN excluded.thumbnail_url <> ''
                                                THEN excluded.thumbnail_url
                                                ELSE articles.thumbnail_url END,
                           source_domain = excluded.source_domain,
                           published_at = COALESCE(articles.published_at, excluded.published_at),
                           ingested_at = excluded.ingested_at,
                           score = articles.score + excluded.score,
                           hit_count = articles.hit_count + 1,
                           engine_count = MAX(articles.engine_count, excluded.engine_count),
                           searx_score = MAX(articles.searx_score, excluded.searx_score),
                           updated_at = datetime('now')"#,
                    params![
                        hit.url,
                        hit.normalized_url,
                        hit.url_hash,
                        hit.title,
                        hit.content,
                        hit.thumbnail_url,
                        hit.source_domain,
                        hit.published_at.map(format_timestamp),
                        format_timestamp(hit.ingested_at),
                        contribution,
                        hit.engine_count,
                        hit.searx_score,
                    ],
                )?;
                let id: i64 = tx.query_row(
                    "SELECT id FROM articles WHERE url_hash = ?1",
                    params![hit.url_hash],
                    |row| row.get(0),
                )?;
                if let Some(topic_id) = hit.topic_id {
                    tx.execute(
                        "INSERT OR IGNORE INTO article_topics (article_id, topic_id) VALUES (?1, ?2)",
                        params![id, topic_id],
                    )?;
                }
                tx.commit()?;
                Ok(id)
            })
            .await?;
        Ok(id)
    }

    #[allow(dead_code)]
    pub async fn get_article(&self, id: i64) -> Result<Option<Article>> {
        let article = self
            .conn
            .call(move |conn| {
                let sql = format!("SELECT {ARTICLE_COLUMNS} FROM articles WHERE id = ?1");
                let article = conn
                    .query_row(&sql, params![id], article_from_row)
                    .optional()?;
                Ok(article)
            })
            .await?;
        Ok(article)
    }

    /// Highest-scoring unread articles, skipping repeated subjects. The
    /// underlying query reads a wider window to make up for skipped rows,
    /// so a page can still come back short when duplicates are dense.
    pub async fn fetch_top_unread(&self, limit: usize, min_score: f64) -> Result<Vec<Article>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let window = limit.saturating_mul(6).clamp(50, 600) as i64;
        let articles = self
            .conn
            .call(move |conn| {
                let sql = format!(
                    r#"SELECT {ARTICLE_COLUMNS}
                       FROM articles
                       WHERE status = 'unread' AND score >= ?1
                       ORDER BY score DESC, COALESCE(published_at, ingested_at) DESC, id DESC
                       LIMIT ?2"#
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt.query(params![min_score, window])?;

                let mut out = Vec::with_capacity(limit.min(window as usize));
                let mut seen_subjects = HashSet::new();
                while let Some(row) = rows.next()? {
                    let article = article_from_row(row)?;
                    let key = subject_key(&article.title);
                    if !key.is_empty() && !seen_subjects.insert(key) {
                        continue;
                    }
                    out.push(article);
                    if out.len() >= limit {
                        break;
                    }
                }
                Ok(out)
            })
            .await?;
        Ok(articles)
    }

    /// Mark unread articles as seen. Rows in any other status are left alone.
    pub async fn mark_seen(&self, ids: Vec<i64>) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let updated = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let mut updated = 0;
                {
                    let mut stmt = tx.prepare(
                        r#"UPDATE articles
                           SET status = 'seen', last_seen_at = datetime('now'), updated_at = datetime('now')
                           WHERE id = ?1 AND status = 'unread'"#,
                    )?;
                    for id in ids {
                        updated += stmt.execute(params![id])?;
                    }
                }
                tx.commit()?;
                Ok(updated)
            })
            .await?;
        Ok(updated)
    }

    /// Move an article to `target` and adjust its score, if the transition
    /// table allows it. Returns false (and changes nothing) otherwise.
    pub async fn set_status(
        &self,
        id: i64,
        target: ArticleStatus,
        score_delta: f64,
    ) -> Result<bool> {
        let changed = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let changed = transition(&tx, id, target, score_delta)?;
                tx.commit()?;
                Ok(changed)
            })
            .await?;

        if !changed {
            tracing::debug!(article_id = id, status = %target, "status transition rejected");
        }
        Ok(changed)
    }

    pub async fn mark_useful(&self, id: i64) -> Result<bool> {
        self.set_status(id, ArticleStatus::Useful, USEFUL_BONUS).await
    }

    pub async fn hide_article(&self, id: i64) -> Result<bool> {
        self.set_status(id, ArticleStatus::Hidden, -HIDE_PENALTY).await
    }

    pub async fn mark_read(&self, id: i64) -> Result<bool> {
        self.set_status(id, ArticleStatus::Read, 0.0).await
    }

    /// Hide an article and add an enabled rule so similar articles are
    /// penalized from now on. Both land in one transaction.
    pub async fn hide_with_rule(&self, id: i64, pattern: &str, penalty: f64) -> Result<bool> {
        let pattern = matcher::normalize_pattern(pattern);
        if pattern.is_empty() {
            return Err(AppError::InvalidInput("empty pattern".to_string()));
        }
        let (update, hidden) = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let update = save_rule(&tx, &pattern, penalty, true)?;
                let hidden = transition(&tx, id, ArticleStatus::Hidden, -penalty)?;
                tx.commit()?;
                Ok((update, hidden))
            })
            .await?;

        tracing::info!(
            article_id = id,
            rule_id = update.id,
            matched = update.matched,
            hidden,
            "article hidden with rule"
        );
        Ok(hidden)
    }

    pub async fn status_counts(&self) -> Result<StatusCounts> {
        let counts = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM articles GROUP BY status")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        let mut out = StatusCounts::default();
        for (status, count) in counts {
            if let Ok(status) = status.parse::<ArticleStatus>() {
                out.add(status, count);
            }
        }
        Ok(out)
    }

    /// Hide every unread article scoring below `threshold`.
    pub async fn hide_unread_below_score(&self, threshold: f64) -> Result<usize> {
        let hidden = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let n = tx.execute(
                    r#"UPDATE articles
                       SET status = 'hidden', updated_at = datetime('now')
                       WHERE status = 'unread' AND score < ?1"#,
                    params![threshold],
                )?;
                tx.commit()?;
                Ok(n)
            })
            .await?;
        Ok(hidden)
    }

    /// Delete unread articles ingested more than `older_than_days` ago whose
    /// score is at or below `max_score`.
    pub async fn cull_old_unread(&self, older_than_days: u32, max_score: f64) -> Result<usize> {
        let cutoff = format_timestamp(Utc::now() - Duration::days(i64::from(older_than_days)));
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    r#"DELETE FROM article_topics WHERE article_id IN (
                           SELECT id FROM articles
                           WHERE status = 'unread' AND score <= ?1 AND ingested_at < ?2)"#,
                    params![max_score, cutoff],
                )?;
                let n = tx.execute(
                    r#"DELETE FROM articles
                       WHERE status = 'unread' AND score <= ?1 AND ingested_at < ?2"#,
                    params![max_score, cutoff],
                )?;
                tx.commit()?;
                Ok(n)
            })
            .await?;
        Ok(deleted)
    }

    // Settings

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        let value = self
            .conn
            .call(move |conn| {
                let value = conn
                    .query_row(
                        "SELECT value FROM app_settings WHERE key = ?1",
                        params![key],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(value)
            })
            .await?;
        Ok(value)
    }

    pub async fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        let (key, value) = (key.to_string(), value.to_string());
        self.conn
            .call(move |conn| {
                conn.execute(
                    r#"INSERT INTO app_settings (key, value) VALUES (?1, ?2)
                       ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = datetime('now')"#,
                    params![key, value],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// Integer setting, or `default` when missing or not a number.
    pub async fn get_setting_i64(&self, key: &str, default: i64) -> Result<i64> {
        Ok(self
            .get_setting(key)
            .await?
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default))
    }

    pub async fn add_to_setting_i64(&self, key: &str, delta: i64) -> Result<()> {
        if delta == 0 {
            return Ok(());
        }
        let key = key.to_string();
        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                add_to_setting(&tx, &key, delta)?;
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    pub async fn dedupe_hidden_total(&self) -> Result<i64> {
        self.get_setting_i64(DEDUPE_HIDDEN_TOTAL, 0).await
    }
}

fn ensure_column(
    conn: &rusqlite::Connection,
    table: &str,
    column: &str,
    ddl: &str,
) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let exists = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<std::result::Result<Vec<_>, _>>()?
        .iter()
        .any(|name| name == column);
    if !exists {
        tracing::info!(table, column, "adding missing column");
        conn.execute_batch(&format!("ALTER TABLE {table} ADD COLUMN {column} {ddl}"))?;
    }
    Ok(())
}

/// Insert or update a rule, then move matching unread articles by the change
/// in its effective penalty.
fn save_rule(
    conn: &rusqlite::Connection,
    pattern: &str,
    penalty: f64,
    enabled: bool,
) -> rusqlite::Result<RuleUpdate> {
    let previous: Option<(f64, bool)> = conn
        .query_row(
            "SELECT penalty, enabled FROM negative_rules WHERE pattern = ?1",
            params![pattern],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;

    conn.execute(
        r#"INSERT INTO negative_rules (pattern, penalty, enabled)
           VALUES (?1, ?2, ?3)
           ON CONFLICT(pattern) DO UPDATE SET
               penalty = excluded.penalty,
               enabled = excluded.enabled,
               updated_at = datetime('now')"#,
        params![pattern, penalty, enabled],
    )?;
    let id: i64 = conn.query_row(
        "SELECT id FROM negative_rules WHERE pattern = ?1",
        params![pattern],
        |row| row.get(0),
    )?;

    let before = previous
        .map(|(penalty, enabled)| effective_penalty(penalty, enabled))
        .unwrap_or(0.0);
    let delta = effective_penalty(penalty, enabled) - before;
    let matched = if delta == 0.0 {
        0
    } else {
        apply_rule_delta(conn, pattern, delta)?
    };
    Ok(RuleUpdate { id, delta, matched })
}

/// Apply `target` if the transition table allows it from the current status.
fn transition(
    conn: &rusqlite::Connection,
    id: i64,
    target: ArticleStatus,
    score_delta: f64,
) -> rusqlite::Result<bool> {
    let current: Option<String> = conn
        .query_row(
            "SELECT status FROM articles WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )
        .optional()?;
    let allowed = current
        .and_then(|s| s.parse::<ArticleStatus>().ok())
        .is_some_and(|status| status.can_transition_to(target));
    if !allowed {
        return Ok(false);
    }
    conn.execute(
        r#"UPDATE articles
           SET status = ?1, score = score + ?2, updated_at = datetime('now')
           WHERE id = ?3"#,
        params![target.as_str(), score_delta, id],
    )?;
    Ok(true)
}

/// Move every unread article matching `pattern` by `-delta`. A positive
/// delta also counts the matches against the rule.
fn apply_rule_delta(conn: &rusqlite::Connection, pattern: &str, delta: f64) -> rusqlite::Result<i64> {
    let unread = {
        let mut stmt = conn.prepare(
            "SELECT id, title, content, source_domain, url FROM articles WHERE status = 'unread'",
        )?;
        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows
    };

    let mut stmt = conn.prepare(
        "UPDATE articles SET score = score - ?1, updated_at = datetime('now') WHERE id = ?2",
    )?;
    let mut matched = 0i64;
    for (id, title, content, domain, url) in &unread {
        if matcher::matches(pattern, title, content, domain, url) {
            stmt.execute(params![delta, id])?;
            matched += 1;
        }
    }

    if matched > 0 && delta > 0.0 {
        conn.execute(
            r#"UPDATE negative_rules
               SET applied_count = applied_count + ?1, updated_at = datetime('now')
               WHERE pattern = ?2"#,
            params![matched, pattern],
        )?;
    }
    Ok(matched)
}

pub(super) fn add_to_setting(conn: &rusqlite::Connection, key: &str, delta: i64) -> rusqlite::Result<()> {
    conn.execute(
        r#"INSERT INTO app_settings (key, value) VALUES (?1, CAST(?2 AS TEXT))
           ON CONFLICT(key) DO UPDATE SET
               value = CAST(CAST(app_settings.value AS INTEGER) + ?2 AS TEXT),
               updated_at = datetime('now')"#,
        params![key, delta],
    )?;
    Ok(())
}

/// Timestamps are stored as fixed-width UTC RFC3339 so they compare as text.
pub fn format_timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    // RFC3339 first (what we write), e.g. "2026-01-11T12:34:56.000Z"
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    // SQLite datetime('now') format, e.g. "2026-01-11 12:34:56"
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return Some(naive.and_utc());
    }
    None
}

fn timestamp_column(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    Ok(row
        .get::<_, Option<String>>(idx)?
        .and_then(|s| parse_datetime(&s))
        .unwrap_or_else(Utc::now))
}

fn topic_from_row(row: &Row) -> rusqlite::Result<Topic> {
    Ok(Topic {
        id: row.get(0)?,
        query: row.get(1)?,
        weight: row.get(2)?,
        enabled: row.get(3)?,
    })
}

fn rule_from_row(row: &Row) -> rusqlite::Result<NegativeRule> {
    Ok(NegativeRule {
        id: row.get(0)?,
        pattern: row.get(1)?,
        penalty: row.get(2)?,
        enabled: row.get(3)?,
        applied_count: row.get(4)?,
    })
}

fn article_from_row(row: &Row) -> rusqlite::Result<Article> {
    let status = row
        .get::<_, String>(10)?
        .parse::<ArticleStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(10, Type::Text, Box::new(e)))?;
    Ok(Article {
        id: row.get(0)?,
        url: row.get(1)?,
        normalized_url: row.get(2)?,
        url_hash: row.get(3)?,
        title: row.get(4)?,
        content: row.get(5)?,
        thumbnail_url: row.get(6)?,
        source_domain: row.get(7)?,
        published_at: timestamp_column(row, 8)?,
        ingested_at: timestamp_column(row, 9)?,
        status,
        score: row.get(11)?,
        hit_count: row.get(12)?,
        engine_count: row.get(13)?,
        searx_score: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::{hit, test_repo};
    use tokio_test::assert_ok;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    async fn score_of(repo: &Repository, id: i64) -> f64 {
        repo.get_article(id).await.unwrap().unwrap().score
    }

    async fn status_of(repo: &Repository, id: i64) -> ArticleStatus {
        repo.get_article(id).await.unwrap().unwrap().status
    }

    #[tokio::test]
    async fn reingest_accumulates_score_and_hits() {
        let (_dir, repo) = test_repo().await;
        let first = hit("https://example.com/story?utm=1", "Fed raises rates");
        let contribution = hit_contribution(&first);

        let id = repo.upsert_article_hit(first).await.unwrap();
        let before = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(before.hit_count, 1);
        assert!(approx(before.score, contribution));

        let mut second = hit("https://EXAMPLE.com/story#comments", "Fed raises rates again");
        second.engine_count = 4;
        second.thumbnail_url = String::new();
        let again = hit_contribution(&second);
        let id2 = repo.upsert_article_hit(second).await.unwrap();
        assert_eq!(id, id2);

        let after = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(after.hit_count, 2);
        assert!(approx(after.score, before.score + again));
        assert_eq!(after.title, "Fed raises rates again");
        assert_eq!(after.engine_count, 4);
        assert_eq!(after.thumbnail_url, before.thumbnail_url);
    }

    #[tokio::test]
    async fn published_time_falls_back_and_is_preserved() {
        let (_dir, repo) = test_repo().await;
        let undated = hit("https://example.com/a", "Undated story");
        let ingested = undated.ingested_at;
        let id = repo.upsert_article_hit(undated).await.unwrap();
        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(format_timestamp(article.published_at), format_timestamp(ingested));

        let published = Utc::now() - Duration::days(2);
        let mut dated = hit("https://example.com/a", "Undated story");
        dated.published_at = Some(published);
        repo.upsert_article_hit(dated).await.unwrap();
        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(format_timestamp(article.published_at), format_timestamp(published));

        let mut later = hit("https://example.com/a", "Undated story");
        later.published_at = Some(Utc::now());
        repo.upsert_article_hit(later).await.unwrap();
        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(format_timestamp(article.published_at), format_timestamp(published));
    }

    #[tokio::test]
    async fn rule_edit_applies_only_the_delta() {
        let (_dir, repo) = test_repo().await;
        let crypto = repo
            .upsert_article_hit(hit("https://a.example/1", "Crypto markets surge"))
            .await
            .unwrap();
        let other = repo
            .upsert_article_hit(hit("https://a.example/2", "Weather report"))
            .await
            .unwrap();
        let seen = repo
            .upsert_article_hit(hit("https://a.example/3", "Crypto exchange fined"))
            .await
            .unwrap();
        repo.mark_seen(vec![seen]).await.unwrap();

        let score = |id| score_of(&repo, id);
        let crypto_before = score(crypto).await;
        let other_before = score(other).await;
        let seen_before = score(seen).await;

        let update = repo
            .upsert_negative_rule(NewNegativeRule {
                pattern: "Crypto".to_string(),
                penalty: 5.0,
                enabled: true,
            })
            .await
            .unwrap();
        assert!(approx(update.delta, 5.0));
        assert_eq!(update.matched, 1);
        assert!(approx(score(crypto).await, crypto_before - 5.0));
        assert!(approx(score(other).await, other_before));
        assert!(approx(score(seen).await, seen_before));

        let rules = repo.list_negative_rules().await.unwrap();
        assert_eq!(rules[0].pattern, "crypto");
        assert_eq!(rules[0].applied_count, 1);

        // Same value again: nothing moves.
        let noop = repo
            .upsert_negative_rule(NewNegativeRule {
                pattern: "crypto".to_string(),
                penalty: 5.0,
                enabled: true,
            })
            .await
            .unwrap();
        assert_eq!(noop.delta, 0.0);
        assert!(approx(score(crypto).await, crypto_before - 5.0));

        // Disable gives the penalty back, re-enable takes it again.
        repo.upsert_negative_rule(NewNegativeRule {
            pattern: "crypto".to_string(),
            penalty: 5.0,
            enabled: false,
        })
        .await
        .unwrap();
        assert!(approx(score(crypto).await, crypto_before));

        repo.upsert_negative_rule(NewNegativeRule {
            pattern: "crypto".to_string(),
            penalty: 5.0,
            enabled: true,
        })
        .await
        .unwrap();
        assert!(approx(score(crypto).await, crypto_before - 5.0));

        let rules = repo.list_negative_rules().await.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].applied_count, 2);
    }

    #[tokio::test]
    async fn lowering_a_penalty_does_not_count_applications() {
        let (_dir, repo) = test_repo().await;
        repo.upsert_article_hit(hit("https://a.example/1", "Crypto scam"))
            .await
            .unwrap();
        let rule = NewNegativeRule {
            pattern: "crypto".to_string(),
            penalty: 5.0,
            enabled: true,
        };
        repo.upsert_negative_rule(rule.clone()).await.unwrap();
        let lowered = repo
            .upsert_negative_rule(NewNegativeRule { penalty: 2.0, ..rule })
            .await
            .unwrap();
        assert!(approx(lowered.delta, -3.0));
        assert_eq!(lowered.matched, 1);
        assert_eq!(repo.list_negative_rules().await.unwrap()[0].applied_count, 1);
    }

    #[tokio::test]
    async fn empty_rule_pattern_is_rejected() {
        let (_dir, repo) = test_repo().await;
        let err = repo
            .upsert_negative_rule(NewNegativeRule {
                pattern: " + ".to_string(),
                penalty: 1.0,
                enabled: true,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn applied_counts_batch_increment() {
        let (_dir, repo) = test_repo().await;
        let a = repo
            .upsert_negative_rule(NewNegativeRule {
                pattern: "alpha".to_string(),
                penalty: 1.0,
                enabled: true,
            })
            .await
            .unwrap();
        let b = repo
            .upsert_negative_rule(NewNegativeRule {
                pattern: "beta".to_string(),
                penalty: 1.0,
                enabled: true,
            })
            .await
            .unwrap();
        let counts = HashMap::from([(a.id, 3), (b.id, 0), (-1, 7)]);
        assert_ok!(repo.increment_rule_applied_counts(counts).await);

        let rules = repo.list_negative_rules().await.unwrap();
        assert_eq!(rules[0].applied_count, 3);
        assert_eq!(rules[1].applied_count, 0);
    }

    #[tokio::test]
    async fn cull_respects_age_and_score() {
        let (_dir, repo) = test_repo().await;
        let old_ingest = Utc::now() - Duration::days(31);

        let mut low = hit("https://a.example/low", "Old low story");
        low.ingested_at = old_ingest;
        let low = repo.upsert_article_hit(low).await.unwrap();

        let mut kept = hit("https://a.example/kept", "Old better story");
        kept.ingested_at = old_ingest;
        let kept = repo.upsert_article_hit(kept).await.unwrap();

        let fresh = repo
            .upsert_article_hit(hit("https://a.example/new", "Fresh story"))
            .await
            .unwrap();

        // Contributions are positive; pull the scores to the boundary.
        for (id, target) in [(low, 0.0), (kept, 0.1), (fresh, 0.0)] {
            let current = repo.get_article(id).await.unwrap().unwrap().score;
            set_score(&repo, id, target - current).await;
        }

        let deleted = repo.cull_old_unread(30, 0.0).await.unwrap();
        assert_eq!(deleted, 1);
        assert!(repo.get_article(low).await.unwrap().is_none());
        assert!(repo.get_article(kept).await.unwrap().is_some());
        assert!(repo.get_article(fresh).await.unwrap().is_some());
    }

    async fn set_score(repo: &Repository, id: i64, delta: f64) {
        repo.conn
            .call(move |conn| {
                conn.execute(
                    "UPDATE articles SET score = score + ?1 WHERE id = ?2",
                    params![delta, id],
                )?;
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn auto_hide_only_touches_unread_below_threshold() {
        let (_dir, repo) = test_repo().await;
        let low = repo
            .upsert_article_hit(hit("https://a.example/1", "Low story"))
            .await
            .unwrap();
        let seen_low = repo
            .upsert_article_hit(hit("https://a.example/2", "Seen low story"))
            .await
            .unwrap();
        let high = repo
            .upsert_article_hit(hit("https://a.example/3", "High story"))
            .await
            .unwrap();
        set_score(&repo, low, -10.0).await;
        set_score(&repo, seen_low, -10.0).await;
        repo.mark_seen(vec![seen_low]).await.unwrap();

        assert_eq!(repo.hide_unread_below_score(1.0).await.unwrap(), 1);
        let status = |id| status_of(&repo, id);
        assert_eq!(status(low).await, ArticleStatus::Hidden);
        assert_eq!(status(seen_low).await, ArticleStatus::Seen);
        assert_eq!(status(high).await, ArticleStatus::Unread);
    }

    #[tokio::test]
    async fn status_transitions_follow_table() {
        let (_dir, repo) = test_repo().await;
        let id = repo
            .upsert_article_hit(hit("https://a.example/1", "Some story"))
            .await
            .unwrap();
        let start = repo.get_article(id).await.unwrap().unwrap().score;

        assert_eq!(repo.mark_seen(vec![id, id]).await.unwrap(), 1);
        assert!(repo.mark_useful(id).await.unwrap());
        let useful = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(useful.status, ArticleStatus::Useful);
        assert!(approx(useful.score, start + USEFUL_BONUS));

        // Useful is terminal.
        assert!(!repo.hide_article(id).await.unwrap());
        assert!(!repo.set_status(id, ArticleStatus::Unread, 0.0).await.unwrap());
        assert!(!repo.mark_read(9999).await.unwrap());
        let still = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(still.status, ArticleStatus::Useful);
        assert!(approx(still.score, useful.score));
    }

    #[tokio::test]
    async fn reingest_never_revives_triaged_article() {
        let (_dir, repo) = test_repo().await;
        let id = repo
            .upsert_article_hit(hit("https://a.example/1", "Some story"))
            .await
            .unwrap();
        repo.hide_article(id).await.unwrap();
        repo.upsert_article_hit(hit("https://a.example/1", "Some story"))
            .await
            .unwrap();
        let article = repo.get_article(id).await.unwrap().unwrap();
        assert_eq!(article.status, ArticleStatus::Hidden);
        assert_eq!(article.hit_count, 2);
    }

    #[tokio::test]
    async fn hide_with_rule_penalizes_and_hides() {
        let (_dir, repo) = test_repo().await;
        let target = repo
            .upsert_article_hit(hit("https://a.example/1", "Celebrity gossip roundup"))
            .await
            .unwrap();
        repo.mark_seen(vec![target]).await.unwrap();
        let sibling = repo
            .upsert_article_hit(hit("https://a.example/2", "More gossip today"))
            .await
            .unwrap();
        let target_before = repo.get_article(target).await.unwrap().unwrap().score;
        let sibling_before = repo.get_article(sibling).await.unwrap().unwrap().score;

        assert!(repo.hide_with_rule(target, "gossip", 3.0).await.unwrap());

        let target_after = repo.get_article(target).await.unwrap().unwrap();
        assert_eq!(target_after.status, ArticleStatus::Hidden);
        assert!(approx(target_after.score, target_before - 3.0));
        let sibling_after = repo.get_article(sibling).await.unwrap().unwrap();
        assert!(approx(sibling_after.score, sibling_before - 3.0));
    }

    #[tokio::test]
    async fn hide_with_rule_failure_saves_nothing() {
        let (_dir, repo) = test_repo().await;
        let target = repo
            .upsert_article_hit(hit("https://a.example/1", "Celebrity gossip roundup"))
            .await
            .unwrap();
        let sibling = repo
            .upsert_article_hit(hit("https://a.example/2", "More gossip today"))
            .await
            .unwrap();
        let sibling_before = repo.get_article(sibling).await.unwrap().unwrap().score;
        repo.conn
            .call(|conn| {
                conn.execute_batch(
                    r#"CREATE TRIGGER refuse_hide BEFORE UPDATE OF status ON articles
                       WHEN NEW.status = 'hidden'
                       BEGIN SELECT RAISE(ABORT, 'hide refused'); END;"#,
                )?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(repo.hide_with_rule(target, "gossip", 3.0).await.is_err());

        assert!(repo.list_negative_rules().await.unwrap().is_empty());
        let target_after = repo.get_article(target).await.unwrap().unwrap();
        assert_eq!(target_after.status, ArticleStatus::Unread);
        let sibling_after = repo.get_article(sibling).await.unwrap().unwrap();
        assert!(approx(sibling_after.score, sibling_before));
    }

    #[tokio::test]
    async fn feed_accepts_huge_limit() {
        let (_dir, repo) = test_repo().await;
        repo.upsert_article_hit(hit("https://a.example/1", "Only story"))
            .await
            .unwrap();

        let articles = assert_ok!(repo.fetch_top_unread(usize::MAX, -100.0).await);
        assert_eq!(articles.len(), 1);
    }

    #[tokio::test]
    async fn feed_skips_repeated_subjects_without_mutating() {
        let (_dir, repo) = test_repo().await;
        let mut best = hit("https://a.example/1", "Fed raises rates");
        best.searx_score = 8.0;
        let best = repo.upsert_article_hit(best).await.unwrap();
        let twin = repo
            .upsert_article_hit(hit("https://b.example/1", "FED  raises -- rates!"))
            .await
            .unwrap();
        let other = repo
            .upsert_article_hit(hit("https://c.example/1", "Unrelated news"))
            .await
            .unwrap();

        let page = repo.fetch_top_unread(10, -100.0).await.unwrap();
        let ids: Vec<i64> = page.iter().map(|a| a.id).collect();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0], best);
        assert!(ids.contains(&other));

        let twin = repo.get_article(twin).await.unwrap().unwrap();
        assert_eq!(twin.status, ArticleStatus::Unread);

        let first_only = repo.fetch_top_unread(1, -100.0).await.unwrap();
        assert_eq!(first_only.len(), 1);
        assert!(repo.fetch_top_unread(10, 1000.0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn topics_upsert_stats_and_cascade() {
        let (_dir, repo) = test_repo().await;
        let id = repo
            .upsert_topic(NewTopic {
                query: " rust async ".to_string(),
                weight: 1.0,
                enabled: true,
            })
            .await
            .unwrap();
        let same = repo
            .upsert_topic(NewTopic {
                query: "rust async".to_string(),
                weight: 2.5,
                enabled: false,
            })
            .await
            .unwrap();
        assert_eq!(id, same);
        let topics = repo.list_topics().await.unwrap();
        assert_eq!(topics.len(), 1);
        assert_eq!(topics[0].weight, 2.5);
        assert!(repo.list_enabled_topics().await.unwrap().is_empty());

        let mut tagged = hit("https://a.example/1", "Tokio release");
        tagged.topic_id = Some(id);
        let article = repo.upsert_article_hit(tagged).await.unwrap();
        repo.mark_seen(vec![article]).await.unwrap();
        let stats = repo.topic_stats().await.unwrap();
        assert_eq!(stats[&id], TopicStats { unread: 0, total: 1 });

        assert!(repo.delete_topic(id).await.unwrap());
        assert!(repo.topic_stats().await.unwrap().is_empty());
        assert!(repo.get_article(article).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn settings_counters_accumulate() {
        let (_dir, repo) = test_repo().await;
        assert_eq!(repo.get_setting_i64("n", 7).await.unwrap(), 7);
        repo.add_to_setting_i64("n", 3).await.unwrap();
        repo.add_to_setting_i64("n", 4).await.unwrap();
        assert_eq!(repo.get_setting_i64("n", 0).await.unwrap(), 7);

        repo.set_setting("name", "value").await.unwrap();
        assert_eq!(repo.get_setting("name").await.unwrap().as_deref(), Some("value"));
        assert_eq!(repo.get_setting_i64("name", 5).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn status_counts_group_by_status() {
        let (_dir, repo) = test_repo().await;
        let a = repo
            .upsert_article_hit(hit("https://a.example/1", "One"))
            .await
            .unwrap();
        repo.upsert_article_hit(hit("https://a.example/2", "Two"))
            .await
            .unwrap();
        repo.hide_article(a).await.unwrap();

        let counts = repo.status_counts().await.unwrap();
        assert_eq!(counts.unread, 1);
        assert_eq!(counts.hidden, 1);
        assert_eq!(counts.seen, 0);
    }

    #[tokio::test]
    async fn reopening_keeps_data_and_schema() {
        let (dir, repo) = test_repo().await;
        repo.upsert_article_hit(hit("https://a.example/1", "Persisted"))
            .await
            .unwrap();
        drop(repo);

        let path = dir.path().join("test.db");
        let reopened = Repository::new(path.to_str().unwrap()).await.unwrap();
        assert_eq!(reopened.status_counts().await.unwrap().unread, 1);
    }
}
