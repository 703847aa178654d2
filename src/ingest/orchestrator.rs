use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;

use crate::config::Config;
use crate::db::Repository;
use crate::error::{AppError, Result};
use crate::models::{ArticleHit, DedupeStats, NegativeRule, Topic};
use crate::scheduler::Runner;
use crate::shutdown::Shutdown;

use super::blocks::InstanceBlocks;
use super::normalize::{clean_thumbnail, compute_penalty, normalize_url, parse_published, term_boost};
use super::searx::{SearchBackend, SearchEntry, SearchRequest, SearxClient};

const HARVEST_CATEGORIES: [Option<&str>; 2] = [Some("news"), None];
const HARVEST_TIME_RANGES: [&str; 2] = ["day", "week"];
const HARVEST_PAGES: [u32; 2] = [1, 2];
const HARVEST_PAGE_SIZE: u32 = 50;

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunSummary {
    pub topics: usize,
    pub failed_topics: usize,
    pub fetched_entries: usize,
    pub stored: usize,
    pub dedupe: DedupeStats,
    pub auto_hidden: usize,
    pub culled: usize,
}

/// Pulls every enabled topic from the search backend and merges the results
/// into the article store.
pub struct Ingester<B: SearchBackend = SearxClient> {
    config: Config,
    repo: Arc<Repository>,
    backend: B,
    blocks: InstanceBlocks,
    progress: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl Ingester<SearxClient> {
    pub fn new(config: Config, repo: Arc<Repository>) -> Result<Self> {
        let backend = SearxClient::new(
            Duration::from_secs(config.request_timeout_seconds),
            config.max_body_bytes,
        )?;
        Ok(Self::with_backend(config, repo, backend))
    }
}

impl<B: SearchBackend> Ingester<B> {
    pub fn with_backend(config: Config, repo: Arc<Repository>, backend: B) -> Self {
        Self {
            config,
            repo,
            backend,
            blocks: InstanceBlocks::new(),
            progress: Mutex::new(None),
        }
    }

    /// Most recent progress message and when it was recorded.
    pub fn last_progress(&self) -> Option<(String, DateTime<Utc>)> {
        self.progress
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn progress(&self, message: String) {
        tracing::info!("{}", message);
        *self.progress.lock().unwrap_or_else(|e| e.into_inner()) = Some((message, Utc::now()));
    }

    pub async fn run(&self, shutdown: &Shutdown) -> Result<RunSummary> {
        let started = Instant::now();
        let topics = self.repo.list_enabled_topics().await?;
        if topics.is_empty() {
            self.progress("ingest: no enabled topics; skipping".to_string());
            return Ok(RunSummary::default());
        }
        self.progress(format!("ingest: started with {} topic(s)", topics.len()));

        let rules = self.repo.list_enabled_negative_rules().await?;
        let ingested_at = Utc::now();
        let mut summary = RunSummary {
            topics: topics.len(),
            ..RunSummary::default()
        };
        let mut last_error = None;
        let mut rule_counts: HashMap<i64, i64> = HashMap::new();

        for (i, topic) in topics.iter().enumerate() {
            if i > 0 {
                let pause = self.inter_topic_pause();
                self.progress(format!(
                    "ingest: sleeping {}s before next topic ({}/{})",
                    pause.as_secs(),
                    i + 1,
                    topics.len()
                ));
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.cancelled() => return Err(AppError::Cancelled),
                }
            }

            let topic_started = Instant::now();
            let entries = match self.fetch_topic(&topic.query, shutdown).await {
                Ok(entries) => entries,
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) => {
                    summary.failed_topics += 1;
                    self.progress(format!("ingest: topic={:?} error={}", topic.query, e));
                    last_error = Some(e.to_string());
                    continue;
                }
            };
            summary.fetched_entries += entries.len();

            for entry in &entries {
                let Some((hit, matched)) = build_hit(topic, &rules, entry, ingested_at) else {
                    continue;
                };
                match self.repo.upsert_article_hit(hit).await {
                    Ok(_) => {
                        summary.stored += 1;
                        for id in matched {
                            *rule_counts.entry(id).or_default() += 1;
                        }
                    }
                    Err(e) => tracing::warn!(url = %entry.url, error = %e, "ingest: upsert failed"),
                }
            }
            self.progress(format!(
                "ingest: topic done ({}/{}) query={:?} results={} took={}ms",
                i + 1,
                topics.len(),
                topic.query,
                entries.len(),
                topic_started.elapsed().as_millis()
            ));
        }

        self.finish_run(ingested_at, rule_counts, &mut summary).await;

        self.progress(format!(
            "ingest: all done in {}ms (topics={}, fetched_entries={}, failed_topics={})",
            started.elapsed().as_millis(),
            summary.topics,
            summary.fetched_entries,
            summary.failed_topics
        ));

        if summary.failed_topics == summary.topics {
            return Err(AppError::AllTopicsFailed {
                failed: summary.failed_topics,
                total: summary.topics,
                last_error: last_error.unwrap_or_else(|| "unknown fetch error".to_string()),
            });
        }
        Ok(summary)
    }

    /// Post-run maintenance. Failures are logged and do not fail the run.
    async fn finish_run(
        &self,
        ingested_at: DateTime<Utc>,
        rule_counts: HashMap<i64, i64>,
        summary: &mut RunSummary,
    ) {
        if self.config.dedupe_after_ingest {
            match self
                .repo
                .hide_ingest_title_duplicates(ingested_at, self.config.dedupe_title_key_chars)
                .await
            {
                Ok(stats) => summary.dedupe = stats,
                Err(e) => tracing::error!(error = %e, "ingest: dedupe failed"),
            }
        }

        if self.config.auto_hide_enabled() {
            let floor = self.config.auto_hide_below_score;
            match self.repo.hide_unread_below_score(floor).await {
                Ok(n) => {
                    summary.auto_hidden = n;
                    if n > 0 {
                        self.progress(format!(
                            "ingest: auto-hidden {n} unread article(s) with score < {floor:.2}"
                        ));
                    }
                }
                Err(e) => tracing::error!(error = %e, "ingest: auto-hide failed"),
            }
        }

        if let Err(e) = self.repo.increment_rule_applied_counts(rule_counts).await {
            tracing::error!(error = %e, "ingest: rule counter update failed");
        }

        if self.config.cull_unread_days > 0 {
            match self
                .repo
                .cull_old_unread(self.config.cull_unread_days, self.config.cull_max_score)
                .await
            {
                Ok(n) => {
                    summary.culled = n;
                    if n > 0 {
                        self.progress(format!("cull: deleted {n} old unread low-score articles"));
                    }
                }
                Err(e) => tracing::error!(error = %e, "cull failed"),
            }
        }
    }

    fn inter_topic_pause(&self) -> Duration {
        let jitter = rand::rng().random_range(0..=self.config.per_query_jitter_seconds);
        Duration::from_secs(self.config.per_query_delay_seconds + jitter)
    }

    /// Try instances in random order until one yields results.
    async fn fetch_topic(&self, query: &str, shutdown: &Shutdown) -> Result<Vec<SearchEntry>> {
        let mut instances = self.config.instances();
        instances.shuffle(&mut rand::rng());

        let mut rate_limited = 0;
        let mut last_error = None;
        for instance in &instances {
            if let Some(remaining) = self.blocks.remaining(instance) {
                rate_limited += 1;
                last_error = Some(AppError::InstanceBlocked {
                    instance: instance.clone(),
                    remaining,
                });
                continue;
            }
            match self.fetch_harvest_from_instance(instance, query, shutdown).await {
                Ok(results) if !results.is_empty() => return Ok(results),
                Ok(_) => tracing::debug!(instance = %instance, query, "no results"),
                Err(AppError::Cancelled) => return Err(AppError::Cancelled),
                Err(e) if e.is_rate_limit() => {
                    if let AppError::RateLimited { retry_after, .. } = &e {
                        self.blocks.block(instance, *retry_after);
                    }
                    rate_limited += 1;
                    tracing::warn!(error = %e, "instance blocked");
                    last_error = Some(e);
                }
                Err(e) => {
                    tracing::warn!(instance = %instance, error = %e, "instance failed");
                    last_error = Some(e);
                }
            }
        }

        if !instances.is_empty() && rate_limited == instances.len() {
            return Err(AppError::AllInstancesRateLimited);
        }
        Err(last_error.unwrap_or(AppError::NoInstanceAvailable))
    }

    /// Every category/time-range/page combination from one instance,
    /// deduplicated by raw URL. A 429 aborts the whole harvest.
    async fn fetch_harvest_from_instance(
        &self,
        instance: &str,
        query: &str,
        shutdown: &Shutdown,
    ) -> Result<Vec<SearchEntry>> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        let mut last_error = None;

        for category in HARVEST_CATEGORIES {
            for time_range in HARVEST_TIME_RANGES {
                for page in HARVEST_PAGES {
                    let request = SearchRequest {
                        query,
                        category,
                        time_range,
                        page,
                        count: HARVEST_PAGE_SIZE,
                    };
                    match self.backend.search(instance, &request, shutdown).await {
                        Ok(results) => {
                            for entry in results {
                                let key = entry.url.trim().to_string();
                                if !key.is_empty() && seen.insert(key) {
                                    out.push(entry);
                                }
                            }
                        }
                        Err(e @ (AppError::RateLimited { .. } | AppError::Cancelled)) => {
                            return Err(e)
                        }
                        Err(e) => last_error = Some(e),
                    }
                }
            }
        }

        match last_error {
            Some(e) if out.is_empty() => Err(e),
            _ => Ok(out),
        }
    }
}

/// Turn one backend entry into a store write, plus the ids of the rules it
/// matched. Entries without a usable URL or title are dropped.
fn build_hit(
    topic: &Topic,
    rules: &[NegativeRule],
    entry: &SearchEntry,
    ingested_at: DateTime<Utc>,
) -> Option<(ArticleHit, Vec<i64>)> {
    let title = entry.title.trim();
    if title.is_empty() {
        return None;
    }
    let url = normalize_url(&entry.url).ok()?;
    let content = entry.content.trim();

    let (penalty, matched) = compute_penalty(rules, title, content, &url.domain, &entry.url);
    let hit = ArticleHit {
        url: entry.url.trim().to_string(),
        normalized_url: url.normalized,
        url_hash: url.hash,
        title: title.to_string(),
        content: content.to_string(),
        thumbnail_url: clean_thumbnail(&[entry.thumbnail.as_deref(), entry.img_src.as_deref()]),
        source_domain: url.domain,
        published_at: parse_published(&[entry.published_date.as_deref(), entry.pubdate.as_deref()]),
        ingested_at,
        topic_id: Some(topic.id),
        topic_weight: topic.weight,
        engine_count: entry.engines.len() as i64,
        searx_score: entry.score,
        term_boost: term_boost(&topic.query, title, content),
        penalty,
    };
    Some((hit, matched))
}

impl<B: SearchBackend + 'static> Runner for Ingester<B> {
    async fn run(&self, shutdown: &Shutdown) -> Result<()> {
        Ingester::run(self, shutdown).await.map(|_| ())
    }
}
