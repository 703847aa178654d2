use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::header::{ACCEPT, RETRY_AFTER};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::error::{AppError, Result};
use crate::shutdown::Shutdown;

const USER_AGENT_STRING: &str = "news-harvester/0.1";

/// Wait applied when a 429 carries no usable Retry-After.
pub const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(120);
pub const MIN_RETRY_AFTER: Duration = Duration::from_secs(30);
pub const MAX_RETRY_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Deserialize)]
struct SearchResponse {
    #[serde(default, deserialize_with = "null_as_default")]
    results: Vec<SearchEntry>,
}

/// One result row as returned by a SearXNG instance.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SearchEntry {
    #[serde(default, deserialize_with = "null_as_default")]
    pub url: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub title: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub content: String,
    #[serde(default)]
    pub thumbnail: Option<String>,
    #[serde(default)]
    pub img_src: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub engines: Vec<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub score: f64,
    #[serde(default, rename = "publishedDate")]
    pub published_date: Option<String>,
    #[serde(default)]
    pub pubdate: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parameters of a single search call.
#[derive(Debug, Clone, Copy)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    /// `None` searches without a category filter.
    pub category: Option<&'a str>,
    pub time_range: &'a str,
    pub page: u32,
    pub count: u32,
}

/// A search engine reachable at several interchangeable base URLs.
///
/// Implementations report HTTP 429 as [`AppError::RateLimited`] and must stop
/// promptly with [`AppError::Cancelled`] once `shutdown` fires.
pub trait SearchBackend: Send + Sync {
    fn search(
        &self,
        instance: &str,
        request: &SearchRequest<'_>,
        shutdown: &Shutdown,
    ) -> impl Future<Output = Result<Vec<SearchEntry>>> + Send;
}

pub struct SearxClient {
    client: Client,
    max_body_bytes: u64,
}

impl SearxClient {
    pub fn new(timeout: Duration, max_body_bytes: u64) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .user_agent(USER_AGENT_STRING)
            .build()?;
        Ok(Self {
            client,
            max_body_bytes,
        })
    }
}

impl SearchBackend for SearxClient {
    async fn search(
        &self,
        instance: &str,
        request: &SearchRequest<'_>,
        shutdown: &Shutdown,
    ) -> Result<Vec<SearchEntry>> {
        let url = search_url(instance, request)?;
        let send = self
            .client
            .get(url)
            .header(ACCEPT, "application/json")
            .send();

        let mut response = tokio::select! {
            res = send => res?,
            _ = shutdown.cancelled() => return Err(AppError::Cancelled),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let header = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok());
            return Err(AppError::RateLimited {
                instance: instance.to_string(),
                retry_after: retry_after_duration(header, Utc::now()),
            });
        }
        if !status.is_success() {
            return Err(AppError::BackendStatus {
                instance: instance.to_string(),
                status: status.as_u16(),
            });
        }

        let mut body = Vec::new();
        loop {
            let chunk = tokio::select! {
                res = response.chunk() => res?,
                _ = shutdown.cancelled() => return Err(AppError::Cancelled),
            };
            let Some(chunk) = chunk else { break };
            if (body.len() + chunk.len()) as u64 > self.max_body_bytes {
                return Err(anyhow::anyhow!(
                    "response from {} too large (over {} bytes)",
                    instance,
                    self.max_body_bytes
                )
                .into());
            }
            body.extend_from_slice(&chunk);
        }

        let parsed: SearchResponse = serde_json::from_slice(&body)?;
        tracing::debug!(
            instance,
            query = request.query,
            page = request.page,
            results = parsed.results.len(),
            "search page fetched"
        );
        Ok(parsed.results)
    }
}

/// `{base}/search?q=..&time_range=..&format=json&pageno=..&count=..[&categories=..]`
pub fn search_url(base: &str, request: &SearchRequest<'_>) -> Result<Url> {
    let mut url = Url::parse(base.trim()).map_err(|e| AppError::InvalidUrl(format!("{base}: {e}")))?;
    let path = format!("{}/search", url.path().trim_end_matches('/'));
    url.set_path(&path);
    {
        let mut query = url.query_pairs_mut();
        query
            .append_pair("q", request.query)
            .append_pair("time_range", request.time_range)
            .append_pair("format", "json")
            .append_pair("pageno", &request.page.to_string())
            .append_pair("count", &request.count.to_string());
        if let Some(category) = request.category {
            query.append_pair("categories", category);
        }
    }
    Ok(url)
}

/// Interpret a Retry-After header: delay in seconds or an HTTP date.
/// Missing or unreadable values fall back to two minutes; anything shorter
/// than 30 seconds is raised to 30 seconds, anything longer than a day is
/// cut to a day.
pub fn retry_after_duration(value: Option<&str>, now: DateTime<Utc>) -> Duration {
    let value = match value.map(str::trim) {
        Some(v) if !v.is_empty() => v,
        _ => return DEFAULT_RETRY_AFTER,
    };
    if let Ok(seconds) = value.parse::<i64>() {
        let seconds = u64::try_from(seconds).unwrap_or(0);
        return Duration::from_secs(seconds).clamp(MIN_RETRY_AFTER, MAX_RETRY_AFTER);
    }
    if let Ok(when) = DateTime::parse_from_rfc2822(value) {
        let wait = (when.with_timezone(&Utc) - now)
            .to_std()
            .unwrap_or(Duration::ZERO);
        return wait.clamp(MIN_RETRY_AFTER, MAX_RETRY_AFTER);
    }
    DEFAULT_RETRY_AFTER
}
