mod dedupe;
mod repository;
mod schema;
mod scoring;

pub use repository::Repository;

#[cfg(test)]
pub(crate) mod test_support {
    use chrono::Utc;
    use tempfile::TempDir;

    use super::Repository;
    use crate::ingest::normalize::normalize_url;
    use crate::models::ArticleHit;

    pub async fn test_repo() -> (TempDir, Repository) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let repo = Repository::new(path.to_str().unwrap()).await.unwrap();
        (dir, repo)
    }

    /// A plain sighting: weight 1, one engine, no backend score, no boost.
    pub fn hit(url: &str, title: &str) -> ArticleHit {
        let normalized = normalize_url(url).unwrap();
        ArticleHit {
            url: url.to_string(),
            normalized_url: normalized.normalized,
            url_hash: normalized.hash,
            title: title.to_string(),
            content: format!("{title} content"),
            thumbnail_url: "https://img.example/thumb.png".to_string(),
            source_domain: normalized.domain,
            published_at: None,
            ingested_at: Utc::now(),
            topic_id: None,
            topic_weight: 1.0,
            engine_count: 1,
            searx_score: 0.0,
            term_boost: 0.0,
            penalty: 0.0,
        }
    }
}
