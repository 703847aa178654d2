use crate::models::ArticleHit;

/// Scores are never written below this value. Later rule deltas may push a
/// stored score further down; that is not re-clamped.
pub const SCORE_FLOOR: f64 = -10.0;

const BASE_HIT: f64 = 1.0;
const PER_ENGINE: f64 = 0.25;
const PER_BACKEND_POINT: f64 = 0.25;

/// Score delta applied to `useful` feedback.
pub const USEFUL_BONUS: f64 = 1.0;
/// Score delta applied when the reader hides an article.
pub const HIDE_PENALTY: f64 = 2.5;

/// Contribution of a single sighting to an article's score.
pub fn hit_contribution(hit: &ArticleHit) -> f64 {
    let raw = BASE_HIT
        + hit.topic_weight
        + hit.engine_count.max(1) as f64 * PER_ENGINE
        + hit.searx_score * PER_BACKEND_POINT
        + hit.term_boost
        - hit.penalty;
    raw.max(SCORE_FLOOR)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn hit(weight: f64, engines: i64, backend: f64, boost: f64, penalty: f64) -> ArticleHit {
        ArticleHit {
            url: "https://example.com/a".to_string(),
            normalized_url: "https://example.com/a".to_string(),
            url_hash: "h".to_string(),
            title: "t".to_string(),
            content: String::new(),
            thumbnail_url: String::new(),
            source_domain: "example.com".to_string(),
            published_at: None,
            ingested_at: Utc::now(),
            topic_id: None,
            topic_weight: weight,
            engine_count: engines,
            searx_score: backend,
            term_boost: boost,
            penalty,
        }
    }

    #[test]
    fn linear_contribution() {
        // 1 + 2 + 3*0.25 + 4*0.25 + 0.35 - 1
        let got = hit_contribution(&hit(2.0, 3, 4.0, 0.35, 1.0));
        assert!((got - 4.1).abs() < 1e-9);
    }

    #[test]
    fn zero_engines_counts_as_one() {
        let got = hit_contribution(&hit(0.0, 0, 0.0, 0.0, 0.0));
        assert!((got - 1.25).abs() < 1e-9);
    }

    #[test]
    fn floored_at_minus_ten() {
        assert_eq!(hit_contribution(&hit(1.0, 1, 0.0, 0.0, 50.0)), SCORE_FLOOR);
    }
}
