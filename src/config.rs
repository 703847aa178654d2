use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};
use crate::scheduler::parse_daily_time;

/// Auto-hide thresholds at or below this value switch the pass off.
pub const AUTO_HIDE_DISABLED: f64 = -100.0;

/// Shortest dedupe key accepted; shorter keys collapse unrelated titles.
pub const MIN_DEDUPE_KEY_CHARS: usize = 10;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub db_path: String,

    /// Local wall-clock time of the daily ingestion run, `HH:MM`.
    pub daily_ingest_time: String,

    pub searxng_instances: Vec<String>,
    pub per_query_delay_seconds: u64,
    pub per_query_jitter_seconds: u64,
    pub request_timeout_seconds: u64,

    pub default_batch_size: usize,
    pub feed_min_score: f64,
    pub auto_hide_below_score: f64,

    /// Unread articles older than this are culled; 0 disables culling.
    pub cull_unread_days: u32,
    pub cull_max_score: f64,

    pub dedupe_title_key_chars: usize,
    pub dedupe_after_ingest: bool,

    /// Largest backend response body accepted, in bytes.
    pub max_body_bytes: u64,
}

fn default_db_path() -> String {
    let data_dir = dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("news-harvester");
    std::fs::create_dir_all(&data_dir).ok();
    data_dir.join("harvest.db").to_string_lossy().to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            daily_ingest_time: "07:30".to_string(),
            searxng_instances: vec!["http://localhost:8888".to_string()],
            per_query_delay_seconds: 5,
            per_query_jitter_seconds: 5,
            request_timeout_seconds: 20,
            default_batch_size: 10,
            feed_min_score: 1.0,
            auto_hide_below_score: 1.0,
            cull_unread_days: 30,
            cull_max_score: 0.0,
            dedupe_title_key_chars: 48,
            dedupe_after_ingest: true,
            max_body_bytes: 4 << 20,
        }
    }
}

impl Config {
    /// Load from `path`, or from the default location when `None`.
    /// A default config is written out if the file does not exist yet.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config_path = path
            .map(Path::to_path_buf)
            .unwrap_or_else(Self::config_path);

        let config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            toml::from_str::<Config>(&content)?
        } else {
            let config = Config::default();
            config.save(&config_path)?;
            tracing::info!("Wrote default config to {:?}", config_path);
            config
        };

        config.validate()?;
        Ok(config)
    }

    pub fn save(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self).map_err(|e| AppError::Config(e.to_string()))?;
        std::fs::write(config_path, content)?;
        Ok(())
    }

    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("news-harvester")
            .join("config.toml")
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: &str| Err(AppError::Config(msg.to_string()));

        if self.db_path.trim().is_empty() {
            return fail("db_path is required");
        }
        if self.searxng_instances.iter().all(|s| s.trim().is_empty()) {
            return fail("at least one searxng_instances entry is required");
        }
        for instance in &self.searxng_instances {
            if url::Url::parse(instance.trim()).is_err() {
                return Err(AppError::Config(format!(
                    "searxng_instances entry {instance:?} is not a valid URL"
                )));
            }
        }
        if parse_daily_time(&self.daily_ingest_time).is_err() {
            return fail("daily_ingest_time must be HH:MM");
        }
        if self.per_query_delay_seconds > 3600 {
            return fail("per_query_delay_seconds out of range");
        }
        if self.per_query_jitter_seconds > 600 {
            return fail("per_query_jitter_seconds out of range");
        }
        if !(1..=300).contains(&self.request_timeout_seconds) {
            return fail("request_timeout_seconds must be 1..300");
        }
        if !(1..=100).contains(&self.default_batch_size) {
            return fail("default_batch_size must be 1..100");
        }
        if !(-100.0..=1000.0).contains(&self.feed_min_score) {
            return fail("feed_min_score out of range");
        }
        if !(AUTO_HIDE_DISABLED..=1000.0).contains(&self.auto_hide_below_score) {
            return fail("auto_hide_below_score out of range");
        }
        if self.dedupe_title_key_chars < MIN_DEDUPE_KEY_CHARS {
            return fail("dedupe_title_key_chars must be at least 10");
        }
        if self.max_body_bytes == 0 {
            return fail("max_body_bytes must be positive");
        }
        Ok(())
    }

    pub fn auto_hide_enabled(&self) -> bool {
        self.auto_hide_below_score > AUTO_HIDE_DISABLED
    }

    pub fn instances(&self) -> Vec<String> {
        self.searxng_instances
            .iter()
            .map(|s| s.trim().trim_end_matches('/').to_string())
            .filter(|s| !s.is_empty())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> Config {
        Config {
            db_path: "test.db".to_string(),
            ..Config::default()
        }
    }

    #[test]
    fn default_config_validates() {
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn rejects_bad_daily_time() {
        let cfg = Config {
            daily_ingest_time: "25:00".to_string(),
            ..valid()
        };
        assert!(matches!(cfg.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn rejects_empty_instance_list() {
        let cfg = Config {
            searxng_instances: vec!["  ".to_string()],
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_short_dedupe_key() {
        let cfg = Config {
            dedupe_title_key_chars: 4,
            ..valid()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn auto_hide_sentinel_disables_pass() {
        let cfg = Config {
            auto_hide_below_score: AUTO_HIDE_DISABLED,
            ..valid()
        };
        assert!(cfg.validate().is_ok());
        assert!(!cfg.auto_hide_enabled());
        assert!(valid().auto_hide_enabled());
    }

    #[test]
    fn partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "db_path = \"x.db\"\nsearxng_instances = [\"https://a.example/\", \"https://b.example\"]\n",
        )
        .unwrap();

        let cfg = Config::load(Some(&path)).unwrap();
        assert_eq!(cfg.daily_ingest_time, "07:30");
        assert_eq!(
            cfg.instances(),
            vec!["https://a.example".to_string(), "https://b.example".to_string()]
        );
    }

    #[test]
    fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let cfg = Config::load(Some(&path)).unwrap();
        assert!(path.exists());
        assert_eq!(cfg.default_batch_size, 10);
    }
}
