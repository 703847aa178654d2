use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use serde_json::json;
use tokio::signal;

mod config;
mod db;
mod error;
mod ingest;
mod matcher;
mod models;
mod scheduler;
mod shutdown;

use config::Config;
use db::Repository;
use error::{AppError, Result};
use ingest::Ingester;
use models::{NewNegativeRule, NewTopic};
use scheduler::Scheduler;

const DEFAULT_TOPIC_WEIGHT: f64 = 1.0;
const DEFAULT_RULE_PENALTY: f64 = 5.0;
const DEFAULT_HIDE_RULE_PENALTY: f64 = 10.0;

const USAGE: &str = "\
usage: news-harvester [--config PATH] [COMMAND]

With no command, runs the daily ingestion scheduler until interrupted.

commands:
  --once                          run one ingestion now and exit
  --dedupe                        hide duplicate titles among unread articles
  --status                        print article, topic and rule statistics
  --feed [N]                      print the next N unread articles and mark them seen
  --useful ID | --read ID | --hide ID
  --hide-rule ID PATTERN [PENALTY]
  --add-topic QUERY [WEIGHT]      --delete-topic ID
  --add-rule PATTERN [PENALTY]    --delete-rule ID
  --setting KEY [VALUE]           read or write a stored setting
  --setting-add KEY DELTA         add to an integer setting";

#[tokio::main]
async fn main() -> Result<()> {
    // Logs go to stderr, INFO unless RUST_LOG says otherwise
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let mut args: Vec<String> = std::env::args().skip(1).collect();
    let config_path = take_option(&mut args, "--config")?.map(PathBuf::from);

    if matches!(args.first().map(String::as_str), Some("--help" | "-h")) {
        println!("{USAGE}");
        return Ok(());
    }

    let config = Config::load(config_path.as_deref())?;
    let repo = Arc::new(Repository::new(&config.db_path).await?);

    let command = args.first().cloned().unwrap_or_default();
    let rest = args.get(1..).unwrap_or_default();
    match command.as_str() {
        "" => run_scheduler(config, repo).await,
        "--once" => run_once(config, repo).await,
        "--dedupe" => {
            let stats = repo
                .hide_all_unread_title_duplicates(config.dedupe_title_key_chars)
                .await?;
            print_json(&json!({
                "same_batch_hidden": stats.same_batch_hidden,
                "historical_hidden": stats.historical_hidden,
                "dedupe_hidden_total": repo.dedupe_hidden_total().await?,
            }))
        }
        "--status" => print_status(&repo).await,
        "--feed" => {
            let limit = optional_arg(rest, 0, "N")?.unwrap_or(config.default_batch_size);
            let articles = repo.fetch_top_unread(limit, config.feed_min_score).await?;
            let ids = articles.iter().map(|a| a.id).collect();
            print_json(&articles)?;
            repo.mark_seen(ids).await?;
            Ok(())
        }
        "--useful" => report_transition(repo.mark_useful(required_arg(rest, 0, "ID")?).await?),
        "--read" => report_transition(repo.mark_read(required_arg(rest, 0, "ID")?).await?),
        "--hide" => report_transition(repo.hide_article(required_arg(rest, 0, "ID")?).await?),
        "--hide-rule" => {
            let id = required_arg(rest, 0, "ID")?;
            let pattern: String = required_arg(rest, 1, "PATTERN")?;
            let penalty = optional_arg(rest, 2, "PENALTY")?.unwrap_or(DEFAULT_HIDE_RULE_PENALTY);
            report_transition(repo.hide_with_rule(id, &pattern, penalty).await?)
        }
        "--add-topic" => {
            let query: String = required_arg(rest, 0, "QUERY")?;
            let weight = optional_arg(rest, 1, "WEIGHT")?.unwrap_or(DEFAULT_TOPIC_WEIGHT);
            let id = repo
                .upsert_topic(NewTopic {
                    query,
                    weight,
                    enabled: true,
                })
                .await?;
            print_json(&json!({ "id": id }))
        }
        "--delete-topic" => {
            let deleted = repo.delete_topic(required_arg(rest, 0, "ID")?).await?;
            print_json(&json!({ "deleted": deleted }))
        }
        "--add-rule" => {
            let pattern: String = required_arg(rest, 0, "PATTERN")?;
            let penalty = optional_arg(rest, 1, "PENALTY")?.unwrap_or(DEFAULT_RULE_PENALTY);
            let update = repo
                .upsert_negative_rule(NewNegativeRule {
                    pattern,
                    penalty,
                    enabled: true,
                })
                .await?;
            print_json(&json!({
                "id": update.id,
                "score_delta": update.delta,
                "matched_unread": update.matched,
            }))
        }
        "--delete-rule" => {
            let deleted = repo.delete_negative_rule(required_arg(rest, 0, "ID")?).await?;
            print_json(&json!({ "deleted": deleted }))
        }
        "--setting" => {
            let key: String = required_arg(rest, 0, "KEY")?;
            if let Some(value) = optional_arg::<String>(rest, 1, "VALUE")? {
                repo.set_setting(&key, &value).await?;
            }
            print_json(&json!({ "key": key, "value": repo.get_setting(&key).await? }))
        }
        "--setting-add" => {
            let key: String = required_arg(rest, 0, "KEY")?;
            repo.add_to_setting_i64(&key, required_arg(rest, 1, "DELTA")?).await?;
            print_json(&json!({ "key": key, "value": repo.get_setting_i64(&key, 0).await? }))
        }
        other => Err(AppError::InvalidInput(format!(
            "unknown argument {other:?}\n{USAGE}"
        ))),
    }
}

/// Run the daily loop until Ctrl-C or SIGTERM.
async fn run_scheduler(config: Config, repo: Arc<Repository>) -> Result<()> {
    let daily_time = config.daily_ingest_time.clone();
    let ingester = Ingester::new(config, repo)?;
    let scheduler = Arc::new(Scheduler::new(daily_time, ingester));
    let (trigger, shutdown) = shutdown::channel();

    let mut handle = scheduler.clone().start(shutdown);
    let stopped_early = tokio::select! {
        res = &mut handle => Some(res),
        _ = shutdown_signal() => None,
    };
    let joined = match stopped_early {
        Some(res) => res,
        None => {
            trigger.trigger();
            handle.await
        }
    };
    if let Err(e) = joined {
        tracing::error!(error = %e, "scheduler task failed");
    }
    Ok(())
}

/// One manual run. Ctrl-C cancels it and waits for it to wind down.
async fn run_once(config: Config, repo: Arc<Repository>) -> Result<()> {
    let daily_time = config.daily_ingest_time.clone();
    let scheduler = Scheduler::new(daily_time, Ingester::new(config, repo)?);
    let (trigger, shutdown) = shutdown::channel();

    let run = scheduler.run_now(&shutdown);
    tokio::pin!(run);
    let finished = tokio::select! {
        res = &mut run => Some(res),
        _ = shutdown_signal() => None,
    };
    let result = match finished {
        Some(res) => res,
        None => {
            trigger.trigger();
            run.await
        }
    };

    let (message, at) = scheduler.runner().last_progress().unzip();
    print_json(&json!({
        "state": scheduler.snapshot(),
        "last_progress": message,
        "last_progress_at": at,
    }))?;
    result
}

async fn print_status(repo: &Repository) -> Result<()> {
    let counts = repo.status_counts().await?;
    let stats = repo.topic_stats().await?;
    let topics: Vec<_> = repo
        .list_topics()
        .await?
        .into_iter()
        .map(|topic| {
            let s = stats.get(&topic.id).copied().unwrap_or_default();
            json!({ "topic": topic, "unread": s.unread, "total": s.total })
        })
        .collect();
    print_json(&json!({
        "articles": counts,
        "topics": topics,
        "rules": repo.list_negative_rules().await?,
        "dedupe_hidden_total": repo.dedupe_hidden_total().await?,
    }))
}

fn report_transition(changed: bool) -> Result<()> {
    print_json(&json!({ "changed": changed }))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Remove `--name VALUE` from `args`, returning the value.
fn take_option(args: &mut Vec<String>, name: &str) -> Result<Option<String>> {
    let Some(pos) = args.iter().position(|a| a == name) else {
        return Ok(None);
    };
    if pos + 1 >= args.len() {
        return Err(AppError::InvalidInput(format!("{name} needs a value")));
    }
    let value = args.remove(pos + 1);
    args.remove(pos);
    Ok(Some(value))
}

fn optional_arg<T: FromStr>(args: &[String], idx: usize, name: &str) -> Result<Option<T>> {
    args.get(idx)
        .map(|raw| {
            raw.parse()
                .map_err(|_| AppError::InvalidInput(format!("invalid {name}: {raw:?}")))
        })
        .transpose()
}

fn required_arg<T: FromStr>(args: &[String], idx: usize, name: &str) -> Result<T> {
    optional_arg(args, idx, name)?
        .ok_or_else(|| AppError::InvalidInput(format!("missing {name}\n{USAGE}")))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
