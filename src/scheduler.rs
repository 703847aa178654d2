use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};
use crate::shutdown::Shutdown;

/// Manual triggers closer than this to the previous completion are refused.
pub const MIN_RUN_GAP: Duration = Duration::from_secs(15);

/// A unit of work the scheduler can start, typically one ingestion run.
pub trait Runner: Send + Sync + 'static {
    fn run(&self, shutdown: &Shutdown) -> impl Future<Output = Result<()>> + Send;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunSource {
    Scheduled,
    Manual,
}

impl fmt::Display for RunSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunSource::Scheduled => "scheduled",
            RunSource::Manual => "manual",
        })
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct RunState {
    pub running: bool,
    pub current_source: Option<RunSource>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_completed_at: Option<DateTime<Utc>>,
    pub last_duration_ms: Option<u64>,
    pub last_error: Option<String>,
    pub last_source: Option<RunSource>,
}

#[derive(Default)]
struct Inner {
    state: RunState,
    last_completed: Option<Instant>,
}

/// Runs `R` once a day at a local wall-clock time, and on demand.
/// At most one run is in flight at any moment.
pub struct Scheduler<R: Runner> {
    daily_time: String,
    runner: R,
    inner: Mutex<Inner>,
}

impl<R: Runner> Scheduler<R> {
    pub fn new(daily_time: impl Into<String>, runner: R) -> Self {
        Self {
            daily_time: daily_time.into(),
            runner,
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    pub fn snapshot(&self) -> RunState {
        self.lock().state.clone()
    }

    /// Start a run right away. Fails fast with [`AppError::AlreadyRunning`]
    /// or [`AppError::Cooldown`] instead of queueing.
    pub async fn run_now(&self, shutdown: &Shutdown) -> Result<()> {
        self.run(RunSource::Manual, shutdown).await
    }

    /// Spawn the daily loop. It ends on shutdown, or right away when the
    /// configured time cannot be parsed.
    pub fn start(self: Arc<Self>, shutdown: Shutdown) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                let now = Local::now();
                let next = match next_run_after(&now, &self.daily_time) {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::error!(daily_time = %self.daily_time, error = %e, "scheduler: invalid daily time");
                        return;
                    }
                };
                let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
                tracing::info!(next = %next.to_rfc3339(), "scheduler: next ingestion");

                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.cancelled() => break,
                }

                match self.run(RunSource::Scheduled, &shutdown).await {
                    Ok(()) => {}
                    Err(AppError::Cancelled) => break,
                    Err(e) if e.is_guard() => {
                        tracing::warn!(error = %e, "scheduler: scheduled run skipped")
                    }
                    Err(e) => tracing::error!(error = %e, "scheduler: ingestion run error"),
                }
            }
            tracing::info!("scheduler: stopped");
        })
    }

    async fn run(&self, source: RunSource, shutdown: &Shutdown) -> Result<()> {
        {
            let mut inner = self.lock();
            if inner.state.running {
                return Err(AppError::AlreadyRunning);
            }
            if source == RunSource::Manual
                && inner
                    .last_completed
                    .is_some_and(|at| at.elapsed() < MIN_RUN_GAP)
            {
                return Err(AppError::Cooldown);
            }
            inner.state.running = true;
            inner.state.current_source = Some(source);
            inner.state.started_at = Some(Utc::now());
        }

        tracing::info!(%source, "scheduler: ingestion started");
        let mut guard = RunGuard {
            inner: &self.inner,
            source,
            started: Instant::now(),
            error: Some("run interrupted".to_string()),
        };
        let result = self.runner.run(shutdown).await;
        guard.error = result.as_ref().err().map(|e| e.to_string());

        let took = guard.started.elapsed().as_millis();
        match &result {
            Ok(()) => tracing::info!(%source, took_ms = took, "scheduler: ingestion finished"),
            Err(e) => tracing::warn!(%source, took_ms = took, error = %e, "scheduler: ingestion finished with error"),
        }
        result
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Records completion when a run ends, including when its future is dropped.
struct RunGuard<'a> {
    inner: &'a Mutex<Inner>,
    source: RunSource,
    started: Instant,
    error: Option<String>,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.last_completed = Some(Instant::now());
        let state = &mut inner.state;
        state.running = false;
        state.current_source = None;
        state.last_completed_at = Some(Utc::now());
        state.last_duration_ms = Some(self.started.elapsed().as_millis() as u64);
        state.last_source = Some(self.source);
        state.last_error = self.error.take();
    }
}

/// Parse `HH:MM` (24-hour clock).
pub fn parse_daily_time(value: &str) -> Result<(u32, u32)> {
    let invalid = || AppError::Config(format!("daily time {value:?} must be HH:MM"));
    let (hour, minute) = value.split_once(':').ok_or_else(invalid)?;
    let hour: u32 = hour.parse().map_err(|_| invalid())?;
    let minute: u32 = minute.parse().map_err(|_| invalid())?;
    if hour > 23 || minute > 59 {
        return Err(invalid());
    }
    Ok((hour, minute))
}

/// Next occurrence of `hhmm` strictly after `now`, in `now`'s time zone.
pub fn next_run_after<Tz: TimeZone>(now: &DateTime<Tz>, hhmm: &str) -> Result<DateTime<Tz>> {
    let (hour, minute) = parse_daily_time(hhmm)?;
    let time = NaiveTime::from_hms_opt(hour, minute, 0)
        .ok_or_else(|| AppError::Config(format!("invalid daily time {hhmm:?}")))?;
    let tz = now.timezone();
    let today = now.date_naive();

    if let Some(at) = local_at(&tz, today, time) {
        if at > *now {
            return Ok(at);
        }
    }
    today
        .succ_opt()
        .and_then(|tomorrow| local_at(&tz, tomorrow, time))
        .ok_or_else(|| AppError::Config(format!("cannot schedule {hhmm:?} after {}", now.to_rfc3339())))
}

// Wall-clock times skipped by a DST change resolve an hour later.
fn local_at<Tz: TimeZone>(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Tz>> {
    let naive = date.and_time(time);
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + chrono::Duration::hours(1))).earliest())
}
