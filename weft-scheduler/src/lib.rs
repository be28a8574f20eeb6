//! Cron scheduler for Weft.
//!
//! Jobs fire on cron expressions (second-resolution, optionally in a
//! named time zone), each tick under its own run scope and `cron <expr>`
//! span. The retry policy is per-tick: a throwing handler is retried up
//! to `max_retries` times with `delay_ms` between attempts, and a
//! handler may re-arm itself inside the tick by returning
//! [`CronOutcome::RetryIn`], which takes precedence over `delay_ms` but
//! spends the same attempt budget.
//!
//! A tick that would fire while the previous tick of the same job is
//! still running is dropped, with a log line. Ticks are never queued.

use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use weft_bus::{BoxError, Bus, EmitArgs};
use weft_kv::{KvPath, KvStore, RunHandle, RunRegistry};
use weft_observability::{Logger, Telemetry, TraceContext};

/// Error type for scheduler operations.
#[derive(Debug)]
pub enum SchedulerError {
    InvalidSchedule { name: String, message: String },
    InvalidTimezone { name: String, tz: String },
}

impl std::fmt::Display for SchedulerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SchedulerError::InvalidSchedule { name, message } => {
                write!(f, "cron '{name}' has an invalid schedule: {message}")
            }
            SchedulerError::InvalidTimezone { name, tz } => {
                write!(f, "cron '{name}' names an unknown timezone '{tz}'")
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

/// Per-tick retry policy.
#[derive(Debug, Clone, Copy, Default)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub delay_ms: u64,
}

/// What a handler asks the scheduler to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronOutcome {
    Done,
    /// Re-execute within the same tick after this many milliseconds.
    /// Bounded by the tick's `max_retries` budget.
    RetryIn(u64),
}

/// Cron handler: scheduled fire time plus invocation context.
pub type CronHandler = Arc<
    dyn Fn(DateTime<Utc>, CronCtx) -> BoxFuture<'static, Result<CronOutcome, BoxError>>
        + Send
        + Sync,
>;

/// One scheduled job.
pub struct CronConfig {
    pub name: String,
    /// Cron expression with seconds, e.g. `*/5 * * * * *`.
    pub cron_time: String,
    /// IANA zone name; UTC when unset.
    pub tz: Option<String>,
    pub retry: RetryPolicy,
    /// Topics this job declares it may emit (topology input).
    pub emits: Vec<String>,
    pub handler: CronHandler,
}

impl CronConfig {
    pub fn new(
        name: impl Into<String>,
        cron_time: impl Into<String>,
        handler: CronHandler,
    ) -> Self {
        Self {
            name: name.into(),
            cron_time: cron_time.into(),
            tz: None,
            retry: RetryPolicy::default(),
            emits: Vec::new(),
            handler,
        }
    }

    pub fn with_tz(mut self, tz: impl Into<String>) -> Self {
        self.tz = Some(tz.into());
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn emits(mut self, topics: Vec<String>) -> Self {
        self.emits = topics;
        self
    }
}

/// Context handed to a cron handler.
#[derive(Clone)]
pub struct CronCtx {
    pub logger: Arc<dyn Logger>,
    pub kv: Arc<dyn KvStore>,
    pub kv_path: KvPath,
    pub run: RunHandle,
    trace: Option<TraceContext>,
    bus: Bus,
}

impl CronCtx {
    /// Emit on a topic, carrying the tick's run scope and span.
    pub fn emit(&self, topic: impl Into<String>, data: Value) {
        let mut args = EmitArgs::new(topic, data).with_run(self.run.id());
        if let Some(trace) = &self.trace {
            args = args.with_trace(trace.clone());
        }
        self.bus.emit(args);
    }
}

/// The scheduler runtime. `add` spawns one task per job; `close` cancels
/// them and waits for in-flight ticks.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

struct SchedulerInner {
    bus: Bus,
    runs: RunRegistry,
    kv: Arc<dyn KvStore>,
    logger: Arc<dyn Logger>,
    telemetry: Telemetry,
    cancel: CancellationToken,
    jobs: Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        bus: Bus,
        runs: RunRegistry,
        kv: Arc<dyn KvStore>,
        logger: Arc<dyn Logger>,
        telemetry: Telemetry,
    ) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                bus,
                runs,
                kv,
                logger,
                telemetry,
                cancel: CancellationToken::new(),
                jobs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Validate and start one job.
    pub fn add(&self, config: CronConfig) -> Result<(), SchedulerError> {
        let schedule =
            Schedule::from_str(&config.cron_time).map_err(|e| SchedulerError::InvalidSchedule {
                name: config.name.clone(),
                message: e.to_string(),
            })?;
        let tz = match &config.tz {
            Some(tz) => Some(tz.parse::<Tz>().map_err(|_| SchedulerError::InvalidTimezone {
                name: config.name.clone(),
                tz: tz.clone(),
            })?),
            None => None,
        };
        let inner = Arc::clone(&self.inner);
        let cancel = self.inner.cancel.child_token();
        let handle = tokio::spawn(run_job(inner, config, schedule, tz, cancel));
        self.inner.jobs.lock().unwrap().push(handle);
        Ok(())
    }

    /// Stop firing, cancel pending sleeps, and wait for in-flight ticks.
    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let jobs = std::mem::take(&mut *self.inner.jobs.lock().unwrap());
        for job in jobs {
            let _ = job.await;
        }
    }
}

fn next_fire(schedule: &Schedule, tz: Option<Tz>, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    match tz {
        Some(tz) => schedule
            .after(&after.with_timezone(&tz))
            .next()
            .map(|t| t.with_timezone(&Utc)),
        None => schedule.after(&after).next(),
    }
}

async fn run_job(
    inner: Arc<SchedulerInner>,
    config: CronConfig,
    schedule: Schedule,
    tz: Option<Tz>,
    cancel: CancellationToken,
) {
    tracing::info!(cron = %config.name, schedule = %config.cron_time, "cron job armed (overlapping ticks are dropped)");
    loop {
        let now = Utc::now();
        let Some(fire_at) = next_fire(&schedule, tz, now) else {
            tracing::warn!(cron = %config.name, "schedule has no future fire times, stopping");
            return;
        };
        let wait = (fire_at - now).to_std().unwrap_or(Duration::ZERO);
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(wait) => {}
        }

        run_tick(&inner, &config, fire_at).await;

        // Fire times that passed while the tick ran are dropped, never
        // queued.
        let after_tick = Utc::now();
        let missed = match tz {
            Some(tz) => schedule
                .after(&fire_at.with_timezone(&tz))
                .take_while(|t| t.with_timezone(&Utc) < after_tick)
                .count(),
            None => schedule
                .after(&fire_at)
                .take_while(|t| *t < after_tick)
                .count(),
        };
        if missed > 0 {
            tracing::warn!(
                cron = %config.name,
                dropped = missed,
                "previous tick outlasted the schedule, dropping overlapping ticks"
            );
        }
    }
}

async fn run_tick(inner: &SchedulerInner, config: &CronConfig, fire_at: DateTime<Utc>) {
    let run = match inner.runs.create().await {
        Ok(run) => run,
        Err(e) => {
            tracing::error!(cron = %config.name, error = %e, "run scope creation failed, skipping tick");
            return;
        }
    };
    let mut span = inner.telemetry.cron_span(&config.cron_time, &config.name);
    let ctx = CronCtx {
        logger: Arc::clone(&inner.logger),
        kv: Arc::clone(&inner.kv),
        kv_path: KvPath::new(Arc::clone(&inner.kv)),
        run: run.clone(),
        trace: span.trace_context(),
        bus: inner.bus.clone(),
    };

    let mut attempt: u32 = 0;
    loop {
        let handler = Arc::clone(&config.handler);
        let tick_ctx = ctx.clone();
        // Spawned so a panicking handler spends a retry instead of
        // killing the job.
        let outcome = tokio::spawn(async move { handler(fire_at, tick_ctx).await }).await;
        match outcome {
            Ok(Ok(CronOutcome::Done)) => break,
            Ok(Ok(CronOutcome::RetryIn(ms))) => {
                if attempt >= config.retry.max_retries {
                    tracing::warn!(
                        cron = %config.name,
                        attempts = attempt + 1,
                        "handler asked to re-arm past its retry budget, giving up"
                    );
                    break;
                }
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(ms)).await;
            }
            Ok(Err(err)) => {
                if attempt >= config.retry.max_retries {
                    tracing::error!(cron = %config.name, attempts = attempt + 1, error = %err, "tick failed after final retry");
                    span.record_failure(&err.to_string());
                    break;
                }
                attempt += 1;
                tracing::warn!(cron = %config.name, attempt, error = %err, "tick failed, retrying");
                tokio::time::sleep(Duration::from_millis(config.retry.delay_ms)).await;
            }
            Err(join_err) => {
                let reason = format!("handler panicked: {join_err}");
                if attempt >= config.retry.max_retries {
                    span.record_failure(&reason);
                    tracing::error!(cron = %config.name, "{reason}");
                    break;
                }
                attempt += 1;
                tokio::time::sleep(Duration::from_millis(config.retry.delay_ms)).await;
            }
        }
    }

    span.end();
    if let Err(e) = run.release().await {
        tracing::warn!(cron = %config.name, error = %e, "run release failed");
    }
}
