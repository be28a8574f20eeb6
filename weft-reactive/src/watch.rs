use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::StreamExt;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::task::{JoinHandle, JoinSet};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use weft_bus::{pipe, BoxError, Bus, EmitArgs, Envelope, Operator};
use weft_kv::{KvPath, KvStore, RunHandle, RunRegistry};
use weft_observability::{Logger, Telemetry, TraceContext};

use crate::cell::StateCell;

/// How handler invocations relate to each other when changes arrive
/// faster than the handler completes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ConcurrencyMode {
    /// Handlers run concurrently.
    #[default]
    Merge,
    /// Queued FIFO.
    Concat,
    /// A new emission cancels the in-flight handler.
    Switch,
    /// A new emission is dropped while a handler runs.
    Exhaust,
}

/// What a watch handler receives.
#[derive(Debug, Clone)]
pub struct WatchChange {
    /// Selected view of the new state.
    pub next: Value,
    /// Selected view of the previous state.
    pub prev: Value,
    /// Full new state snapshot.
    pub root: Value,
}

/// Context handed to a watch handler.
#[derive(Clone)]
pub struct WatchCtx {
    pub logger: Arc<dyn Logger>,
    pub kv: Arc<dyn KvStore>,
    pub kv_path: KvPath,
    pub run: Option<RunHandle>,
    trace: Option<TraceContext>,
    bus: Bus,
}

impl WatchCtx {
    /// Emit on a topic, carrying the invocation's run scope and span.
    pub fn emit(&self, topic: impl Into<String>, data: Value) {
        let mut args = EmitArgs::new(topic, data);
        if let Some(run) = &self.run {
            args = args.with_run(run.id());
        }
        if let Some(trace) = &self.trace {
            args = args.with_trace(trace.clone());
        }
        self.bus.emit(args);
    }
}

pub type WatchHandler = Arc<
    dyn Fn(WatchChange, WatchCtx) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync,
>;

/// One watch registration.
pub struct WatchConfig {
    /// Name used in the `reactive <name>` span and in logs.
    pub name: String,
    /// Projects the state snapshot before pairing and filtering.
    /// Identity when unset.
    pub selector: Option<Arc<dyn Fn(&Value) -> Value + Send + Sync>>,
    /// Decides whether a `(next, prev)` selected pair is delivered.
    /// Default: deliver when the selected values differ.
    pub filter: Option<Arc<dyn Fn(&Value, &Value) -> bool + Send + Sync>>,
    /// Operator pipeline between pairing and the handler.
    pub pipes: Vec<Arc<dyn Operator>>,
    pub mode: ConcurrencyMode,
    /// Caller-supplied run scope. When set, the framework neither
    /// creates nor releases scopes for invocations.
    pub run: Option<RunHandle>,
    /// Topics this watcher declares it may emit (topology input).
    pub emits: Vec<String>,
    pub handler: WatchHandler,
}

impl WatchConfig {
    pub fn new(name: impl Into<String>, handler: WatchHandler) -> Self {
        Self {
            name: name.into(),
            selector: None,
            filter: None,
            pipes: Vec::new(),
            mode: ConcurrencyMode::default(),
            run: None,
            emits: Vec::new(),
            handler,
        }
    }

    pub fn with_selector(
        mut self,
        selector: impl Fn(&Value) -> Value + Send + Sync + 'static,
    ) -> Self {
        self.selector = Some(Arc::new(selector));
        self
    }

    pub fn with_filter(
        mut self,
        filter: impl Fn(&Value, &Value) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_pipes(mut self, pipes: Vec<Arc<dyn Operator>>) -> Self {
        self.pipes = pipes;
        self
    }

    pub fn with_mode(mut self, mode: ConcurrencyMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_run(mut self, run: RunHandle) -> Self {
        self.run = Some(run);
        self
    }

    pub fn emits(mut self, topics: Vec<String>) -> Self {
        self.emits = topics;
        self
    }
}

/// Shared services a watcher needs from the owning server.
#[derive(Clone)]
pub struct WatchDeps {
    pub bus: Bus,
    pub runs: RunRegistry,
    pub kv: Arc<dyn KvStore>,
    pub logger: Arc<dyn Logger>,
    pub telemetry: Telemetry,
}

/// Handle to a running watcher.
pub struct WatchHandle {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl WatchHandle {
    /// Stop observing and wait for in-flight handlers to settle.
    pub async fn close(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Attach a handler pipeline to a state cell.
pub fn watch<T>(cell: &StateCell<T>, config: WatchConfig, deps: WatchDeps) -> WatchHandle
where
    T: Clone + Serialize + Send + 'static,
{
    let rx = cell.subscribe();
    let seed = cell.committed();
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_watch(rx, seed, config, deps, cancel.clone()));
    WatchHandle { cancel, task }
}

async fn run_watch(
    rx: tokio::sync::broadcast::Receiver<crate::cell::Change>,
    seed: Value,
    config: WatchConfig,
    deps: WatchDeps,
    cancel: CancellationToken,
) {
    let WatchConfig {
        name,
        selector,
        filter,
        pipes,
        mode,
        run,
        emits: _,
        handler,
    } = config;

    let select = move |value: &Value| -> Value {
        match &selector {
            Some(sel) => sel(value),
            None => value.clone(),
        }
    };

    // Seed + pairwise + filter, folded into a scan so the previous
    // selected value travels with the stream.
    let pairs = BroadcastStream::new(rx)
        .filter_map(|change| futures_util::future::ready(change.ok()))
        .scan(select(&seed), move |prev_sel, change| {
            let next_sel = select(&change.next);
            let pair = (next_sel.clone(), std::mem::replace(prev_sel, next_sel), change.next);
            futures_util::future::ready(Some(pair))
        })
        .filter(move |(next_sel, prev_sel, _)| {
            let deliver = match &filter {
                Some(f) => f(next_sel, prev_sel),
                None => next_sel != prev_sel,
            };
            futures_util::future::ready(deliver)
        })
        .map(|(next, prev, root)| {
            Envelope::new(json!({"next": next, "prev": prev, "root": root}))
        })
        .boxed();

    let mut stream = pipe(&pipes, pairs);

    let worker = Arc::new(WatchWorker {
        name,
        handler,
        supplied_run: run,
        deps,
    });

    match mode {
        ConcurrencyMode::Concat => loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                next = stream.next() => match next {
                    Some(envelope) => worker.deliver(envelope).await,
                    None => break,
                },
            }
        },
        ConcurrencyMode::Merge => {
            let mut running: JoinSet<()> = JoinSet::new();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(envelope) => {
                            let worker = Arc::clone(&worker);
                            running.spawn(async move { worker.deliver(envelope).await });
                            while running.try_join_next().is_some() {}
                        }
                        None => break,
                    },
                }
            }
            while running.join_next().await.is_some() {}
        }
        ConcurrencyMode::Switch => {
            let mut current: Option<JoinHandle<()>> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(envelope) => {
                            if let Some(task) = current.take() {
                                task.abort();
                            }
                            let worker = Arc::clone(&worker);
                            current = Some(tokio::spawn(async move {
                                worker.deliver(envelope).await;
                            }));
                        }
                        None => break,
                    },
                }
            }
            if let Some(task) = current {
                let _ = task.await;
            }
        }
        ConcurrencyMode::Exhaust => {
            let mut current: Option<JoinHandle<()>> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    next = stream.next() => match next {
                        Some(envelope) => {
                            let busy = current.as_ref().map(|t| !t.is_finished()).unwrap_or(false);
                            if busy {
                                tracing::debug!("exhaust mode dropped an emission while busy");
                                continue;
                            }
                            let worker = Arc::clone(&worker);
                            current = Some(tokio::spawn(async move {
                                worker.deliver(envelope).await;
                            }));
                        }
                        None => break,
                    },
                }
            }
            if let Some(task) = current {
                let _ = task.await;
            }
        }
    }
}

struct WatchWorker {
    name: String,
    handler: WatchHandler,
    supplied_run: Option<RunHandle>,
    deps: WatchDeps,
}

impl WatchWorker {
    async fn deliver(&self, envelope: Envelope) {
        let change = WatchChange {
            next: envelope.data["next"].clone(),
            prev: envelope.data["prev"].clone(),
            root: envelope.data["root"].clone(),
        };

        // Caller-supplied scopes are neither created nor released here.
        let (run, owned) = match &self.supplied_run {
            Some(run) => (Some(run.clone()), false),
            None => match self.deps.runs.create().await {
                Ok(run) => (Some(run), true),
                Err(e) => {
                    tracing::error!(watch = %self.name, error = %e, "run scope creation failed");
                    (None, false)
                }
            },
        };

        let mut span = self
            .deps
            .telemetry
            .reactive_span(&self.name, envelope.trace.as_ref());
        let ctx = WatchCtx {
            logger: Arc::clone(&self.deps.logger),
            kv: Arc::clone(&self.deps.kv),
            kv_path: KvPath::new(Arc::clone(&self.deps.kv)),
            run: run.clone(),
            trace: span.trace_context(),
            bus: self.deps.bus.clone(),
        };

        if let Err(err) = (self.handler)(change, ctx).await {
            tracing::error!(watch = %self.name, error = %err, "watch handler failed");
            span.record_failure(&err.to_string());
        }
        span.end();

        if owned {
            if let Some(run) = run {
                if let Err(e) = run.release().await {
                    tracing::warn!(watch = %self.name, error = %e, "run release failed");
                }
            }
        }
    }
}
