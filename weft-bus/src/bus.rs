use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};

use dashmap::DashMap;
use futures_util::StreamExt;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_stream::wrappers::UnboundedReceiverStream;
use weft_kv::{KvPath, KvStore, RunRegistry};
use weft_observability::{LogLevel, Logger, Telemetry};

use crate::envelope::{EmitArgs, Envelope};
use crate::operators::{pipe, Operator};
use crate::remote::{RemoteError, RemoteInvoker, ValueMap};
use crate::schema::{GateDecision, SchemaError, SchemaGate};
use crate::subscription::{
    BoxError, DispatchMode, EventCtx, SubscriberKind, SubscriptionConfig,
};
use crate::system;

/// Error type for bus operations.
#[derive(Debug)]
pub enum BusError {
    /// The subscription's schema configuration is unusable.
    Schema(SchemaError),
    /// The bus has been closed; no new subscriptions are accepted.
    Closed,
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BusError::Schema(e) => write!(f, "subscription schema error: {e}"),
            BusError::Closed => write!(f, "bus is closed"),
        }
    }
}

impl std::error::Error for BusError {}

impl From<SchemaError> for BusError {
    fn from(e: SchemaError) -> Self {
        BusError::Schema(e)
    }
}

/// Topic → multicast stream registry.
///
/// Subjects are created lazily on first subscription and never deleted
/// during the process lifetime. Each subscription owns one channel per
/// topic, so deliveries to a subscription preserve publication order on
/// that topic; payload types are not enforced by the bus itself but may
/// be constrained per subscription with a JSON schema.
///
/// `Bus` is `Clone` and can be shared across threads.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

struct BusInner {
    topics: DashMap<String, Vec<mpsc::UnboundedSender<Envelope>>>,
    pumps: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
    runs: RunRegistry,
    kv: Arc<dyn KvStore>,
    kv_path: KvPath,
    logger: Arc<dyn Logger>,
    telemetry: Telemetry,
    remote: RwLock<Option<Arc<dyn RemoteInvoker>>>,
}

impl Bus {
    pub fn new(
        runs: RunRegistry,
        kv: Arc<dyn KvStore>,
        logger: Arc<dyn Logger>,
        telemetry: Telemetry,
    ) -> Self {
        let kv_path = KvPath::new(Arc::clone(&kv));
        Self {
            inner: Arc::new(BusInner {
                topics: DashMap::new(),
                pumps: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
                runs,
                kv,
                kv_path,
                logger,
                telemetry,
                remote: RwLock::new(None),
            }),
        }
    }

    /// Install the bridge once it is initialised. Remote subscriptions
    /// invoked before this fail with a lifecycle error.
    pub fn set_remote_invoker(&self, invoker: Arc<dyn RemoteInvoker>) {
        *self.inner.remote.write().unwrap() = Some(invoker);
    }

    pub fn run_registry(&self) -> &RunRegistry {
        &self.inner.runs
    }

    /// The installed bridge, if any. `None` until
    /// [`Bus::set_remote_invoker`] has run.
    pub fn remote_invoker(&self) -> Option<Arc<dyn RemoteInvoker>> {
        self.inner.remote.read().unwrap().clone()
    }

    /// Register a handler under one or more topics.
    ///
    /// Each topic gets its own FIFO pump through the subscription's
    /// operator pipeline; the handler runs under the configured
    /// [`DispatchMode`].
    pub fn subscribe(&self, config: SubscriptionConfig) -> Result<(), BusError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(BusError::Closed);
        }
        let gate = SchemaGate::new(config.schema.as_ref(), config.strict)?;
        let worker = Arc::new(SubWorker {
            name: config.name.clone(),
            gate,
            kind: config.handler.clone(),
            bus: Arc::downgrade(&self.inner),
        });

        for topic in &config.topics {
            let (tx, rx) = mpsc::unbounded_channel();
            self.inner
                .topics
                .entry(topic.clone())
                .or_default()
                .push(tx);
            let pump = tokio::spawn(run_pump(
                topic.clone(),
                rx,
                config.pipes.clone(),
                config.dispatch,
                Arc::clone(&worker),
            ));
            self.inner.pumps.lock().unwrap().push(pump);
        }
        Ok(())
    }

    /// Publish on a topic. Non-blocking; a topic without subscriptions is
    /// a no-op. The run scope named in `args.run` is retained once per
    /// delivery and released when the corresponding handler settles.
    pub fn emit(&self, args: EmitArgs) {
        if self.inner.closed.load(Ordering::SeqCst) {
            tracing::debug!(topic = %args.topic, "emit after close dropped");
            return;
        }
        let Some(subs) = self.inner.topics.get(&args.topic) else {
            return;
        };
        for tx in subs.iter() {
            let run = args
                .run
                .as_deref()
                .and_then(|id| self.inner.runs.token(id));
            let envelope = Envelope {
                data: args.data.clone(),
                run,
                trace: args.trace.clone(),
            };
            // A send error means the pump is gone (close raced us); the
            // dropped envelope releases its run token.
            let _ = tx.send(envelope);
        }
    }

    /// Complete every subscription stream. In-flight handlers finish, no
    /// new envelopes are delivered, and the call returns once all pumps
    /// have settled.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.topics.clear();
        let pumps = std::mem::take(&mut *self.inner.pumps.lock().unwrap());
        for pump in pumps {
            let _ = pump.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Number of subscriptions currently attached to a topic.
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.inner.topics.get(topic).map_or(0, |s| s.len())
    }
}

struct SubWorker {
    name: String,
    gate: SchemaGate,
    kind: SubscriberKind,
    bus: Weak<BusInner>,
}

async fn run_pump(
    topic: String,
    rx: mpsc::UnboundedReceiver<Envelope>,
    pipes: Vec<Arc<dyn Operator>>,
    dispatch: DispatchMode,
    worker: Arc<SubWorker>,
) {
    let source = UnboundedReceiverStream::new(rx).boxed();
    let mut stream = pipe(&pipes, source);
    match dispatch {
        DispatchMode::Concat => {
            while let Some(envelope) = stream.next().await {
                let w = Arc::clone(&worker);
                let t = topic.clone();
                // Spawned so a panicking handler cannot kill the pump.
                let result = tokio::spawn(async move { w.deliver(t, envelope).await }).await;
                worker.reap(result);
            }
        }
        DispatchMode::Merge => {
            let mut running: JoinSet<()> = JoinSet::new();
            while let Some(envelope) = stream.next().await {
                let w = Arc::clone(&worker);
                let t = topic.clone();
                running.spawn(async move { w.deliver(t, envelope).await });
                while let Some(result) = running.try_join_next() {
                    worker.reap(result);
                }
            }
            while let Some(result) = running.join_next().await {
                worker.reap(result);
            }
        }
    }
}

impl SubWorker {
    fn bus(&self) -> Option<Bus> {
        self.bus.upgrade().map(|inner| Bus { inner })
    }

    fn reap(&self, result: Result<(), JoinError>) {
        let Err(err) = result else { return };
        if err.is_panic() {
            let reason = format!("handler '{}' panicked: {err}", self.name);
            tracing::error!(subscription = %self.name, "{reason}");
            if let Some(bus) = self.bus() {
                bus.emit(EmitArgs::new(
                    system::UNHANDLED_REJECTION,
                    json!({ "reason": reason }),
                ));
            }
        }
    }

    async fn deliver(&self, topic: String, mut envelope: Envelope) {
        let Some(bus) = self.bus() else { return };
        let inner = &bus.inner;
        let mut span =
            inner
                .telemetry
                .event_span(&topic, envelope.trace.as_ref(), &self.name);

        match self.gate.check(&envelope.data) {
            GateDecision::Drop(reason) => {
                let msg = format!("dropping invalid payload on '{topic}': {reason}");
                inner.logger.log(LogLevel::Error, &msg, None);
                tracing::error!(topic = %topic, subscription = %self.name, %reason, "strict schema rejected payload");
                span.record_failure(&msg);
                span.end();
                if let Some(token) = envelope.run.take() {
                    let _ = token.release().await;
                }
                return;
            }
            GateDecision::DeliverWarn(reason) => {
                inner.logger.log(
                    LogLevel::Warn,
                    &format!("payload on '{topic}' failed validation, delivering anyway: {reason}"),
                    None,
                );
                tracing::warn!(topic = %topic, subscription = %self.name, %reason, "lax schema warning");
            }
            GateDecision::Deliver => {}
        }

        let trace = span.trace_context().or_else(|| envelope.trace.clone());
        let result: Result<(), BoxError> = match &self.kind {
            SubscriberKind::Local(handler) => {
                let ctx = EventCtx {
                    trigger: topic.clone(),
                    logger: Arc::clone(&inner.logger),
                    kv: Arc::clone(&inner.kv),
                    kv_path: inner.kv_path.clone(),
                    run: envelope.run.as_ref().and_then(|t| t.handle()),
                    trace,
                    bus: bus.clone(),
                };
                handler(envelope.data.clone(), ctx).await
            }
            SubscriberKind::Remote(binding) => {
                let invoker = inner.remote.read().unwrap().clone();
                match invoker {
                    None => Err(Box::new(RemoteError::not_initialized()) as BoxError),
                    Some(invoker) => {
                        let mut input = ValueMap::new();
                        input.insert("topic".into(), Value::String(topic.clone()));
                        input.insert("payload".into(), envelope.data.clone());
                        if let Some(run) = &envelope.run {
                            input.insert("runId".into(), Value::String(run.id().to_string()));
                        }
                        let mut meta = ValueMap::new();
                        if let Some(tc) = &trace {
                            meta.insert("trace_id".into(), Value::String(tc.trace_id.clone()));
                            meta.insert("span_id".into(), Value::String(tc.span_id.clone()));
                            meta.insert("trace_flags".into(), json!(tc.trace_flags));
                        }
                        invoker
                            .invoke(binding, "event", input, meta)
                            .await
                            .map(|_| ())
                            .map_err(|e| Box::new(e) as BoxError)
                    }
                }
            }
        };

        if let Err(err) = result {
            let msg = format!("handler '{}' failed on '{topic}': {err}", self.name);
            inner.logger.log(LogLevel::Error, &msg, None);
            tracing::error!(topic = %topic, subscription = %self.name, error = %err, "event handler failed");
            span.record_failure(&err.to_string());
        }
        span.end();
        if let Some(token) = envelope.run.take() {
            let _ = token.release().await;
        }
    }
}
