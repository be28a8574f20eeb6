use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_kv::{KvPath, KvStore, RunHandle};
use weft_observability::{Logger, TraceContext};

use crate::bus::Bus;
use crate::envelope::EmitArgs;
use crate::operators::Operator;
use crate::remote::RemoteBinding;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Local event handler: payload plus invocation context.
pub type EventHandler =
    Arc<dyn Fn(Value, EventCtx) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// How deliveries of one subscription execute relative to each other.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DispatchMode {
    /// Handler instances run concurrently (per-topic arrival order is
    /// still the invocation order).
    #[default]
    Merge,
    /// One delivery at a time, FIFO.
    Concat,
}

/// Who handles deliveries.
#[derive(Clone)]
pub enum SubscriberKind {
    Local(EventHandler),
    /// Delegated to a remote worker through the bridge, method `"event"`.
    Remote(RemoteBinding),
}

/// One subscription registration.
pub struct SubscriptionConfig {
    /// Topics this handler observes. Each topic gets its own FIFO pump.
    pub topics: Vec<String>,
    /// Handler identity, used in spans and logs.
    pub name: String,
    /// Optional JSON schema for payloads.
    pub schema: Option<Value>,
    /// Strict schema policy: invalid payloads are dropped instead of
    /// delivered-with-warning. Requires `schema`.
    pub strict: bool,
    /// Operator pipeline composed between publication and the handler.
    pub pipes: Vec<Arc<dyn Operator>>,
    /// Topics this handler declares it may emit (topology input).
    pub emits: Vec<String>,
    pub dispatch: DispatchMode,
    pub handler: SubscriberKind,
}

impl SubscriptionConfig {
    pub fn local(
        topic: impl Into<String>,
        name: impl Into<String>,
        handler: EventHandler,
    ) -> Self {
        Self {
            topics: vec![topic.into()],
            name: name.into(),
            schema: None,
            strict: false,
            pipes: Vec::new(),
            emits: Vec::new(),
            dispatch: DispatchMode::default(),
            handler: SubscriberKind::Local(handler),
        }
    }

    pub fn remote(
        topic: impl Into<String>,
        name: impl Into<String>,
        binding: RemoteBinding,
    ) -> Self {
        Self {
            topics: vec![topic.into()],
            name: name.into(),
            schema: None,
            strict: false,
            pipes: Vec::new(),
            emits: Vec::new(),
            dispatch: DispatchMode::default(),
            handler: SubscriberKind::Remote(binding),
        }
    }

    pub fn on_topics(mut self, topics: Vec<String>) -> Self {
        self.topics = topics;
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_pipes(mut self, pipes: Vec<Arc<dyn Operator>>) -> Self {
        self.pipes = pipes;
        self
    }

    pub fn emits(mut self, topics: Vec<String>) -> Self {
        self.emits = topics;
        self
    }

    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.dispatch = mode;
        self
    }
}

/// Context handed to a local event handler.
///
/// `emit` is pre-bound to the delivery's run scope and span, so
/// downstream emissions stay correlated without the handler doing
/// anything.
#[derive(Clone)]
pub struct EventCtx {
    /// Topic that triggered this delivery.
    pub trigger: String,
    pub logger: Arc<dyn Logger>,
    pub kv: Arc<dyn KvStore>,
    pub kv_path: KvPath,
    pub run: Option<RunHandle>,
    pub(crate) trace: Option<TraceContext>,
    pub(crate) bus: Bus,
}

impl EventCtx {
    /// Emit on a topic, carrying this delivery's run and trace context.
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

    /// The trace context the delivery span established.
    pub fn trace(&self) -> Option<&TraceContext> {
        self.trace.as_ref()
    }

    /// The bus itself, for the rare handler that needs full control.
    pub fn bus(&self) -> &Bus {
        &self.bus
    }
}
