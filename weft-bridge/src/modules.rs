use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_bus::{BoxError, Bus, EmitArgs, ValueMap};
use weft_kv::{KvPath, KvStore, RunHandle};
use weft_observability::{LogLevel, Logger, TraceContext};

/// A local handler module served over the bridge's `Invoker` service.
///
/// Modules are registered programmatically on the [`crate::BridgeServer`]
/// and addressed by `handler_name` on the wire. `method` distinguishes
/// the invocation surface (`"api"`, `"http"`, `"sse"`, `"event"`, or
/// anything a peer defines).
pub trait HandlerModule: Send + Sync {
    fn name(&self) -> &str;

    fn invoke(
        &self,
        method: &str,
        input: ValueMap,
        meta: ValueMap,
        ctx: ModuleCtx,
    ) -> BoxFuture<'static, Result<ValueMap, BoxError>>;
}

/// Context handed to a served handler module: the same ambient surface a
/// local route or event handler gets.
#[derive(Clone)]
pub struct ModuleCtx {
    pub logger: Arc<dyn Logger>,
    pub kv: Arc<dyn KvStore>,
    pub kv_path: KvPath,
    /// Run scope resolved from the caller's `run_id` meta, when it is
    /// still alive on this host.
    pub run: Option<RunHandle>,
    pub(crate) trace: Option<TraceContext>,
    pub(crate) bus: Bus,
}

impl ModuleCtx {
    /// Emit on the host bus, carrying the caller's run and trace context.
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

    pub fn log(&self, level: &str, msg: &str, fields: Option<&Value>) {
        self.logger.log(LogLevel::parse(level), msg, fields);
    }

    pub fn trace(&self) -> Option<&TraceContext> {
        self.trace.as_ref()
    }
}
