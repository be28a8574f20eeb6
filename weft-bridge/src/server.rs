use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::{ReceiverStream, TcpListenerStream};
use tokio_util::sync::CancellationToken;
use tonic::{Request, Response, Status, Streaming};
use weft_bus::{Bus, EmitArgs};
use weft_kv::{KvPath, KvStore, RunRegistry};
use weft_observability::{LogLevel, Logger, TraceContext};

use crate::client::BridgeError;
use crate::codec::{decode_map, decode_value, encode_map, encode_value};
use crate::modules::{HandlerModule, ModuleCtx};
use crate::proto::control_plane_server::{ControlPlane, ControlPlaneServer};
use crate::proto::invoker_server::{Invoker, InvokerServer};
use crate::proto::{
    control_request, control_response, ControlRequest, ControlResponse, InvokeRequest,
    InvokeResponse, KvCommonRes, KvGetRes, Status as WireStatus,
};

/// Server half of the bridge: serves registered [`HandlerModule`]s on
/// the `Invoker` service and the host's logger/bus/KV on the
/// `ControlPlane` service.
#[derive(Clone)]
pub struct BridgeServer {
    inner: Arc<ServerInner>,
}

struct ServerInner {
    modules: DashMap<String, Arc<dyn HandlerModule>>,
    bus: Bus,
    runs: RunRegistry,
    kv: Arc<dyn KvStore>,
    logger: Arc<dyn Logger>,
    cancel: CancellationToken,
    serve_task: Mutex<Option<JoinHandle<()>>>,
}

impl BridgeServer {
    pub fn new(
        bus: Bus,
        runs: RunRegistry,
        kv: Arc<dyn KvStore>,
        logger: Arc<dyn Logger>,
    ) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                modules: DashMap::new(),
                bus,
                runs,
                kv,
                logger,
                cancel: CancellationToken::new(),
                serve_task: Mutex::new(None),
            }),
        }
    }

    /// Register a handler module under its name. Re-registration
    /// replaces the previous module.
    pub fn register_module(&self, module: Arc<dyn HandlerModule>) {
        self.inner.modules.insert(module.name().to_string(), module);
    }

    pub fn module_count(&self) -> usize {
        self.inner.modules.len()
    }

    /// Bind and serve both services. Returns the bound address (useful
    /// with port 0).
    pub async fn serve(&self, addr: SocketAddr) -> Result<SocketAddr, BridgeError> {
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|e| BridgeError::Io(format!("bind {addr}: {e}")))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BridgeError::Io(e.to_string()))?;
        let incoming = TcpListenerStream::new(listener);
        let service = GrpcService {
            inner: Arc::clone(&self.inner),
        };
        let cancel = self.inner.cancel.clone();
        let task = tokio::spawn(async move {
            let result = tonic::transport::Server::builder()
                .add_service(InvokerServer::new(service.clone()))
                .add_service(ControlPlaneServer::new(service))
                .serve_with_incoming_shutdown(incoming, cancel.cancelled())
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "bridge server terminated");
            }
        });
        *self.inner.serve_task.lock().unwrap() = Some(task);
        tracing::info!(%local_addr, "bridge server listening");
        Ok(local_addr)
    }

    pub async fn close(&self) {
        self.inner.cancel.cancel();
        let task = self.inner.serve_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

#[derive(Clone)]
struct GrpcService {
    inner: Arc<ServerInner>,
}

fn wire_ok() -> Option<WireStatus> {
    Some(WireStatus {
        code: 0,
        message: String::new(),
    })
}

fn wire_error(code: i32, message: impl Into<String>) -> Option<WireStatus> {
    Some(WireStatus {
        code,
        message: message.into(),
    })
}

fn trace_from_meta(meta: &weft_bus::ValueMap) -> Option<TraceContext> {
    TraceContext::from_meta(
        meta.get("trace_id").and_then(Value::as_str),
        meta.get("span_id").and_then(Value::as_str),
        meta.get("trace_flags").and_then(Value::as_u64).map(|f| f as u8),
    )
}

#[tonic::async_trait]
impl Invoker for GrpcService {
    async fn invoke(
        &self,
        request: Request<InvokeRequest>,
    ) -> Result<Response<InvokeResponse>, Status> {
        let request = request.into_inner();
        let correlation = request.correlation.clone();

        let Some(module) = self
            .inner
            .modules
            .get(&request.handler_name)
            .map(|m| Arc::clone(m.value()))
        else {
            return Ok(Response::new(InvokeResponse {
                correlation,
                status: wire_error(
                    tonic::Code::NotFound as i32,
                    format!("no handler module '{}'", request.handler_name),
                ),
                output: Default::default(),
            }));
        };

        let input = decode_map(request.input);
        let meta = decode_map(request.meta);
        let run = meta
            .get("run_id")
            .and_then(Value::as_str)
            .and_then(|id| self.inner.runs.resolve(id));
        let ctx = ModuleCtx {
            logger: Arc::clone(&self.inner.logger),
            kv: Arc::clone(&self.inner.kv),
            kv_path: KvPath::new(Arc::clone(&self.inner.kv)),
            run,
            trace: trace_from_meta(&meta),
            bus: self.inner.bus.clone(),
        };

        let response = match module.invoke(&request.method, input, meta, ctx).await {
            Ok(output) => InvokeResponse {
                correlation,
                status: wire_ok(),
                output: encode_map(&output),
            },
            Err(err) => {
                tracing::warn!(
                    handler = %request.handler_name,
                    method = %request.method,
                    error = %err,
                    "handler module failed"
                );
                InvokeResponse {
                    correlation,
                    status: wire_error(tonic::Code::Internal as i32, err.to_string()),
                    output: Default::default(),
                }
            }
        };
        Ok(Response::new(response))
    }
}

#[tonic::async_trait]
impl ControlPlane for GrpcService {
    type ConnectStream =
        Pin<Box<dyn futures_util::Stream<Item = Result<ControlResponse, Status>> + Send + 'static>>;

    async fn connect(
        &self,
        request: Request<Streaming<ControlRequest>>,
    ) -> Result<Response<Self::ConnectStream>, Status> {
        let mut inbound = request.into_inner();
        let (tx, rx) = mpsc::channel(64);
        let inner = Arc::clone(&self.inner);

        tokio::spawn(async move {
            loop {
                let message = match inbound.message().await {
                    Ok(Some(message)) => message,
                    Ok(None) => break,
                    Err(e) => {
                        tracing::debug!(error = %e, "control plane stream ended");
                        break;
                    }
                };
                let response = handle_control(&inner, message).await;
                if tx.send(Ok(response)).await.is_err() {
                    break;
                }
            }
        });

        Ok(Response::new(Box::pin(ReceiverStream::new(rx))))
    }
}

/// Translate one control-plane message into host-side effects and the
/// correlated response.
async fn handle_control(inner: &ServerInner, message: ControlRequest) -> ControlResponse {
    let correlation = message.correlation;
    let meta = decode_map(message.meta);
    let run_id = meta.get("run_id").and_then(Value::as_str);

    match message.body {
        Some(control_request::Body::Log(log)) => {
            let fields = Value::Object(decode_map(log.fields));
            inner
                .logger
                .log(LogLevel::parse(&log.level), &log.msg, Some(&fields));
            common_response(correlation, wire_ok())
        }
        Some(control_request::Body::Emit(emit)) => {
            let data = emit.data.map(decode_value).unwrap_or(Value::Null);
            let mut args = EmitArgs::new(emit.topic, data);
            // Only attach the run when the scope is still resolvable;
            // the bus would ignore a dead id anyway.
            if let Some(id) = run_id {
                if inner.runs.resolve(id).is_some() {
                    args = args.with_run(id);
                }
            }
            if let Some(trace) = trace_from_meta(&meta) {
                args = args.with_trace(trace);
            }
            inner.bus.emit(args);
            common_response(correlation, wire_ok())
        }
        Some(control_request::Body::KvGet(get)) => {
            let key = format!("{}:{}", get.bucket, get.key);
            match inner.kv.get(&key).await {
                Ok(value) => ControlResponse {
                    correlation,
                    status: wire_ok(),
                    body: Some(control_response::Body::KvGetRes(KvGetRes {
                        found: value.is_some(),
                        value: value.as_ref().map(encode_value),
                    })),
                },
                Err(e) => ControlResponse {
                    correlation,
                    status: wire_error(tonic::Code::Internal as i32, e.to_string()),
                    body: Some(control_response::Body::KvGetRes(KvGetRes {
                        found: false,
                        value: None,
                    })),
                },
            }
        }
        Some(control_request::Body::KvPut(put)) => {
            let key = format!("{}:{}", put.bucket, put.key);
            let value = put.value.map(decode_value).unwrap_or(Value::Null);
            match inner.kv.put(&key, value).await {
                Ok(()) => common_response(correlation, wire_ok()),
                Err(e) => {
                    common_response(correlation, wire_error(tonic::Code::Internal as i32, e.to_string()))
                }
            }
        }
        Some(control_request::Body::KvDel(del)) => {
            let key = format!("{}:{}", del.bucket, del.key);
            match inner.kv.delete(&key).await {
                Ok(()) => common_response(correlation, wire_ok()),
                Err(e) => {
                    common_response(correlation, wire_error(tonic::Code::Internal as i32, e.to_string()))
                }
            }
        }
        None => common_response(
            correlation,
            wire_error(tonic::Code::InvalidArgument as i32, "empty control message"),
        ),
    }
}

fn common_response(correlation: String, status: Option<WireStatus>) -> ControlResponse {
    let ok = status.as_ref().map(|s| s.code == 0).unwrap_or(false);
    ControlResponse {
        correlation,
        status,
        body: Some(control_response::Body::KvCommonRes(KvCommonRes { ok })),
    }
}
