use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::RawPathParams;
use axum::http::{header, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::Next;
use axum::response::Response;
use axum::routing::MethodFilter;
use axum::Router;
use jsonschema::Validator;
use opentelemetry::KeyValue;
use serde_json::{json, Map, Value};
use tokio_stream::wrappers::UnboundedReceiverStream;
use weft_bus::{Bus, SchemaError, ValueMap};
use weft_kv::{KvPath, KvStore, RunHandle, RunRegistry};
use weft_observability::{LogLevel, Logger, RouteSpanArgs, SpanHandle, Telemetry};

use crate::error::validation_error_body;
use crate::route::{
    Reply, ResponseSchema, RouteConfig, RouteCtx, RouteKind, RouteMethod, RouteRequest,
    RouteTarget,
};
use crate::stream::{ndjson_content_type, SseFormat, StreamHandle};

/// Error type for router assembly.
#[derive(Debug)]
pub enum RouterError {
    DuplicateRoute { method: String, path: String },
    Schema { route: String, error: SchemaError },
}

impl std::fmt::Display for RouterError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RouterError::DuplicateRoute { method, path } => {
                write!(f, "route {method} {path} registered twice")
            }
            RouterError::Schema { route, error } => {
                write!(f, "route {route} has an invalid schema: {error}")
            }
        }
    }
}

impl std::error::Error for RouterError {}

/// Everything the dispatcher needs from the owning server.
#[derive(Clone)]
pub struct RouterDeps {
    pub bus: Bus,
    pub runs: RunRegistry,
    pub kv: Arc<dyn KvStore>,
    pub logger: Arc<dyn Logger>,
    pub telemetry: Telemetry,
    pub server_address: String,
    pub server_port: u16,
}

/// Collects route configurations and assembles the axum router.
#[derive(Default)]
pub struct HttpRouter {
    routes: Vec<RouteConfig>,
    bound: HashSet<(RouteMethod, String)>,
}

impl HttpRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a route. `(method, path)` must be unique.
    pub fn add(&mut self, route: RouteConfig) -> Result<(), RouterError> {
        if !self.bound.insert((route.method, route.path.clone())) {
            return Err(RouterError::DuplicateRoute {
                method: route.method.to_string(),
                path: route.path.clone(),
            });
        }
        self.routes.push(route);
        Ok(())
    }

    pub fn routes(&self) -> &[RouteConfig] {
        &self.routes
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Compile schemas and produce the servable router.
    pub fn build(&self, deps: RouterDeps) -> Result<Router, RouterError> {
        let state = Arc::new(deps);
        let mut router = Router::new();
        for config in &self.routes {
            let entry = Arc::new(RouteEntry::compile(config.clone())?);
            let template = axum_path(&config.path);
            let state = Arc::clone(&state);
            let handler = move |params: RawPathParams, req: Request<Body>| {
                let state = Arc::clone(&state);
                let entry = Arc::clone(&entry);
                async move { dispatch(state, entry, params, req).await }
            };
            let filter = match config.method {
                RouteMethod::Get => MethodFilter::GET,
                RouteMethod::Post => MethodFilter::POST,
                RouteMethod::Put => MethodFilter::PUT,
                RouteMethod::Delete => MethodFilter::DELETE,
            };
            router = router.route(&template, axum::routing::on(filter, handler));
        }
        Ok(router.layer(axum::middleware::from_fn(stamp_initiated)))
    }
}

/// Marker recording when the request entered the middleware stack.
#[derive(Clone, Copy)]
struct Initiated(Instant);

async fn stamp_initiated(mut req: Request<Body>, next: Next) -> Response {
    req.extensions_mut().insert(Initiated(Instant::now()));
    next.run(req).await
}

/// Render a `:name` template into axum's `{name}` syntax.
fn axum_path(template: &str) -> String {
    template
        .split('/')
        .map(|seg| match seg.strip_prefix(':') {
            Some(name) => format!("{{{name}}}"),
            None => seg.to_string(),
        })
        .collect::<Vec<_>>()
        .join("/")
}

enum ResponseValidators {
    None,
    Global(Arc<Validator>),
    PerStatus {
        by_status: HashMap<u16, Arc<Validator>>,
        /// Validator for statuses absent from the map: a generic
        /// `{error: string}` object, kept for compatibility even though
        /// it can surprise callers.
        fallback: Arc<Validator>,
    },
}

struct RouteEntry {
    config: RouteConfig,
    body_validator: Option<Arc<Validator>>,
    query_validator: Option<Arc<Validator>>,
    response: ResponseValidators,
    /// Schema document used by streaming sends (also decides the NDJSON
    /// content type).
    stream_schema: Option<Value>,
    stream_validator: Option<Arc<Validator>>,
}

fn compile_schema(route: &str, doc: &Value) -> Result<Arc<Validator>, RouterError> {
    weft_bus::schema::compile(doc)
        .map(Arc::new)
        .map_err(|error| RouterError::Schema {
            route: route.to_string(),
            error,
        })
}

fn fallback_error_schema() -> Value {
    json!({
        "type": "object",
        "properties": {"error": {"type": "string"}},
        "required": ["error"]
    })
}

impl RouteEntry {
    fn compile(config: RouteConfig) -> Result<Self, RouterError> {
        let label = config.label();
        let body_validator = config
            .body_schema
            .as_ref()
            .map(|s| compile_schema(&label, s))
            .transpose()?;
        let query_validator = config
            .query_schema
            .as_ref()
            .map(|s| compile_schema(&label, s))
            .transpose()?;
        let response = match &config.response_schema {
            None => ResponseValidators::None,
            Some(ResponseSchema::Global(doc)) => {
                ResponseValidators::Global(compile_schema(&label, doc)?)
            }
            Some(ResponseSchema::PerStatus(map)) => {
                let mut by_status = HashMap::new();
                for (status, doc) in map {
                    by_status.insert(*status, compile_schema(&label, doc)?);
                }
                ResponseValidators::PerStatus {
                    by_status,
                    fallback: compile_schema(&label, &fallback_error_schema())?,
                }
            }
        };
        let stream_schema = match &config.response_schema {
            Some(ResponseSchema::Global(doc)) => Some(doc.clone()),
            Some(ResponseSchema::PerStatus(map)) => map.get(&200).cloned(),
            None => None,
        };
        let stream_validator = stream_schema
            .as_ref()
            .map(|s| compile_schema(&label, s))
            .transpose()?;
        Ok(Self {
            config,
            body_validator,
            query_validator,
            response,
            stream_schema,
            stream_validator,
        })
    }
}

fn header_map(req: &Request<Body>) -> HashMap<String, String> {
    req.headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect()
}

fn parse_query(query: Option<&str>) -> Value {
    let mut map = Map::new();
    if let Some(q) = query {
        for (k, v) in form_urlencoded::parse(q.as_bytes()) {
            map.insert(k.into_owned(), Value::String(v.into_owned()));
        }
    }
    Value::Object(map)
}

async fn dispatch(
    state: Arc<RouterDeps>,
    entry: Arc<RouteEntry>,
    params: RawPathParams,
    req: Request<Body>,
) -> Response {
    let initiated = req.extensions().get::<Initiated>().map(|i| i.0);
    let start = Instant::now();
    let latency_ms = initiated
        .map(|i| start.duration_since(i).as_secs_f64() * 1000.0)
        .unwrap_or(0.0);

    let uri = req.uri().clone();
    let path = uri.path().to_string();
    let query_str = uri.query().map(str::to_string);
    let headers = header_map(&req);

    let mut span = state.telemetry.route_span(RouteSpanArgs {
        method: entry.config.method.as_str(),
        route: &entry.config.path,
        scheme: uri.scheme_str().unwrap_or("http"),
        server_address: &state.server_address,
        server_port: state.server_port,
        path: &path,
        query: query_str.as_deref(),
        user_agent: headers.get("user-agent").map(String::as_str),
        client_address: headers.get("x-forwarded-for").map(String::as_str),
    });

    let run = match state.runs.create().await {
        Ok(run) => run,
        Err(e) => {
            tracing::error!(route = %entry.config.label(), error = %e, "run scope creation failed");
            span.record_failure(&e.to_string());
            span.end();
            return plain_json(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "internal"}));
        }
    };

    let params_map: HashMap<String, String> = params
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let query = parse_query(query_str.as_deref());

    // Drain the body before handing anything to the handler.
    let body_bytes = match axum::body::to_bytes(req.into_body(), 10 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(e) => {
            let reply = error_reply(
                &entry,
                &run,
                400,
                "body_read_failed",
                &e.to_string(),
                &path,
            );
            return finalize(&state, &entry, &mut span, &run, latency_ms, start, reply, false)
                .await;
        }
    };
    let body = match entry.config.kind {
        RouteKind::Http => Value::String(String::from_utf8_lossy(&body_bytes).into_owned()),
        RouteKind::Api | RouteKind::Sse => {
            if body_bytes.is_empty() {
                Value::Null
            } else {
                match serde_json::from_slice(&body_bytes) {
                    Ok(v) => v,
                    Err(e) => {
                        if entry.config.strict {
                            let reply = error_reply(
                                &entry,
                                &run,
                                422,
                                "validation_failed",
                                &format!("body is not valid JSON: {e}"),
                                &path,
                            );
                            return finalize(
                                &state, &entry, &mut span, &run, latency_ms, start, reply,
                                false,
                            )
                            .await;
                        }
                        tracing::warn!(route = %entry.config.label(), error = %e, "non-JSON body on lax route");
                        Value::String(String::from_utf8_lossy(&body_bytes).into_owned())
                    }
                }
            }
        }
    };

    let mut route_req = RouteRequest {
        method: entry.config.method.to_string(),
        path: path.clone(),
        route: entry.config.path.clone(),
        url: uri.to_string(),
        params: params_map,
        query,
        body,
        headers,
        user: None,
    };

    // Middleware chain: stages may mutate the request or short-circuit.
    for mw in &entry.config.middleware {
        if let Err(reply) = mw.handle(&mut route_req).await {
            return finalize(&state, &entry, &mut span, &run, latency_ms, start, reply, false)
                .await;
        }
    }

    // Request validation.
    for (validator, what, value) in [
        (&entry.body_validator, "body", &route_req.body),
        (&entry.query_validator, "query", &route_req.query),
    ] {
        let Some(validator) = validator else { continue };
        if let Err(err) = validator.validate(value) {
            let reason = format!("{what}: {err}");
            if entry.config.strict {
                let reply =
                    error_reply(&entry, &run, 422, "validation_failed", &reason, &path);
                return finalize(
                    &state, &entry, &mut span, &run, latency_ms, start, reply, false,
                )
                .await;
            }
            state.logger.log(
                LogLevel::Warn,
                &format!("{} request failed validation: {reason}", entry.config.label()),
                None,
            );
            tracing::warn!(route = %entry.config.label(), %reason, "lax request validation failure");
        }
    }

    match &entry.config.target {
        RouteTarget::Static { root, file } => {
            let reply = serve_static(root, file).await;
            finalize(&state, &entry, &mut span, &run, latency_ms, start, reply, false).await
        }
        RouteTarget::Local(handler) if entry.config.kind == RouteKind::Sse => {
            dispatch_sse(
                state.clone(),
                entry.clone(),
                handler.clone(),
                route_req,
                span,
                run,
                latency_ms,
                start,
            )
            .await
        }
        RouteTarget::Local(handler) => {
            let ctx = RouteCtx {
                logger: Arc::clone(&state.logger),
                kv: Arc::clone(&state.kv),
                kv_path: KvPath::new(Arc::clone(&state.kv)),
                run: run.clone(),
                stream: None,
                trace: span.trace_context(),
                bus: state.bus.clone(),
            };
            let (reply, validate) = match handler(route_req, ctx).await {
                Ok(Some(reply)) => (reply, true),
                Ok(None) => {
                    span.record_failure("handler returned no result");
                    (
                        error_reply(
                            &entry,
                            &run,
                            500,
                            "internal",
                            "handler returned no result",
                            &path,
                        ),
                        false,
                    )
                }
                Err(err) => {
                    span.record_failure(&err.to_string());
                    state.logger.log(
                        LogLevel::Error,
                        &format!("{} handler failed: {err}", entry.config.label()),
                        None,
                    );
                    (
                        error_reply(&entry, &run, 500, "internal", &err.to_string(), &path),
                        false,
                    )
                }
            };
            finalize(&state, &entry, &mut span, &run, latency_ms, start, reply, validate).await
        }
        RouteTarget::Remote(binding) => {
            let outcome = invoke_remote(&state, &entry, binding, &route_req, &span, &run).await;
            match (outcome, entry.config.kind) {
                (Ok(reply), RouteKind::Sse) => {
                    // Unary remote handlers produce at most one frame.
                    let (stream, rx) = StreamHandle::channel(
                        entry.config.sse_format,
                        entry.stream_validator.clone(),
                        entry.config.strict,
                    );
                    if let Some(body) = reply.body {
                        let _ = stream.send(body, Default::default());
                    }
                    stream.close();
                    let response = stream_response(&entry, rx);
                    finalize_streaming(&state, &entry, &mut span, &run, latency_ms, start)
                        .await;
                    response
                }
                (Ok(reply), _) => {
                    finalize(&state, &entry, &mut span, &run, latency_ms, start, reply, true)
                        .await
                }
                (Err(reply), _) => {
                    finalize(&state, &entry, &mut span, &run, latency_ms, start, reply, false)
                        .await
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_sse(
    state: Arc<RouterDeps>,
    entry: Arc<RouteEntry>,
    handler: crate::route::RouteHandler,
    route_req: RouteRequest,
    mut span: SpanHandle,
    run: RunHandle,
    latency_ms: f64,
    start: Instant,
) -> Response {
    let (stream, rx) = StreamHandle::channel(
        entry.config.sse_format,
        entry.stream_validator.clone(),
        entry.config.strict,
    );
    let ctx = RouteCtx {
        logger: Arc::clone(&state.logger),
        kv: Arc::clone(&state.kv),
        kv_path: KvPath::new(Arc::clone(&state.kv)),
        run: run.clone(),
        stream: Some(stream.clone()),
        trace: span.trace_context(),
        bus: state.bus.clone(),
    };

    let response = stream_response(&entry, rx);

    // The handler runs while the response streams; the adapter closes
    // the stream when it returns, the watcher releases the run scope.
    let watcher_state = Arc::clone(&state);
    let watcher_entry = Arc::clone(&entry);
    tokio::spawn(async move {
        let handler_task =
            tokio::spawn(async move { handler(route_req, ctx).await });
        match handler_task.await {
            Ok(Ok(Some(_))) => {
                tracing::debug!(
                    route = %watcher_entry.config.label(),
                    "streaming handler returned a value, discarding"
                );
            }
            Ok(Ok(None)) => {}
            Ok(Err(err)) => {
                span.record_failure(&err.to_string());
                stream.error(&err.to_string());
            }
            Err(join_err) => {
                span.record_failure(&join_err.to_string());
                stream.error("internal error");
            }
        }
        stream.close();
        finalize_streaming(
            &watcher_state,
            &watcher_entry,
            &mut span,
            &run,
            latency_ms,
            start,
        )
        .await;
    });

    response
}

fn stream_response(
    entry: &RouteEntry,
    rx: tokio::sync::mpsc::UnboundedReceiver<Result<bytes::Bytes, std::convert::Infallible>>,
) -> Response {
    let mut builder = Response::builder().status(StatusCode::OK);
    match entry.config.sse_format {
        SseFormat::EventStream => {
            builder = builder
                .header(header::CONTENT_TYPE, "text/event-stream")
                .header(header::CACHE_CONTROL, "no-cache, no-transform")
                .header(header::CONNECTION, "keep-alive")
                .header("x-accel-buffering", "no");
        }
        SseFormat::NdJson => {
            builder = builder.header(
                header::CONTENT_TYPE,
                ndjson_content_type(entry.stream_schema.as_ref()),
            );
        }
    }
    builder
        .body(Body::from_stream(UnboundedReceiverStream::new(rx)))
        .expect("static header set is valid")
}

async fn serve_static(root: &std::path::Path, file: &str) -> Reply {
    let full = root.join(file);
    match tokio::fs::read(&full).await {
        Ok(bytes) => {
            let mime = mime_guess::from_path(&full)
                .first_or_octet_stream()
                .to_string();
            // Static payloads bypass JSON; carry them as a string when
            // textual, base64 is the host's job for true binaries.
            Reply {
                status: Some(200),
                body: Some(Value::String(String::from_utf8_lossy(&bytes).into_owned())),
                mime: Some(mime),
                headers: Vec::new(),
            }
        }
        Err(_) => Reply {
            status: Some(404),
            body: Some(json!({"error": "not found"})),
            mime: Some("application/json".to_string()),
            headers: Vec::new(),
        },
    }
}

async fn invoke_remote(
    state: &RouterDeps,
    entry: &RouteEntry,
    binding: &weft_bus::RemoteBinding,
    route_req: &RouteRequest,
    span: &SpanHandle,
    run: &RunHandle,
) -> Result<Reply, Reply> {
    let Some(invoker) = state.bus.remote_invoker() else {
        return Err(error_reply(
            entry,
            run,
            500,
            "bridge_unavailable",
            "bridge is not initialised",
            &route_req.path,
        ));
    };

    let mut input = ValueMap::new();
    input.insert("body".into(), route_req.body.clone());
    input.insert("query".into(), route_req.query.clone());
    input.insert(
        "params".into(),
        Value::Object(
            route_req
                .params
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        ),
    );
    input.insert(
        "headers".into(),
        Value::Object(
            route_req
                .headers
                .iter()
                .map(|(k, v)| (k.clone(), Value::String(v.clone())))
                .collect(),
        ),
    );
    input.insert("user".into(), route_req.user.clone().unwrap_or(Value::Null));

    let mut meta = ValueMap::new();
    meta.insert("run_id".into(), Value::String(run.id().to_string()));
    meta.insert(
        "http_method".into(),
        Value::String(route_req.method.clone()),
    );
    meta.insert("route".into(), Value::String(route_req.route.clone()));
    meta.insert("path".into(), Value::String(route_req.path.clone()));
    meta.insert("url".into(), Value::String(route_req.url.clone()));
    if let Some(tc) = span.trace_context() {
        meta.insert("trace_id".into(), Value::String(tc.trace_id));
        meta.insert("span_id".into(), Value::String(tc.span_id));
        meta.insert("trace_flags".into(), json!(tc.trace_flags));
    }

    match invoker
        .invoke(binding, entry.config.kind.as_str(), input, meta)
        .await
    {
        Ok(remote) => Ok(reply_from_output(remote.output)),
        Err(err) => {
            state.logger.log(
                LogLevel::Error,
                &format!("{} remote invocation failed: {err}", entry.config.label()),
                None,
            );
            Err(error_reply(
                entry,
                run,
                500,
                "remote_invocation_failed",
                &err.to_string(),
                &route_req.path,
            ))
        }
    }
}

/// Translate a remote handler's output record into a [`Reply`]:
/// `status`/`headers`/`mime` map onto the response envelope, `body`
/// becomes the body, and with no `body` key the remaining fields do.
fn reply_from_output(mut output: ValueMap) -> Reply {
    let status = output
        .remove("status")
        .and_then(|v| v.as_u64())
        .map(|s| s as u16);
    let mime = output
        .remove("mime")
        .and_then(|v| v.as_str().map(str::to_string));
    let headers = output
        .remove("headers")
        .and_then(|v| match v {
            Value::Object(map) => Some(
                map.into_iter()
                    .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
                    .collect::<Vec<_>>(),
            ),
            _ => None,
        })
        .unwrap_or_default();
    let body = match output.remove("body") {
        Some(body) => Some(body),
        None if output.is_empty() => None,
        None => Some(Value::Object(output)),
    };
    Reply {
        status,
        body,
        mime,
        headers,
    }
}

fn error_reply(
    entry: &RouteEntry,
    run: &RunHandle,
    status: u16,
    error: &str,
    reason: &str,
    path: &str,
) -> Reply {
    Reply {
        status: Some(status),
        body: Some(validation_error_body(
            error,
            reason,
            path,
            entry.config.method.as_str(),
            &entry.config.label(),
            Some(run.id()),
        )),
        mime: Some("application/json".to_string()),
        headers: Vec::new(),
    }
}

/// Serialize a reply, record metrics, close the span, release the run.
#[allow(clippy::too_many_arguments)]
async fn finalize(
    state: &RouterDeps,
    entry: &RouteEntry,
    span: &mut SpanHandle,
    run: &RunHandle,
    latency_ms: f64,
    start: Instant,
    mut reply: Reply,
    validate_response: bool,
) -> Response {
    let mut status = reply.status.unwrap_or(200);

    if validate_response {
        let validator = match &entry.response {
            ResponseValidators::None => None,
            ResponseValidators::Global(v) => Some(v),
            ResponseValidators::PerStatus { by_status, fallback } => {
                Some(by_status.get(&status).unwrap_or(fallback))
            }
        };
        if let Some(validator) = validator {
            let body = reply.body.clone().unwrap_or(Value::Null);
            if let Err(err) = validator.validate(&body) {
                let reason = format!("response for status {status}: {err}");
                if entry.config.strict {
                    span.record_failure(&reason);
                    status = 500;
                    reply = error_reply(
                        entry,
                        run,
                        500,
                        "response_validation_failed",
                        &reason,
                        &entry.config.path,
                    );
                } else {
                    state.logger.log(
                        LogLevel::Warn,
                        &format!(
                            "{} response failed validation: {reason}",
                            entry.config.label()
                        ),
                        None,
                    );
                    tracing::warn!(route = %entry.config.label(), %reason, "lax response validation failure");
                }
            }
        }
    }

    let response = render_reply(entry, status, reply);
    record_request(state, entry, status, latency_ms, start);
    span.set_status_code(status);
    span.end();
    if let Err(e) = run.release().await {
        tracing::warn!(run = %run.id(), error = %e, "run release failed");
    }
    response
}

/// Metrics + span close + run release for streaming routes, where the
/// response itself was already written.
async fn finalize_streaming(
    state: &RouterDeps,
    entry: &RouteEntry,
    span: &mut SpanHandle,
    run: &RunHandle,
    latency_ms: f64,
    start: Instant,
) {
    record_request(state, entry, 200, latency_ms, start);
    span.set_status_code(200);
    span.end();
    if let Err(e) = run.release().await {
        tracing::warn!(run = %run.id(), error = %e, "run release failed");
    }
}

fn record_request(
    state: &RouterDeps,
    entry: &RouteEntry,
    status: u16,
    latency_ms: f64,
    start: Instant,
) {
    let attrs = [
        KeyValue::new("method", entry.config.method.as_str()),
        KeyValue::new("type", entry.config.kind.as_str()),
        KeyValue::new("path", entry.config.path.clone()),
        KeyValue::new("status", i64::from(status)),
    ];
    let metrics = state.telemetry.http_metrics();
    metrics.requests_total.add(1, &attrs);
    metrics.request_latency_ms.record(latency_ms, &attrs);
    metrics
        .request_duration_ms
        .record(start.elapsed().as_secs_f64() * 1000.0, &attrs);
}

fn render_reply(entry: &RouteEntry, status: u16, reply: Reply) -> Response {
    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let (content_type, body_bytes) = match entry.config.kind {
        RouteKind::Api | RouteKind::Sse => {
            let body = reply.body.unwrap_or(Value::Null);
            (
                "application/json".to_string(),
                serde_json::to_vec(&body).unwrap_or_else(|_| b"null".to_vec()),
            )
        }
        RouteKind::Http => {
            let text = match reply.body {
                Some(Value::String(s)) => s,
                Some(other) => other.to_string(),
                None => String::new(),
            };
            (
                reply.mime.unwrap_or_else(|| "text/html".to_string()),
                text.into_bytes(),
            )
        }
    };
    // Error replies always carry JSON, whatever the route kind.
    let content_type = if status >= 400 && entry.config.kind == RouteKind::Http {
        reply_mime_for_error().to_string()
    } else {
        content_type
    };

    let mut builder = Response::builder()
        .status(status_code)
        .header(header::CONTENT_TYPE, content_type);
    for (name, value) in reply.headers {
        if let (Ok(name), Ok(value)) = (
            HeaderName::try_from(name.as_str()),
            HeaderValue::try_from(value.as_str()),
        ) {
            builder = builder.header(name, value);
        }
    }
    builder
        .body(Body::from(body_bytes))
        .unwrap_or_else(|_| plain_json(StatusCode::INTERNAL_SERVER_ERROR, json!({"error": "internal"})))
}

fn reply_mime_for_error() -> &'static str {
    "application/json"
}

fn plain_json(status: StatusCode, body: Value) -> Response {
    Response::builder()
        .status(status)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .expect("static response is valid")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn axum_path_renders_placeholders() {
        assert_eq!(axum_path("/orders/:id"), "/orders/{id}");
        assert_eq!(axum_path("/a/:x/b/:y"), "/a/{x}/b/{y}");
        assert_eq!(axum_path("/plain"), "/plain");
        assert_eq!(axum_path("/"), "/");
    }

    #[test]
    fn parse_query_builds_string_object() {
        assert_eq!(
            parse_query(Some("a=1&b=two&c=with%20space")),
            json!({"a": "1", "b": "two", "c": "with space"})
        );
        assert_eq!(parse_query(None), json!({}));
        assert_eq!(parse_query(Some("")), json!({}));
    }

    #[test]
    fn remote_output_maps_envelope_keys() {
        let mut output = ValueMap::new();
        output.insert("status".into(), json!(201));
        output.insert("mime".into(), json!("text/plain"));
        output.insert(
            "headers".into(),
            json!({"x-request-id": "abc", "bad": 42}),
        );
        output.insert("body".into(), json!({"ok": true}));
        let reply = reply_from_output(output);
        assert_eq!(reply.status, Some(201));
        assert_eq!(reply.mime.as_deref(), Some("text/plain"));
        // Non-string header values are dropped, not stringified.
        assert_eq!(reply.headers, vec![("x-request-id".to_string(), "abc".to_string())]);
        assert_eq!(reply.body, Some(json!({"ok": true})));
    }

    #[test]
    fn remote_output_without_body_uses_residual_fields() {
        let mut output = ValueMap::new();
        output.insert("status".into(), json!(200));
        output.insert("greeting".into(), json!("hi"));
        output.insert("count".into(), json!(3));
        let reply = reply_from_output(output);
        assert_eq!(reply.body, Some(json!({"greeting": "hi", "count": 3})));
    }

    #[test]
    fn remote_output_empty_after_envelope_keys_has_no_body() {
        let mut output = ValueMap::new();
        output.insert("status".into(), json!(204));
        let reply = reply_from_output(output);
        assert_eq!(reply.status, Some(204));
        assert_eq!(reply.body, None);
    }

    #[test]
    fn route_entry_rejects_bad_schema() {
        let config = RouteConfig::api(
            RouteMethod::Get,
            "/x",
            Arc::new(|_req, _ctx| Box::pin(async { Ok(None) })),
        )
        .with_body_schema(json!({"type": "no-such-type"}));
        assert!(matches!(
            RouteEntry::compile(config),
            Err(RouterError::Schema { .. })
        ));
    }

    #[test]
    fn per_status_entry_compiles_fallback() {
        let config = RouteConfig::api(
            RouteMethod::Get,
            "/x",
            Arc::new(|_req, _ctx| Box::pin(async { Ok(None) })),
        )
        .with_response_schema(ResponseSchema::PerStatus(HashMap::from([(
            200u16,
            json!({"type": "object"}),
        )])));
        let entry = RouteEntry::compile(config).unwrap();
        match entry.response {
            ResponseValidators::PerStatus { by_status, fallback } => {
                assert!(by_status.contains_key(&200));
                assert!(fallback.is_valid(&json!({"error": "x"})));
                assert!(!fallback.is_valid(&json!({"other": 1})));
            }
            _ => panic!("expected per-status validators"),
        }
    }
}
