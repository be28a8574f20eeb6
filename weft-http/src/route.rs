use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use serde_json::Value;
use weft_bus::{BoxError, Bus, EmitArgs, RemoteBinding};
use weft_kv::{KvPath, KvStore, RunHandle};
use weft_observability::{Logger, TraceContext};

use crate::middleware::Middleware;
use crate::stream::{SseFormat, StreamHandle};

/// HTTP methods a route may bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteMethod {
    Get,
    Post,
    Put,
    Delete,
}

impl RouteMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMethod::Get => "GET",
            RouteMethod::Post => "POST",
            RouteMethod::Put => "PUT",
            RouteMethod::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for RouteMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How the route's response is shaped on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// JSON in, JSON out.
    Api,
    /// Text/HTML out, content type from the handler's `mime`.
    Http,
    /// Server-push stream (event-framed or NDJSON).
    Sse,
}

impl RouteKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RouteKind::Api => "api",
            RouteKind::Http => "http",
            RouteKind::Sse => "sse",
        }
    }
}

/// Response schema, either one document or keyed by status code.
#[derive(Debug, Clone)]
pub enum ResponseSchema {
    Global(Value),
    PerStatus(HashMap<u16, Value>),
}

/// The adapted request a handler receives.
#[derive(Debug, Clone)]
pub struct RouteRequest {
    pub method: String,
    /// Concrete request path, e.g. `/orders/42`.
    pub path: String,
    /// Route template the path matched, e.g. `/orders/:id`.
    pub route: String,
    pub url: String,
    pub params: HashMap<String, String>,
    /// Query parameters as a JSON object of strings.
    pub query: Value,
    pub body: Value,
    pub headers: HashMap<String, String>,
    /// Authenticated principal, populated by middleware when present.
    pub user: Option<Value>,
}

/// What a handler returns for non-streaming routes.
#[derive(Debug, Clone, Default)]
pub struct Reply {
    /// Defaults to 200 when unset.
    pub status: Option<u16>,
    pub body: Option<Value>,
    pub mime: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Self {
            status: None,
            body: Some(body),
            mime: None,
            headers: Vec::new(),
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Local route handler. Returning `None` on a non-streaming route is an
/// internal error (500); on a streaming route it is the normal case.
pub type RouteHandler = Arc<
    dyn Fn(RouteRequest, RouteCtx) -> BoxFuture<'static, Result<Option<Reply>, BoxError>>
        + Send
        + Sync,
>;

/// Who produces the response.
#[derive(Clone)]
pub enum RouteTarget {
    Local(RouteHandler),
    /// Delegated through the bridge, method = route kind.
    Remote(RemoteBinding),
    /// A single file under a configured root; 404 when missing.
    Static { root: PathBuf, file: String },
}

/// One route registration.
#[derive(Clone)]
pub struct RouteConfig {
    pub method: RouteMethod,
    /// Template with `:name` placeholders.
    pub path: String,
    pub kind: RouteKind,
    pub body_schema: Option<Value>,
    pub query_schema: Option<Value>,
    pub response_schema: Option<ResponseSchema>,
    pub strict: bool,
    pub emits: Vec<String>,
    pub middleware: Vec<Arc<dyn Middleware>>,
    pub target: RouteTarget,
    /// Wire format for `kind = Sse`.
    pub sse_format: SseFormat,
}

impl RouteConfig {
    fn new(method: RouteMethod, path: impl Into<String>, kind: RouteKind, target: RouteTarget) -> Self {
        Self {
            method,
            path: path.into(),
            kind,
            body_schema: None,
            query_schema: None,
            response_schema: None,
            strict: false,
            emits: Vec::new(),
            middleware: Vec::new(),
            target,
            sse_format: SseFormat::EventStream,
        }
    }

    pub fn api(method: RouteMethod, path: impl Into<String>, handler: RouteHandler) -> Self {
        Self::new(method, path, RouteKind::Api, RouteTarget::Local(handler))
    }

    pub fn http(method: RouteMethod, path: impl Into<String>, handler: RouteHandler) -> Self {
        Self::new(method, path, RouteKind::Http, RouteTarget::Local(handler))
    }

    pub fn sse(method: RouteMethod, path: impl Into<String>, handler: RouteHandler) -> Self {
        Self::new(method, path, RouteKind::Sse, RouteTarget::Local(handler))
    }

    pub fn remote(
        method: RouteMethod,
        path: impl Into<String>,
        kind: RouteKind,
        binding: RemoteBinding,
    ) -> Self {
        Self::new(method, path, kind, RouteTarget::Remote(binding))
    }

    pub fn static_file(
        path: impl Into<String>,
        root: impl Into<PathBuf>,
        file: impl Into<String>,
    ) -> Self {
        Self::new(
            RouteMethod::Get,
            path,
            RouteKind::Http,
            RouteTarget::Static {
                root: root.into(),
                file: file.into(),
            },
        )
    }

    pub fn with_body_schema(mut self, schema: Value) -> Self {
        self.body_schema = Some(schema);
        self
    }

    pub fn with_query_schema(mut self, schema: Value) -> Self {
        self.query_schema = Some(schema);
        self
    }

    pub fn with_response_schema(mut self, schema: ResponseSchema) -> Self {
        self.response_schema = Some(schema);
        self
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn emits(mut self, topics: Vec<String>) -> Self {
        self.emits = topics;
        self
    }

    pub fn with_middleware(mut self, middleware: Vec<Arc<dyn Middleware>>) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn with_sse_format(mut self, format: SseFormat) -> Self {
        self.sse_format = format;
        self
    }

    /// Label used in topology origins and log lines.
    pub fn label(&self) -> String {
        format!("{} {}", self.method, self.path)
    }
}

/// Context handed to a local route handler.
#[derive(Clone)]
pub struct RouteCtx {
    pub logger: Arc<dyn Logger>,
    pub kv: Arc<dyn KvStore>,
    pub kv_path: KvPath,
    pub run: RunHandle,
    /// Present only on streaming routes.
    pub stream: Option<StreamHandle>,
    pub(crate) trace: Option<TraceContext>,
    pub(crate) bus: Bus,
}

impl RouteCtx {
    /// Emit on a topic, carrying the request's run scope and span.
    pub fn emit(&self, topic: impl Into<String>, data: Value) {
        let mut args = EmitArgs::new(topic, data).with_run(self.run.id());
        if let Some(trace) = &self.trace {
            args = args.with_trace(trace.clone());
        }
        self.bus.emit(args);
    }

    pub fn trace(&self) -> Option<&TraceContext> {
        self.trace.as_ref()
    }
}
