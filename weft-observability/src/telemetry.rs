use opentelemetry::global::{self, BoxedSpan, BoxedTracer};
use opentelemetry::metrics::{Counter, Histogram};
use opentelemetry::trace::{Link, Span, SpanKind, Status, Tracer};
use opentelemetry::KeyValue;
use opentelemetry_semantic_conventions::attribute;

use crate::context::TraceContext;

/// Span and metric factory shared by every sub-service.
///
/// Works against the process-global OpenTelemetry provider: when no
/// provider is installed (tests, hosts that opted out) every span is a
/// no-op and [`SpanHandle::trace_context`] returns `None`, so envelopes
/// simply travel without trace fields.
#[derive(Clone)]
pub struct Telemetry {
    tracer: std::sync::Arc<BoxedTracer>,
    http: HttpMetrics,
}

/// HTTP-layer instruments recorded by the route dispatcher.
#[derive(Clone)]
pub struct HttpMetrics {
    pub requests_total: Counter<u64>,
    pub request_latency_ms: Histogram<f64>,
    pub request_duration_ms: Histogram<f64>,
}

impl HttpMetrics {
    fn new() -> Self {
        let meter = global::meter("weft");
        Self {
            requests_total: meter
                .u64_counter("requests_total")
                .with_description("Requests handled, by method/type/path/status")
                .build(),
            request_latency_ms: meter
                .f64_histogram("request_latency_ms")
                .with_unit("ms")
                .with_description("Time spent between middleware entry and dispatch")
                .build(),
            request_duration_ms: meter
                .f64_histogram("request_duration_ms")
                .with_unit("ms")
                .with_description("Time spent inside the route handler")
                .build(),
        }
    }
}

/// Attribute bundle for the per-request span.
pub struct RouteSpanArgs<'a> {
    pub method: &'a str,
    pub route: &'a str,
    pub scheme: &'a str,
    pub server_address: &'a str,
    pub server_port: u16,
    pub path: &'a str,
    pub query: Option<&'a str>,
    pub user_agent: Option<&'a str>,
    pub client_address: Option<&'a str>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self {
            tracer: std::sync::Arc::new(global::tracer("weft")),
            http: HttpMetrics::new(),
        }
    }

    pub fn http_metrics(&self) -> &HttpMetrics {
        &self.http
    }

    /// Span for one envelope delivery: `event <topic>`, linked to the
    /// emitting span when the envelope carried a trace context.
    pub fn event_span(
        &self,
        topic: &str,
        link: Option<&TraceContext>,
        subscription: &str,
    ) -> SpanHandle {
        let mut builder = self
            .tracer
            .span_builder(format!("event {topic}"))
            .with_kind(SpanKind::Consumer)
            .with_attributes([
                KeyValue::new("weft.topic", topic.to_string()),
                KeyValue::new("weft.subscription", subscription.to_string()),
            ]);
        if let Some(ctx) = link.and_then(TraceContext::to_span_context) {
            builder = builder.with_links(vec![Link::with_context(ctx)]);
        }
        SpanHandle::new(builder.start(self.tracer.as_ref()))
    }

    /// Span for one HTTP request: `<METHOD> <route-template>`.
    pub fn route_span(&self, args: RouteSpanArgs<'_>) -> SpanHandle {
        let mut attrs = vec![
            KeyValue::new(attribute::HTTP_REQUEST_METHOD, args.method.to_string()),
            KeyValue::new(attribute::URL_SCHEME, args.scheme.to_string()),
            KeyValue::new(attribute::SERVER_ADDRESS, args.server_address.to_string()),
            KeyValue::new(attribute::SERVER_PORT, i64::from(args.server_port)),
            KeyValue::new(attribute::URL_PATH, args.path.to_string()),
            KeyValue::new(attribute::HTTP_ROUTE, args.route.to_string()),
        ];
        if let Some(query) = args.query {
            attrs.push(KeyValue::new(attribute::URL_QUERY, query.to_string()));
        }
        if let Some(ua) = args.user_agent {
            attrs.push(KeyValue::new(attribute::USER_AGENT_ORIGINAL, ua.to_string()));
        }
        if let Some(client) = args.client_address {
            attrs.push(KeyValue::new(attribute::CLIENT_ADDRESS, client.to_string()));
        }
        let builder = self
            .tracer
            .span_builder(format!("{} {}", args.method, args.route))
            .with_kind(SpanKind::Server)
            .with_attributes(attrs);
        SpanHandle::new(builder.start(self.tracer.as_ref()))
    }

    /// Span for one cron tick: `cron <expr>`.
    pub fn cron_span(&self, cron_time: &str, name: &str) -> SpanHandle {
        let builder = self
            .tracer
            .span_builder(format!("cron {cron_time}"))
            .with_kind(SpanKind::Internal)
            .with_attributes([
                KeyValue::new("weft.cron.schedule", cron_time.to_string()),
                KeyValue::new("weft.cron.name", name.to_string()),
            ]);
        SpanHandle::new(builder.start(self.tracer.as_ref()))
    }

    /// Span for one reactive handler invocation: `reactive <name>`.
    pub fn reactive_span(&self, name: &str, link: Option<&TraceContext>) -> SpanHandle {
        let mut builder = self
            .tracer
            .span_builder(format!("reactive {name}"))
            .with_kind(SpanKind::Internal)
            .with_attributes([KeyValue::new("weft.watch", name.to_string())]);
        if let Some(ctx) = link.and_then(TraceContext::to_span_context) {
            builder = builder.with_links(vec![Link::with_context(ctx)]);
        }
        SpanHandle::new(builder.start(self.tracer.as_ref()))
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new()
    }
}

/// A started span plus the helpers the runtime needs around it.
///
/// The underlying span ends when the handle is dropped; [`SpanHandle::end`]
/// exists for the paths that want to end it at a precise point (response
/// `finish`/`close`).
pub struct SpanHandle {
    span: BoxedSpan,
}

impl SpanHandle {
    fn new(span: BoxedSpan) -> Self {
        Self { span }
    }

    /// Wire form of this span's context, for stamping onto envelopes and
    /// RPC metadata. `None` when no real tracer is installed.
    pub fn trace_context(&self) -> Option<TraceContext> {
        TraceContext::from_span_context(self.span.span_context())
    }

    pub fn set_attribute(&mut self, kv: KeyValue) {
        self.span.set_attribute(kv);
    }

    pub fn set_status_code(&mut self, status: u16) {
        self.span.set_attribute(KeyValue::new(
            attribute::HTTP_RESPONSE_STATUS_CODE,
            i64::from(status),
        ));
        if status >= 500 {
            self.span.set_status(Status::error(format!("HTTP {status}")));
        }
    }

    /// Record a handler failure: exception event plus error status.
    pub fn record_failure(&mut self, message: &str) {
        self.span.add_event(
            "exception",
            vec![KeyValue::new("exception.message", message.to_string())],
        );
        self.span.set_status(Status::error(message.to_string()));
    }

    pub fn end(&mut self) {
        self.span.end();
    }
}
