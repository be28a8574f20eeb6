use std::convert::Infallible;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use jsonschema::Validator;
use serde_json::{json, Value};
use tokio::sync::mpsc;

/// Server-push wire format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SseFormat {
    /// `event:` / `id:` / `retry:` / `data:` lines, blank-line framed.
    #[default]
    EventStream,
    /// One payload per line.
    NdJson,
}

/// Optional frame fields for event-framed sends.
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    pub event: Option<String>,
    pub id: Option<String>,
    pub retry: Option<u64>,
}

/// Error type for stream sends.
#[derive(Debug, Clone)]
pub enum StreamError {
    /// The payload failed response-schema validation on a strict route.
    Invalid(String),
}

impl std::fmt::Display for StreamError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamError::Invalid(reason) => write!(f, "stream payload invalid: {reason}"),
        }
    }
}

impl std::error::Error for StreamError {}

/// Handle a streaming handler writes frames through.
///
/// The handle validates payloads against the route's response schema,
/// frames them per the configured format, and writes to the response
/// body. Once closed (by [`StreamHandle::close`], by an error frame, or
/// by client disconnect) every further send is a no-op.
#[derive(Clone)]
pub struct StreamHandle {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    tx: Mutex<Option<mpsc::UnboundedSender<Result<Bytes, Infallible>>>>,
    closed: AtomicBool,
    format: SseFormat,
    validator: Option<Arc<Validator>>,
    strict: bool,
}

impl StreamHandle {
    /// Build a handle plus the receiver the response body drains.
    pub fn channel(
        format: SseFormat,
        validator: Option<Arc<Validator>>,
        strict: bool,
    ) -> (Self, mpsc::UnboundedReceiver<Result<Bytes, Infallible>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: Arc::new(StreamInner {
                    tx: Mutex::new(Some(tx)),
                    closed: AtomicBool::new(false),
                    format,
                    validator,
                    strict,
                }),
            },
            rx,
        )
    }

    /// Validate, serialize, frame, and write one payload.
    ///
    /// Buffers pass through as-is, objects are JSON-encoded, strings go
    /// verbatim. Sends on a closed stream are no-ops.
    pub fn send(&self, payload: Value, options: SendOptions) -> Result<(), StreamError> {
        if self.is_closed() {
            tracing::debug!("send on closed stream ignored");
            return Ok(());
        }
        if let Some(validator) = &self.inner.validator {
            if let Err(err) = validator.validate(&payload) {
                let reason = err.to_string();
                if self.inner.strict {
                    tracing::error!(%reason, "stream payload rejected by response schema");
                    return Err(StreamError::Invalid(reason));
                }
                tracing::warn!(%reason, "stream payload failed response schema, sending anyway");
            }
        }
        let text = serialize_payload(&payload);
        let frame = match self.inner.format {
            SseFormat::EventStream => frame_event(&text, &options),
            SseFormat::NdJson => format!("{text}\n"),
        };
        self.write(Bytes::from(frame));
        Ok(())
    }

    /// Write an `{"error": …}` frame and close the stream.
    pub fn error(&self, reason: &str) {
        if self.is_closed() {
            return;
        }
        let payload = json!({ "error": reason });
        let text = serialize_payload(&payload);
        let frame = match self.inner.format {
            SseFormat::EventStream => frame_event(&text, &SendOptions::default()),
            SseFormat::NdJson => format!("{text}\n"),
        };
        self.write(Bytes::from(frame));
        self.close();
    }

    /// Terminate the stream. Idempotent.
    pub fn close(&self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            // Dropping the sender ends the response body.
            self.inner.tx.lock().unwrap().take();
        }
    }

    pub fn is_closed(&self) -> bool {
        if self.inner.closed.load(Ordering::SeqCst) {
            return true;
        }
        // Client disconnect drops the body and with it the receiver.
        let gone = self
            .inner
            .tx
            .lock()
            .unwrap()
            .as_ref()
            .map_or(true, |tx| tx.is_closed());
        if gone {
            self.inner.closed.store(true, Ordering::SeqCst);
        }
        gone
    }

    fn write(&self, frame: Bytes) {
        let guard = self.inner.tx.lock().unwrap();
        if let Some(tx) = guard.as_ref() {
            if tx.send(Ok(frame)).is_err() {
                self.inner.closed.store(true, Ordering::SeqCst);
            }
        }
    }
}

fn serialize_payload(payload: &Value) -> String {
    match payload {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Event-framed encoding: one `data:` line per source line, blank-line
/// terminated.
fn frame_event(data: &str, options: &SendOptions) -> String {
    let mut out = String::new();
    if let Some(event) = &options.event {
        out.push_str("event: ");
        out.push_str(event);
        out.push('\n');
    }
    if let Some(id) = &options.id {
        out.push_str("id: ");
        out.push_str(id);
        out.push('\n');
    }
    if let Some(retry) = options.retry {
        out.push_str(&format!("retry: {retry}\n"));
    }
    for line in data.split('\n') {
        out.push_str("data: ");
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

/// Content type for NDJSON responses: structured schemas stream JSON
/// documents, everything else is plain text.
pub(crate) fn ndjson_content_type(schema: Option<&Value>) -> &'static str {
    let structured = schema
        .and_then(|s| s.get("type"))
        .and_then(Value::as_str)
        .map(|t| t == "object" || t == "array")
        .unwrap_or(false);
    if structured {
        "application/x-ndjson; charset=utf-8"
    } else {
        "text/plain; charset=utf-8"
    }
}
