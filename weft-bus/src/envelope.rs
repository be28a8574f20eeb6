use serde_json::Value;
use weft_kv::RunToken;
use weft_observability::TraceContext;

/// What a subscription receives: payload plus ambient context.
///
/// Cloning an envelope retains its run scope again (see
/// [`weft_kv::RunToken`]); dropping one (including inside a filtering
/// operator) releases it, so the scope's pending count always balances.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub data: Value,
    pub run: Option<RunToken>,
    pub trace: Option<TraceContext>,
}

impl Envelope {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            run: None,
            trace: None,
        }
    }

    /// Replace the payload, keeping run and trace context. This is what
    /// mapping operators use so context survives the pipeline.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }
}

/// Arguments to [`crate::Bus::emit`].
#[derive(Debug, Clone)]
pub struct EmitArgs {
    pub topic: String,
    pub data: Value,
    /// Run scope id to carry; the bus retains it once per delivery.
    pub run: Option<String>,
    /// Trace context of the emitting span, linked by delivery spans.
    pub trace: Option<TraceContext>,
}

impl EmitArgs {
    pub fn new(topic: impl Into<String>, data: Value) -> Self {
        Self {
            topic: topic.into(),
            data,
            run: None,
            trace: None,
        }
    }

    pub fn with_run(mut self, run_id: impl Into<String>) -> Self {
        self.run = Some(run_id.into());
        self
    }

    pub fn with_trace(mut self, trace: TraceContext) -> Self {
        self.trace = Some(trace);
        self
    }
}
