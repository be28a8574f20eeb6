use opentelemetry::trace::{SpanContext, SpanId, TraceFlags, TraceId, TraceState};
use serde::{Deserialize, Serialize};

/// Trace identity carried in event envelopes and RPC metadata.
///
/// This is the wire form of an OpenTelemetry `SpanContext`: hex-encoded
/// trace and span ids plus the sampling flags. It establishes *link*
/// relationships across boundaries: a receiving span links back to the
/// emitting span rather than becoming its child, because delivery may
/// happen long after the emitting scope has closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
    pub trace_flags: u8,
}

impl TraceContext {
    /// Capture the wire form of a live span context.
    ///
    /// Returns `None` for invalid contexts (telemetry disabled or span
    /// recording suppressed), so callers can skip the envelope fields
    /// entirely.
    pub fn from_span_context(ctx: &SpanContext) -> Option<Self> {
        if !ctx.is_valid() {
            return None;
        }
        Some(Self {
            trace_id: format!("{:032x}", u128::from_be_bytes(ctx.trace_id().to_bytes())),
            span_id: format!("{:016x}", u64::from_be_bytes(ctx.span_id().to_bytes())),
            trace_flags: ctx.trace_flags().to_u8(),
        })
    }

    /// Rebuild a remote `SpanContext` suitable for span links.
    ///
    /// Returns `None` when the hex ids do not parse; a malformed trace
    /// context degrades to an unlinked span, never an error.
    pub fn to_span_context(&self) -> Option<SpanContext> {
        let trace_id = TraceId::from_hex(&self.trace_id).ok()?;
        let span_id = SpanId::from_hex(&self.span_id).ok()?;
        if trace_id == TraceId::INVALID || span_id == SpanId::INVALID {
            return None;
        }
        Some(SpanContext::new(
            trace_id,
            span_id,
            TraceFlags::new(self.trace_flags),
            true,
            TraceState::default(),
        ))
    }

    /// Parse the `trace_id` / `span_id` / `trace_flags` keys of a string
    /// metadata map, as received on the bridge.
    pub fn from_meta(
        trace_id: Option<&str>,
        span_id: Option<&str>,
        trace_flags: Option<u8>,
    ) -> Option<Self> {
        Some(Self {
            trace_id: trace_id?.to_string(),
            span_id: span_id?.to_string(),
            trace_flags: trace_flags.unwrap_or(1),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trip_through_span_context() {
        let tc = TraceContext {
            trace_id: "0af7651916cd43dd8448eb211c80319c".into(),
            span_id: "b7ad6b7169203331".into(),
            trace_flags: 1,
        };
        let sc = tc.to_span_context().expect("valid context");
        assert!(sc.is_valid());
        assert!(sc.is_remote());
        let back = TraceContext::from_span_context(&sc).expect("valid wire form");
        assert_eq!(back, tc);
    }

    #[test]
    fn malformed_hex_yields_none() {
        let tc = TraceContext {
            trace_id: "not-hex".into(),
            span_id: "b7ad6b7169203331".into(),
            trace_flags: 1,
        };
        assert!(tc.to_span_context().is_none());
    }

    #[test]
    fn all_zero_ids_are_invalid() {
        let tc = TraceContext {
            trace_id: "0".repeat(32),
            span_id: "0".repeat(16),
            trace_flags: 0,
        };
        assert!(tc.to_span_context().is_none());
    }

    #[test]
    fn from_meta_requires_both_ids() {
        assert!(TraceContext::from_meta(Some("a"), None, None).is_none());
        let tc = TraceContext::from_meta(Some("a"), Some("b"), None).unwrap();
        assert_eq!(tc.trace_flags, 1);
    }
}
