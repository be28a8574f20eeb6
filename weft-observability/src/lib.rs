//! Telemetry fabric for Weft.
//!
//! Every entry point into the runtime (a route dispatch, an event
//! delivery, a cron tick, a reactive emission) runs under a span built
//! here. Spans created on opposite sides of a process boundary are tied
//! together with span *links* (not parent/child): the emitting side
//! serializes its [`TraceContext`] into the envelope or RPC metadata, and
//! the receiving side links its new span back to it.
//!
//! The crate also defines the [`Logger`] contract the host supplies. The
//! default [`TracingLogger`] forwards everything to `tracing`, which is
//! what the rest of the workspace uses for its own diagnostics.

mod config;
mod context;
mod logger;
mod telemetry;
mod tracing_setup;

pub use config::{LogFormat, TelemetryConfig};
pub use context::TraceContext;
pub use logger::{LogLevel, Logger, TracingLogger};
pub use telemetry::{HttpMetrics, RouteSpanArgs, SpanHandle, Telemetry};
pub use tracing_setup::{init_tracing, TelemetryGuard};

pub mod prelude {
    //! Re-exports of the most commonly used telemetry types.
    pub use crate::{LogLevel, Logger, Telemetry, TraceContext, TracingLogger};
}
