use serde_json::Value;

/// Log severity used across the runtime and on the bridge control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Parse a level name as it arrives from a remote handler.
    ///
    /// Unknown names map to `Info` so a misbehaving worker never silences
    /// its own output.
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "trace" => LogLevel::Trace,
            "debug" => LogLevel::Debug,
            "warn" | "warning" => LogLevel::Warn,
            "error" => LogLevel::Error,
            _ => LogLevel::Info,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Host-supplied log sink.
///
/// The core never writes to stdout directly: route handlers, event
/// handlers, and remote workers (via the bridge control plane) all log
/// through this contract. Implementations must be cheap to call; the
/// bus invokes the logger on validation failures in hot paths.
pub trait Logger: Send + Sync {
    fn log(&self, level: LogLevel, msg: &str, fields: Option<&Value>);
}

/// Default [`Logger`] adapter that forwards to the `tracing` macros.
///
/// Structured fields are rendered through their JSON representation on
/// the `fields` key.
#[derive(Debug, Default, Clone)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, level: LogLevel, msg: &str, fields: Option<&Value>) {
        match (level, fields) {
            (LogLevel::Trace, Some(f)) => tracing::trace!(fields = %f, "{msg}"),
            (LogLevel::Trace, None) => tracing::trace!("{msg}"),
            (LogLevel::Debug, Some(f)) => tracing::debug!(fields = %f, "{msg}"),
            (LogLevel::Debug, None) => tracing::debug!("{msg}"),
            (LogLevel::Info, Some(f)) => tracing::info!(fields = %f, "{msg}"),
            (LogLevel::Info, None) => tracing::info!("{msg}"),
            (LogLevel::Warn, Some(f)) => tracing::warn!(fields = %f, "{msg}"),
            (LogLevel::Warn, None) => tracing::warn!("{msg}"),
            (LogLevel::Error, Some(f)) => tracing::error!(fields = %f, "{msg}"),
            (LogLevel::Error, None) => tracing::error!("{msg}"),
        }
    }
}
