use serde::Deserialize;

/// Configuration for the tracing/telemetry bootstrap.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Service name reported to the tracing backend.
    pub service_name: String,
    /// Service version (used in resource attributes).
    pub service_version: Option<String>,
    /// OTLP exporter endpoint, honored when the `otlp` feature is enabled.
    pub otlp_endpoint: String,
    /// Whether span export is enabled at all.
    pub enabled: bool,
    /// Sampling ratio (0.0 to 1.0, default 1.0 = all traces).
    pub sampling_ratio: f64,
    /// Log output format: Pretty (default) or Json.
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "weft".to_string(),
            service_version: None,
            otlp_endpoint: "http://localhost:4317".to_string(),
            enabled: true,
            sampling_ratio: 1.0,
            log_format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    pub fn new(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            ..Self::default()
        }
    }

    pub fn with_service_version(mut self, version: &str) -> Self {
        self.service_version = Some(version.to_string());
        self
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.otlp_endpoint = endpoint.to_string();
        self
    }

    pub fn with_sampling_ratio(mut self, ratio: f64) -> Self {
        self.sampling_ratio = ratio.clamp(0.0, 1.0);
        self
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }
}
