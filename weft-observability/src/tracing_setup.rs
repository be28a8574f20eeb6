use opentelemetry::trace::TracerProvider;
use opentelemetry_sdk::trace::{Sampler, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

use crate::config::{LogFormat, TelemetryConfig};

/// Initialize the full tracing stack: console logs + OpenTelemetry export.
///
/// Installs the SDK tracer provider as the process-global provider so the
/// [`crate::Telemetry`] span factory starts producing real spans. Returns
/// a guard that flushes on drop. Call once, early; calling twice panics
/// in `tracing_subscriber::init` like any double subscriber install.
pub fn init_tracing(config: &TelemetryConfig) -> TelemetryGuard {
    let mut resource_kv = vec![opentelemetry::KeyValue::new(
        opentelemetry_semantic_conventions::attribute::SERVICE_NAME,
        config.service_name.clone(),
    )];
    if let Some(ref version) = config.service_version {
        resource_kv.push(opentelemetry::KeyValue::new(
            opentelemetry_semantic_conventions::attribute::SERVICE_VERSION,
            version.clone(),
        ));
    }
    let resource = Resource::builder().with_attributes(resource_kv).build();

    let sampler = if !config.enabled || config.sampling_ratio <= 0.0 {
        Sampler::AlwaysOff
    } else if config.sampling_ratio >= 1.0 {
        Sampler::AlwaysOn
    } else {
        Sampler::TraceIdRatioBased(config.sampling_ratio)
    };

    let mut provider_builder = SdkTracerProvider::builder()
        .with_sampler(sampler)
        .with_resource(resource);

    #[cfg(feature = "otlp")]
    if config.enabled {
        use opentelemetry_otlp::WithExportConfig;
        let exporter = opentelemetry_otlp::SpanExporter::builder()
            .with_http()
            .with_endpoint(&config.otlp_endpoint)
            .build()
            .expect("Failed to build OTLP span exporter");
        provider_builder = provider_builder.with_batch_exporter(exporter);
    }

    let provider = provider_builder.build();
    let tracer = provider.tracer("weft");
    opentelemetry::global::set_tracer_provider(provider.clone());

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    // The OTel layer must be created inside each match arm because its type
    // depends on the subscriber type (which differs for JSON vs Pretty fmt).
    match config.log_format {
        LogFormat::Json => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .json()
                .with_target(true)
                .with_file(false);
            Registry::default()
                .with(env_filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
        }
        LogFormat::Pretty => {
            let fmt_layer = tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_file(false);
            Registry::default()
                .with(env_filter)
                .with(fmt_layer)
                .with(tracing_opentelemetry::layer().with_tracer(tracer))
                .init();
        }
    }

    TelemetryGuard { provider }
}

/// Guard that ensures traces are flushed when the application shuts down.
///
/// Holds the `SdkTracerProvider` and calls `shutdown()` on drop.
pub struct TelemetryGuard {
    provider: SdkTracerProvider,
}

impl TelemetryGuard {
    /// Flush and shut down the provider explicitly, logging failures.
    ///
    /// Used by the server's ordered shutdown so telemetry closes at its
    /// slot in the sequence instead of at process exit.
    pub fn shutdown(&self) {
        if let Err(e) = self.provider.shutdown() {
            tracing::warn!(error = %e, "telemetry provider shutdown failed");
        }
    }
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        let _ = self.provider.shutdown();
    }
}
