//! Subscriber wiring.
//!
//! Every crate in the workspace logs through `tracing`; this is the only
//! place a subscriber is installed. Filtering follows `RUST_LOG` (default
//! `info`). When an OTLP endpoint is configured, spans are additionally
//! exported through `tracing-opentelemetry`.

use anyhow::Context;
use opentelemetry::trace::TracerProvider as _;
use opentelemetry::KeyValue;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::TracerProvider;
use opentelemetry_sdk::{runtime, Resource};
use tracing::warn;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::CliConfig;

const SERVICE_NAME: &str = "cohort";

/// Handle to the installed exporters. Call [`Telemetry::shutdown`] before
/// exiting so batched spans are flushed.
#[derive(Debug)]
pub struct Telemetry {
    provider: Option<TracerProvider>,
}

impl Telemetry {
    /// Installs the global subscriber described by `config`.
    pub fn init(config: &CliConfig) -> anyhow::Result<Self> {
        let provider = config
            .otlp_endpoint
            .as_deref()
            .map(otlp_provider)
            .transpose()?;

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        let (plain, json) = if config.json_logs {
            (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
        } else {
            (Some(fmt::layer().with_writer(std::io::stderr)), None)
        };
        let otel = provider
            .as_ref()
            .map(|p| tracing_opentelemetry::layer().with_tracer(p.tracer(SERVICE_NAME)));

        tracing_subscriber::registry()
            .with(filter)
            .with(plain)
            .with(json)
            .with(otel)
            .try_init()
            .context("failed to install tracing subscriber")?;

        Ok(Self { provider })
    }

    /// Flushes and stops the span exporter, if one is running.
    pub fn shutdown(self) {
        if let Some(provider) = self.provider {
            if let Err(e) = provider.shutdown() {
                warn!(error = %e, "span exporter shutdown failed");
            }
        }
    }
}

fn otlp_provider(endpoint: &str) -> anyhow::Result<TracerProvider> {
    let exporter = opentelemetry_otlp::SpanExporter::builder()
        .with_tonic()
        .with_endpoint(endpoint)
        .build()
        .context("failed to build OTLP span exporter")?;

    let provider = TracerProvider::builder()
        .with_batch_exporter(exporter, runtime::Tokio)
        .with_resource(Resource::new([
            KeyValue::new("service.name", SERVICE_NAME),
            KeyValue::new("service.version", env!("CARGO_PKG_VERSION")),
        ]))
        .build();
    opentelemetry::global::set_tracer_provider(provider.clone());
    Ok(provider)
}
