//! Tracer lifecycle for a service process.

use std::error::Error;

use common_config::{TraceExporterKind, TracesConfig};
use common_obs::{tracer_provider, TraceExport, Tracer};

pub fn trace_export(config: &TracesConfig) -> TraceExport {
    match (config.enabled, config.exporter) {
        (false, _) => TraceExport::Disabled,
        (true, TraceExporterKind::Stdout) => TraceExport::Stdout,
        (true, TraceExporterKind::Otlp) => TraceExport::Otlp {
            endpoint: config.otlp_endpoint(),
        },
    }
}

/// Build the tracer of `service`. The OTLP exporter owns a blocking HTTP
/// client, so it is created off the async workers.
pub async fn start_tracer(
    service: &'static str,
    config: &TracesConfig,
) -> Result<Tracer, Box<dyn Error>> {
    let export = trace_export(config);
    tracing::info!(service, export = ?export, "starting tracer");
    let provider = tokio::task::spawn_blocking(move || tracer_provider(service, export)).await??;
    Ok(Tracer::new(service, provider))
}

/// Flush and stop the exporters once the server has stopped.
pub async fn stop_tracer(tracer: Tracer) {
    if let Err(error) = tokio::task::spawn_blocking(move || tracer.shutdown()).await {
        tracing::warn!(%error, "tracer shutdown task failed");
    }
}
