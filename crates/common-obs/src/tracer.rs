//! Request-scoped OpenTelemetry spans with string tags.
//!
//! A [`ScopedSpan`] ends its span when it is dropped, so every exit path of the
//! code holding it (normal return, early `?`, panic unwinding, a cancelled
//! future) hands the span to the provider's processors exactly once.

use opentelemetry::trace::{Span as _, TraceContextExt, Tracer as _, TracerProvider as _};
use opentelemetry::{Context, KeyValue};
use opentelemetry_sdk::trace::{self as sdktrace, SdkTracerProvider};
use opentelemetry_sdk::Resource;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TracesInitError {
    #[error("failed to build span exporter: {0}")]
    Exporter(String),
}

/// Destination of finished spans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraceExport {
    /// Spans are still created and tagged, but nothing is exported.
    Disabled,
    Stdout,
    /// OTLP over HTTP, e.g. `http://localhost:4318/v1/traces`.
    Otlp { endpoint: String },
}

/// Build the tracer provider of a service, with `service.name` set on its
/// resource.
///
/// The OTLP exporter uses a blocking HTTP client; call this outside of async
/// worker threads (e.g. from `spawn_blocking`).
pub fn tracer_provider(
    service: &str,
    export: TraceExport,
) -> Result<SdkTracerProvider, TracesInitError> {
    let resource = Resource::builder()
        .with_attributes([KeyValue::new("service.name", service.to_string())])
        .build();
    let builder = SdkTracerProvider::builder().with_resource(resource);

    let builder = match export {
        TraceExport::Disabled => builder,
        TraceExport::Stdout => {
            builder.with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
        }
        TraceExport::Otlp { endpoint } => {
            use opentelemetry_otlp::{Protocol, WithExportConfig};

            let exporter = opentelemetry_otlp::SpanExporter::builder()
                .with_http()
                .with_endpoint(endpoint)
                .with_protocol(Protocol::HttpBinary)
                .build()
                .map_err(|e| TracesInitError::Exporter(e.to_string()))?;
            builder.with_batch_exporter(exporter)
        }
    };

    Ok(builder.build())
}

/// Opens the standalone spans of one service.
#[derive(Clone)]
pub struct Tracer {
    provider: SdkTracerProvider,
    tracer: sdktrace::Tracer,
}

impl Tracer {
    /// Spans are recorded under an instrumentation scope named after `service`.
    pub fn new(service: &str, provider: SdkTracerProvider) -> Self {
        let tracer = provider.tracer(service.to_string());
        Self { provider, tracer }
    }

    /// Open a root span. Nothing is inherited from an incoming request.
    pub fn start_span(&self, operation: &str) -> ScopedSpan {
        let span = self
            .tracer
            .start_with_context(operation.to_string(), &Context::new());
        let span_context = span.span_context().clone();
        let trace_id = span_context.trace_id().to_string();

        let tracing_span = tracing::info_span!(
            "span",
            operation = operation,
            trace_id = trace_id.as_str(),
            span_id = %span_context.span_id(),
        );

        ScopedSpan {
            handle: SpanHandle {
                cx: Context::new().with_span(span),
                trace_id,
            },
            tracing_span,
        }
    }

    /// Flush pending spans and stop the exporters.
    pub fn shutdown(&self) {
        if let Err(error) = self.provider.shutdown() {
            tracing::warn!(%error, "tracer provider shutdown failed");
        }
    }
}

/// Tagging access to an open span. Cloning it never extends or closes the span,
/// and tags set after the span ended are dropped.
#[derive(Clone)]
pub struct SpanHandle {
    cx: Context,
    trace_id: String,
}

impl SpanHandle {
    /// Set a string attribute. Readers take the last value set for a key.
    pub fn set_tag(&self, key: &str, value: &str) {
        self.cx
            .span()
            .set_attribute(KeyValue::new(key.to_string(), value.to_string()));
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }
}

/// Owner of an open span; dropping it ends the span.
pub struct ScopedSpan {
    handle: SpanHandle,
    tracing_span: tracing::Span,
}

impl ScopedSpan {
    pub fn set_tag(&self, key: &str, value: &str) {
        self.handle.set_tag(key, value);
    }

    pub fn handle(&self) -> SpanHandle {
        self.handle.clone()
    }

    /// The `tracing` span that log events inside this scope should run under.
    pub fn tracing_span(&self) -> &tracing::Span {
        &self.tracing_span
    }
}

impl Drop for ScopedSpan {
    fn drop(&mut self) {
        self.handle.cx.span().end();
    }
}
