//! Shared observability for the star services: JSON logging correlated with
//! request spans, the label-keyed metrics registry and the span scope manager.

use std::{fmt, io, sync::Arc};

use axum::{routing::get, Json, Router};
use serde_json::{json, Map, Number, Value};
use tracing::field::{Field, Visit};
use tracing::{self, span};
use tracing_subscriber::{
    fmt::{self as tsfmt, format::Writer, FmtContext, FormatEvent, FormatFields, MakeWriter},
    layer::{Context, Layer, SubscriberExt},
    registry::{LookupSpan, SpanRef},
    EnvFilter, Registry,
};

#[derive(Debug, thiserror::Error)]
pub enum ObsInitError {
    #[error("tracing subscriber already initialized")]
    AlreadyInitialized,
    #[error("failed to install tracing subscriber: {0}")]
    Install(#[from] tracing::subscriber::SetGlobalDefaultError),
}

/// Initialize observability for a service.
pub struct ObsInit;

impl ObsInit {
    /// Install a global tracing subscriber with JSON output and trace propagation.
    pub fn init(service: &str) -> Result<(), ObsInitError> {
        let subscriber = Self::subscriber_with_writer(service, io::stderr);
        tracing::subscriber::set_global_default(subscriber).map_err(|err| {
            if tracing::dispatcher::has_been_set() {
                ObsInitError::AlreadyInitialized
            } else {
                ObsInitError::Install(err)
            }
        })
    }

    /// Build a tracing subscriber using the provided writer.
    pub fn subscriber_with_writer<W>(service: &str, writer: W) -> impl tracing::Subscriber
    where
        W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
    {
        let env_level = std::env::var("LOG_LEVEL").unwrap_or_else(|_| {
            if cfg!(debug_assertions) {
                "debug".to_string()
            } else {
                "info".to_string()
            }
        });
        let env_filter = EnvFilter::try_from_default_env()
            .or_else(|_| EnvFilter::try_new(env_level))
            .unwrap_or_else(|_| EnvFilter::new("info"));

        let service_name: Arc<str> = Arc::from(service.to_string());
        let trace_layer = TraceLayer;
        let fmt_layer = tsfmt::layer()
            .with_ansi(false)
            .event_format(ObsJsonFormat::new(service_name.clone()))
            .with_writer(writer);

        Registry::default()
            .with(env_filter)
            .with(trace_layer)
            .with(fmt_layer)
    }
}

/// `/health` and `/info` for a service; neither route is instrumented.
pub fn health_router(service: &'static str, version: impl Into<String>) -> Router {
    let version: Arc<str> = Arc::from(version.into());

    Router::new()
        .route(
            "/health",
            get(move || async move { Json(json!({ "status": "ok", "service": service })) }),
        )
        .route(
            "/info",
            get(move || {
                let version = version.clone();
                async move { Json(json!({ "service": service, "version": &*version })) }
            }),
        )
}

/// Copies the `trace_id` and `operation` recorded on a request span onto every
/// span opened beneath it, so events deep inside a handler still correlate.
struct TraceLayer;

impl<S> Layer<S> for TraceLayer
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else {
            return;
        };

        let mut visitor = SpanFieldVisitor::default();
        attrs.record(&mut visitor);
        let trace_ctx = match visitor.trace_id {
            Some(trace_id) => Some(Arc::new(TraceContext {
                trace_id,
                operation: visitor.operation,
            })),
            None => span
                .parent()
                .and_then(|parent| parent.extensions().get::<Arc<TraceContext>>().cloned()),
        };

        if let Some(trace_ctx) = trace_ctx {
            span.extensions_mut().insert(trace_ctx);
        }
    }
}

#[derive(Default)]
struct SpanFieldVisitor {
    trace_id: Option<String>,
    operation: Option<String>,
}

impl SpanFieldVisitor {
    fn slot(&mut self, field: &Field) -> Option<&mut Option<String>> {
        match field.name() {
            "trace_id" => Some(&mut self.trace_id),
            "operation" => Some(&mut self.operation),
            _ => None,
        }
    }
}

impl Visit for SpanFieldVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if let Some(slot) = self.slot(field) {
            *slot = Some(value.to_string());
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if let Some(slot) = self.slot(field) {
            *slot = Some(format!("{value:?}").trim_matches('"').to_string());
        }
    }
}

#[derive(Debug)]
struct TraceContext {
    trace_id: String,
    operation: Option<String>,
}

/// One JSON object per line: `level`, `target`, `service`, `trace_id`,
/// `span` and the event's own `fields`.
struct ObsJsonFormat {
    service: Arc<str>,
}

impl ObsJsonFormat {
    fn new(service: Arc<str>) -> Self {
        Self { service }
    }
}

impl<S, N> FormatEvent<S, N> for ObsJsonFormat
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
    N: for<'writer> FormatFields<'writer> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: Writer<'_>,
        event: &tracing::Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        let mut fields = EventFieldVisitor::default();
        event.record(&mut fields);

        let trace_ctx = ctx.lookup_current().and_then(find_trace_ctx);
        let (trace_id, operation) = match &trace_ctx {
            Some(trace_ctx) => (
                Value::String(trace_ctx.trace_id.clone()),
                trace_ctx
                    .operation
                    .clone()
                    .map(Value::String)
                    .unwrap_or(Value::Null),
            ),
            None => (Value::Null, Value::Null),
        };

        let line = json!({
            "level": metadata.level().as_str().to_ascii_lowercase(),
            "target": metadata.target(),
            "service": &*self.service,
            "trace_id": trace_id,
            "span": operation,
            "fields": Value::Object(fields.0),
        });
        writeln!(writer, "{line}")
    }
}

fn find_trace_ctx<S>(span: SpanRef<'_, S>) -> Option<Arc<TraceContext>>
where
    S: tracing::Subscriber + for<'span> LookupSpan<'span>,
{
    span.scope()
        .find_map(|scope_span| scope_span.extensions().get::<Arc<TraceContext>>().cloned())
}

#[derive(Default)]
struct EventFieldVisitor(Map<String, Value>);

impl EventFieldVisitor {
    fn insert(&mut self, field: &Field, value: impl Into<Value>) {
        self.0.insert(field.name().to_string(), value.into());
    }
}

impl Visit for EventFieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, format!("{value:?}"));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, value);
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, value);
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        // non-finite floats have no JSON form
        let value = Number::from_f64(value)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(value.to_string()));
        self.insert(field, value);
    }
}

mod metrics;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod tracer;

pub use metrics::{
    CounterVec, GaugeVec, HistogramVec, HttpMetrics, LabeledCounter, MetricsRegistry,
    PROMETHEUS_CONTENT_TYPE,
};
pub use tracer::{tracer_provider, ScopedSpan, SpanHandle, TraceExport, Tracer, TracesInitError};

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::{Mutex, Once};
    use tracing::subscriber::with_default;

    static INIT: Once = Once::new();

    fn init_global() {
        INIT.call_once(|| {
            ObsInit::init("test-service").expect("init failed");
        });
    }

    #[test]
    fn init_is_idempotent() {
        init_global();
        assert!(matches!(
            ObsInit::init("test"),
            Err(ObsInitError::AlreadyInitialized)
        ));
    }

    #[test]
    fn json_logs_carry_span_trace_id() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let make_writer = TestMakeWriter(buffer.clone());
        let subscriber = ObsInit::subscriber_with_writer("svc", make_writer);

        let (tracer, _recorder) = testing::SpanRecorder::tracer("svc");

        let trace_id = with_default(subscriber, || {
            let span = tracer.start_span("homepage-span");
            let _guard = span.tracing_span().enter();
            let child = tracing::info_span!("inner");
            let _child = child.enter();
            tracing::info!(message = "hello world");
            span.handle().trace_id().to_string()
        });

        let output = {
            let guard = buffer.lock().unwrap();
            String::from_utf8(guard.clone()).expect("valid utf8")
        };

        assert!(output.contains(&format!("\"trace_id\":\"{}\"", trace_id)));
        assert!(output.contains("\"service\":\"svc\""));
        assert!(output.contains("\"message\":\"hello world\""));
        assert!(output.contains("\"span\":\"homepage-span\""));
    }

    #[test]
    fn events_outside_spans_have_null_trace() {
        let buffer = Arc::new(Mutex::new(Vec::new()));
        let subscriber = ObsInit::subscriber_with_writer("svc", TestMakeWriter(buffer.clone()));

        with_default(subscriber, || {
            tracing::warn!(reason = "none", "standalone");
        });

        let output = String::from_utf8(buffer.lock().unwrap().clone()).expect("valid utf8");
        assert!(output.contains("\"trace_id\":null"));
        assert!(output.contains("\"level\":\"warn\""));
    }

    #[derive(Clone)]
    struct TestMakeWriter(Arc<Mutex<Vec<u8>>>);

    impl<'a> MakeWriter<'a> for TestMakeWriter {
        type Writer = TestWriter;

        fn make_writer(&'a self) -> Self::Writer {
            TestWriter(self.0.clone())
        }
    }

    struct TestWriter(Arc<Mutex<Vec<u8>>>);

    impl io::Write for TestWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let mut guard = self.0.lock().unwrap();
            guard.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }
}
