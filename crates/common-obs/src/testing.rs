//! In-memory span capture for tests.

use opentelemetry_sdk::trace::{InMemorySpanExporter, SdkTracerProvider, SpanData};

use crate::tracer::Tracer;

/// Collects every span ended by a [`Tracer`] it built.
#[derive(Clone, Debug)]
pub struct SpanRecorder {
    exporter: InMemorySpanExporter,
}

impl SpanRecorder {
    /// A tracer whose spans are exported synchronously into the recorder.
    pub fn tracer(service: &str) -> (Tracer, SpanRecorder) {
        let exporter = InMemorySpanExporter::default();
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(exporter.clone())
            .build();
        (Tracer::new(service, provider), SpanRecorder { exporter })
    }

    pub fn finished(&self) -> Vec<SpanData> {
        self.exporter
            .get_finished_spans()
            .expect("in-memory exporter is readable")
    }

    pub fn finished_named(&self, name: &str) -> Vec<SpanData> {
        self.finished()
            .into_iter()
            .filter(|span| span.name == name)
            .collect()
    }
}

/// Last value recorded for `key` on a finished span.
pub fn tag(span: &SpanData, key: &str) -> Option<String> {
    span.attributes
        .iter()
        .rev()
        .find(|kv| kv.key.as_str() == key)
        .map(|kv| kv.value.as_str().into_owned())
}
