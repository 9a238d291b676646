use std::collections::HashMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

const DEFAULT_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Process-scoped collection of metric families.
///
/// Created once per service and shared through an `Arc`; every family
/// registered here shows up in [`MetricsRegistry::encode`].
#[derive(Default)]
pub struct MetricsRegistry {
    families: RwLock<Vec<MetricFamily>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_counter(
        &self,
        name: &'static str,
        help: &'static str,
        label_names: &[&'static str],
    ) -> CounterVec {
        let mut guard = self.families.write().expect("lock poisoned");
        for family in guard.iter() {
            if let MetricFamily::Counter(existing) = family {
                if existing.name == name {
                    return CounterVec {
                        inner: existing.clone(),
                    };
                }
            }
        }
        let inner = Arc::new(CounterVecInner::new(name, help, label_names));
        guard.push(MetricFamily::Counter(inner.clone()));
        CounterVec { inner }
    }

    pub fn register_gauge(
        &self,
        name: &'static str,
        help: &'static str,
        label_names: &[&'static str],
    ) -> GaugeVec {
        let mut guard = self.families.write().expect("lock poisoned");
        for family in guard.iter() {
            if let MetricFamily::Gauge(existing) = family {
                if existing.name == name {
                    return GaugeVec {
                        inner: existing.clone(),
                    };
                }
            }
        }
        let inner = Arc::new(GaugeVecInner::new(name, help, label_names));
        guard.push(MetricFamily::Gauge(inner.clone()));
        GaugeVec { inner }
    }

    pub fn register_histogram(
        &self,
        name: &'static str,
        help: &'static str,
        label_names: &[&'static str],
        buckets: &'static [f64],
    ) -> HistogramVec {
        let mut guard = self.families.write().expect("lock poisoned");
        for family in guard.iter() {
            if let MetricFamily::Histogram(existing) = family {
                if existing.name == name {
                    return HistogramVec {
                        inner: existing.clone(),
                    };
                }
            }
        }
        let inner = Arc::new(HistogramVecInner::new(name, help, label_names, buckets));
        guard.push(MetricFamily::Histogram(inner.clone()));
        HistogramVec { inner }
    }

    /// Register a counter whose single label is derived from the in-flight request.
    ///
    /// `label_fn` runs once per [`LabeledCounter::increment`] and must not fail.
    pub fn labeled_counter<R, F>(
        &self,
        name: &'static str,
        help: &'static str,
        label_name: &'static str,
        label_fn: F,
    ) -> LabeledCounter<R>
    where
        R: ?Sized,
        F: Fn(&R) -> String + Send + Sync + 'static,
    {
        LabeledCounter {
            counters: self.register_counter(name, help, &[label_name]),
            label_fn: Arc::new(label_fn),
        }
    }

    /// Static `<name>{version="..."} 1` gauge describing the running build.
    pub fn info(&self, name: &'static str, help: &'static str, version: &str) {
        self.register_gauge(name, help, &["version"]).set(&[version], 1.0);
    }

    /// Render every family in the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let mut output = String::new();
        let guard = self.families.read().expect("lock poisoned");
        for family in guard.iter() {
            match family {
                MetricFamily::Counter(counter) => {
                    write_header(&mut output, counter.name, counter.help, "counter");
                    let mut samples = counter.collect();
                    samples.sort_by(|a, b| a.0.cmp(&b.0));
                    for (labels, value) in samples {
                        output.push_str(counter.name);
                        write_labels(&mut output, &counter.label_names, &labels);
                        let _ = writeln!(output, " {}", value);
                    }
                }
                MetricFamily::Gauge(gauge) => {
                    write_header(&mut output, gauge.name, gauge.help, "gauge");
                    let mut samples = gauge.collect();
                    samples.sort_by(|a, b| a.0.cmp(&b.0));
                    for (labels, value) in samples {
                        output.push_str(gauge.name);
                        write_labels(&mut output, &gauge.label_names, &labels);
                        let _ = writeln!(output, " {}", format_float(value));
                    }
                }
                MetricFamily::Histogram(histogram) => {
                    write_header(&mut output, histogram.name, histogram.help, "histogram");
                    let mut samples = histogram.collect();
                    samples.sort_by(|a, b| a.0.cmp(&b.0));
                    let mut bucket_names = histogram.label_names.clone();
                    bucket_names.push("le");
                    for (labels, snapshot) in samples {
                        let mut cumulative = 0;
                        let bounds = histogram
                            .buckets
                            .iter()
                            .map(|bound| format_float(*bound))
                            .chain(std::iter::once("+Inf".to_string()));
                        for (idx, bound) in bounds.enumerate() {
                            cumulative += snapshot.counts.get(idx).copied().unwrap_or(0);
                            let _ = write!(output, "{}_bucket", histogram.name);
                            let mut bucket_labels = labels.clone();
                            bucket_labels.push(bound);
                            write_labels(&mut output, &bucket_names, &bucket_labels);
                            let _ = writeln!(output, " {}", cumulative);
                        }

                        let _ = write!(output, "{}_sum", histogram.name);
                        write_labels(&mut output, &histogram.label_names, &labels);
                        let _ = writeln!(output, " {}", format_float(snapshot.sum));

                        let _ = write!(output, "{}_count", histogram.name);
                        write_labels(&mut output, &histogram.label_names, &labels);
                        let _ = writeln!(output, " {}", snapshot.count);
                    }
                }
            }
        }

        output
    }
}

/// Default per-request metrics recorded for every route of a service.
#[derive(Clone)]
pub struct HttpMetrics {
    requests: CounterVec,
    duration: HistogramVec,
}

impl HttpMetrics {
    pub fn register(registry: &MetricsRegistry) -> Self {
        Self {
            requests: registry.register_counter(
                "http_request_total",
                "Total number of HTTP requests",
                &["method", "status"],
            ),
            duration: registry.register_histogram(
                "http_request_duration_seconds",
                "HTTP request duration in seconds",
                &["method", "path", "status"],
                DEFAULT_BUCKETS,
            ),
        }
    }

    pub fn observe(&self, method: &str, path: &str, status: &str, seconds: f64) {
        self.requests.inc(&[method, status], 1);
        self.duration.observe(&[method, path, status], seconds);
    }
}

enum MetricFamily {
    Counter(Arc<CounterVecInner>),
    Gauge(Arc<GaugeVecInner>),
    Histogram(Arc<HistogramVecInner>),
}

/// Counter family keyed by a label computed from a request of type `R`.
pub struct LabeledCounter<R: ?Sized> {
    counters: CounterVec,
    label_fn: Arc<dyn Fn(&R) -> String + Send + Sync>,
}

impl<R: ?Sized> Clone for LabeledCounter<R> {
    fn clone(&self) -> Self {
        Self {
            counters: self.counters.clone(),
            label_fn: self.label_fn.clone(),
        }
    }
}

impl<R: ?Sized> LabeledCounter<R> {
    pub fn increment(&self, request: &R) {
        let label = (self.label_fn)(request);
        self.counters.inc(&[label.as_str()], 1);
    }

    /// Current count for one label value.
    pub fn value(&self, label: &str) -> u64 {
        self.counters.value(&[label])
    }
}

#[derive(Default)]
struct CounterValue {
    value: AtomicU64,
}

impl CounterValue {
    fn increment(&self, amount: u64) {
        self.value.fetch_add(amount, Ordering::Relaxed);
    }

    fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

struct CounterVecInner {
    name: &'static str,
    help: &'static str,
    label_names: Vec<&'static str>,
    values: Mutex<HashMap<Vec<String>, Arc<CounterValue>>>,
}

impl CounterVecInner {
    fn new(name: &'static str, help: &'static str, label_names: &[&'static str]) -> Self {
        Self {
            name,
            help,
            label_names: label_names.to_vec(),
            values: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, label_values: &[&str]) -> Arc<CounterValue> {
        assert_eq!(
            self.label_names.len(),
            label_values.len(),
            "label value count mismatch",
        );
        let mut guard = self.values.lock().expect("lock poisoned");
        let key: Vec<String> = label_values.iter().map(|value| value.to_string()).collect();
        Arc::clone(guard.entry(key).or_default())
    }

    fn get(&self, label_values: &[&str]) -> u64 {
        let key: Vec<String> = label_values.iter().map(|value| value.to_string()).collect();
        let guard = self.values.lock().expect("lock poisoned");
        guard.get(&key).map(|value| value.get()).unwrap_or(0)
    }

    fn collect(&self) -> Vec<(Vec<String>, u64)> {
        let guard = self.values.lock().expect("lock poisoned");
        guard
            .iter()
            .map(|(labels, value)| (labels.clone(), value.get()))
            .collect()
    }
}

#[derive(Clone)]
pub struct CounterVec {
    inner: Arc<CounterVecInner>,
}

impl CounterVec {
    pub fn inc(&self, labels: &[&str], amount: u64) {
        self.inner.get_or_create(labels).increment(amount);
    }

    /// Current value of a series; zero when it was never touched.
    pub fn value(&self, labels: &[&str]) -> u64 {
        self.inner.get(labels)
    }
}

#[derive(Default)]
struct GaugeValue {
    value: AtomicU64,
}

impl GaugeValue {
    fn set(&self, new_value: f64) {
        self.value.store(new_value.to_bits(), Ordering::Relaxed);
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.value.load(Ordering::Relaxed))
    }
}

struct GaugeVecInner {
    name: &'static str,
    help: &'static str,
    label_names: Vec<&'static str>,
    values: Mutex<HashMap<Vec<String>, Arc<GaugeValue>>>,
}

impl GaugeVecInner {
    fn new(name: &'static str, help: &'static str, label_names: &[&'static str]) -> Self {
        Self {
            name,
            help,
            label_names: label_names.to_vec(),
            values: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, label_values: &[&str]) -> Arc<GaugeValue> {
        assert_eq!(
            self.label_names.len(),
            label_values.len(),
            "label value count mismatch",
        );
        let mut guard = self.values.lock().expect("lock poisoned");
        let key: Vec<String> = label_values.iter().map(|value| value.to_string()).collect();
        Arc::clone(guard.entry(key).or_default())
    }

    fn collect(&self) -> Vec<(Vec<String>, f64)> {
        let guard = self.values.lock().expect("lock poisoned");
        guard
            .iter()
            .map(|(labels, value)| (labels.clone(), value.get()))
            .collect()
    }
}

#[derive(Clone)]
pub struct GaugeVec {
    inner: Arc<GaugeVecInner>,
}

impl GaugeVec {
    pub fn set(&self, labels: &[&str], value: f64) {
        self.inner.get_or_create(labels).set(value);
    }
}

struct HistogramVecInner {
    name: &'static str,
    help: &'static str,
    label_names: Vec<&'static str>,
    buckets: &'static [f64],
    values: Mutex<HashMap<Vec<String>, Arc<HistogramValue>>>,
}

impl HistogramVecInner {
    fn new(
        name: &'static str,
        help: &'static str,
        label_names: &[&'static str],
        buckets: &'static [f64],
    ) -> Self {
        Self {
            name,
            help,
            label_names: label_names.to_vec(),
            buckets,
            values: Mutex::new(HashMap::new()),
        }
    }

    fn get_or_create(&self, label_values: &[&str]) -> Arc<HistogramValue> {
        assert_eq!(
            self.label_names.len(),
            label_values.len(),
            "label value count mismatch",
        );
        let mut guard = self.values.lock().expect("lock poisoned");
        let key: Vec<String> = label_values.iter().map(|value| value.to_string()).collect();
        Arc::clone(
            guard
                .entry(key)
                .or_insert_with(|| HistogramValue::new(self.buckets.len())),
        )
    }

    fn collect(&self) -> Vec<(Vec<String>, HistogramSnapshot)> {
        let guard = self.values.lock().expect("lock poisoned");
        guard
            .iter()
            .map(|(labels, value)| (labels.clone(), value.snapshot()))
            .collect()
    }
}

#[derive(Clone)]
pub struct HistogramVec {
    inner: Arc<HistogramVecInner>,
}

impl HistogramVec {
    pub fn observe(&self, labels: &[&str], value: f64) {
        self.inner
            .get_or_create(labels)
            .observe(self.inner.buckets, value);
    }
}

struct HistogramSnapshot {
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

struct HistogramValue {
    state: Mutex<HistogramState>,
}

struct HistogramState {
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl HistogramValue {
    fn new(bucket_count: usize) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(HistogramState {
                counts: vec![0; bucket_count + 1],
                sum: 0.0,
                count: 0,
            }),
        })
    }

    fn observe(&self, buckets: &[f64], value: f64) {
        let mut state = self.state.lock().expect("lock poisoned");
        state.count += 1;
        state.sum += value;

        let idx = buckets
            .iter()
            .position(|bound| value <= *bound)
            .unwrap_or(buckets.len());
        if let Some(slot) = state.counts.get_mut(idx) {
            *slot += 1;
        }
    }

    fn snapshot(&self) -> HistogramSnapshot {
        let state = self.state.lock().expect("lock poisoned");
        HistogramSnapshot {
            counts: state.counts.clone(),
            sum: state.sum,
            count: state.count,
        }
    }
}

fn write_header(output: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(output, "# HELP {} {}", name, help);
    let _ = writeln!(output, "# TYPE {} {}", name, kind);
}

fn write_labels(output: &mut String, names: &[&str], values: &[String]) {
    if names.is_empty() {
        return;
    }

    output.push('{');
    for (idx, (name, value)) in names.iter().zip(values.iter()).enumerate() {
        if idx > 0 {
            output.push(',');
        }
        let _ = write!(output, r#"{}="{}""#, name, escape_label_value(value));
    }
    output.push('}');
}

fn escape_label_value(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            _ => escaped.push(ch),
        }
    }
    escaped
}

fn format_float(value: f64) -> String {
    let mut formatted = format!("{value:.6}");
    while formatted.contains('.') && formatted.ends_with('0') {
        formatted.pop();
    }
    if formatted.ends_with('.') {
        formatted.push('0');
    }
    if formatted == "-0.0" {
        formatted = "0.0".to_string();
    }
    formatted
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::thread;

    struct FakeRequest {
        path: &'static str,
    }

    #[test]
    fn labeled_counter_partitions_by_label() {
        let registry = MetricsRegistry::new();
        let counter = registry.labeled_counter(
            "path_counter",
            "counting requests by path",
            "path",
            |req: &FakeRequest| req.path.to_string(),
        );

        counter.increment(&FakeRequest { path: "/a" });
        counter.increment(&FakeRequest { path: "/a" });
        counter.increment(&FakeRequest { path: "/b" });

        assert_eq!(counter.value("/a"), 2);
        assert_eq!(counter.value("/b"), 1);
        assert_eq!(counter.value("/c"), 0);

        let encoded = registry.encode();
        assert!(encoded.contains("# TYPE path_counter counter"));
        assert!(encoded.contains("path_counter{path=\"/a\"} 2"));
        assert!(encoded.contains("path_counter{path=\"/b\"} 1"));
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let registry = MetricsRegistry::new();
        let counter =
            registry.labeled_counter("hits", "hits", "path", |req: &FakeRequest| {
                req.path.to_string()
            });

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        counter.increment(&FakeRequest { path: "/shared" });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(counter.value("/shared"), 8000);
    }

    #[test]
    fn registering_twice_returns_same_family() {
        let registry = MetricsRegistry::new();
        let first = registry.register_counter("dup_total", "dup", &["k"]);
        let second = registry.register_counter("dup_total", "dup", &["k"]);
        first.inc(&["v"], 1);
        second.inc(&["v"], 1);
        assert_eq!(first.value(&["v"]), 2);
        assert_eq!(registry.encode().matches("# TYPE dup_total").count(), 1);
    }

    #[test]
    fn info_gauge_carries_version() {
        let registry = MetricsRegistry::new();
        registry.info("app_info", "Application info", "1.0.3");
        assert!(registry.encode().contains("app_info{version=\"1.0.3\"} 1.0"));
    }

    #[test]
    fn histogram_export_writes_prometheus_fields() {
        let registry = MetricsRegistry::new();
        let http = HttpMetrics::register(&registry);
        http.observe("GET", "/api", "200", 0.2);

        let encoded = registry.encode();
        assert!(encoded.contains("http_request_total{method=\"GET\",status=\"200\"} 1"));
        assert!(encoded.contains(
            "http_request_duration_seconds_bucket{method=\"GET\",path=\"/api\",status=\"200\",le=\"0.25\"} 1"
        ));
        assert!(encoded.contains(
            "http_request_duration_seconds_bucket{method=\"GET\",path=\"/api\",status=\"200\",le=\"+Inf\"} 1"
        ));
        assert!(encoded
            .contains("http_request_duration_seconds_sum{method=\"GET\",path=\"/api\",status=\"200\"} 0.2"));
        assert!(encoded.contains(
            "http_request_duration_seconds_count{method=\"GET\",path=\"/api\",status=\"200\"} 1"
        ));
    }

    #[test]
    fn label_values_are_escaped() {
        let registry = MetricsRegistry::new();
        let counter = registry.register_counter("escaped_total", "escaped", &["q"]);
        counter.inc(&["a\"b"], 1);
        assert!(registry.encode().contains(r#"escaped_total{q="a\"b"} 1"#));
    }
}
