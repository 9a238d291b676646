//! The wrapping applied to every business route: two request counters, then a
//! span scope around the handler.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::State;
use axum::http::{Request, Uri};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::Response;
use axum::routing::MethodRouter;
use axum::Router;
use common_obs::{HttpMetrics, LabeledCounter, MetricsRegistry, Tracer};
use tracing::Instrument;

/// What the counter label functions see of an in-flight request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestInfo {
    pub full_path: String,
    pub endpoint: &'static str,
}

impl RequestInfo {
    pub fn new(req: &Request<Body>, endpoint: &'static str) -> Self {
        Self {
            full_path: full_path(req.uri()),
            endpoint,
        }
    }
}

/// Path plus raw query string, always joined by `?` (`/api` becomes `/api?`).
pub fn full_path(uri: &Uri) -> String {
    format!("{}?{}", uri.path(), uri.query().unwrap_or(""))
}

/// Metrics and tracing state of one service, built once at startup.
pub struct Instrumentation {
    registry: Arc<MetricsRegistry>,
    by_full_path: LabeledCounter<RequestInfo>,
    by_endpoint: LabeledCounter<RequestInfo>,
    http: HttpMetrics,
    tracer: Tracer,
    version: String,
}

impl Instrumentation {
    pub fn new(version: &str, tracer: Tracer) -> Self {
        let registry = Arc::new(MetricsRegistry::new());
        registry.info("app_info", "Application info", version);

        let by_full_path = registry.labeled_counter(
            "full_path_counter",
            "counting requests by full path",
            "full_path",
            |req: &RequestInfo| req.full_path.clone(),
        );
        let by_endpoint = registry.labeled_counter(
            "endpoint_counter",
            "counting requests by endpoint",
            "endpoint",
            |req: &RequestInfo| req.endpoint.to_string(),
        );
        let http = HttpMetrics::register(&registry);

        Self {
            registry,
            by_full_path,
            by_endpoint,
            http,
            tracer,
            version: version.to_string(),
        }
    }

    /// Application version reported by `app_info` and `/info`.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn registry(&self) -> &MetricsRegistry {
        &self.registry
    }

    pub fn full_path_counter(&self) -> &LabeledCounter<RequestInfo> {
        &self.by_full_path
    }

    pub fn endpoint_counter(&self) -> &LabeledCounter<RequestInfo> {
        &self.by_endpoint
    }

    pub fn http_metrics(&self) -> &HttpMetrics {
        &self.http
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }
}

/// Static description of a business route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSpec {
    /// Value of the `endpoint` counter label.
    pub endpoint: &'static str,
    /// Operation name of the span opened around the handler.
    pub span: &'static str,
    /// The one tag set right after the span opens.
    pub tag: (&'static str, &'static str),
}

impl RouteSpec {
    pub const fn new(
        endpoint: &'static str,
        span: &'static str,
        tag_key: &'static str,
        tag_value: &'static str,
    ) -> Self {
        Self {
            endpoint,
            span,
            tag: (tag_key, tag_value),
        }
    }
}

#[derive(Clone)]
struct RouteContext {
    spec: RouteSpec,
    instrumentation: Arc<Instrumentation>,
}

#[derive(Debug, Clone, Copy)]
enum Wrapper {
    FullPathCounter,
    EndpointCounter,
    SpanScope,
}

/// Outermost first.
const CHAIN: [Wrapper; 3] = [
    Wrapper::FullPathCounter,
    Wrapper::EndpointCounter,
    Wrapper::SpanScope,
];

impl Wrapper {
    fn wrap<S>(self, route: MethodRouter<S>, ctx: RouteContext) -> MethodRouter<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        // `route_layer` leaves the 405 fallback unwrapped
        match self {
            Wrapper::FullPathCounter => {
                route.route_layer(from_fn_with_state(ctx, count_by_full_path))
            }
            Wrapper::EndpointCounter => {
                route.route_layer(from_fn_with_state(ctx, count_by_endpoint))
            }
            Wrapper::SpanScope => route.route_layer(from_fn_with_state(ctx, span_scope)),
        }
    }
}

/// Wrap `route` with the full chain. The last layer applied ends up outermost,
/// so the chain is folded from the innermost wrapper outwards.
pub fn instrument<S>(
    route: MethodRouter<S>,
    spec: RouteSpec,
    instrumentation: &Arc<Instrumentation>,
) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    let ctx = RouteContext {
        spec,
        instrumentation: instrumentation.clone(),
    };
    CHAIN
        .iter()
        .rev()
        .fold(route, |route, wrapper| wrapper.wrap(route, ctx.clone()))
}

/// Router whose routes can only be added through the instrumentation chain.
pub struct InstrumentedRouter<S = ()> {
    router: Router<S>,
    instrumentation: Arc<Instrumentation>,
}

impl<S> InstrumentedRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    pub fn new(instrumentation: Arc<Instrumentation>) -> Self {
        Self {
            router: Router::new(),
            instrumentation,
        }
    }

    pub fn route(mut self, path: &str, spec: RouteSpec, method_router: MethodRouter<S>) -> Self {
        let wrapped = instrument(method_router, spec, &self.instrumentation);
        self.router = self.router.route(path, wrapped);
        self
    }

    pub fn into_router(self) -> Router<S> {
        self.router
    }
}

async fn count_by_full_path(
    State(ctx): State<RouteContext>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let info = RequestInfo::new(&req, ctx.spec.endpoint);
    ctx.instrumentation.by_full_path.increment(&info);
    next.run(req).await
}

async fn count_by_endpoint(
    State(ctx): State<RouteContext>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let info = RequestInfo::new(&req, ctx.spec.endpoint);
    ctx.instrumentation.by_endpoint.increment(&info);
    next.run(req).await
}

/// Handlers reach the span through the `SpanHandle` request extension; the
/// span itself is released here once the handler's response exists.
async fn span_scope(
    State(ctx): State<RouteContext>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let span = ctx.instrumentation.tracer.start_span(ctx.spec.span);
    let (key, value) = ctx.spec.tag;
    span.set_tag(key, value);
    req.extensions_mut().insert(span.handle());

    let tracing_span = span.tracing_span().clone();
    let response = next.run(req).instrument(tracing_span).await;
    drop(span);
    response
}
