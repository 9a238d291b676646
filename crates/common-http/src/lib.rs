pub mod error;
pub mod instrument;
pub mod status;
pub mod traces;

use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{MatchedPath, State};
use axum::http::{header, HeaderValue, Request, StatusCode};
use axum::middleware::{from_fn_with_state, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use common_obs::{health_router, PROMETHEUS_CONTENT_TYPE};

pub use error::UsageError;
pub use instrument::{instrument, Instrumentation, InstrumentedRouter, RequestInfo, RouteSpec};
pub use status::with_forced_status_routes;
pub use traces::{start_tracer, stop_tracer, trace_export};

/// Attach the operational surface (`/metrics`, `/health`, `/info`) and the
/// per-request HTTP metrics layer to a service's business routes.
pub fn service_router(
    routes: Router,
    instrumentation: Arc<Instrumentation>,
    service: &'static str,
) -> Router {
    let version = instrumentation.version().to_string();
    let metrics = Router::new()
        .route("/metrics", get(metrics))
        .with_state(instrumentation.clone());

    routes
        .merge(metrics)
        .merge(health_router(service, version))
        .layer(from_fn_with_state(instrumentation, track_http_metrics))
}

async fn metrics(State(instrumentation): State<Arc<Instrumentation>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            HeaderValue::from_static(PROMETHEUS_CONTENT_TYPE),
        )],
        instrumentation.registry().encode(),
    )
}

async fn track_http_metrics(
    State(instrumentation): State<Arc<Instrumentation>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let method = req.method().to_string();
    let path = req
        .extensions()
        .get::<MatchedPath>()
        .map(|matched| matched.as_str().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());

    let start = Instant::now();
    let response = next.run(req).await;
    let status = response.status().as_u16().to_string();

    instrumentation.http_metrics().observe(
        &method,
        &path,
        &status,
        start.elapsed().as_secs_f64(),
    );

    response
}
