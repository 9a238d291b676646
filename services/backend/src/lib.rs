pub mod config;
pub mod star;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::extract::{Extension, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use common_config::load;
use common_http::{
    service_router, start_tracer, stop_tracer, with_forced_status_routes, Instrumentation,
    InstrumentedRouter, RouteSpec, UsageError,
};
use common_obs::{ObsInit, SpanHandle};
use serde_json::json;
use tokio::net::TcpListener;

use config::BackendConfig;
use star::{StarError, StarFailurePolicy, StarService};
use store::{DocumentStore, FileDocumentStore, MemoryDocumentStore};

pub const SERVICE_NAME: &str = "backend-service";
const BUILD_SHA: &str = match option_env!("BUILD_SHA") {
    Some(value) => value,
    None => "dev",
};

pub const HOMEPAGE: RouteSpec = RouteSpec::new("homepage", "homepage-span", "homepage-tag", "95");
pub const MY_API: RouteSpec = RouteSpec::new("my_api", "my_api_span", "my_api-tag", "90");
pub const ADD_STAR: RouteSpec = RouteSpec::new("add_star", "star_span", "star-tag", "80");
pub const OOPS: RouteSpec = RouteSpec::new("oops", "oops_span", "oops-tag", "500");

pub const STAR_FAILURE_MESSAGE: &str = "Unable to add a star";
/// Largest `/star` body read; anything bigger takes the failure branch.
pub const STAR_BODY_LIMIT: usize = 2 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub stars: StarService,
    pub star_failure_policy: StarFailurePolicy,
}

pub fn build_router(state: Arc<AppState>, instrumentation: Arc<Instrumentation>) -> Router {
    let routes = InstrumentedRouter::new(instrumentation.clone())
        .route("/", HOMEPAGE, get(homepage))
        .route("/api", MY_API, get(my_api))
        .route("/star", ADD_STAR, post(add_star))
        .route("/error", OOPS, get(oops));
    let routes = with_forced_status_routes(routes)
        .into_router()
        .with_state(state);

    service_router(routes, instrumentation, SERVICE_NAME)
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    ObsInit::init(SERVICE_NAME).map_err(|err| -> Box<dyn std::error::Error> { Box::new(err) })?;

    let config = load::<BackendConfig>()?;
    let addr = config.socket_addr()?;
    tracing::info!(
        event = "service_start",
        service = SERVICE_NAME,
        version = config.app_version.as_str(),
        build_sha = BUILD_SHA,
        listen_addr = %addr,
        traces_agent = config.traces.agent_host.as_str(),
        star_failure_policy = ?config.star_failure_policy,
        "starting service"
    );

    let tracer = start_tracer(SERVICE_NAME, &config.traces).await?;
    let instrumentation = Arc::new(Instrumentation::new(&config.app_version, tracer.clone()));

    let store: Arc<dyn DocumentStore> = match &config.store.path {
        Some(path) => {
            tracing::info!(path = %path.display(), "using file document store");
            Arc::new(FileDocumentStore::new(path))
        }
        None => {
            tracing::info!("using in-memory document store");
            Arc::new(MemoryDocumentStore::new())
        }
    };
    let state = Arc::new(AppState {
        stars: StarService::new(store, config.store.collection.clone()),
        star_failure_policy: config.star_failure_policy,
    });

    serve(addr, build_router(state, instrumentation)).await?;

    stop_tracer(tracer).await;
    tracing::info!(event = "service_stop", service = SERVICE_NAME);
    Ok(())
}

pub async fn serve(addr: SocketAddr, app: Router) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn homepage() -> &'static str {
    tracing::info!("Hit the homepage");
    "Hello World"
}

async fn my_api() -> Json<serde_json::Value> {
    tracing::info!("Hit the /api endpoint");
    Json(json!({ "reponse": "something" }))
}

async fn add_star(
    State(state): State<Arc<AppState>>,
    Extension(span): Extension<SpanHandle>,
    body: Body,
) -> Response {
    tracing::info!("Hit the /star endpoint");

    let body = match to_bytes(body, STAR_BODY_LIMIT).await {
        Ok(body) => body,
        Err(error) => {
            return star_failure(&span, state.star_failure_policy, &StarError::BodyRead(error));
        }
    };
    match state.stars.create(&body).await {
        Ok(created) => Json(json!({ "result": created.star })).into_response(),
        Err(error) => star_failure(&span, state.star_failure_policy, &error),
    }
}

/// Failures never propagate past `/star`: they are logged, tagged on the span
/// and answered according to the configured policy.
fn star_failure(span: &SpanHandle, policy: StarFailurePolicy, error: &StarError) -> Response {
    tracing::error!(%error, "{}", STAR_FAILURE_MESSAGE);
    span.set_tag("http.status_code", "500");

    match policy {
        StarFailurePolicy::Degrade => StatusCode::OK.into_response(),
        StarFailurePolicy::Surface => {
            UsageError::with_status(STAR_FAILURE_MESSAGE, StatusCode::INTERNAL_SERVER_ERROR)
                .into_response()
        }
    }
}

async fn oops() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, ":(")
}
