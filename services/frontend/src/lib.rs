pub mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::response::Html;
use axum::routing::get;
use axum::Router;
use common_config::load;
use common_http::{
    service_router, start_tracer, stop_tracer, with_forced_status_routes, Instrumentation,
    InstrumentedRouter, RouteSpec,
};
use common_obs::ObsInit;
use tokio::net::TcpListener;

use config::FrontendConfig;

pub const SERVICE_NAME: &str = "frontend-service";
const BUILD_SHA: &str = match option_env!("BUILD_SHA") {
    Some(value) => value,
    None => "dev",
};

pub const HOMEPAGE: RouteSpec = RouteSpec::new("homepage", "homepage-span", "homepage-tag", "90");

const MAIN_PAGE: &str = include_str!("../templates/main.html");

pub fn build_router(instrumentation: Arc<Instrumentation>) -> Router {
    let routes =
        InstrumentedRouter::new(instrumentation.clone()).route("/", HOMEPAGE, get(homepage));
    let routes = with_forced_status_routes(routes).into_router();

    service_router(routes, instrumentation, SERVICE_NAME)
}

pub async fn run() -> Result<(), Box<dyn std::error::Error>> {
    ObsInit::init(SERVICE_NAME).map_err(|err| -> Box<dyn std::error::Error> { Box::new(err) })?;

    let config = load::<FrontendConfig>()?;
    let addr = config.socket_addr()?;
    tracing::info!(
        event = "service_start",
        service = SERVICE_NAME,
        version = config.app_version.as_str(),
        build_sha = BUILD_SHA,
        listen_addr = %addr,
        traces_agent = config.traces.agent_host.as_str(),
        "starting service"
    );

    let tracer = start_tracer(SERVICE_NAME, &config.traces).await?;
    let instrumentation = Arc::new(Instrumentation::new(&config.app_version, tracer.clone()));

    serve(addr, build_router(instrumentation)).await?;

    stop_tracer(tracer).await;

    tracing::info!(event = "service_stop", service = SERVICE_NAME);
    Ok(())
}

pub async fn serve(addr: SocketAddr, app: Router) -> Result<(), Box<dyn std::error::Error>> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

async fn homepage() -> Html<&'static str> {
    tracing::info!("Hit the homepage");
    Html(MAIN_PAGE)
}
