//! Routes that always fail with a fixed status, for exercising the error path.

use axum::http::StatusCode;
use axum::routing::{get, MethodRouter};

use crate::error::UsageError;
use crate::instrument::{InstrumentedRouter, RouteSpec};

pub const FORCED_STATUS_ROUTES: [(&str, StatusCode, RouteSpec); 4] = [
    (
        "/403",
        StatusCode::FORBIDDEN,
        RouteSpec::new(
            "status_code_403",
            "status_code_403_span",
            "status_code-tag",
            "403",
        ),
    ),
    (
        "/404",
        StatusCode::NOT_FOUND,
        RouteSpec::new(
            "status_code_404",
            "status_code_404_span",
            "status_code-tag",
            "404",
        ),
    ),
    (
        "/500",
        StatusCode::INTERNAL_SERVER_ERROR,
        RouteSpec::new(
            "status_code_500",
            "status_code_500_span",
            "status_code-tag",
            "500",
        ),
    ),
    (
        "/503",
        StatusCode::SERVICE_UNAVAILABLE,
        RouteSpec::new(
            "status_code_503",
            "status_code_503_span",
            "status_code-tag",
            "503",
        ),
    ),
];

pub fn with_forced_status_routes<S>(router: InstrumentedRouter<S>) -> InstrumentedRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    FORCED_STATUS_ROUTES
        .iter()
        .fold(router, |router, (path, status, spec)| {
            router.route(path, *spec, forced_status(*status))
        })
}

fn forced_status<S>(status: StatusCode) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    get(move || async move { Err::<(), UsageError>(UsageError::forced(status)) })
}
