use std::sync::Arc;

use axum::body::Body;
use axum::extract::Extension;
use axum::http::{Request, StatusCode};
use axum::routing::get;
use axum::Router;
use common_http::{
    service_router, with_forced_status_routes, Instrumentation, InstrumentedRouter, RouteSpec,
    UsageError,
};
use common_obs::testing::{tag, SpanRecorder};
use common_obs::SpanHandle;
use http_body_util::BodyExt;
use serde_json::{json, Map, Value};
use tower::ServiceExt;

const PING: RouteSpec = RouteSpec::new("ping", "ping_span", "ping-tag", "1");
const REJECT: RouteSpec = RouteSpec::new("reject", "reject_span", "reject-tag", "2");
const ORDER: RouteSpec = RouteSpec::new("order", "order_span", "order-tag", "3");

struct Harness {
    router: Router,
    instrumentation: Arc<Instrumentation>,
    spans: SpanRecorder,
}

fn harness() -> Harness {
    let (tracer, spans) = SpanRecorder::tracer("test-service");
    let instrumentation = Arc::new(Instrumentation::new("9.9.9", tracer));

    let order_check = {
        let instrumentation = instrumentation.clone();
        let spans = spans.clone();
        get(move |Extension(span): Extension<SpanHandle>| async move {
            // both counters already moved, span still open
            let by_path = instrumentation.full_path_counter().value("/order?");
            let by_endpoint = instrumentation.endpoint_counter().value("order");
            let closed = spans.finished_named("order_span").len();
            span.set_tag("observed", "yes");
            axum::Json(json!({
                "by_path": by_path,
                "by_endpoint": by_endpoint,
                "closed": closed,
            }))
        })
    };

    let routes = InstrumentedRouter::new(instrumentation.clone())
        .route("/ping", PING, get(|| async { "pong" }))
        .route(
            "/reject",
            REJECT,
            get(|| async {
                let mut payload = Map::new();
                payload.insert("hint".to_string(), json!("try again"));
                Err::<(), _>(
                    UsageError::with_status("rejected", StatusCode::CONFLICT).with_payload(payload),
                )
            }),
        )
        .route("/order", ORDER, order_check);
    let routes = with_forced_status_routes(routes).into_router();

    Harness {
        router: service_router(routes, instrumentation.clone(), "test-service"),
        instrumentation,
        spans,
    }
}

async fn call(router: &Router, uri: &str) -> (StatusCode, Vec<u8>) {
    let response = router
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .expect("response");
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body.to_vec())
}

#[tokio::test]
async fn counters_increment_once_per_request() {
    let h = harness();

    call(&h.router, "/ping").await;
    call(&h.router, "/ping?verbose=1").await;

    let by_path = h.instrumentation.full_path_counter();
    let by_endpoint = h.instrumentation.endpoint_counter();
    assert_eq!(by_path.value("/ping?"), 1);
    assert_eq!(by_path.value("/ping?verbose=1"), 1);
    assert_eq!(by_endpoint.value("ping"), 2);
}

#[tokio::test]
async fn counters_and_span_cover_error_responses() {
    let h = harness();

    let (status, body) = call(&h.router, "/reject").await;
    assert_eq!(status, StatusCode::CONFLICT);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "hint": "try again", "message": "rejected" }));

    assert_eq!(h.instrumentation.full_path_counter().value("/reject?"), 1);
    assert_eq!(h.instrumentation.endpoint_counter().value("reject"), 1);

    let spans = h.spans.finished_named("reject_span");
    assert_eq!(spans.len(), 1);
    assert_eq!(tag(&spans[0], "reject-tag").as_deref(), Some("2"));
    assert_eq!(spans[0].instrumentation_scope.name(), "test-service");
}

#[tokio::test]
async fn counters_run_before_span_which_closes_after_handler() {
    let h = harness();

    let (status, body) = call(&h.router, "/order").await;
    assert_eq!(status, StatusCode::OK);
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body, json!({ "by_path": 1, "by_endpoint": 1, "closed": 0 }));

    let spans = h.spans.finished_named("order_span");
    assert_eq!(spans.len(), 1);
    assert_eq!(tag(&spans[0], "order-tag").as_deref(), Some("3"));
    assert_eq!(tag(&spans[0], "observed").as_deref(), Some("yes"));
}

#[tokio::test]
async fn forced_status_routes_use_taxonomy() {
    let h = harness();

    for code in [403u16, 404, 500, 503] {
        let (status, body) = call(&h.router, &format!("/{code}")).await;
        assert_eq!(status.as_u16(), code);
        let body: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(
            body,
            json!({ "message": format!("Raising status code: {code}") })
        );

        let endpoint = format!("status_code_{code}");
        assert_eq!(h.instrumentation.endpoint_counter().value(&endpoint), 1);
        let spans = h
            .spans
            .finished_named(&format!("status_code_{code}_span"));
        assert_eq!(spans.len(), 1);
        assert_eq!(tag(&spans[0], "status_code-tag"), Some(code.to_string()));
    }
}

#[tokio::test]
async fn metrics_endpoint_exposes_counters() {
    let h = harness();
    call(&h.router, "/ping").await;
    call(&h.router, "/404").await;

    let (status, body) = call(&h.router, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(body).unwrap();
    assert!(text.contains("app_info{version=\"9.9.9\"} 1.0"));
    assert!(text.contains("full_path_counter{full_path=\"/ping?\"} 1"));
    assert!(text.contains("endpoint_counter{endpoint=\"status_code_404\"} 1"));
    assert!(text.contains("http_request_total{method=\"GET\",status=\"404\"} 1"));
}

#[tokio::test]
async fn operational_routes_are_not_counted() {
    let h = harness();
    let (status, _) = call(&h.router, "/health").await;
    assert_eq!(status, StatusCode::OK);

    assert_eq!(h.instrumentation.full_path_counter().value("/health?"), 0);
    assert!(h.spans.finished().is_empty());
}

#[tokio::test]
async fn wrong_method_is_not_counted_or_traced() {
    let h = harness();
    let response = h
        .router
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/ping")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .expect("response");

    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(h.instrumentation.full_path_counter().value("/ping?"), 0);
    assert_eq!(h.instrumentation.endpoint_counter().value("ping"), 0);
    assert!(h.spans.finished().is_empty());
}
