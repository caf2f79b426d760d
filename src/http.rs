//! `/healthz`, `/readyz`, `/metrics` — a small three-endpoint `axum` router.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use prometheus::{Encoder, TextEncoder};

use crate::metrics::REGISTRY;

#[derive(Clone)]
struct AppState {
    ready: Arc<AtomicBool>,
}

pub fn build_router(ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_handler))
        .with_state(AppState { ready })
}

async fn healthz() -> impl IntoResponse {
    StatusCode::OK
}

/// 503 until the reconciler's `readyForUpdates` flag is set, i.e. until the
/// first full sync has completed — mirrors the at-least-once-sync-before-
/// events invariant at the HTTP layer.
async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    if state.ready.load(Ordering::Acquire) {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}

async fn metrics_handler() -> impl IntoResponse {
    let metric_families = REGISTRY.gather();
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&metric_families, &mut buffer).is_err() {
        return (StatusCode::INTERNAL_SERVER_ERROR, String::new());
    }
    (StatusCode::OK, String::from_utf8_lossy(&buffer).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn healthz_is_always_ok() {
        let router = build_router(Arc::new(AtomicBool::new(false)));
        let response = router.oneshot(Request::builder().uri("/healthz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn readyz_is_unavailable_before_first_sync() {
        let router = build_router(Arc::new(AtomicBool::new(false)));
        let response = router.oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn readyz_is_ok_after_first_sync() {
        let ready = Arc::new(AtomicBool::new(true));
        let router = build_router(ready);
        let response = router.oneshot(Request::builder().uri("/readyz").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_endpoint_serves_text_format() {
        crate::metrics::init();
        let router = build_router(Arc::new(AtomicBool::new(false)));
        let response = router.oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap()).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
