//! HTTP surface: `/health`, `/status`, `/metrics` (spec.md §6).

use crate::metrics::METRICS;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Serialize;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/metrics", get(metrics))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Serialize)]
struct StatusBody {
    connections_active: i64,
    subscriptions_active: i64,
    queue_depth: i64,
    aggregations_open: i64,
    signals_emitted: i64,
    ws_reconnects: i64,
    connections_failed: i64,
}

async fn status() -> impl IntoResponse {
    let body = StatusBody {
        connections_active: METRICS.connections_active.get(),
        subscriptions_active: METRICS.subscriptions_active.get(),
        queue_depth: METRICS.queue_depth.get(),
        aggregations_open: METRICS.aggregations_open.get(),
        signals_emitted: METRICS.signals_emitted.get() as i64,
        ws_reconnects: METRICS.ws_reconnects.get() as i64,
        connections_failed: METRICS.connections_failed.get() as i64,
    };
    axum::Json(body)
}

async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        METRICS.encode(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    #[tokio::test]
    async fn health_returns_ok() {
        let app = router();
        let response = app
            .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn metrics_returns_prometheus_text() {
        let app = router();
        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }
}
