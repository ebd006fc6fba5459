//! Prometheus scrape route.

use std::sync::Arc;

use axum::{
    Router,
    extract::State,
    http::{StatusCode, header},
    response::IntoResponse,
    routing::get,
};
use tracing::error;

use crate::metrics::MetricsRegistry;

/// Create the metrics router.
pub fn router() -> Router<Arc<MetricsRegistry>> {
    Router::new().route("/metrics", get(export_metrics))
}

async fn export_metrics(State(registry): State<Arc<MetricsRegistry>>) -> impl IntoResponse {
    match registry.export() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, registry.content_type())],
            body,
        ),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain".to_string())],
                e.to_string(),
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    use crate::metrics::GaugeSink;

    #[tokio::test]
    async fn test_metrics_route() {
        let registry = Arc::new(MetricsRegistry::new().unwrap());
        registry.set("1234", "curl", 5.0).unwrap();

        let app = router().with_state(registry);
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let content_type = response.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(content_type.to_str().unwrap().starts_with("text/plain"));

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();
        assert!(body.contains("tcp_connects_by_pid{comm=\"curl\",pid=\"1234\"} 5"));
    }

    #[tokio::test]
    async fn test_other_paths_not_found() {
        let registry = Arc::new(MetricsRegistry::new().unwrap());
        let app = router().with_state(registry);

        for path in ["/", "/health", "/metrics/extra"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::NOT_FOUND, "{path}");
        }
    }
}
