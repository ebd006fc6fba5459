//! Health check routes.

use std::sync::Arc;

use axum::{Json, Router, extract::State, http::StatusCode, response::IntoResponse, routing::get};

use crate::metrics::HealthState;

/// Create the health router.
pub fn router() -> Router<Arc<HealthState>> {
    Router::new()
        .route("/readiness", get(readiness_check))
        .route("/liveness", get(liveness_check))
        .route("/health", get(health_check))
}

/// Readiness check - is the agent ready to serve traffic?
async fn readiness_check(State(health): State<Arc<HealthState>>) -> impl IntoResponse {
    if health.is_ready() {
        (StatusCode::OK, "Ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not ready")
    }
}

/// Liveness check - is the agent still collecting?
async fn liveness_check(State(health): State<Arc<HealthState>>) -> impl IntoResponse {
    if health.is_alive() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "Not alive")
    }
}

/// Detailed status. HTTP 200 only when both ready and alive.
async fn health_check(State(health): State<Arc<HealthState>>) -> impl IntoResponse {
    let status = health.status();
    let code = if status.is_healthy() {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, Json(status))
}

#[cfg(test)]
mod tests {
    use super::*;

    use axum::body::{Body, to_bytes};
    use axum::http::{Request, header};
    use tower::ServiceExt;

    use crate::metrics::HealthStatus;

    async fn get(health: &Arc<HealthState>, path: &str) -> (StatusCode, String) {
        let app = router().with_state(health.clone());
        let response = app
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(body.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_readiness() {
        let health = Arc::new(HealthState::new());
        assert_eq!(
            get(&health, "/readiness").await,
            (StatusCode::SERVICE_UNAVAILABLE, "Not ready".to_string())
        );

        health.set_ready(true);
        assert_eq!(
            get(&health, "/readiness").await,
            (StatusCode::OK, "Ready".to_string())
        );
    }

    #[tokio::test]
    async fn test_liveness() {
        let health = Arc::new(HealthState::new());
        assert_eq!(
            get(&health, "/liveness").await,
            (StatusCode::OK, "OK".to_string())
        );

        health.set_alive(false);
        assert_eq!(
            get(&health, "/liveness").await,
            (StatusCode::SERVICE_UNAVAILABLE, "Not alive".to_string())
        );
    }

    #[tokio::test]
    async fn test_health_status_codes() {
        let cases = [
            (false, false, StatusCode::SERVICE_UNAVAILABLE),
            (true, false, StatusCode::SERVICE_UNAVAILABLE),
            (false, true, StatusCode::SERVICE_UNAVAILABLE),
            (true, true, StatusCode::OK),
        ];

        for (ready, alive, expected) in cases {
            let health = Arc::new(HealthState::new());
            health.set_ready(ready);
            health.set_alive(alive);

            let (code, body) = get(&health, "/health").await;
            assert_eq!(code, expected, "ready={ready} alive={alive}");

            let status: HealthStatus = serde_json::from_str(&body).unwrap();
            assert_eq!(status.ready, ready);
            assert_eq!(status.alive, alive);
            assert!(status.timestamp > 0);
        }
    }

    #[tokio::test]
    async fn test_health_content_type() {
        let app = router().with_state(Arc::new(HealthState::new()));
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
    }

    #[tokio::test]
    async fn test_unknown_path() {
        let health = Arc::new(HealthState::new());
        let (code, _) = get(&health, "/metrics").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }
}
