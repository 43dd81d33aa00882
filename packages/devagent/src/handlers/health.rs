use axum::{Json, extract::State, response::IntoResponse};

use crate::AppState;

/// Liveness probe used by discovery. The body never changes.
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({ "status": "ok", "service": "devagent" }))
}

/// Counters plus the live subscriber count.
pub async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "metrics": state.metrics.snapshot(),
        "event_subscribers": state.events.subscriber_count(),
        "notifications": state.events.notification_count(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::Body, http::Request, http::StatusCode, routing::get};
    use tower::ServiceExt;

    fn test_router() -> Router {
        let (state, _fakes) = crate::test_helpers::test_app_state();
        Router::new()
            .route("/api/health", get(health_handler))
            .route("/api/metrics", get(metrics_handler))
            .with_state(state)
    }

    #[tokio::test]
    async fn health_is_static_ok() {
        let resp = test_router()
            .oneshot(
                Request::builder()
                    .uri("/api/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "ok");
    }

    #[tokio::test]
    async fn metrics_reports_counters() {
        let resp = test_router()
            .oneshot(
                Request::builder()
                    .uri("/api/metrics")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["event_subscribers"], 0);
        assert_eq!(json["metrics"]["mutations"], 0);
    }
}
