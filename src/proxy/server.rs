use crate::constants::RATE_LIMIT_SWEEP_SECS;
use crate::error::{error_body, AppError, AppResult};
use crate::proxy::handlers;
use crate::proxy::health;
use crate::proxy::security::security_headers_middleware;
use crate::proxy::state::AppState;
use crate::proxy::token::AccountPool;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/v1/messages", post(handlers::messages::handle_messages))
        .route(
            "/v1/messages/count_tokens",
            post(handlers::messages::handle_count_tokens),
        )
        .route("/v1/models", get(handlers::messages::handle_list_models))
        .route("/health", get(health::health))
        .route("/account-limits", get(health::account_limits))
        .route("/refresh-token", post(health::refresh_token))
        .fallback(not_found)
        .layer(axum::middleware::from_fn(security_headers_middleware))
        .with_state(state)
}

async fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(error_body("not_found_error", "unknown path")),
    )
        .into_response()
}

/// Bind and serve until the cancellation token fires, then drain in-flight
/// requests. A bind failure is surfaced so main can exit non-zero.
pub async fn serve(state: AppState, port: u16, cancel: CancellationToken) -> AppResult<()> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| AppError::Config(format!("failed to bind {}: {}", addr, e)))?;
    info!("listening on http://{}", addr);

    let router = build_router(state);
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    info!("listener drained");
    Ok(())
}

/// Sweep expired rate-limit records on a fixed cadence, in addition to the
/// on-the-fly clearing done by `pick_next`.
pub fn spawn_rate_limit_janitor(
    pool: Arc<AccountPool>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let tracker = pool.rate_limits();
        let mut tick =
            tokio::time::interval(std::time::Duration::from_secs(RATE_LIMIT_SWEEP_SECS));
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("rate limit janitor stopped");
                    return;
                }
                _ = tick.tick() => {
                    tracker.cleanup_expired();
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AppConfig;
    use crate::proxy::token::TokenStore;
    use crate::proxy::upstream::UpstreamClient;
    use axum::body::Body;
    use tower::ServiceExt;

    fn test_state() -> AppState {
        let dir = std::env::temp_dir().join(format!("agcp-srv-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let config = AppConfig {
            port: 0,
            debug: false,
            fallback_enabled: false,
            local_llm_url: "http://127.0.0.1:1/v1/chat/completions".to_string(),
            local_llm_key: None,
            model_mapping: Default::default(),
            fallback_models: Default::default(),
            data_dir: dir.clone(),
        };
        AppState::new(
            Arc::new(AccountPool::new(Vec::new(), dir.clone())),
            Arc::new(TokenStore::new(dir)),
            Arc::new(UpstreamClient::new()),
            config,
            CancellationToken::new(),
        )
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn unknown_paths_get_the_error_taxonomy() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/nope")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            response.headers().get("X-Frame-Options").unwrap(),
            "DENY",
            "security headers apply to the fallback too"
        );
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "not_found_error");
    }

    #[tokio::test]
    async fn count_tokens_is_501() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/messages/count_tokens")
                    .header("content-type", "application/json")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_IMPLEMENTED);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "not_implemented");
    }

    #[tokio::test]
    async fn prototype_pollution_is_rejected_with_the_exact_message() {
        let app = build_router(test_state());
        let payload = r#"{"model":"claude-3-haiku","max_tokens":10,
            "messages":[{"role":"user","content":"x"}],
            "__proto__":{"polluted":true}}"#;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");
        assert_eq!(
            body["error"]["message"],
            "Prototype pollution attempt detected"
        );
    }

    #[tokio::test]
    async fn unknown_model_prefix_is_rejected() {
        let app = build_router(test_state());
        let payload = r#"{"model":"mistral-large","max_tokens":10,
            "messages":[{"role":"user","content":"x"}]}"#;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert!(body["error"]["message"]
            .as_str()
            .unwrap()
            .contains("not allowed"));
    }

    #[tokio::test]
    async fn pool_route_with_no_accounts_is_quota_exhausted_400() {
        let app = build_router(test_state());
        let payload = r#"{"model":"claude-3-5-sonnet","max_tokens":10,
            "messages":[{"role":"user","content":"x"}]}"#;
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .method("POST")
                    .uri("/v1/messages")
                    .header("content-type", "application/json")
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = body_json(response).await;
        assert_eq!(body["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn models_endpoint_lists_the_catalog() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/v1/models")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert!(body["data"].as_array().unwrap().len() > 1);
    }

    #[tokio::test]
    async fn health_reports_empty_pool_as_degraded() {
        let app = build_router(test_state());
        let response = app
            .oneshot(
                axum::http::Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["accounts"]["total"], 0);
    }
}
