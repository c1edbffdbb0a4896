// One attempt against the Cloud-Code backend: walk the endpoint-fallback
// list, classify the outcome, and surface the smallest observed reset on a
// full 429 sweep.
use crate::constants::{DEFAULT_COOLDOWN_SECS, SOFT_FAIL_PAUSE_MS};
use crate::proxy::google::endpoints;
use crate::proxy::rate_limit::{parse_reset_from_body, parse_retry_after};
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tokio::time::Duration;
use tracing::{debug, warn};

/// Outcome classification for the dispatcher.
#[derive(Debug)]
pub enum AttemptError {
    /// Every endpoint rejected the token (401 / UNAUTHENTICATED).
    Auth(String),
    /// Every endpoint returned 429; smallest reset across them, in seconds.
    RateLimited { reset_secs: u64 },
    /// PERMISSION_DENIED; never retried.
    Permission(String),
    /// Some other 4xx; the request itself is bad.
    InvalidRequest(String),
    /// Every endpoint 5xx'd.
    Overloaded(String),
    /// Connection-level failure on every endpoint.
    Network(String),
}

impl std::fmt::Display for AttemptError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttemptError::Auth(m) => write!(f, "authentication failed: {}", m),
            AttemptError::RateLimited { reset_secs } => {
                write!(f, "rate limited, reset in {}s", reset_secs)
            }
            AttemptError::Permission(m) => write!(f, "permission denied: {}", m),
            AttemptError::InvalidRequest(m) => write!(f, "invalid request: {}", m),
            AttemptError::Overloaded(m) => write!(f, "upstream overloaded: {}", m),
            AttemptError::Network(m) => write!(f, "network failure: {}", m),
        }
    }
}

pub enum UpstreamResponse {
    /// Decoded body of a non-streaming call.
    Complete(Value),
    /// Raw response whose byte stream carries vendor SSE.
    Stream(reqwest::Response),
}

pub struct UpstreamClient {
    client: Client,
    base_urls: Vec<String>,
}

impl UpstreamClient {
    pub fn new() -> Self {
        Self::with_base_urls(endpoints::v1_internal_base_urls())
    }

    pub fn with_base_urls(base_urls: Vec<String>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(20))
            .pool_max_idle_per_host(16)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(600))
            .user_agent(crate::constants::USER_AGENT.as_str())
            .build()
            .expect("failed to build upstream HTTP client");
        Self { client, base_urls }
    }

    /// Execute one attempt with the given token and vendor payload. Walks the
    /// endpoint list: 429 and 5xx advance to the next endpoint, 401 advances
    /// then surfaces as an auth error, 403 and other 4xx stop immediately.
    /// Connection-level failures stop immediately too; the dispatcher handles
    /// those by moving to another account.
    pub async fn call(
        &self,
        access_token: &str,
        body: &Value,
        stream: bool,
    ) -> Result<UpstreamResponse, AttemptError> {
        let method = if stream {
            "streamGenerateContent"
        } else {
            "generateContent"
        };
        let query = if stream { Some("alt=sse") } else { None };

        let mut last_server: Option<String> = None;
        let mut auth_failure: Option<String> = None;
        let mut smallest_reset: Option<u64> = None;
        let mut all_rate_limited = !self.base_urls.is_empty();

        for (idx, base_url) in self.base_urls.iter().enumerate() {
            let url = endpoints::build_url(base_url, method, query);

            let response = match self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .header("Content-Type", "application/json")
                .json(body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    // Connection-level failures (DNS, reset, timeout) are
                    // account-scoped, not endpoint-scoped: surface them right
                    // away so the dispatcher advances to the next account
                    // instead of walking the fallback list on a dead path.
                    debug!("request to {} failed: {}", base_url, e);
                    return Err(AttemptError::Network(e.to_string()));
                }
            };

            let status = response.status();
            if status.is_success() {
                if idx > 0 {
                    debug!("fallback endpoint {} succeeded", base_url);
                }
                if stream {
                    return Ok(UpstreamResponse::Stream(response));
                }
                let parsed: Value = response
                    .json()
                    .await
                    .map_err(|e| AttemptError::Overloaded(format!("body decode failed: {}", e)))?;
                return Ok(UpstreamResponse::Complete(parsed));
            }

            let retry_after = response
                .headers()
                .get("Retry-After")
                .and_then(|h| h.to_str().ok())
                .map(|s| s.to_string());
            let error_text = response.text().await.unwrap_or_default();

            match status {
                StatusCode::UNAUTHORIZED => {
                    warn!("endpoint {} rejected the token (401)", base_url);
                    auth_failure = Some(truncate(&error_text, 200));
                    all_rate_limited = false;
                    continue;
                }
                StatusCode::TOO_MANY_REQUESTS => {
                    let reset = retry_after
                        .as_deref()
                        .and_then(parse_retry_after)
                        .or_else(|| parse_reset_from_body(&error_text))
                        .unwrap_or(DEFAULT_COOLDOWN_SECS);
                    smallest_reset = Some(match smallest_reset {
                        Some(prev) => prev.min(reset),
                        None => reset,
                    });
                    warn!("endpoint {} returned 429, reset hint {}s", base_url, reset);
                    continue;
                }
                StatusCode::FORBIDDEN => {
                    return Err(AttemptError::Permission(truncate(&error_text, 200)));
                }
                s if s.is_server_error() => {
                    warn!("endpoint {} returned {}", base_url, s);
                    last_server = Some(format!("{}: {}", s, truncate(&error_text, 200)));
                    all_rate_limited = false;
                    tokio::time::sleep(Duration::from_millis(SOFT_FAIL_PAUSE_MS)).await;
                    continue;
                }
                s => {
                    return Err(AttemptError::InvalidRequest(format!(
                        "upstream returned {}: {}",
                        s,
                        truncate(&error_text, 400)
                    )));
                }
            }
        }

        if all_rate_limited {
            if let Some(reset_secs) = smallest_reset {
                return Err(AttemptError::RateLimited { reset_secs });
            }
        }
        if let Some(message) = auth_failure {
            return Err(AttemptError::Auth(message));
        }
        if let Some(reset_secs) = smallest_reset {
            return Err(AttemptError::RateLimited { reset_secs });
        }
        if let Some(message) = last_server {
            return Err(AttemptError::Overloaded(message));
        }
        Err(AttemptError::Network("all endpoints failed".to_string()))
    }

    /// Resolve the Cloud-Code project for an account whose store entry lacks
    /// one. Tried against each endpoint in order.
    pub async fn fetch_project_id(&self, access_token: &str) -> Result<String, AttemptError> {
        let mut last_error = String::from("no endpoints configured");
        for base_url in &self.base_urls {
            let url = endpoints::endpoint_load_code_assist(base_url);
            let response = match self
                .client
                .post(&url)
                .bearer_auth(access_token)
                .json(&serde_json::json!({
                    "metadata": { "pluginType": "GEMINI" }
                }))
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };
            if !response.status().is_success() {
                last_error = format!("loadCodeAssist returned {}", response.status());
                continue;
            }
            let body: Value = match response.json().await {
                Ok(b) => b,
                Err(e) => {
                    last_error = e.to_string();
                    continue;
                }
            };
            if let Some(project) = body
                .get("cloudaicompanionProject")
                .and_then(Value::as_str)
                .filter(|p| !p.is_empty())
            {
                return Ok(project.to_string());
            }
            last_error = "loadCodeAssist response had no project".to_string();
        }
        Err(AttemptError::Auth(last_error))
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new()
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode as AxStatus;
    use axum::response::IntoResponse;
    use axum::routing::post;
    use axum::Router;
    use serde_json::json;

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/v1internal", addr)
    }

    fn vendor_ok() -> serde_json::Value {
        json!({
            "response": {
                "responseId": "r1",
                "candidates": [{
                    "content": {"parts": [{"text": "ok"}]},
                    "finishReason": "STOP"
                }]
            }
        })
    }

    #[tokio::test]
    async fn success_on_the_primary_endpoint() {
        let app = Router::new().route(
            "/v1internal:generateContent",
            post(|| async { axum::Json(vendor_ok()) }),
        );
        let base = serve(app).await;
        let client = UpstreamClient::with_base_urls(vec![base]);
        let result = client.call("tok", &json!({}), false).await;
        match result {
            Ok(UpstreamResponse::Complete(v)) => {
                assert_eq!(v["response"]["responseId"], "r1");
            }
            _ => panic!("expected a complete response"),
        }
    }

    #[tokio::test]
    async fn rate_limited_primary_falls_through_to_secondary() {
        let limited = Router::new().route(
            "/v1internal:generateContent",
            post(|| async {
                (
                    AxStatus::TOO_MANY_REQUESTS,
                    [("Retry-After", "30")],
                    "quota exhausted",
                )
                    .into_response()
            }),
        );
        let healthy = Router::new().route(
            "/v1internal:generateContent",
            post(|| async { axum::Json(vendor_ok()) }),
        );
        let primary = serve(limited).await;
        let secondary = serve(healthy).await;
        let client = UpstreamClient::with_base_urls(vec![primary, secondary]);
        assert!(matches!(
            client.call("tok", &json!({}), false).await,
            Ok(UpstreamResponse::Complete(_))
        ));
    }

    #[tokio::test]
    async fn all_endpoints_429_surface_the_smallest_reset() {
        let slow = Router::new().route(
            "/v1internal:generateContent",
            post(|| async {
                (
                    AxStatus::TOO_MANY_REQUESTS,
                    "quota will reset after 1h 0m 0s",
                )
                    .into_response()
            }),
        );
        let fast = Router::new().route(
            "/v1internal:generateContent",
            post(|| async {
                (AxStatus::TOO_MANY_REQUESTS, [("Retry-After", "10")], "").into_response()
            }),
        );
        let client =
            UpstreamClient::with_base_urls(vec![serve(slow).await, serve(fast).await]);
        match client.call("tok", &json!({}), false).await {
            Err(AttemptError::RateLimited { reset_secs }) => assert_eq!(reset_secs, 10),
            other => panic!("unexpected: {:?}", other.map(|_| "ok")),
        }
    }

    #[tokio::test]
    async fn unauthenticated_everywhere_is_an_auth_error() {
        let app = Router::new().route(
            "/v1internal:generateContent",
            post(|| async { (AxStatus::UNAUTHORIZED, "UNAUTHENTICATED").into_response() }),
        );
        let client = UpstreamClient::with_base_urls(vec![serve(app).await]);
        assert!(matches!(
            client.call("tok", &json!({}), false).await,
            Err(AttemptError::Auth(_))
        ));
    }

    #[tokio::test]
    async fn forbidden_stops_without_fallback() {
        let forbidden = Router::new().route(
            "/v1internal:generateContent",
            post(|| async { (AxStatus::FORBIDDEN, "PERMISSION_DENIED").into_response() }),
        );
        let healthy = Router::new().route(
            "/v1internal:generateContent",
            post(|| async { axum::Json(vendor_ok()) }),
        );
        let client = UpstreamClient::with_base_urls(vec![
            serve(forbidden).await,
            serve(healthy).await,
        ]);
        assert!(matches!(
            client.call("tok", &json!({}), false).await,
            Err(AttemptError::Permission(_))
        ));
    }

    #[tokio::test]
    async fn plain_bad_request_is_invalid_request() {
        let app = Router::new().route(
            "/v1internal:generateContent",
            post(|| async { (AxStatus::BAD_REQUEST, "malformed contents").into_response() }),
        );
        let client = UpstreamClient::with_base_urls(vec![serve(app).await]);
        match client.call("tok", &json!({}), false).await {
            Err(AttemptError::InvalidRequest(m)) => assert!(m.contains("malformed")),
            other => panic!("unexpected: {:?}", other.map(|_| "ok")),
        }
    }

    #[tokio::test]
    async fn unreachable_endpoints_are_a_network_error() {
        let client =
            UpstreamClient::with_base_urls(vec!["http://127.0.0.1:1/v1internal".to_string()]);
        assert!(matches!(
            client.call("tok", &json!({}), false).await,
            Err(AttemptError::Network(_))
        ));
    }

    #[tokio::test]
    async fn network_failure_surfaces_before_walking_the_fallback_list() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        // An unreachable primary must not spill over to the healthy
        // secondary: connection failures rotate accounts, not endpoints.
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_handler = calls.clone();
        let healthy = Router::new().route(
            "/v1internal:generateContent",
            post(move || {
                let calls = calls_handler.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    axum::Json(vendor_ok())
                }
            }),
        );
        let client = UpstreamClient::with_base_urls(vec![
            "http://127.0.0.1:1/v1internal".to_string(),
            serve(healthy).await,
        ]);
        assert!(matches!(
            client.call("tok", &json!({}), false).await,
            Err(AttemptError::Network(_))
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn project_id_resolves_from_load_code_assist() {
        let app = Router::new().route(
            "/v1internal:loadCodeAssist",
            post(|| async {
                axum::Json(json!({ "cloudaicompanionProject": "resolved-project" }))
            }),
        );
        let client = UpstreamClient::with_base_urls(vec![serve(app).await]);
        assert_eq!(
            client.fetch_project_id("tok").await.unwrap(),
            "resolved-project"
        );
    }
}
