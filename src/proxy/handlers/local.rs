// Local gateway: `local-*` / `gemma-*` models proxied to an OpenAI-compatible
// endpoint, transcoded to Anthropic shape on the way back.
use crate::proxy::handlers::common::{error_response, sse_response};
use crate::proxy::mappers::claude::ClaudeRequest;
use crate::proxy::mappers::openai::{
    delta_to_events, finish_events, message_start_event, openai_response_to_claude, sse_frame,
    transform_claude_to_openai, OpenAiStreamState,
};
use crate::proxy::state::AppState;
use axum::body::Body;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use bytes::BytesMut;
use futures::StreamExt;
use once_cell::sync::Lazy;
use serde_json::Value;
use tracing::{debug, info};

static LOCAL_CLIENT: Lazy<reqwest::Client> = Lazy::new(|| {
    reqwest::Client::builder()
        .connect_timeout(std::time::Duration::from_secs(10))
        .timeout(std::time::Duration::from_secs(600))
        .user_agent(crate::constants::USER_AGENT.as_str())
        .build()
        .expect("failed to build local gateway client")
});

pub async fn forward(state: &AppState, request: ClaudeRequest) -> Response {
    forward_to(
        &state.config.local_llm_url,
        state.config.local_llm_key.as_deref(),
        request,
    )
    .await
}

pub async fn forward_to(url: &str, api_key: Option<&str>, request: ClaudeRequest) -> Response {
    let body = transform_claude_to_openai(&request);
    info!(
        "local gateway: {} | stream: {} | {} message(s)",
        request.model,
        request.stream,
        request.messages.len()
    );

    let mut builder = LOCAL_CLIENT.post(url).json(&body);
    if let Some(key) = api_key {
        builder = builder.bearer_auth(key);
    }

    let response = match builder.send().await {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                StatusCode::BAD_GATEWAY,
                "api_error",
                &format!("Local Agent Error: {}", e),
            );
        }
    };

    let status = response.status();
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return error_response(
            StatusCode::BAD_GATEWAY,
            "api_error",
            &format!("Local Agent Error: upstream returned {}: {}", status, text),
        );
    }

    if request.stream {
        stream_response(response, request.model.clone())
    } else {
        let parsed: Value = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                return error_response(
                    StatusCode::BAD_GATEWAY,
                    "api_error",
                    &format!("Local Agent Error: invalid JSON from upstream: {}", e),
                );
            }
        };
        Json(openai_response_to_claude(&parsed, &request.model)).into_response()
    }
}

/// Parse upstream SSE lines, suppress `data: [DONE]`, feed each JSON delta
/// through the transcoder, and frame `message_stop` at stream end.
fn stream_response(response: reqwest::Response, model: String) -> Response {
    let stream = async_stream::stream! {
        let mut upstream = response.bytes_stream();
        let mut state = OpenAiStreamState::new();
        let mut buffer = BytesMut::new();

        let (event_type, payload) = message_start_event(&model);
        yield Ok::<_, std::io::Error>(sse_frame(&event_type, &payload));

        while let Some(chunk) = upstream.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    debug!("local stream ended with error: {}", e);
                    break;
                }
            };
            buffer.extend_from_slice(&chunk);
            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line_raw = buffer.split_to(pos + 1);
                let data = match std::str::from_utf8(&line_raw) {
                    Ok(line) => match line.trim().strip_prefix("data:") {
                        Some(d) => d.trim().to_string(),
                        None => continue,
                    },
                    Err(_) => continue,
                };
                if data == "[DONE]" || data.is_empty() {
                    continue;
                }
                let parsed = match serde_json::from_str::<Value>(&data) {
                    Ok(v) => v,
                    Err(_) => continue,
                };
                let delta = &parsed["choices"][0]["delta"];
                for (event_type, payload) in delta_to_events(delta, &mut state) {
                    yield Ok(sse_frame(&event_type, &payload));
                }
            }
        }

        for (event_type, payload) in finish_events(&state) {
            yield Ok(sse_frame(&event_type, &payload));
        }
    };

    sse_response(Body::from_stream(stream))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;
    use serde_json::json;

    fn request(stream: bool) -> ClaudeRequest {
        serde_json::from_value(json!({
            "model": "local-gemma",
            "max_tokens": 10,
            "stream": stream,
            "messages": [{"role": "user", "content": "hi"}]
        }))
        .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        String::from_utf8_lossy(&bytes).to_string()
    }

    #[tokio::test]
    async fn unreachable_endpoint_maps_to_502_api_error() {
        let response =
            forward_to("http://127.0.0.1:1/v1/chat/completions", None, request(false)).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let text = body_text(response).await;
        assert!(text.contains("\"api_error\""), "{}", text);
        assert!(text.contains("Local Agent Error"), "{}", text);
    }

    #[tokio::test]
    async fn upstream_error_body_is_surfaced() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                (axum::http::StatusCode::INTERNAL_SERVER_ERROR, "model not loaded")
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let url = format!("http://{}/v1/chat/completions", addr);
        let response = forward_to(&url, None, request(false)).await;
        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let text = body_text(response).await;
        assert!(text.contains("model not loaded"), "{}", text);
    }

    #[tokio::test]
    async fn single_chunk_stream_produces_the_expected_events() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                let body = concat!(
                    "data: {\"choices\":[{\"delta\":{\"content\":\"ok\"}}]}\n\n",
                    "data: [DONE]\n\n",
                );
                (
                    [("content-type", "text/event-stream")],
                    body,
                )
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let url = format!("http://{}/v1/chat/completions", addr);
        let response = forward_to(&url, None, request(true)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "text/event-stream"
        );
        let text = body_text(response).await;
        let types: Vec<&str> = text
            .lines()
            .filter_map(|l| l.strip_prefix("event: "))
            .collect();
        assert_eq!(types.first(), Some(&"message_start"));
        assert_eq!(types.last(), Some(&"message_stop"));
        assert!(text.contains("\"text_delta\""));
        assert!(text.contains("\"ok\""));
        assert!(!text.contains("[DONE]"));
    }

    #[tokio::test]
    async fn non_stream_response_is_wrapped_with_zeroed_usage() {
        let app = Router::new().route(
            "/v1/chat/completions",
            post(|| async {
                axum::Json(json!({
                    "choices": [{
                        "message": {"role": "assistant", "content": "hello there"},
                        "finish_reason": "stop"
                    }]
                }))
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        let url = format!("http://{}/v1/chat/completions", addr);
        let response = forward_to(&url, None, request(false)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(body["role"], "assistant");
        assert_eq!(body["stop_reason"], "end_turn");
        assert_eq!(body["content"][0]["text"], "hello there");
        assert_eq!(body["usage"]["input_tokens"], 0);
        assert_eq!(body["usage"]["output_tokens"], 0);
    }
}
