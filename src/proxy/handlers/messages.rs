// POST /v1/messages: classify by model prefix, validate, then either proxy
// to the local gateway or drive the retry loop across the account pool.
use crate::constants::{
    EMPTY_RESPONSE_FALLBACK_TEXT, MAX_EMPTY_RESPONSE_RETRIES, MAX_RETRIES,
    MAX_WAIT_BEFORE_ERROR_MS, SOFT_FAIL_PAUSE_MS,
};
use crate::models::account::mask_email;
use crate::proxy::common::model_mapping::{apply_model_mapping, classify_model, ModelRoute};
use crate::proxy::handlers::common::{
    build_models_list_response, error_response, sse_error_frame, sse_response,
};
use crate::proxy::handlers::local;
use crate::proxy::mappers::claude::{ClaudeMessage, ClaudeRequest, ContentBlock, Usage};
use crate::proxy::mappers::cloudcode::streaming::synthetic_text_events;
use crate::proxy::mappers::cloudcode::{
    create_claude_sse_stream, transform_claude_request, transform_response,
};
use crate::proxy::state::AppState;
use crate::proxy::token::types::PoolAccount;
use crate::proxy::token::PickOutcome;
use crate::proxy::upstream::{AttemptError, UpstreamResponse};
use crate::proxy::validation::{scan_object_safety, validate_request};
use axum::body::Body;
use axum::extract::{Json, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use futures::StreamExt;
use serde_json::{json, Value};
use std::pin::Pin;
use tracing::{debug, info, warn};

pub async fn handle_messages(State(state): State<AppState>, Json(mut body): Json<Value>) -> Response {
    if let Err(message) = scan_object_safety(&body) {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request_error", &message);
    }

    let Some(requested_model) = body.get("model").and_then(Value::as_str).map(String::from)
    else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            "model is required",
        );
    };

    // Alias rewrite happens before validation; the post-rewrite name must
    // still satisfy the prefix allow-list.
    let mapped_model = {
        let mapping = state.model_mapping.read().await;
        apply_model_mapping(&requested_model, &mapping)
    };
    let Some(route) = classify_model(&mapped_model) else {
        return error_response(
            StatusCode::BAD_REQUEST,
            "invalid_request_error",
            &format!("model '{}' is not allowed", requested_model),
        );
    };
    body["model"] = json!(mapped_model);

    let mut request: ClaudeRequest = match serde_json::from_value(body) {
        Ok(r) => r,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "invalid_request_error",
                &format!("Invalid request body: {}", e),
            );
        }
    };

    if let Err(message) = validate_request(&mut request) {
        return error_response(StatusCode::BAD_REQUEST, "invalid_request_error", &message);
    }

    match route {
        ModelRoute::LocalGateway => local::forward(&state, request).await,
        ModelRoute::CloudCode => dispatch(&state, request).await,
    }
}

pub async fn handle_count_tokens() -> Response {
    error_response(
        StatusCode::NOT_IMPLEMENTED,
        "not_implemented",
        "count_tokens is not implemented by this gateway",
    )
}

pub async fn handle_list_models(State(state): State<AppState>) -> Response {
    build_models_list_response(&state.model_mapping)
        .await
        .into_response()
}

fn trace_id() -> String {
    use rand::Rng;
    rand::thread_rng()
        .sample_iter(&rand::distributions::Alphanumeric)
        .take(6)
        .map(char::from)
        .collect::<String>()
        .to_lowercase()
}

/// The retry loop. Attempt budget = max(MAX_RETRIES, accounts + 1); each
/// attempt selects an account, resolves its token and project, and executes
/// one upstream call. Rate-limit and auth failures rotate; permission and
/// request errors terminate.
async fn dispatch(state: &AppState, mut request: ClaudeRequest) -> Response {
    let trace = trace_id();
    info!(
        "[{}] dispatch | model: {} | stream: {} | {} message(s)",
        trace,
        request.model,
        request.stream,
        request.messages.len()
    );

    let mut fallback_allowed = state.config.fallback_enabled;
    let mut optimistic_reset_done = false;
    let mut last_error = String::from("no attempt executed");
    let mut last_status = StatusCode::SERVICE_UNAVAILABLE;

    'model: loop {
        let pool_size = state.pool.len().await;
        let max_attempts = MAX_RETRIES.max(pool_size + 1);

        for attempt in 0..max_attempts {
            let account = match select_account(state, &request.model, &trace).await {
                Selection::Account(account) => account,
                Selection::PoolLimited => {
                    if !optimistic_reset_done {
                        // Accumulated limit state may be stale; allow one
                        // fresh probe across the pool.
                        optimistic_reset_done = true;
                        state.pool.reset_all_rate_limits().await;
                        continue;
                    }
                    if fallback_allowed {
                        if let Some(fallback) = state.config.fallback_model_for(&request.model) {
                            if classify_model(fallback) == Some(ModelRoute::CloudCode) {
                                info!(
                                    "[{}] pool exhausted for {}, falling back to {}",
                                    trace, request.model, fallback
                                );
                                request.model = fallback.to_string();
                                fallback_allowed = false;
                                continue 'model;
                            }
                        }
                    }
                    // Deliberately 400, not 429: stops client retry loops
                    // from amplifying the quota problem.
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        "invalid_request_error",
                        &format!(
                            "All accounts are rate-limited for model '{}'; quota exhausted",
                            request.model
                        ),
                    );
                }
                Selection::NoAccounts => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        "invalid_request_error",
                        "No usable accounts are configured; quota exhausted",
                    );
                }
            };

            let email = account.email.clone();
            debug!("[{}] attempt {}/{} using {}", trace, attempt + 1, max_attempts, mask_email(&email));

            let token = match state.token_store.token_for(&account).await {
                Ok(t) => t,
                Err(e) => {
                    warn!("[{}] token refresh failed for {}: {}", trace, mask_email(&email), e);
                    if e.to_string().contains("invalid_grant") {
                        state.pool.mark_invalid(&email, "refresh token revoked").await;
                    }
                    last_error = format!("token refresh failed: {}", e);
                    last_status = StatusCode::UNAUTHORIZED;
                    continue;
                }
            };

            let project = match state.pool.project_id_for(&email).await {
                Some(p) => p,
                None => match state.upstream.fetch_project_id(&token).await {
                    Ok(p) => {
                        state.pool.set_project_id(&email, &p).await;
                        p
                    }
                    Err(e) => {
                        warn!("[{}] project resolution failed for {}: {}", trace, mask_email(&email), e);
                        last_error = format!("project resolution failed: {}", e);
                        last_status = StatusCode::UNAUTHORIZED;
                        continue;
                    }
                },
            };

            let vendor_body = match transform_claude_request(&request, &project) {
                Ok(b) => b,
                Err(e) => {
                    return error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "api_error",
                        &format!("Transform error: {}", e),
                    );
                }
            };

            match state
                .upstream
                .call(&token, &vendor_body, request.stream)
                .await
            {
                Ok(UpstreamResponse::Complete(raw)) => {
                    match complete_response(state, &trace, &request, &email, &token, &vendor_body, raw)
                        .await
                    {
                        Some(response) => return response,
                        None => {
                            last_error = "empty upstream response".to_string();
                            continue;
                        }
                    }
                }
                Ok(UpstreamResponse::Stream(response)) => {
                    match stream_response(state, &trace, &request, &email, &token, &vendor_body, response)
                        .await
                    {
                        Some(response) => return response,
                        None => {
                            last_error = "stream error before first event".to_string();
                            continue;
                        }
                    }
                }
                Err(AttemptError::Auth(message)) => {
                    // Token and project bindings are suspect; drop both.
                    state.token_store.invalidate(&email);
                    state.pool.invalidate_project(&email).await;
                    last_error = format!("authentication failed: {}", message);
                    last_status = StatusCode::UNAUTHORIZED;
                    continue;
                }
                Err(AttemptError::RateLimited { reset_secs }) => {
                    state
                        .pool
                        .mark_rate_limited(&email, &request.model, Some(reset_secs * 1000))
                        .await;
                    last_error = format!("rate limited, reset in {}s", reset_secs);
                    last_status = StatusCode::TOO_MANY_REQUESTS;
                    continue;
                }
                Err(AttemptError::Permission(message)) => {
                    return error_response(
                        StatusCode::FORBIDDEN,
                        "permission_error",
                        &sanitize(&message),
                    );
                }
                Err(AttemptError::InvalidRequest(message)) => {
                    return error_response(
                        StatusCode::BAD_REQUEST,
                        "invalid_request_error",
                        &sanitize(&message),
                    );
                }
                Err(AttemptError::Overloaded(message)) => {
                    last_error = message;
                    last_status = StatusCode::SERVICE_UNAVAILABLE;
                    continue;
                }
                Err(AttemptError::Network(message)) => {
                    last_error = message;
                    last_status = StatusCode::SERVICE_UNAVAILABLE;
                    tokio::time::sleep(std::time::Duration::from_millis(SOFT_FAIL_PAUSE_MS)).await;
                    continue;
                }
            }
        }

        // Budget exhausted.
        let (status, error_type) = match last_status {
            StatusCode::UNAUTHORIZED => (StatusCode::UNAUTHORIZED, "authentication_error"),
            StatusCode::TOO_MANY_REQUESTS => (StatusCode::BAD_REQUEST, "invalid_request_error"),
            _ => (StatusCode::SERVICE_UNAVAILABLE, "overloaded_error"),
        };
        return error_response(
            status,
            error_type,
            &format!("All attempts failed: {}", sanitize(&last_error)),
        );
    }
}

enum Selection {
    Account(PoolAccount),
    PoolLimited,
    NoAccounts,
}

/// Ask the pool for an account; when everyone is cooling down and the wait
/// fits the budget, sleep once and re-ask.
async fn select_account(state: &AppState, model: &str, trace: &str) -> Selection {
    match state.pool.pick_next(model).await {
        PickOutcome::Account(account) => Selection::Account(account),
        PickOutcome::Exhausted => Selection::NoAccounts,
        PickOutcome::Wait(wait_ms) => {
            if wait_ms > MAX_WAIT_BEFORE_ERROR_MS {
                return Selection::PoolLimited;
            }
            info!(
                "[{}] pool limited for {}, waiting {}ms for the nearest reset",
                trace, model, wait_ms
            );
            tokio::time::sleep(std::time::Duration::from_millis(wait_ms.max(100))).await;
            match state.pool.pick_next(model).await {
                PickOutcome::Account(account) => Selection::Account(account),
                PickOutcome::Exhausted => Selection::NoAccounts,
                PickOutcome::Wait(_) => Selection::PoolLimited,
            }
        }
    }
}

/// Non-streamed upstream result. Empty content retries the same payload up to
/// the empty-response budget, then synthesizes the fallback message.
async fn complete_response(
    state: &AppState,
    trace: &str,
    request: &ClaudeRequest,
    email: &str,
    token: &str,
    vendor_body: &Value,
    first: Value,
) -> Option<Response> {
    let mut raw = first;
    for retry in 0..=MAX_EMPTY_RESPONSE_RETRIES {
        match transform_response(&raw, &request.model) {
            Ok(message) if !message.content.is_empty() => {
                state.pool.mark_success(email, &request.model).await;
                return Some(success_json(email, &request.model, message));
            }
            Ok(_) | Err(_) => {
                if retry == MAX_EMPTY_RESPONSE_RETRIES {
                    break;
                }
                warn!(
                    "[{}] empty upstream response, retry {}/{}",
                    trace,
                    retry + 1,
                    MAX_EMPTY_RESPONSE_RETRIES
                );
                match state.upstream.call(token, vendor_body, false).await {
                    Ok(UpstreamResponse::Complete(next)) => raw = next,
                    _ => break,
                }
            }
        }
    }

    warn!("[{}] empty responses exhausted, synthesizing fallback", trace);
    let message = ClaudeMessage::assistant(
        &request.model,
        vec![ContentBlock::Text {
            text: EMPTY_RESPONSE_FALLBACK_TEXT.to_string(),
        }],
        "end_turn",
        Usage::default(),
    );
    Some(success_json(email, &request.model, message))
}

fn success_json(email: &str, model: &str, message: ClaudeMessage) -> Response {
    (
        StatusCode::OK,
        [
            ("X-Account", mask_email(email)),
            ("X-Mapped-Model", model.to_string()),
        ],
        Json(message),
    )
        .into_response()
}

type FrameStream = Pin<Box<dyn futures::Stream<Item = Result<Bytes, String>> + Send>>;

/// Streamed upstream result. Peeks the translated stream for the first
/// content block; streams that end without one are retried on the same
/// payload, then replaced by the synthetic fallback sequence.
async fn stream_response(
    state: &AppState,
    trace: &str,
    request: &ClaudeRequest,
    email: &str,
    token: &str,
    vendor_body: &Value,
    first: reqwest::Response,
) -> Option<Response> {
    let mut upstream_response = first;

    for retry in 0..=MAX_EMPTY_RESPONSE_RETRIES {
        let claude_stream = create_claude_sse_stream(
            Box::pin(upstream_response.bytes_stream()),
            request.model.clone(),
            trace.to_string(),
        );

        match peek_for_content(claude_stream).await {
            Peeked::Content { buffered, rest } => {
                state.pool.mark_success(email, &request.model).await;
                return Some(assemble_stream(email, &request.model, buffered, rest));
            }
            Peeked::Empty => {
                if retry == MAX_EMPTY_RESPONSE_RETRIES {
                    break;
                }
                warn!(
                    "[{}] stream carried no content blocks, retry {}/{}",
                    trace,
                    retry + 1,
                    MAX_EMPTY_RESPONSE_RETRIES
                );
                match state.upstream.call(token, vendor_body, true).await {
                    Ok(UpstreamResponse::Stream(next)) => upstream_response = next,
                    _ => break,
                }
            }
            Peeked::Failed(message) => {
                warn!("[{}] stream failed during peek: {}", trace, message);
                return None;
            }
        }
    }

    warn!("[{}] empty streams exhausted, synthesizing fallback", trace);
    let frames = synthetic_text_events(&request.model, EMPTY_RESPONSE_FALLBACK_TEXT);
    let body = Body::from_stream(futures::stream::iter(
        frames.into_iter().map(Ok::<_, std::io::Error>),
    ));
    let mut response = sse_response(body);
    decorate_stream_headers(&mut response, email, &request.model);
    Some(response)
}

enum Peeked {
    Content { buffered: Vec<Bytes>, rest: FrameStream },
    Empty,
    Failed(String),
}

async fn peek_for_content(mut stream: FrameStream) -> Peeked {
    let mut buffered: Vec<Bytes> = Vec::new();
    loop {
        let frame = match tokio::time::timeout(std::time::Duration::from_secs(60), stream.next())
            .await
        {
            Ok(Some(Ok(frame))) => frame,
            Ok(Some(Err(e))) => return Peeked::Failed(e),
            Ok(None) => return Peeked::Empty,
            Err(_) => return Peeked::Failed("timeout waiting for first event".to_string()),
        };
        let is_content = frame_has_event(&frame, "content_block_start");
        let is_stop = frame_has_event(&frame, "message_stop");
        buffered.push(frame);
        if is_content {
            return Peeked::Content { buffered, rest: stream };
        }
        if is_stop {
            return Peeked::Empty;
        }
    }
}

fn frame_has_event(frame: &Bytes, event: &str) -> bool {
    std::str::from_utf8(frame)
        .map(|s| s.lines().any(|l| l == format!("event: {}", event)))
        .unwrap_or(false)
}

fn assemble_stream(email: &str, model: &str, buffered: Vec<Bytes>, rest: FrameStream) -> Response {
    let head = futures::stream::iter(buffered.into_iter().map(Ok::<_, std::io::Error>));
    let tail = rest.map(|item| -> Result<Bytes, std::io::Error> {
        match item {
            Ok(frame) => Ok(frame),
            // Headers are already out: surface the failure as a terminal
            // error event, not a broken connection.
            Err(e) => Ok(sse_error_frame("api_error", &sanitize(&e))),
        }
    });
    let mut response = sse_response(Body::from_stream(head.chain(tail)));
    decorate_stream_headers(&mut response, email, model);
    response
}

fn decorate_stream_headers(response: &mut Response, email: &str, model: &str) {
    let headers = response.headers_mut();
    if let Ok(value) = mask_email(email).parse() {
        headers.insert("X-Account", value);
    }
    if let Ok(value) = model.parse() {
        headers.insert("X-Mapped-Model", value);
    }
}

/// Upstream text can carry tokens; strip anything that looks like a bearer
/// credential before echoing.
fn sanitize(message: &str) -> String {
    let mut out = String::with_capacity(message.len());
    for word in message.split_whitespace() {
        if word.starts_with("ya29.") || word.starts_with("Bearer") || word.len() > 120 {
            out.push_str("[redacted]");
        } else {
            out.push_str(word);
        }
        out.push(' ');
    }
    out.trim_end().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_strips_token_like_words() {
        let input = "request failed ya29.A0ARrdaM-abcdef with Bearer token";
        let out = sanitize(input);
        assert!(!out.contains("ya29."));
        assert!(out.contains("[redacted]"));
        assert!(out.contains("request failed"));
    }

    #[test]
    fn frame_event_detection_matches_exact_lines() {
        let frame = Bytes::from("event: content_block_start\ndata: {}\n\n");
        assert!(frame_has_event(&frame, "content_block_start"));
        assert!(!frame_has_event(&frame, "message_stop"));
        // A delta frame whose payload mentions the word is not a match.
        let tricky = Bytes::from(
            "event: content_block_delta\ndata: {\"text\":\"event: message_stop\"}\n\n",
        );
        assert!(!frame_has_event(&tricky, "message_stop"));
    }

    #[tokio::test]
    async fn peek_reports_empty_for_contentless_streams() {
        let frames = vec![
            Ok(Bytes::from("event: message_start\ndata: {}\n\n")),
            Ok(Bytes::from("event: message_delta\ndata: {}\n\n")),
            Ok(Bytes::from("event: message_stop\ndata: {}\n\n")),
        ];
        let stream: FrameStream = Box::pin(futures::stream::iter(frames));
        assert!(matches!(peek_for_content(stream).await, Peeked::Empty));
    }

    #[tokio::test]
    async fn peek_buffers_up_to_the_first_content_block() {
        let frames = vec![
            Ok(Bytes::from("event: message_start\ndata: {}\n\n")),
            Ok(Bytes::from("event: content_block_start\ndata: {}\n\n")),
            Ok(Bytes::from("event: content_block_delta\ndata: {}\n\n")),
        ];
        let stream: FrameStream = Box::pin(futures::stream::iter(frames));
        match peek_for_content(stream).await {
            Peeked::Content { buffered, mut rest } => {
                assert_eq!(buffered.len(), 2);
                assert!(frame_has_event(&buffered[0], "message_start"));
                assert!(frame_has_event(&buffered[1], "content_block_start"));
                let next = rest.next().await.unwrap().unwrap();
                assert!(frame_has_event(&next, "content_block_delta"));
            }
            _ => panic!("expected content"),
        }
    }
}
