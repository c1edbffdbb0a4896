use crate::error::error_body;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use serde_json::{json, Value};

/// An Anthropic-shaped error response.
pub fn error_response(status: StatusCode, error_type: &str, message: &str) -> Response {
    (status, Json(error_body(error_type, message))).into_response()
}

/// Response headers every SSE stream carries, flushed before the first event.
pub fn sse_response(body: axum::body::Body) -> Response {
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .header("X-Accel-Buffering", "no")
        .body(body)
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Terminal `event: error` frame for failures after headers are out.
pub fn sse_error_frame(error_type: &str, message: &str) -> bytes::Bytes {
    let payload = error_body(error_type, message);
    bytes::Bytes::from(format!(
        "event: error\ndata: {}\n\n",
        serde_json::to_string(&payload).unwrap_or_default()
    ))
}

/// Anthropic-shaped model catalog.
pub async fn build_models_list_response(
    mapping: &tokio::sync::RwLock<std::collections::HashMap<String, String>>,
) -> Json<Value> {
    let mapping = mapping.read().await;
    let data: Vec<Value> = crate::proxy::common::model_mapping::catalog_models(&mapping)
        .into_iter()
        .map(|id| {
            json!({
                "type": "model",
                "id": id,
                "display_name": id,
            })
        })
        .collect();
    let first_id = data.first().and_then(|m| m["id"].as_str().map(String::from));
    let last_id = data.last().and_then(|m| m["id"].as_str().map(String::from));
    Json(json!({
        "data": data,
        "first_id": first_id,
        "has_more": false,
        "last_id": last_id,
    }))
}
