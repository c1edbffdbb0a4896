// Request-body validation for /v1/messages. Runs on every route, local
// gateway included, before any transcoding.
use crate::constants::{
    MAX_BODY_DEPTH, MAX_IMAGE_BASE64_BYTES, MAX_MESSAGES, MAX_TEXT_BLOCK_BYTES,
    MAX_TOKENS_DEFAULT_CAP, MAX_TOKENS_LIMIT, MAX_TOOLS, THINKING_BUDGET_MAX, THINKING_BUDGET_MIN,
};
use crate::proxy::mappers::claude::{ClaudeRequest, ContentBlock, MessageContent};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

static TOOL_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{1,256}$").expect("tool name regex"));

const POLLUTION_KEYS: &[&str] = &["__proto__", "constructor", "prototype"];

const ALLOWED_IMAGE_TYPES: &[&str] = &["image/jpeg", "image/png", "image/gif", "image/webp"];

/// Object-safety scan over the decoded body: rejects prototype-pollution key
/// names at any depth and bounds nesting. Serves as the general guard against
/// hostile object shapes before anything reaches an upstream.
pub fn scan_object_safety(value: &Value) -> Result<(), String> {
    scan_value(value, 0)
}

fn scan_value(value: &Value, depth: usize) -> Result<(), String> {
    if depth > MAX_BODY_DEPTH {
        return Err(format!(
            "Request body exceeds maximum nesting depth of {}",
            MAX_BODY_DEPTH
        ));
    }
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                if POLLUTION_KEYS.contains(&key.as_str()) {
                    return Err("Prototype pollution attempt detected".to_string());
                }
                scan_value(child, depth + 1)?;
            }
        }
        Value::Array(items) => {
            for item in items {
                scan_value(item, depth + 1)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// Semantic validation of a parsed request, then defaults: `max_tokens` is
/// clamped to the 8192 cap. The model prefix is checked by the router before
/// this runs.
pub fn validate_request(request: &mut ClaudeRequest) -> Result<(), String> {
    if request.messages.is_empty() {
        return Err("messages must not be empty".to_string());
    }
    if request.messages.len() > MAX_MESSAGES {
        return Err(format!(
            "messages exceeds the maximum of {} entries",
            MAX_MESSAGES
        ));
    }

    for (idx, message) in request.messages.iter().enumerate() {
        if message.role != "user" && message.role != "assistant" {
            return Err(format!(
                "messages[{}].role must be 'user' or 'assistant'",
                idx
            ));
        }
        if let MessageContent::Array(blocks) = &message.content {
            for block in blocks {
                validate_block(idx, block)?;
            }
        }
    }

    match request.max_tokens {
        None => return Err("max_tokens is required".to_string()),
        Some(v) if v < 1 || v > MAX_TOKENS_LIMIT => {
            return Err(format!(
                "max_tokens must be between 1 and {}",
                MAX_TOKENS_LIMIT
            ));
        }
        Some(_) => {}
    }

    if let Some(t) = request.temperature {
        if !(0.0..=2.0).contains(&t) {
            return Err("temperature must be between 0 and 2".to_string());
        }
    }
    if let Some(p) = request.top_p {
        if !(0.0..=1.0).contains(&p) {
            return Err("top_p must be between 0 and 1".to_string());
        }
    }
    if let Some(k) = request.top_k {
        if !(1..=500).contains(&k) {
            return Err("top_k must be between 1 and 500".to_string());
        }
    }

    if let Some(tools) = &request.tools {
        if tools.len() > MAX_TOOLS {
            return Err(format!("tools exceeds the maximum of {}", MAX_TOOLS));
        }
        for tool in tools {
            if !TOOL_NAME_RE.is_match(&tool.name) {
                return Err(format!(
                    "tool name '{}' must match [A-Za-z0-9_-]+ and be at most 256 characters",
                    truncate_for_error(&tool.name)
                ));
            }
        }
    }

    if let Some(thinking) = &request.thinking {
        if let Some(budget) = thinking.budget_tokens {
            if !(THINKING_BUDGET_MIN..=THINKING_BUDGET_MAX).contains(&budget) {
                return Err(format!(
                    "thinking.budget_tokens must be between {} and {}",
                    THINKING_BUDGET_MIN, THINKING_BUDGET_MAX
                ));
            }
        }
    }

    // Defaults after validation.
    request.max_tokens = request.max_tokens.map(|v| v.min(MAX_TOKENS_DEFAULT_CAP));

    Ok(())
}

fn validate_block(message_idx: usize, block: &ContentBlock) -> Result<(), String> {
    match block {
        ContentBlock::Text { text } => {
            if text.len() > MAX_TEXT_BLOCK_BYTES {
                return Err(format!(
                    "messages[{}] text block exceeds {} bytes",
                    message_idx, MAX_TEXT_BLOCK_BYTES
                ));
            }
        }
        ContentBlock::Image { source } => {
            if !ALLOWED_IMAGE_TYPES.contains(&source.media_type.as_str()) {
                return Err(format!(
                    "messages[{}] image media_type '{}' is not supported",
                    message_idx, source.media_type
                ));
            }
            if source.data.len() > MAX_IMAGE_BASE64_BYTES {
                return Err(format!(
                    "messages[{}] image exceeds {} base64 bytes",
                    message_idx, MAX_IMAGE_BASE64_BYTES
                ));
            }
        }
        ContentBlock::ToolUse { name, .. } => {
            if !TOOL_NAME_RE.is_match(name) {
                return Err(format!(
                    "messages[{}] tool_use name '{}' is invalid",
                    message_idx,
                    truncate_for_error(name)
                ));
            }
        }
        ContentBlock::ToolResult { tool_use_id, .. } => {
            if tool_use_id.is_empty() {
                return Err(format!(
                    "messages[{}] tool_result requires a tool_use_id",
                    message_idx
                ));
            }
        }
        // Opaque and thinking blocks are forwarded as-is.
        _ => {}
    }
    Ok(())
}

fn truncate_for_error(s: &str) -> String {
    s.chars().take(64).collect()
}
