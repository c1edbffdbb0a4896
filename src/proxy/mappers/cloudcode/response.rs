// Complete (non-streamed) Cloud-Code response -> Anthropic message.
use crate::proxy::mappers::claude::{ClaudeMessage, ContentBlock, Usage};
use serde_json::Value;

/// Map a `generateContent` response. The payload is sometimes wrapped in a
/// top-level `response` field.
pub fn transform_response(raw: &Value, model: &str) -> Result<ClaudeMessage, String> {
    let body = raw.get("response").unwrap_or(raw);
    let candidate = body
        .pointer("/candidates/0")
        .ok_or("upstream response has no candidates")?;

    let mut content: Vec<ContentBlock> = Vec::new();
    let mut used_tool = false;

    if let Some(parts) = candidate.pointer("/content/parts").and_then(Value::as_array) {
        for part in parts {
            if let Some(block) = part_to_block(part, &mut used_tool) {
                content.push(block);
            }
        }
    }

    let finish_reason = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .unwrap_or("STOP");
    let stop_reason = map_stop_reason(finish_reason, used_tool);

    let mut message = ClaudeMessage::assistant(model, content, &stop_reason, usage_from(body));
    if let Some(id) = body.get("responseId").and_then(Value::as_str) {
        message.id = id.to_string();
    }
    Ok(message)
}

pub(super) fn part_to_block(part: &Value, used_tool: &mut bool) -> Option<ContentBlock> {
    if let Some(call) = part.get("functionCall") {
        *used_tool = true;
        let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
        let id = call
            .get("id")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
        return Some(ContentBlock::ToolUse {
            id,
            name: name.to_string(),
            input: call.get("args").cloned().unwrap_or(serde_json::json!({})),
        });
    }

    let text = part.get("text").and_then(Value::as_str)?;
    if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
        return Some(ContentBlock::Thinking {
            thinking: text.to_string(),
            signature: part
                .get("thoughtSignature")
                .and_then(Value::as_str)
                .map(|s| s.to_string()),
        });
    }
    Some(ContentBlock::Text {
        text: text.to_string(),
    })
}

pub(super) fn map_stop_reason(finish_reason: &str, used_tool: bool) -> String {
    if used_tool {
        return "tool_use".to_string();
    }
    match finish_reason {
        "STOP" => "end_turn".to_string(),
        "MAX_TOKENS" => "max_tokens".to_string(),
        other => other.to_ascii_lowercase(),
    }
}

pub(super) fn usage_from(body: &Value) -> Usage {
    let meta = match body.get("usageMetadata") {
        Some(m) => m,
        None => return Usage::default(),
    };
    Usage {
        input_tokens: meta
            .get("promptTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        output_tokens: meta
            .get("candidatesTokenCount")
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32,
        cache_read_input_tokens: meta
            .get("cachedContentTokenCount")
            .and_then(Value::as_u64)
            .map(|v| v as u32),
    }
}
