// Anthropic request -> Cloud-Code v1internal envelope.
use crate::proxy::mappers::claude::{
    ClaudeRequest, ContentBlock, MessageContent, ToolChoice,
};
use serde_json::{json, Value};
use std::collections::HashMap;

/// Wrap a conversation in the vendor envelope: project id, model id, and the
/// messages/tools rendered as vendor content parts. Thinking blocks carry
/// their signatures through byte-exact.
pub fn transform_claude_request(
    request: &ClaudeRequest,
    project_id: &str,
) -> Result<Value, String> {
    // tool_use id -> name, so functionResponse parts can name their function.
    let mut tool_names: HashMap<String, String> = HashMap::new();
    for message in &request.messages {
        if let MessageContent::Array(blocks) = &message.content {
            for block in blocks {
                if let ContentBlock::ToolUse { id, name, .. } = block {
                    tool_names.insert(id.clone(), name.clone());
                }
            }
        }
    }

    let mut contents: Vec<Value> = Vec::new();
    for message in &request.messages {
        let role = if message.role == "assistant" { "model" } else { "user" };
        let parts = match &message.content {
            MessageContent::String(text) => vec![json!({ "text": text })],
            MessageContent::Array(blocks) => blocks
                .iter()
                .filter_map(|b| block_to_part(b, &tool_names))
                .collect(),
        };
        if parts.is_empty() {
            continue;
        }
        contents.push(json!({ "role": role, "parts": parts }));
    }

    if contents.is_empty() {
        return Err("conversation has no sendable content".to_string());
    }

    let mut inner = json!({ "contents": contents });

    if let Some(system) = &request.system {
        let text = system.as_text();
        if !text.is_empty() {
            inner["systemInstruction"] = json!({
                "role": "user",
                "parts": [{ "text": text }]
            });
        }
    }

    if let Some(tools) = &request.tools {
        let declarations: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "name": t.name,
                    "description": t.description.clone().unwrap_or_default(),
                    "parameters": t.input_schema,
                })
            })
            .collect();
        if !declarations.is_empty() {
            inner["tools"] = json!([{ "functionDeclarations": declarations }]);
        }
    }

    if let Some(choice) = &request.tool_choice {
        inner["toolConfig"] = match choice {
            ToolChoice::Auto => json!({ "functionCallingConfig": { "mode": "AUTO" } }),
            ToolChoice::Any => json!({ "functionCallingConfig": { "mode": "ANY" } }),
            ToolChoice::Tool { name } => json!({
                "functionCallingConfig": {
                    "mode": "ANY",
                    "allowedFunctionNames": [name]
                }
            }),
        };
    }

    let mut generation = json!({});
    if let Some(max_tokens) = request.max_tokens {
        generation["maxOutputTokens"] = json!(max_tokens);
    }
    if let Some(t) = request.temperature {
        generation["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        generation["topP"] = json!(p);
    }
    if let Some(k) = request.top_k {
        generation["topK"] = json!(k);
    }
    if let Some(thinking) = &request.thinking {
        if let Some(budget) = thinking.budget_tokens {
            generation["thinkingConfig"] = json!({
                "includeThoughts": true,
                "thinkingBudget": budget,
            });
        }
    }
    if generation.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
        inner["generationConfig"] = generation;
    }

    Ok(json!({
        "model": request.model,
        "project": project_id,
        "request": inner,
    }))
}

fn block_to_part(block: &ContentBlock, tool_names: &HashMap<String, String>) -> Option<Value> {
    match block {
        ContentBlock::Text { text } => Some(json!({ "text": text })),
        ContentBlock::Image { source } => Some(json!({
            "inlineData": {
                "mimeType": source.media_type,
                "data": source.data,
            }
        })),
        ContentBlock::ToolUse { id, name, input } => Some(json!({
            "functionCall": {
                "id": id,
                "name": name,
                "args": input,
            }
        })),
        ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } => {
            let name = tool_names
                .get(tool_use_id)
                .cloned()
                .unwrap_or_else(|| tool_use_id.clone());
            Some(json!({
                "functionResponse": {
                    "id": tool_use_id,
                    "name": name,
                    "response": { "result": tool_result_value(content) },
                }
            }))
        }
        ContentBlock::Thinking {
            thinking,
            signature,
        } => {
            let mut part = json!({ "text": thinking, "thought": true });
            if let Some(sig) = signature {
                part["thoughtSignature"] = json!(sig);
            }
            Some(part)
        }
        // Redacted thinking cannot be replayed; opaque blocks have no vendor
        // part shape.
        ContentBlock::RedactedThinking { .. } => None,
        ContentBlock::Unknown(_) => None,
    }
}

fn tool_result_value(content: &Value) -> Value {
    match content {
        Value::String(_) => content.clone(),
        Value::Null => json!(""),
        other => json!(serde_json::to_string(other).unwrap_or_default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request_from(value: Value) -> ClaudeRequest {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn envelope_carries_project_and_model() {
        let req = request_from(json!({
            "model": "gemini-3-pro",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "hi"}]
        }));
        let body = transform_claude_request(&req, "my-project").unwrap();
        assert_eq!(body["model"], "gemini-3-pro");
        assert_eq!(body["project"], "my-project");
        assert_eq!(body["request"]["contents"][0]["role"], "user");
        assert_eq!(body["request"]["contents"][0]["parts"][0]["text"], "hi");
    }

    #[test]
    fn assistant_role_maps_to_model() {
        let req = request_from(json!({
            "model": "gemini-3-pro",
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": "q"},
                {"role": "assistant", "content": "a"}
            ]
        }));
        let body = transform_claude_request(&req, "p").unwrap();
        assert_eq!(body["request"]["contents"][1]["role"], "model");
    }

    #[test]
    fn thinking_signature_passes_through_byte_exact() {
        let sig = "CsgBAXLEYjK4dGlu==";
        let req = request_from(json!({
            "model": "claude-sonnet-4-5-thinking",
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": "q"},
                {"role": "assistant", "content": [
                    {"type": "thinking", "thinking": "deep", "signature": sig},
                    {"type": "text", "text": "a"}
                ]}
            ]
        }));
        let body = transform_claude_request(&req, "p").unwrap();
        let part = &body["request"]["contents"][1]["parts"][0];
        assert_eq!(part["thought"], true);
        assert_eq!(part["text"], "deep");
        assert_eq!(part["thoughtSignature"], sig);
    }

    #[test]
    fn tool_round_trip_keeps_ids_resolving() {
        let req = request_from(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "messages": [
                {"role": "assistant", "content": [
                    {"type": "tool_use", "id": "toolu_7", "name": "read_file",
                     "input": {"path": "a.txt"}}
                ]},
                {"role": "user", "content": [
                    {"type": "tool_result", "tool_use_id": "toolu_7", "content": "data"}
                ]}
            ]
        }));
        let body = transform_claude_request(&req, "p").unwrap();
        let call = &body["request"]["contents"][0]["parts"][0]["functionCall"];
        assert_eq!(call["id"], "toolu_7");
        assert_eq!(call["name"], "read_file");
        let response = &body["request"]["contents"][1]["parts"][0]["functionResponse"];
        assert_eq!(response["id"], "toolu_7");
        assert_eq!(response["name"], "read_file");
        assert_eq!(response["response"]["result"], "data");
    }

    #[test]
    fn tools_and_choice_map_into_the_envelope() {
        let req = request_from(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "messages": [{"role": "user", "content": "x"}],
            "tools": [{"name": "f", "description": "does f",
                       "input_schema": {"type": "object"}}],
            "tool_choice": {"type": "tool", "name": "f"}
        }));
        let body = transform_claude_request(&req, "p").unwrap();
        let decl = &body["request"]["tools"][0]["functionDeclarations"][0];
        assert_eq!(decl["name"], "f");
        assert_eq!(decl["description"], "does f");
        let config = &body["request"]["toolConfig"]["functionCallingConfig"];
        assert_eq!(config["mode"], "ANY");
        assert_eq!(config["allowedFunctionNames"][0], "f");
    }

    #[test]
    fn generation_config_collects_sampling_params() {
        let req = request_from(json!({
            "model": "claude-sonnet-4-5-thinking",
            "max_tokens": 4096,
            "temperature": 0.5,
            "top_p": 0.9,
            "top_k": 40,
            "thinking": {"type": "enabled", "budget_tokens": 2048},
            "messages": [{"role": "user", "content": "x"}]
        }));
        let body = transform_claude_request(&req, "p").unwrap();
        let config = &body["request"]["generationConfig"];
        assert_eq!(config["maxOutputTokens"], 4096);
        assert_eq!(config["temperature"], 0.5);
        assert_eq!(config["thinkingConfig"]["thinkingBudget"], 2048);
        assert_eq!(config["thinkingConfig"]["includeThoughts"], true);
    }

    #[test]
    fn empty_conversation_is_an_error() {
        let req = request_from(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 100,
            "messages": [
                {"role": "user", "content": [{"type": "redacted_thinking", "data": "x"}]}
            ]
        }));
        assert!(transform_claude_request(&req, "p").is_err());
    }
}
