// Anthropic -> OpenAI Chat Completions request shaping, and the reverse for
// complete (non-streamed) responses.
use crate::proxy::mappers::claude::{
    ClaudeMessage, ClaudeRequest, ContentBlock, MessageContent, ToolChoice, Usage,
};
use serde_json::{json, Value};

/// Build an OpenAI chat request from an Anthropic one. `system` leads as a
/// system message; assistant `tool_use` blocks become `tool_calls`; user
/// `tool_result` blocks become trailing `role: tool` messages.
pub fn transform_claude_to_openai(request: &ClaudeRequest) -> Value {
    let mut messages: Vec<Value> = Vec::new();

    if let Some(system) = &request.system {
        let text = system.as_text();
        if !text.is_empty() {
            messages.push(json!({ "role": "system", "content": text }));
        }
    }

    for message in &request.messages {
        match &message.content {
            MessageContent::String(text) => {
                messages.push(json!({ "role": message.role, "content": text }));
            }
            MessageContent::Array(blocks) => {
                if message.role == "assistant" {
                    push_assistant_message(&mut messages, blocks);
                } else {
                    push_user_messages(&mut messages, blocks);
                }
            }
        }
    }

    let mut body = json!({
        "model": request.model,
        "messages": messages,
        "stream": request.stream,
    });

    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(t) = request.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = request.top_p {
        body["top_p"] = json!(p);
    }

    if let Some(tools) = &request.tools {
        let mapped: Vec<Value> = tools
            .iter()
            .map(|t| {
                json!({
                    "type": "function",
                    "function": {
                        "name": t.name,
                        "description": t.description.clone().unwrap_or_default(),
                        "parameters": t.input_schema,
                    }
                })
            })
            .collect();
        body["tools"] = json!(mapped);
    }

    if let Some(choice) = &request.tool_choice {
        body["tool_choice"] = match choice {
            ToolChoice::Auto => json!("auto"),
            ToolChoice::Any => json!("required"),
            ToolChoice::Tool { name } => json!({
                "type": "function",
                "function": { "name": name }
            }),
        };
    }

    body
}

fn push_assistant_message(messages: &mut Vec<Value>, blocks: &[ContentBlock]) {
    let mut text_parts: Vec<&str> = Vec::new();
    let mut tool_calls: Vec<Value> = Vec::new();

    for block in blocks {
        match block {
            ContentBlock::Text { text } => text_parts.push(text),
            ContentBlock::ToolUse { id, name, input } => {
                tool_calls.push(json!({
                    "id": id,
                    "type": "function",
                    "function": {
                        "name": name,
                        "arguments": serde_json::to_string(input).unwrap_or_else(|_| "{}".into()),
                    }
                }));
            }
            // Thinking and opaque blocks have no OpenAI representation.
            _ => {}
        }
    }

    let content = text_parts.concat();
    let mut message = json!({ "role": "assistant" });
    if content.is_empty() && !tool_calls.is_empty() {
        message["content"] = Value::Null;
    } else {
        message["content"] = json!(content);
    }
    if !tool_calls.is_empty() {
        message["tool_calls"] = json!(tool_calls);
    }
    messages.push(message);
}

fn push_user_messages(messages: &mut Vec<Value>, blocks: &[ContentBlock]) {
    let has_tool_result = blocks
        .iter()
        .any(|b| matches!(b, ContentBlock::ToolResult { .. }));

    if !has_tool_result {
        let text: String = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        messages.push(json!({ "role": "user", "content": text }));
        return;
    }

    // Text parts preceding the tool results form one user message, then one
    // `role: tool` message per result so tool-call ids keep resolving.
    let text: String = blocks
        .iter()
        .filter_map(|b| match b {
            ContentBlock::Text { text } => Some(text.as_str()),
            _ => None,
        })
        .collect();
    if !text.is_empty() {
        messages.push(json!({ "role": "user", "content": text }));
    }

    for block in blocks {
        if let ContentBlock::ToolResult {
            tool_use_id,
            content,
            ..
        } = block
        {
            messages.push(json!({
                "role": "tool",
                "tool_call_id": tool_use_id,
                "content": stringify_tool_content(content),
            }));
        }
    }
}

fn stringify_tool_content(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

/// Wrap a complete OpenAI chat response into an Anthropic message.
pub fn openai_response_to_claude(response: &Value, model: &str) -> ClaudeMessage {
    let message = &response["choices"][0]["message"];
    let mut content: Vec<ContentBlock> = Vec::new();

    if let Some(text) = message.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            content.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
    }

    if let Some(calls) = message.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let id = call.get("id").and_then(Value::as_str).unwrap_or_default();
            let name = call
                .pointer("/function/name")
                .and_then(Value::as_str)
                .unwrap_or_default();
            let arguments = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
                .unwrap_or("{}");
            let input = serde_json::from_str(arguments).unwrap_or(json!({}));
            content.push(ContentBlock::ToolUse {
                id: id.to_string(),
                name: name.to_string(),
                input,
            });
        }
    }

    let stop_reason = match response
        .pointer("/choices/0/finish_reason")
        .and_then(Value::as_str)
    {
        Some("tool_calls") => "tool_use",
        Some("length") => "max_tokens",
        _ => "end_turn",
    };

    ClaudeMessage::assistant(model, content, stop_reason, Usage::default())
}
