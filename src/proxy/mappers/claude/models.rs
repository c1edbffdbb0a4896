use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Value};

/// Anthropic Messages request. Unknown content-block tags are preserved via
/// the `Unknown` variant so new vendor block types pass through opaquely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeRequest {
    pub model: String,
    pub messages: Vec<Message>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<SystemPrompt>,
    #[serde(default)]
    pub stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_k: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<ToolDefinition>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SystemPrompt {
    Text(String),
    Blocks(Vec<SystemBlock>),
}

impl SystemPrompt {
    /// Flatten to a single string, concatenating text blocks in order.
    pub fn as_text(&self) -> String {
        match self {
            SystemPrompt::Text(s) => s.clone(),
            SystemPrompt::Blocks(blocks) => blocks
                .iter()
                .map(|b| b.text.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    String(String),
    Array(Vec<ContentBlock>),
}

#[derive(Debug, Clone)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    Image {
        source: ImageSource,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        content: Value,
        is_error: Option<bool>,
    },
    Thinking {
        thinking: String,
        signature: Option<String>,
    },
    RedactedThinking {
        data: String,
    },
    /// Anything with an unrecognized `type` tag. Forwarded untouched.
    Unknown(Value),
}

/// Tags this codebase understands. A block carrying one of these tags but a
/// malformed body is a schema violation, not an Unknown passthrough.
pub const KNOWN_BLOCK_TAGS: &[&str] = &[
    "text",
    "image",
    "tool_use",
    "tool_result",
    "thinking",
    "redacted_thinking",
];

impl ContentBlock {
    pub fn to_value(&self) -> Value {
        match self {
            ContentBlock::Text { text } => json!({ "type": "text", "text": text }),
            ContentBlock::Image { source } => json!({ "type": "image", "source": source }),
            ContentBlock::ToolUse { id, name, input } => json!({
                "type": "tool_use", "id": id, "name": name, "input": input
            }),
            ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            } => {
                let mut v = json!({ "type": "tool_result", "tool_use_id": tool_use_id, "content": content });
                if let Some(err) = is_error {
                    v["is_error"] = json!(err);
                }
                v
            }
            ContentBlock::Thinking {
                thinking,
                signature,
            } => {
                let mut v = json!({ "type": "thinking", "thinking": thinking });
                if let Some(sig) = signature {
                    v["signature"] = json!(sig);
                }
                v
            }
            ContentBlock::RedactedThinking { data } => {
                json!({ "type": "redacted_thinking", "data": data })
            }
            ContentBlock::Unknown(v) => v.clone(),
        }
    }

    pub fn from_value(v: Value) -> Result<Self, String> {
        let tag = v
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        match tag.as_str() {
            "text" => {
                let text = v
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or("text block requires a string `text` field")?;
                Ok(ContentBlock::Text {
                    text: text.to_string(),
                })
            }
            "image" => {
                let source: ImageSource = serde_json::from_value(
                    v.get("source").cloned().ok_or("image block requires `source`")?,
                )
                .map_err(|e| format!("invalid image source: {}", e))?;
                Ok(ContentBlock::Image { source })
            }
            "tool_use" => {
                let id = v
                    .get("id")
                    .and_then(Value::as_str)
                    .ok_or("tool_use block requires `id`")?;
                let name = v
                    .get("name")
                    .and_then(Value::as_str)
                    .ok_or("tool_use block requires `name`")?;
                Ok(ContentBlock::ToolUse {
                    id: id.to_string(),
                    name: name.to_string(),
                    input: v.get("input").cloned().unwrap_or(json!({})),
                })
            }
            "tool_result" => {
                let tool_use_id = v
                    .get("tool_use_id")
                    .and_then(Value::as_str)
                    .ok_or("tool_result block requires `tool_use_id`")?;
                Ok(ContentBlock::ToolResult {
                    tool_use_id: tool_use_id.to_string(),
                    content: v.get("content").cloned().unwrap_or(Value::Null),
                    is_error: v.get("is_error").and_then(Value::as_bool),
                })
            }
            "thinking" => {
                let thinking = v
                    .get("thinking")
                    .and_then(Value::as_str)
                    .ok_or("thinking block requires `thinking`")?;
                Ok(ContentBlock::Thinking {
                    thinking: thinking.to_string(),
                    signature: v
                        .get("signature")
                        .and_then(Value::as_str)
                        .map(|s| s.to_string()),
                })
            }
            "redacted_thinking" => {
                let data = v
                    .get("data")
                    .and_then(Value::as_str)
                    .ok_or("redacted_thinking block requires `data`")?;
                Ok(ContentBlock::RedactedThinking {
                    data: data.to_string(),
                })
            }
            _ => Ok(ContentBlock::Unknown(v)),
        }
    }
}

impl Serialize for ContentBlock {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for ContentBlock {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let v = Value::deserialize(deserializer)?;
        ContentBlock::from_value(v).map_err(DeError::custom)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSource {
    #[serde(rename = "type")]
    pub source_type: String,
    pub media_type: String,
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub input_schema: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ToolChoice {
    Auto,
    Any,
    Tool { name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThinkingConfig {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub input_tokens: u32,
    pub output_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u32>,
}

/// A complete (non-streamed) assistant message in Anthropic shape.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaudeMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub role: String,
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub stop_reason: Option<String>,
    pub stop_sequence: Option<Value>,
    pub usage: Usage,
}

impl ClaudeMessage {
    pub fn assistant(
        model: &str,
        content: Vec<ContentBlock>,
        stop_reason: &str,
        usage: Usage,
    ) -> Self {
        Self {
            id: format!("msg_{}", uuid::Uuid::new_v4().simple()),
            message_type: "message".to_string(),
            role: "assistant".to_string(),
            content,
            model: model.to_string(),
            stop_reason: Some(stop_reason.to_string()),
            stop_sequence: None,
            usage,
        }
    }
}
