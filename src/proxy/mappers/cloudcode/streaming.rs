// Cloud-Code SSE -> Anthropic event stream. One StreamingState per request;
// events are produced in strict order: message_start, block start/delta/stop
// groups, message_delta, message_stop.
use super::response::{map_stop_reason, usage_from};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    None,
    Text,
    Thinking,
    Tool,
}

pub struct StreamingState {
    model: String,
    block_type: BlockType,
    block_index: usize,
    pub message_start_sent: bool,
    pub saw_content_block: bool,
    used_tool: bool,
    stop_reason: Option<String>,
    output_tokens: u32,
}

impl StreamingState {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            block_type: BlockType::None,
            block_index: 0,
            message_start_sent: false,
            saw_content_block: false,
            used_tool: false,
            stop_reason: None,
            output_tokens: 0,
        }
    }

    fn emit(&self, event_type: &str, data: Value) -> Bytes {
        Bytes::from(format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        ))
    }

    fn emit_message_start(&mut self, raw: &Value) -> Option<Bytes> {
        if self.message_start_sent {
            return None;
        }
        self.message_start_sent = true;
        let usage = usage_from(raw);
        let id = raw
            .get("responseId")
            .and_then(Value::as_str)
            .map(|s| s.to_string())
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple()));
        Some(self.emit(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": id,
                    "type": "message",
                    "role": "assistant",
                    "content": [],
                    "model": self.model,
                    "stop_reason": null,
                    "stop_sequence": null,
                    "usage": usage,
                }
            }),
        ))
    }

    fn start_block(&mut self, block_type: BlockType, content_block: Value) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if self.block_type != BlockType::None {
            chunks.extend(self.end_block());
        }
        chunks.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block,
            }),
        ));
        self.block_type = block_type;
        self.saw_content_block = true;
        chunks
    }

    fn end_block(&mut self) -> Vec<Bytes> {
        if self.block_type == BlockType::None {
            return Vec::new();
        }
        let chunk = self.emit(
            "content_block_stop",
            json!({ "type": "content_block_stop", "index": self.block_index }),
        );
        self.block_type = BlockType::None;
        self.block_index += 1;
        vec![chunk]
    }

    fn delta(&self, payload: Value) -> Bytes {
        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": payload,
            }),
        )
    }

    /// Translate one decoded vendor SSE object into Anthropic event frames.
    pub fn process_chunk(&mut self, raw: &Value) -> Vec<Bytes> {
        let body = raw.get("response").unwrap_or(raw);
        let mut chunks = Vec::new();

        if let Some(frame) = self.emit_message_start(body) {
            chunks.push(frame);
        }

        if let Some(parts) = body
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
        {
            for part in parts {
                chunks.extend(self.process_part(part));
            }
        }

        if let Some(finish) = body
            .pointer("/candidates/0/finishReason")
            .and_then(Value::as_str)
        {
            self.stop_reason = Some(map_stop_reason(finish, self.used_tool));
        }

        let usage = usage_from(body);
        if usage.output_tokens > 0 {
            self.output_tokens = usage.output_tokens;
        }

        chunks
    }

    fn process_part(&mut self, part: &Value) -> Vec<Bytes> {
        let mut chunks = Vec::new();

        if let Some(call) = part.get("functionCall") {
            self.used_tool = true;
            let id = call
                .get("id")
                .and_then(Value::as_str)
                .map(|s| s.to_string())
                .unwrap_or_else(|| format!("toolu_{}", uuid::Uuid::new_v4().simple()));
            let name = call.get("name").and_then(Value::as_str).unwrap_or_default();
            let args = call.get("args").cloned().unwrap_or(json!({}));
            chunks.extend(self.start_block(
                BlockType::Tool,
                json!({ "type": "tool_use", "id": id, "name": name, "input": {} }),
            ));
            chunks.push(self.delta(json!({
                "type": "input_json_delta",
                "partial_json": serde_json::to_string(&args).unwrap_or_else(|_| "{}".into()),
            })));
            chunks.extend(self.end_block());
            return chunks;
        }

        let text = match part.get("text").and_then(Value::as_str) {
            Some(t) if !t.is_empty() => t,
            _ => return chunks,
        };

        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            if self.block_type != BlockType::Thinking {
                chunks.extend(self.start_block(
                    BlockType::Thinking,
                    json!({ "type": "thinking", "thinking": "" }),
                ));
            }
            chunks.push(self.delta(json!({ "type": "thinking_delta", "thinking": text })));
            if let Some(sig) = part.get("thoughtSignature").and_then(Value::as_str) {
                chunks.push(self.delta(json!({ "type": "signature_delta", "signature": sig })));
            }
        } else {
            if self.block_type != BlockType::Text {
                chunks.extend(self.start_block(
                    BlockType::Text,
                    json!({ "type": "text", "text": "" }),
                ));
            }
            chunks.push(self.delta(json!({ "type": "text_delta", "text": text })));
        }
        chunks
    }

    /// Close the stream: open block, message_delta with the stop reason, then
    /// message_stop. A stream that never started still gets correct framing.
    pub fn finalize(&mut self) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if !self.message_start_sent {
            if let Some(frame) = self.emit_message_start(&json!({})) {
                chunks.push(frame);
            }
        }
        chunks.extend(self.end_block());
        let stop_reason = self
            .stop_reason
            .clone()
            .unwrap_or_else(|| "end_turn".to_string());
        chunks.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": { "stop_reason": stop_reason, "stop_sequence": null },
                "usage": { "output_tokens": self.output_tokens },
            }),
        ));
        chunks.push(self.emit("message_stop", json!({ "type": "message_stop" })));
        chunks
    }
}

/// Decode one `data:` line. Returns frames to forward, or None for
/// heartbeats and non-data lines.
pub fn process_sse_line(line: &str, state: &mut StreamingState) -> Option<Vec<Bytes>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let json_part = line.strip_prefix("data:")?.trim();
    if json_part == "[DONE]" {
        return None;
    }
    let parsed: Value = serde_json::from_str(json_part).ok()?;
    Some(state.process_chunk(&parsed))
}

/// Lazily translate an upstream byte stream into Anthropic SSE frames.
/// Frames are yielded as soon as each vendor line decodes; nothing buffers
/// the whole stream.
pub fn create_claude_sse_stream(
    mut upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    model: String,
    trace_id: String,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, String>> + Send>> {
    Box::pin(async_stream::stream! {
        let mut state = StreamingState::new(&model);
        let mut buffer = BytesMut::new();
        loop {
            let next_chunk = tokio::time::timeout(
                std::time::Duration::from_secs(30),
                upstream.next(),
            )
            .await;
            match next_chunk {
                Ok(Some(Ok(chunk))) => {
                    buffer.extend_from_slice(&chunk);
                    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                        let line_raw = buffer.split_to(pos + 1);
                        if let Ok(line) = std::str::from_utf8(&line_raw) {
                            if let Some(frames) = process_sse_line(line, &mut state) {
                                for frame in frames {
                                    yield Ok(frame);
                                }
                            }
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    tracing::warn!("[{}] upstream stream error: {}", trace_id, e);
                    yield Err(format!("Stream error: {}", e));
                    break;
                }
                Ok(None) => break,
                Err(_) => {
                    // Keep the client connection warm while the upstream
                    // thinks.
                    yield Ok(Bytes::from(": ping\n\n"));
                }
            }
        }
        for frame in state.finalize() {
            yield Ok(frame);
        }
    })
}

/// The event sequence sent when the upstream kept returning empty streams.
pub fn synthetic_text_events(model: &str, text: &str) -> Vec<Bytes> {
    let mut state = StreamingState::new(model);
    let mut frames = Vec::new();
    if let Some(frame) = state.emit_message_start(&json!({})) {
        frames.push(frame);
    }
    frames.extend(state.start_block(BlockType::Text, json!({ "type": "text", "text": "" })));
    frames.push(state.delta(json!({ "type": "text_delta", "text": text })));
    frames.extend(state.finalize());
    frames
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames_to_text(frames: &[Bytes]) -> String {
        frames
            .iter()
            .map(|b| String::from_utf8_lossy(b).to_string())
            .collect()
    }

    fn event_types(text: &str) -> Vec<String> {
        text.lines()
            .filter_map(|l| l.strip_prefix("event: "))
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn text_chunk_produces_ordered_events() {
        let mut state = StreamingState::new("m");
        let chunk = json!({
            "response": {
                "responseId": "r1",
                "candidates": [{"content": {"parts": [{"text": "hi"}]}}]
            }
        });
        let mut frames = state.process_chunk(&chunk);
        frames.extend(state.finalize());
        let types = event_types(&frames_to_text(&frames));
        assert_eq!(
            types,
            vec![
                "message_start",
                "content_block_start",
                "content_block_delta",
                "content_block_stop",
                "message_delta",
                "message_stop",
            ]
        );
    }

    #[test]
    fn no_delta_before_its_block_start() {
        let mut state = StreamingState::new("m");
        let chunks = [
            json!({"candidates": [{"content": {"parts": [{"text": "think", "thought": true}]}}]}),
            json!({"candidates": [{"content": {"parts": [{"text": "answer"}]}}]}),
        ];
        let mut frames = Vec::new();
        for c in &chunks {
            frames.extend(state.process_chunk(c));
        }
        frames.extend(state.finalize());
        let text = frames_to_text(&frames);
        let mut open_indices = std::collections::HashSet::new();
        for line in text.lines().filter(|l| l.starts_with("data: ")) {
            let v: Value = serde_json::from_str(line.strip_prefix("data: ").unwrap()).unwrap();
            match v["type"].as_str().unwrap_or_default() {
                "content_block_start" => {
                    open_indices.insert(v["index"].as_u64().unwrap());
                }
                "content_block_delta" => {
                    assert!(
                        open_indices.contains(&v["index"].as_u64().unwrap()),
                        "delta before start: {}",
                        line
                    );
                }
                _ => {}
            }
        }
    }

    #[test]
    fn thinking_signature_is_forwarded_as_signature_delta() {
        let mut state = StreamingState::new("m");
        let chunk = json!({
            "candidates": [{"content": {"parts": [
                {"text": "deep", "thought": true, "thoughtSignature": "c2ln"}
            ]}}]
        });
        let frames = state.process_chunk(&chunk);
        let text = frames_to_text(&frames);
        assert!(text.contains("thinking_delta"));
        assert!(text.contains("signature_delta"));
        assert!(text.contains("c2ln"));
    }

    #[test]
    fn function_call_emits_complete_tool_block() {
        let mut state = StreamingState::new("m");
        let chunk = json!({
            "candidates": [{
                "content": {"parts": [
                    {"functionCall": {"id": "call_1", "name": "f", "args": {"x": 1}}}
                ]},
                "finishReason": "STOP"
            }]
        });
        let mut frames = state.process_chunk(&chunk);
        frames.extend(state.finalize());
        let text = frames_to_text(&frames);
        assert!(text.contains("\"tool_use\""));
        assert!(text.contains("input_json_delta"));
        // The partial json concatenation parses back to the args.
        let mut partial = String::new();
        for line in text.lines().filter(|l| l.starts_with("data: ")) {
            let v: Value = serde_json::from_str(line.strip_prefix("data: ").unwrap()).unwrap();
            if v["delta"]["type"] == "input_json_delta" {
                partial.push_str(v["delta"]["partial_json"].as_str().unwrap());
            }
        }
        let args: Value = serde_json::from_str(&partial).unwrap();
        assert_eq!(args["x"], 1);
        assert!(text.contains("\"stop_reason\":\"tool_use\""));
    }

    #[test]
    fn sse_line_decoder_skips_noise() {
        let mut state = StreamingState::new("m");
        assert!(process_sse_line("", &mut state).is_none());
        assert!(process_sse_line(": heartbeat", &mut state).is_none());
        assert!(process_sse_line("data: [DONE]", &mut state).is_none());
        assert!(process_sse_line("event: something", &mut state).is_none());
        let frames = process_sse_line(
            r#"data: {"candidates":[{"content":{"parts":[{"text":"x"}]}}]}"#,
            &mut state,
        )
        .unwrap();
        assert!(!frames.is_empty());
    }

    #[test]
    fn empty_stream_still_gets_correct_framing() {
        let mut state = StreamingState::new("m");
        let frames = state.finalize();
        let types = event_types(&frames_to_text(&frames));
        assert_eq!(types, vec!["message_start", "message_delta", "message_stop"]);
        assert!(!state.saw_content_block);
    }

    #[test]
    fn synthetic_fallback_has_one_text_delta() {
        let frames = synthetic_text_events("m", "[No response after retries - please try again]");
        let text = frames_to_text(&frames);
        let types = event_types(&text);
        assert_eq!(types[0], "message_start");
        assert_eq!(*types.last().unwrap(), "message_stop");
        assert_eq!(
            text.matches("text_delta").count(),
            1,
            "exactly one text delta expected"
        );
        assert!(text.contains("[No response after retries - please try again]"));
    }

    #[tokio::test]
    async fn lazy_stream_translates_lines_incrementally() {
        let body = concat!(
            "data: {\"response\":{\"responseId\":\"r\",\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"}]}}]}}\n\n",
            "data: {\"response\":{\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"b\"}]},\"finishReason\":\"STOP\"}]}}\n\n",
        );
        let upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>> =
            Box::pin(futures::stream::once(async move {
                Ok(Bytes::from(body))
            }));
        let mut stream = create_claude_sse_stream(upstream, "m".into(), "test".into());
        let mut all = String::new();
        while let Some(frame) = stream.next().await {
            all.push_str(&String::from_utf8_lossy(&frame.unwrap()));
        }
        let types = event_types(&all);
        assert_eq!(types.first().map(|s| s.as_str()), Some("message_start"));
        assert_eq!(types.last().map(|s| s.as_str()), Some("message_stop"));
        assert!(all.contains("\"text\":\"a\""));
        assert!(all.contains("\"text\":\"b\""));
    }
}
