// OpenAI stream deltas -> Anthropic events. The engine emits a synthetic
// message_start before the first delta and message_stop after the upstream
// stream ends.
use bytes::Bytes;
use serde_json::{json, Value};
use std::collections::BTreeSet;

const TEXT_BLOCK_INDEX: u64 = 0;

#[derive(Debug, Default)]
pub struct OpenAiStreamState {
    pub text_block_open: bool,
    pub open_tool_indices: BTreeSet<u64>,
    pub saw_tool_call: bool,
}

impl OpenAiStreamState {
    pub fn new() -> Self {
        Self::default()
    }
}

/// One SSE frame: `event: <type>\ndata: <json>\n\n`.
pub fn sse_frame(event_type: &str, data: &Value) -> Bytes {
    Bytes::from(format!(
        "event: {}\ndata: {}\n\n",
        event_type,
        serde_json::to_string(data).unwrap_or_default()
    ))
}

pub fn message_start_event(model: &str) -> (String, Value) {
    (
        "message_start".to_string(),
        json!({
            "type": "message_start",
            "message": {
                "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
                "type": "message",
                "role": "assistant",
                "content": [],
                "model": model,
                "stop_reason": null,
                "stop_sequence": null,
                "usage": { "input_tokens": 0, "output_tokens": 0 }
            }
        }),
    )
}

/// Translate one `choices[0].delta` into zero or more Anthropic events.
/// Text lands at block index 0; tool calls land at `tool_calls[].index`.
pub fn delta_to_events(delta: &Value, state: &mut OpenAiStreamState) -> Vec<(String, Value)> {
    let mut events = Vec::new();

    if let Some(text) = delta.get("content").and_then(Value::as_str) {
        if !text.is_empty() {
            if !state.text_block_open {
                state.text_block_open = true;
                events.push((
                    "content_block_start".to_string(),
                    json!({
                        "type": "content_block_start",
                        "index": TEXT_BLOCK_INDEX,
                        "content_block": { "type": "text", "text": "" }
                    }),
                ));
            }
            events.push((
                "content_block_delta".to_string(),
                json!({
                    "type": "content_block_delta",
                    "index": TEXT_BLOCK_INDEX,
                    "delta": { "type": "text_delta", "text": text }
                }),
            ));
        }
    }

    if let Some(calls) = delta.get("tool_calls").and_then(Value::as_array) {
        for call in calls {
            let index = call.get("index").and_then(Value::as_u64).unwrap_or(0);
            if let Some(id) = call.get("id").and_then(Value::as_str) {
                state.saw_tool_call = true;
                state.open_tool_indices.insert(index);
                let name = call
                    .pointer("/function/name")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                events.push((
                    "content_block_start".to_string(),
                    json!({
                        "type": "content_block_start",
                        "index": index,
                        "content_block": {
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": {}
                        }
                    }),
                ));
            }
            if let Some(arguments) = call
                .pointer("/function/arguments")
                .and_then(Value::as_str)
            {
                if !arguments.is_empty() {
                    events.push((
                        "content_block_delta".to_string(),
                        json!({
                            "type": "content_block_delta",
                            "index": index,
                            "delta": { "type": "input_json_delta", "partial_json": arguments }
                        }),
                    ));
                }
            }
        }
    }

    events
}

/// Close open blocks and terminate the stream.
pub fn finish_events(state: &OpenAiStreamState) -> Vec<(String, Value)> {
    let mut events = Vec::new();
    if state.text_block_open {
        events.push((
            "content_block_stop".to_string(),
            json!({ "type": "content_block_stop", "index": TEXT_BLOCK_INDEX }),
        ));
    }
    for index in &state.open_tool_indices {
        events.push((
            "content_block_stop".to_string(),
            json!({ "type": "content_block_stop", "index": index }),
        ));
    }
    let stop_reason = if state.saw_tool_call { "tool_use" } else { "end_turn" };
    events.push((
        "message_delta".to_string(),
        json!({
            "type": "message_delta",
            "delta": { "stop_reason": stop_reason, "stop_sequence": null },
            "usage": { "output_tokens": 0 }
        }),
    ));
    events.push((
        "message_stop".to_string(),
        json!({ "type": "message_stop" }),
    ));
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_delta_opens_a_block_once() {
        let mut state = OpenAiStreamState::new();
        let first = delta_to_events(&json!({"content": "he"}), &mut state);
        let second = delta_to_events(&json!({"content": "llo"}), &mut state);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].0, "content_block_start");
        assert_eq!(first[1].1["delta"]["text"], "he");
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].1["delta"]["text"], "llo");
    }

    #[test]
    fn empty_deltas_are_suppressed() {
        let mut state = OpenAiStreamState::new();
        assert!(delta_to_events(&json!({"content": ""}), &mut state).is_empty());
        assert!(delta_to_events(&json!({"role": "assistant"}), &mut state).is_empty());
    }

    #[test]
    fn tool_call_id_starts_a_block_at_its_index() {
        let mut state = OpenAiStreamState::new();
        let events = delta_to_events(
            &json!({"tool_calls": [{
                "index": 1, "id": "call_1",
                "function": {"name": "get_weather", "arguments": ""}
            }]}),
            &mut state,
        );
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "content_block_start");
        assert_eq!(events[0].1["index"], 1);
        assert_eq!(events[0].1["content_block"]["type"], "tool_use");
        assert_eq!(events[0].1["content_block"]["id"], "call_1");
        assert_eq!(events[0].1["content_block"]["input"], json!({}));
    }

    #[test]
    fn argument_chunks_concatenate_to_valid_json() {
        let mut state = OpenAiStreamState::new();
        let chunks = [
            json!({"tool_calls": [{"index": 0, "id": "call_1",
                "function": {"name": "f", "arguments": "{\"ci"}}]}),
            json!({"tool_calls": [{"index": 0,
                "function": {"arguments": "ty\":\"Oslo\"}"}}]}),
        ];
        let mut partial = String::new();
        for chunk in &chunks {
            for (event_type, payload) in delta_to_events(chunk, &mut state) {
                if event_type == "content_block_delta" {
                    partial.push_str(payload["delta"]["partial_json"].as_str().unwrap());
                }
            }
        }
        let parsed: Value = serde_json::from_str(&partial).unwrap();
        assert_eq!(parsed["city"], "Oslo");
    }

    #[test]
    fn finish_closes_blocks_and_stops_the_message() {
        let mut state = OpenAiStreamState::new();
        delta_to_events(&json!({"content": "hi"}), &mut state);
        let events = finish_events(&state);
        assert_eq!(events[0].0, "content_block_stop");
        assert_eq!(events[1].0, "message_delta");
        assert_eq!(events[1].1["delta"]["stop_reason"], "end_turn");
        assert_eq!(events.last().unwrap().0, "message_stop");
    }

    #[test]
    fn tool_streams_stop_with_tool_use() {
        let mut state = OpenAiStreamState::new();
        delta_to_events(
            &json!({"tool_calls": [{"index": 0, "id": "c",
                "function": {"name": "f", "arguments": "{}"}}]}),
            &mut state,
        );
        let events = finish_events(&state);
        let delta = events.iter().find(|(t, _)| t == "message_delta").unwrap();
        assert_eq!(delta.1["delta"]["stop_reason"], "tool_use");
    }

    #[test]
    fn sse_frame_layout() {
        let frame = sse_frame("message_stop", &json!({"type": "message_stop"}));
        let text = std::str::from_utf8(&frame).unwrap();
        assert!(text.starts_with("event: message_stop\ndata: "));
        assert!(text.ends_with("\n\n"));
    }
}
