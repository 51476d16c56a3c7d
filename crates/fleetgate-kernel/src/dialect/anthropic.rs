//! Anthropic messages dialect.

use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::PipelineError;

use super::{parse_thinking_suffix, split_candidate, SseParser, TranslatedRequest};

/// Translate an Anthropic messages body into the native request shape.
pub fn translate_in(body: &Value) -> Result<TranslatedRequest, PipelineError> {
    let root = body
        .as_object()
        .ok_or_else(|| PipelineError::BadRequest("body must be a JSON object".into()))?;

    let model_raw = root
        .get("model")
        .and_then(Value::as_str)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| PipelineError::BadRequest("model field is required".into()))?;
    let (model, thinking_level) = parse_thinking_suffix(model_raw);

    let messages = root
        .get("messages")
        .and_then(Value::as_array)
        .filter(|m| !m.is_empty())
        .ok_or_else(|| {
            PipelineError::BadRequest("messages array must contain at least one message".into())
        })?;

    let mut contents = Vec::new();
    for message in messages {
        let role = match message.get("role").and_then(Value::as_str) {
            Some("assistant") => "model",
            _ => "user",
        };
        contents.push(json!({
            "role": role,
            "parts": block_parts(message.get("content")),
        }));
    }

    let mut native = Map::new();
    native.insert("contents".into(), json!(contents));

    let system_parts = block_parts(root.get("system"));
    if !system_parts.is_empty() {
        native.insert("systemInstruction".into(), json!({ "parts": system_parts }));
    }

    let mut generation = Map::new();
    if let Some(value) = root.get("max_tokens").and_then(Value::as_u64) {
        generation.insert("maxOutputTokens".into(), json!(value));
    }
    if let Some(value) = root.get("temperature").and_then(Value::as_f64) {
        generation.insert("temperature".into(), json!(value));
    }
    if let Some(value) = root.get("top_p").and_then(Value::as_f64) {
        generation.insert("topP".into(), json!(value));
    }
    if let Some(value) = root.get("top_k").and_then(Value::as_u64) {
        generation.insert("topK".into(), json!(value));
    }
    if let Some(stops) = root.get("stop_sequences").and_then(Value::as_array) {
        generation.insert("stopSequences".into(), json!(stops));
    }
    if !generation.is_empty() {
        native.insert("generationConfig".into(), Value::Object(generation));
    }

    Ok(TranslatedRequest {
        native_body: Value::Object(native),
        model,
        thinking_level,
        stream: root.get("stream").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// Anthropic content: bare string or typed blocks.
fn block_parts(content: Option<&Value>) -> Vec<Value> {
    match content {
        Some(Value::String(text)) => vec![json!({ "text": text })],
        Some(Value::Array(blocks)) => blocks
            .iter()
            .filter_map(|block| match block.get("type").and_then(Value::as_str) {
                Some("text") => block
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|text| json!({ "text": text })),
                Some("image") => {
                    let source = block.get("source")?;
                    let media_type = source.get("media_type").and_then(Value::as_str)?;
                    let data = source.get("data").and_then(Value::as_str)?;
                    Some(json!({ "inlineData": { "mimeType": media_type, "data": data } }))
                }
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn map_stop_reason(native: &str) -> &'static str {
    match native {
        "MAX_TOKENS" => "max_tokens",
        _ => "end_turn",
    }
}

fn usage_value(usage: Option<&Value>) -> Value {
    json!({
        "input_tokens": usage
            .and_then(|u| u.get("promptTokenCount"))
            .cloned()
            .unwrap_or(json!(0)),
        "output_tokens": usage
            .and_then(|u| u.get("candidatesTokenCount"))
            .cloned()
            .unwrap_or(json!(0)),
    })
}

/// Build the non-streaming message object from the accumulated native body.
pub fn non_stream_response(native_raw: &str, model: &str) -> Value {
    let parsed: Value = serde_json::from_str(native_raw).unwrap_or(Value::Null);
    let delta = split_candidate(&parsed);

    let mut content = Vec::new();
    if !delta.thoughts.is_empty() {
        content.push(json!({ "type": "thinking", "thinking": delta.thoughts.join("") }));
    }
    let text = if delta.texts.is_empty() && parsed.is_null() {
        native_raw.to_string()
    } else {
        delta.texts.join("")
    };
    content.push(json!({ "type": "text", "text": text }));

    json!({
        "id": format!("msg_{}", Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": content,
        "stop_reason": delta
            .finish_reason
            .as_deref()
            .map(map_stop_reason)
            .unwrap_or("end_turn"),
        "stop_sequence": null,
        "usage": usage_value(delta.usage.as_ref()),
    })
}

/// Translate a count-tokens body: same content mapping, no generation
/// config.
pub fn count_tokens_request(body: &Value) -> Result<TranslatedRequest, PipelineError> {
    let mut translated = translate_in(body)?;
    if let Some(map) = translated.native_body.as_object_mut() {
        map.remove("generationConfig");
    }
    translated.stream = false;
    Ok(translated)
}

/// Map the native `:countTokens` response into the Anthropic shape.
pub fn count_tokens_response(native_raw: &str) -> Value {
    let parsed: Value = serde_json::from_str(native_raw).unwrap_or(Value::Null);
    json!({
        "input_tokens": parsed.get("totalTokens").cloned().unwrap_or(json!(0)),
    })
}

pub fn error_body(status: u16, message: &str) -> Value {
    let error_type = match status {
        400 => "invalid_request_error",
        401 => "authentication_error",
        429 => "rate_limit_error",
        503 => "overloaded_error",
        _ => "api_error",
    };
    json!({
        "type": "error",
        "error": { "type": error_type, "message": message },
    })
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum BlockKind {
    Thinking,
    Text,
}

/// Streaming state for one Anthropic SSE response: `message_start`, typed
/// content blocks (thinking before text), then `message_delta` with the
/// stop reason and `message_stop`. No `[DONE]` sentinel in this dialect.
pub struct AnthropicStream {
    model: String,
    parser: SseParser,
    started: bool,
    open_block: Option<(usize, BlockKind)>,
    next_index: usize,
    finish_reason: Option<String>,
    usage: Option<Value>,
}

impl AnthropicStream {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
            parser: SseParser::new(),
            started: false,
            open_block: None,
            next_index: 0,
            finish_reason: None,
            usage: None,
        }
    }

    fn event(name: &str, data: Value) -> String {
        format!("event: {name}\ndata: {data}\n\n")
    }

    fn ensure_started(&mut self, out: &mut Vec<String>) {
        if self.started {
            return;
        }
        self.started = true;
        out.push(Self::event(
            "message_start",
            json!({
                "type": "message_start",
                "message": {
                    "id": format!("msg_{}", Uuid::new_v4().simple()),
                    "type": "message",
                    "role": "assistant",
                    "model": self.model,
                    "content": [],
                    "stop_reason": null,
                    "usage": { "input_tokens": 0, "output_tokens": 0 },
                },
            }),
        ));
    }

    fn ensure_block(&mut self, kind: BlockKind, out: &mut Vec<String>) -> usize {
        if let Some((index, open_kind)) = self.open_block {
            if open_kind == kind {
                return index;
            }
            out.push(Self::event(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": index }),
            ));
        }
        let index = self.next_index;
        self.next_index += 1;
        let block = match kind {
            BlockKind::Thinking => json!({ "type": "thinking", "thinking": "" }),
            BlockKind::Text => json!({ "type": "text", "text": "" }),
        };
        out.push(Self::event(
            "content_block_start",
            json!({ "type": "content_block_start", "index": index, "content_block": block }),
        ));
        self.open_block = Some((index, kind));
        index
    }

    pub fn translate(&mut self, data: &str) -> Vec<String> {
        let mut out = Vec::new();
        for record in self.parser.push(data) {
            let delta = split_candidate(&record);
            self.ensure_started(&mut out);

            if !delta.thoughts.is_empty() {
                let index = self.ensure_block(BlockKind::Thinking, &mut out);
                out.push(Self::event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": { "type": "thinking_delta", "thinking": delta.thoughts.join("") },
                    }),
                ));
            }
            if !delta.texts.is_empty() {
                let index = self.ensure_block(BlockKind::Text, &mut out);
                out.push(Self::event(
                    "content_block_delta",
                    json!({
                        "type": "content_block_delta",
                        "index": index,
                        "delta": { "type": "text_delta", "text": delta.texts.join("") },
                    }),
                ));
            }
            if let Some(reason) = delta.finish_reason {
                self.finish_reason = Some(reason);
            }
            if delta.usage.is_some() {
                self.usage = delta.usage;
            }
        }
        out
    }

    pub fn finish(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        self.ensure_started(&mut out);
        if let Some((index, _)) = self.open_block.take() {
            out.push(Self::event(
                "content_block_stop",
                json!({ "type": "content_block_stop", "index": index }),
            ));
        }
        out.push(Self::event(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {
                    "stop_reason": self
                        .finish_reason
                        .as_deref()
                        .map(map_stop_reason)
                        .unwrap_or("end_turn"),
                    "stop_sequence": null,
                },
                "usage": usage_value(self.usage.as_ref()),
            }),
        ));
        out.push(Self::event("message_stop", json!({ "type": "message_stop" })));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_system_blocks_and_sampling() {
        let body = json!({
            "model": "gemini-2.5-pro",
            "max_tokens": 512,
            "system": [{ "type": "text", "text": "be kind" }],
            "messages": [
                { "role": "user", "content": [
                    { "type": "text", "text": "hi" },
                    { "type": "image", "source": { "type": "base64", "media_type": "image/png", "data": "QUJD" } },
                ]},
                { "role": "assistant", "content": "hello" },
            ],
            "top_k": 40,
            "stop_sequences": ["END"],
        });
        let translated = translate_in(&body).unwrap();
        let native = &translated.native_body;
        assert_eq!(native["systemInstruction"]["parts"][0]["text"], "be kind");
        assert_eq!(native["contents"][0]["parts"][1]["inlineData"]["mimeType"], "image/png");
        assert_eq!(native["contents"][1]["role"], "model");
        assert_eq!(native["generationConfig"]["maxOutputTokens"], 512);
        assert_eq!(native["generationConfig"]["topK"], 40);
    }

    #[test]
    fn non_stream_response_is_a_message() {
        let native = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Hi" }] },
                "finishReason": "MAX_TOKENS",
            }],
            "usageMetadata": { "promptTokenCount": 4, "candidatesTokenCount": 1 },
        })
        .to_string();
        let response = non_stream_response(&native, "gemini-2.5-pro");
        assert_eq!(response["type"], "message");
        assert_eq!(response["content"][0]["text"], "Hi");
        assert_eq!(response["stop_reason"], "max_tokens");
        assert_eq!(response["usage"]["input_tokens"], 4);
    }

    #[test]
    fn count_tokens_round_trip() {
        let body = json!({
            "model": "gemini-2.5-pro",
            "messages": [{ "role": "user", "content": "count me" }],
            "max_tokens": 16,
        });
        let translated = count_tokens_request(&body).unwrap();
        assert!(translated.native_body.get("generationConfig").is_none());

        let counted = count_tokens_response(&json!({ "totalTokens": 9 }).to_string());
        assert_eq!(counted["input_tokens"], 9);
    }

    #[test]
    fn stream_emits_full_event_sequence() {
        let mut stream = AnthropicStream::new("gemini-2.5-pro");
        let chunk = format!(
            "data: {}\n\n",
            json!({ "candidates": [{ "content": { "parts": [
                { "text": "mull", "thought": true },
                { "text": "Hi" },
            ]}}]})
        );
        let events = stream.translate(&chunk);
        let joined = events.join("");
        assert!(joined.contains("event: message_start"));
        assert!(joined.contains("thinking_delta"));
        assert!(joined.contains("content_block_stop"));
        assert!(joined.contains("text_delta"));

        let tail = stream.finish().join("");
        assert!(tail.contains("event: message_delta"));
        assert!(tail.contains("event: message_stop"));
        assert!(!tail.contains("[DONE]"));
    }
}
