//! OpenAI chat-completions dialect.

use chrono::Utc;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::error::PipelineError;

use super::{parse_thinking_suffix, split_candidate, SseParser, TranslatedRequest};

/// Translate an OpenAI chat-completions body into the native request shape.
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

    let mut system_parts: Vec<Value> = Vec::new();
    let mut contents: Vec<Value> = Vec::new();
    for message in messages {
        let role = message.get("role").and_then(Value::as_str).unwrap_or("user");
        let parts = message_parts(message.get("content"));
        match role {
            "system" | "developer" => system_parts.extend(parts),
            "assistant" => contents.push(json!({ "role": "model", "parts": parts })),
            _ => contents.push(json!({ "role": "user", "parts": parts })),
        }
    }

    let mut native = Map::new();
    native.insert("contents".into(), Value::Array(contents));
    if !system_parts.is_empty() {
        native.insert(
            "systemInstruction".into(),
            json!({ "parts": system_parts }),
        );
    }

    let mut generation = Map::new();
    if let Some(value) = root.get("temperature").and_then(Value::as_f64) {
        generation.insert("temperature".into(), json!(value));
    }
    if let Some(value) = root.get("top_p").and_then(Value::as_f64) {
        generation.insert("topP".into(), json!(value));
    }
    if let Some(value) = root
        .get("max_completion_tokens")
        .or_else(|| root.get("max_tokens"))
        .and_then(Value::as_u64)
    {
        generation.insert("maxOutputTokens".into(), json!(value));
    }
    match root.get("stop") {
        Some(Value::String(stop)) => {
            generation.insert("stopSequences".into(), json!([stop]));
        }
        Some(Value::Array(stops)) => {
            generation.insert("stopSequences".into(), json!(stops));
        }
        _ => {}
    }
    if !generation.is_empty() {
        native.insert("generationConfig".into(), Value::Object(generation));
    }

    if let Some(tools) = root.get("tools").and_then(Value::as_array) {
        let declarations: Vec<Value> = tools
            .iter()
            .filter_map(|tool| tool.get("function"))
            .map(|function| {
                json!({
                    "name": function.get("name").cloned().unwrap_or(Value::Null),
                    "description": function.get("description").cloned().unwrap_or(Value::Null),
                    "parameters": function.get("parameters").cloned().unwrap_or(Value::Null),
                })
            })
            .collect();
        if !declarations.is_empty() {
            native.insert(
                "tools".into(),
                json!([{ "functionDeclarations": declarations }]),
            );
        }
    }

    Ok(TranslatedRequest {
        native_body: Value::Object(native),
        model,
        thinking_level,
        stream: root.get("stream").and_then(Value::as_bool).unwrap_or(false),
    })
}

/// OpenAI message content: a bare string or an array of typed parts.
fn message_parts(content: Option<&Value>) -> Vec<Value> {
    match content {
        Some(Value::String(text)) => vec![json!({ "text": text })],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item.get("type").and_then(Value::as_str) {
                Some("text") => item
                    .get("text")
                    .and_then(Value::as_str)
                    .map(|text| json!({ "text": text })),
                Some("image_url") => item
                    .get("image_url")
                    .and_then(|i| i.get("url"))
                    .and_then(Value::as_str)
                    .and_then(data_url_to_inline),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    }
}

fn data_url_to_inline(url: &str) -> Option<Value> {
    let rest = url.strip_prefix("data:")?;
    let (mime, data) = rest.split_once(";base64,")?;
    Some(json!({ "inlineData": { "mimeType": mime, "data": data } }))
}

fn map_finish_reason(native: &str) -> &'static str {
    match native {
        "MAX_TOKENS" => "length",
        "SAFETY" | "PROHIBITED_CONTENT" => "content_filter",
        _ => "stop",
    }
}

/// Build the non-streaming chat-completion object from the accumulated
/// native response body.
pub fn non_stream_response(native_raw: &str, model: &str) -> Value {
    let completion_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let created = Utc::now().timestamp();

    let parsed: Value = serde_json::from_str(native_raw).unwrap_or(Value::Null);
    let delta = split_candidate(&parsed);
    let content = if delta.texts.is_empty() && parsed.is_null() {
        native_raw.to_string()
    } else {
        delta.texts.join("")
    };
    let finish_reason = delta
        .finish_reason
        .as_deref()
        .map(map_finish_reason)
        .unwrap_or("stop");

    let usage = delta
        .usage
        .as_ref()
        .map(|usage| {
            json!({
                "prompt_tokens": usage.get("promptTokenCount").cloned().unwrap_or(json!(0)),
                "completion_tokens": usage.get("candidatesTokenCount").cloned().unwrap_or(json!(0)),
                "total_tokens": usage.get("totalTokenCount").cloned().unwrap_or(json!(0)),
            })
        })
        .unwrap_or_else(|| json!({ "prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0 }));

    let mut message = json!({ "role": "assistant", "content": content });
    if !delta.thoughts.is_empty() {
        message["reasoning_content"] = json!(delta.thoughts.join(""));
    }

    json!({
        "id": completion_id,
        "object": "chat.completion",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "message": message,
            "finish_reason": finish_reason,
        }],
        "usage": usage,
    })
}

pub fn error_body(status: u16, message: &str) -> Value {
    let error_type = if status >= 500 || status == 503 {
        "server_error"
    } else {
        "invalid_request_error"
    };
    json!({
        "error": {
            "message": message,
            "type": error_type,
            "param": null,
            "code": status,
        }
    })
}

/// Streaming state for one OpenAI SSE response.
pub struct OpenAiStream {
    id: String,
    model: String,
    created: i64,
    parser: SseParser,
    role_sent: bool,
}

impl OpenAiStream {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            model: model.to_string(),
            created: Utc::now().timestamp(),
            parser: SseParser::new(),
            role_sent: false,
        }
    }

    fn chunk(&self, delta: Value, finish_reason: Option<&str>) -> String {
        let body = json!({
            "id": self.id,
            "object": "chat.completion.chunk",
            "created": self.created,
            "model": self.model,
            "choices": [{
                "index": 0,
                "delta": delta,
                "finish_reason": finish_reason,
            }],
        });
        format!("data: {body}\n\n")
    }

    pub fn translate(&mut self, data: &str) -> Vec<String> {
        let mut out = Vec::new();
        for record in self.parser.push(data) {
            let delta = split_candidate(&record);

            let mut payload = Map::new();
            if !self.role_sent {
                payload.insert("role".into(), json!("assistant"));
                self.role_sent = true;
            }
            if !delta.thoughts.is_empty() {
                payload.insert("reasoning_content".into(), json!(delta.thoughts.join("")));
            }
            if !delta.texts.is_empty() {
                payload.insert("content".into(), json!(delta.texts.join("")));
            }

            let finish = delta.finish_reason.as_deref().map(map_finish_reason);
            if payload.is_empty() && finish.is_none() {
                continue;
            }
            out.push(self.chunk(Value::Object(payload), finish));
        }
        out
    }

    pub fn finish(&mut self) -> Vec<String> {
        vec!["data: [DONE]\n\n".to_string()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn translates_roles_and_generation_config() {
        let body = json!({
            "model": "models/gemini-2.5-flash-lite@low",
            "messages": [
                { "role": "system", "content": "be brief" },
                { "role": "user", "content": "hi" },
                { "role": "assistant", "content": "hello" },
                { "role": "user", "content": [
                    { "type": "text", "text": "what is this?" },
                    { "type": "image_url", "image_url": { "url": "data:image/png;base64,QUJD" } },
                ]},
            ],
            "stream": true,
            "temperature": 0.5,
            "max_tokens": 256,
            "stop": ["END"],
        });
        let translated = translate_in(&body).unwrap();
        assert_eq!(translated.model, "gemini-2.5-flash-lite");
        assert_eq!(translated.thinking_level.as_deref(), Some("low"));
        assert!(translated.stream);

        let native = &translated.native_body;
        assert_eq!(native["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(native["contents"][0]["role"], "user");
        assert_eq!(native["contents"][1]["role"], "model");
        assert_eq!(
            native["contents"][2]["parts"][1]["inlineData"]["mimeType"],
            "image/png"
        );
        assert_eq!(native["generationConfig"]["maxOutputTokens"], 256);
        assert_eq!(native["generationConfig"]["stopSequences"][0], "END");
    }

    #[test]
    fn rejects_missing_model_and_messages() {
        assert!(translate_in(&json!({ "messages": [{"role":"user","content":"x"}] })).is_err());
        assert!(translate_in(&json!({ "model": "m", "messages": [] })).is_err());
    }

    #[test]
    fn non_stream_response_extracts_text_and_usage() {
        let native = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "Hello!" }] },
                "finishReason": "STOP",
            }],
            "usageMetadata": { "promptTokenCount": 3, "candidatesTokenCount": 2, "totalTokenCount": 5 },
        })
        .to_string();
        let response = non_stream_response(&native, "gemini-2.5-flash");
        assert_eq!(response["object"], "chat.completion");
        assert_eq!(response["choices"][0]["message"]["content"], "Hello!");
        assert_eq!(response["choices"][0]["finish_reason"], "stop");
        assert_eq!(response["usage"]["total_tokens"], 5);
    }

    #[test]
    fn stream_emits_role_once_then_deltas_then_done() {
        let mut stream = OpenAiStream::new("gemini-2.5-flash");
        let chunk = format!(
            "data: {}\n\n",
            json!({ "candidates": [{ "content": { "parts": [{ "text": "Hel" }] } }] })
        );
        let first = stream.translate(&chunk);
        assert_eq!(first.len(), 1);
        assert!(first[0].contains("\"role\":\"assistant\""));
        assert!(first[0].contains("chat.completion.chunk"));

        let chunk = format!(
            "data: {}\n\n",
            json!({ "candidates": [{ "content": { "parts": [{ "text": "lo" }] }, "finishReason": "STOP" }] })
        );
        let second = stream.translate(&chunk);
        assert!(!second[0].contains("\"role\""));
        assert!(second[0].contains("\"finish_reason\":\"stop\""));

        assert_eq!(stream.finish(), vec!["data: [DONE]\n\n".to_string()]);
    }

    #[test]
    fn finish_reason_mapping() {
        assert_eq!(map_finish_reason("STOP"), "stop");
        assert_eq!(map_finish_reason("MAX_TOKENS"), "length");
        assert_eq!(map_finish_reason("SAFETY"), "content_filter");
    }
}
