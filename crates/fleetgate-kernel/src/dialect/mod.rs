//! Wire dialects.
//!
//! The three HTTP surfaces share one pipeline and differ only in body
//! translation in, chunk translation out, and the error envelope. Dialect
//! translation is pure: no I/O, no shared state beyond the per-stream
//! accumulator.

pub mod anthropic;
pub mod openai;

use serde_json::Value;

use crate::error::PipelineError;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Dialect {
    OpenAi,
    Anthropic,
    Native,
}

/// A client request translated to the native shape.
#[derive(Clone, Debug)]
pub struct TranslatedRequest {
    pub native_body: Value,
    pub model: String,
    pub thinking_level: Option<String>,
    pub stream: bool,
}

/// Strip the `models/` prefix clients sometimes carry over.
pub fn clean_model_name(model: &str) -> &str {
    model.strip_prefix("models/").unwrap_or(model)
}

/// Split a `@level` suffix off a model name: `gemini-2.5-pro@high` names the
/// model and asks for the `high` thinking level.
pub fn parse_thinking_suffix(model: &str) -> (String, Option<String>) {
    let cleaned = clean_model_name(model);
    match cleaned.rsplit_once('@') {
        Some((name, level))
            if !name.is_empty()
                && matches!(level, "none" | "low" | "medium" | "high" | "max") =>
        {
            (name.to_string(), Some(level.to_string()))
        }
        _ => (cleaned.to_string(), None),
    }
}

/// Incremental `text/event-stream` parser. Upstream chunks split lines at
/// arbitrary byte boundaries; the parser buffers partials and yields each
/// complete `data:` payload that parses as JSON.
#[derive(Debug, Default)]
pub struct SseParser {
    buffer: String,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &str) -> Vec<Value> {
        self.buffer.push_str(chunk);
        let mut records = Vec::new();

        while let Some(newline) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline).collect();
            let line = line.trim_end_matches(['\n', '\r']);
            let Some(payload) = line.strip_prefix("data:") else {
                continue;
            };
            let payload = payload.trim();
            if payload.is_empty() || payload == "[DONE]" {
                continue;
            }
            if let Ok(value) = serde_json::from_str::<Value>(payload) {
                records.push(value);
            }
        }
        records
    }
}

/// Per-part text extracted from a native streaming record.
#[derive(Clone, Debug, Default)]
pub struct CandidateDelta {
    pub thoughts: Vec<String>,
    pub texts: Vec<String>,
    pub finish_reason: Option<String>,
    pub usage: Option<Value>,
}

/// Pull thought/content text and termination metadata out of one native
/// chunk or response body.
pub fn split_candidate(record: &Value) -> CandidateDelta {
    let mut delta = CandidateDelta {
        usage: record.get("usageMetadata").cloned(),
        ..Default::default()
    };
    let Some(candidate) = record.get("candidates").and_then(|c| c.get(0)) else {
        return delta;
    };
    delta.finish_reason = candidate
        .get("finishReason")
        .and_then(Value::as_str)
        .map(String::from);

    let Some(parts) = candidate
        .get("content")
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
    else {
        return delta;
    };
    for part in parts {
        let Some(text) = part.get("text").and_then(Value::as_str) else {
            continue;
        };
        if part.get("thought").and_then(Value::as_bool).unwrap_or(false) {
            delta.thoughts.push(text.to_string());
        } else {
            delta.texts.push(text.to_string());
        }
    }
    delta
}

/// Streaming chunk translator, one per in-flight streamed response.
pub enum StreamTranslator {
    /// Native dialect: upstream SSE bytes pass through verbatim.
    Native,
    OpenAi(openai::OpenAiStream),
    Anthropic(anthropic::AnthropicStream),
}

impl StreamTranslator {
    pub fn new(dialect: Dialect, model: &str) -> Self {
        match dialect {
            Dialect::Native => StreamTranslator::Native,
            Dialect::OpenAi => StreamTranslator::OpenAi(openai::OpenAiStream::new(model)),
            Dialect::Anthropic => {
                StreamTranslator::Anthropic(anthropic::AnthropicStream::new(model))
            }
        }
    }

    /// Translate one upstream chunk into zero or more wire-ready strings.
    pub fn translate(&mut self, data: &str) -> Vec<String> {
        match self {
            StreamTranslator::Native => vec![data.to_string()],
            StreamTranslator::OpenAi(stream) => stream.translate(data),
            StreamTranslator::Anthropic(stream) => stream.translate(data),
        }
    }

    /// Emit the dialect's end-of-stream records.
    pub fn finish(&mut self) -> Vec<String> {
        match self {
            StreamTranslator::Native => Vec::new(),
            StreamTranslator::OpenAi(stream) => stream.finish(),
            StreamTranslator::Anthropic(stream) => stream.finish(),
        }
    }

    /// An SSE record reporting a mid-stream error, in the client's dialect.
    pub fn error_record(&self, status: u16, message: &str) -> String {
        match self {
            StreamTranslator::Native => format!(
                "data: {}\n\n",
                serde_json::json!({ "error": { "code": status, "message": message } })
            ),
            StreamTranslator::OpenAi(_) => format!(
                "data: {}\n\n",
                openai::error_body(status, message)
            ),
            StreamTranslator::Anthropic(_) => format!(
                "event: error\ndata: {}\n\n",
                anthropic::error_body(status, message)
            ),
        }
    }
}

/// The body a dialect hands back for terminal pipeline errors.
pub fn error_response_body(dialect: Dialect, err: &PipelineError) -> Value {
    match dialect {
        Dialect::OpenAi => openai::error_body(err.status(), &err.to_string()),
        Dialect::Anthropic => anthropic::error_body(err.status(), &err.to_string()),
        Dialect::Native => serde_json::json!({
            "error": { "code": err.status(), "message": err.to_string(), "status": "UNAVAILABLE" }
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thinking_suffix_parses_known_levels() {
        assert_eq!(
            parse_thinking_suffix("gemini-2.5-pro@high"),
            ("gemini-2.5-pro".into(), Some("high".into()))
        );
        assert_eq!(
            parse_thinking_suffix("models/gemini-2.5-flash@none"),
            ("gemini-2.5-flash".into(), Some("none".into()))
        );
        assert_eq!(
            parse_thinking_suffix("gemini-2.5-flash"),
            ("gemini-2.5-flash".into(), None)
        );
        // Unknown levels stay part of the model name.
        assert_eq!(
            parse_thinking_suffix("custom@v2"),
            ("custom@v2".into(), None)
        );
    }

    #[test]
    fn sse_parser_handles_split_lines() {
        let mut parser = SseParser::new();
        assert!(parser.push("data: {\"a\"").is_empty());
        let records = parser.push(": 1}\n\ndata: {\"b\": 2}\n");
        assert_eq!(records.len(), 2);
        assert_eq!(records[0]["a"], 1);
        assert_eq!(records[1]["b"], 2);
    }

    #[test]
    fn sse_parser_skips_comments_and_done() {
        let mut parser = SseParser::new();
        let records = parser.push(": keep-alive\n\ndata: [DONE]\n\ndata: {\"x\": 1}\n");
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn candidate_split_partitions_thoughts() {
        let record = serde_json::json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "mull", "thought": true },
                    { "text": "answer" },
                ]},
                "finishReason": "STOP",
            }],
            "usageMetadata": { "totalTokenCount": 3 },
        });
        let delta = split_candidate(&record);
        assert_eq!(delta.thoughts, vec!["mull"]);
        assert_eq!(delta.texts, vec!["answer"]);
        assert_eq!(delta.finish_reason.as_deref(), Some("STOP"));
        assert!(delta.usage.is_some());
    }
}
