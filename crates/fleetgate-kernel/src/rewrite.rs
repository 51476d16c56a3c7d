//! Server-side body rewrites.
//!
//! Inbound: generative native requests get the configured feature fields
//! forced in (thinking, web search, URL context), a `thoughtSignature` on
//! function-call parts, and their tool entries normalized to the upstream
//! schema. Outbound: pseudo-stream bodies are split into thought/content
//! records and inline images are re-encoded as Markdown data URLs.

use serde_json::{json, Map, Value};

use crate::config::GatewayConfig;

/// Rewrite `:streamGenerateContent` to its non-streaming form for the
/// pseudo-stream path.
pub fn pseudo_rewrite_path(path: &str) -> String {
    path.replace(":streamGenerateContent", ":generateContent")
}

/// Apply the configured inbound rewrites to a native generative body.
pub fn apply_native_rewrites(body: &mut Value, cfg: &GatewayConfig, thinking_level: Option<&str>) {
    if !body.is_object() {
        return;
    }

    normalize_tools(body);

    if thinking_level.is_some() || cfg.force_thinking {
        if let Some(root) = body.as_object_mut() {
            let generation = root
                .entry("generationConfig")
                .or_insert_with(|| Value::Object(Map::new()));
            if !generation.is_object() {
                *generation = Value::Object(Map::new());
            }
            if let Some(generation) = generation.as_object_mut() {
                let thinking = generation
                    .entry("thinkingConfig")
                    .or_insert_with(|| Value::Object(Map::new()));
                if !thinking.is_object() {
                    *thinking = Value::Object(Map::new());
                }
                if let Some(thinking) = thinking.as_object_mut() {
                    if let Some(level) = thinking_level {
                        thinking.insert("thinkingLevel".into(), json!(level));
                    }
                    if cfg.force_thinking && !thinking.contains_key("includeThoughts") {
                        thinking.insert("includeThoughts".into(), json!(true));
                    }
                }
            }
        }
    }

    if cfg.force_web_search {
        inject_tool(body, "googleSearch");
    }
    if cfg.force_url_context {
        inject_tool(body, "urlContext");
    }

    ensure_thought_signatures(body);
}

/// Add a `{ "<name>": {} }` tool entry unless the client already carries a
/// compatible one.
fn inject_tool(body: &mut Value, name: &str) {
    let Some(map) = body.as_object_mut() else {
        return;
    };
    let tools = map
        .entry("tools")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(entries) = tools.as_array_mut() else {
        return;
    };
    if entries.iter().any(|entry| entry.get(name).is_some()) {
        return;
    }
    entries.push(json!({ name: {} }));
}

/// Normalize snake_case tool schemas to the upstream camelCase form.
pub fn normalize_tools(body: &mut Value) {
    let Some(tools) = body.get_mut("tools").and_then(Value::as_array_mut) else {
        return;
    };
    for entry in tools {
        let Some(map) = entry.as_object_mut() else {
            continue;
        };
        for (from, to) in [
            ("google_search", "googleSearch"),
            ("url_context", "urlContext"),
            ("function_declarations", "functionDeclarations"),
            ("code_execution", "codeExecution"),
        ] {
            if let Some(value) = map.remove(from) {
                map.entry(to.to_string()).or_insert(value);
            }
        }
    }
}

/// The upstream rejects function-call parts without a `thoughtSignature`;
/// backfill an empty one where missing.
pub fn ensure_thought_signatures(body: &mut Value) {
    let Some(contents) = body.get_mut("contents").and_then(Value::as_array_mut) else {
        return;
    };
    for content in contents {
        let Some(parts) = content.get_mut("parts").and_then(Value::as_array_mut) else {
            continue;
        };
        for part in parts {
            let Some(map) = part.as_object_mut() else {
                continue;
            };
            if map.contains_key("functionCall") && !map.contains_key("thoughtSignature") {
                map.insert("thoughtSignature".into(), json!(""));
            }
        }
    }
}

/// How a pseudo-stream body is emitted to the client.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum PseudoRecords {
    /// One or two SSE records: thoughts first (no `finishReason`), then the
    /// content record carrying `finishReason` and `usageMetadata`.
    Split(Vec<Value>),
    /// Structural mismatch; relay the raw body as a single record.
    Raw(String),
}

pub fn pseudo_stream_records(raw: &str) -> PseudoRecords {
    let Ok(body) = serde_json::from_str::<Value>(raw) else {
        return PseudoRecords::Raw(raw.to_string());
    };
    let Some(parts) = body
        .get("candidates")
        .and_then(|c| c.get(0))
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(Value::as_array)
        .cloned()
    else {
        return PseudoRecords::Raw(raw.to_string());
    };

    let (thoughts, content): (Vec<Value>, Vec<Value>) = parts
        .into_iter()
        .partition(|part| part.get("thought").and_then(Value::as_bool).unwrap_or(false));

    let mut records = Vec::with_capacity(2);
    if !thoughts.is_empty() {
        records.push(json!({
            "candidates": [{
                "content": { "parts": thoughts, "role": "model" },
                "index": 0,
            }]
        }));
    }

    let mut final_record = body.clone();
    if let Some(record_parts) = final_record
        .get_mut("candidates")
        .and_then(|c| c.get_mut(0))
        .and_then(|c| c.get_mut("content"))
        .and_then(|c| c.get_mut("parts"))
    {
        *record_parts = Value::Array(content);
    }
    records.push(final_record);
    PseudoRecords::Split(records)
}

/// Rewrite `inlineData` image parts into a Markdown image with an embedded
/// data URL. Returns whether anything changed.
pub fn rewrite_inline_images(body: &mut Value) -> bool {
    let Some(candidates) = body.get_mut("candidates").and_then(Value::as_array_mut) else {
        return false;
    };
    let mut changed = false;
    for candidate in candidates {
        let Some(parts) = candidate
            .get_mut("content")
            .and_then(|c| c.get_mut("parts"))
            .and_then(Value::as_array_mut)
        else {
            continue;
        };
        for part in parts {
            let inline = part.get("inlineData").or_else(|| part.get("inline_data"));
            let Some((mime, data)) = inline.and_then(|inline| {
                let mime = inline.get("mimeType").or_else(|| inline.get("mime_type"))?.as_str()?;
                let data = inline.get("data")?.as_str()?;
                Some((mime.to_string(), data.to_string()))
            }) else {
                continue;
            };
            *part = json!({
                "text": format!("![Generated Image](data:{mime};base64,{data})"),
            });
            changed = true;
        }
    }
    changed
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(thinking: bool, search: bool, url: bool) -> GatewayConfig {
        GatewayConfig {
            force_thinking: thinking,
            force_web_search: search,
            force_url_context: url,
            ..GatewayConfig::default()
        }
    }

    #[test]
    fn forces_thinking_and_tools_only_when_absent() {
        let mut body = json!({ "contents": [] });
        apply_native_rewrites(&mut body, &cfg(true, true, true), Some("high"));
        assert_eq!(body["generationConfig"]["thinkingConfig"]["includeThoughts"], json!(true));
        assert_eq!(body["generationConfig"]["thinkingConfig"]["thinkingLevel"], json!("high"));
        let tools = body["tools"].as_array().unwrap();
        assert!(tools.iter().any(|t| t.get("googleSearch").is_some()));
        assert!(tools.iter().any(|t| t.get("urlContext").is_some()));

        // Client already opted out of thoughts; the flag is not overridden.
        let mut body = json!({
            "generationConfig": { "thinkingConfig": { "includeThoughts": false } },
            "tools": [{ "googleSearch": { "custom": true } }],
        });
        apply_native_rewrites(&mut body, &cfg(true, true, false), None);
        assert_eq!(body["generationConfig"]["thinkingConfig"]["includeThoughts"], json!(false));
        assert_eq!(body["tools"].as_array().unwrap().len(), 1);
        assert_eq!(body["tools"][0]["googleSearch"]["custom"], json!(true));
    }

    #[test]
    fn normalizes_snake_case_tool_entries() {
        let mut body = json!({ "tools": [{ "google_search": {} }, { "function_declarations": [] }] });
        normalize_tools(&mut body);
        assert!(body["tools"][0].get("googleSearch").is_some());
        assert!(body["tools"][1].get("functionDeclarations").is_some());
    }

    #[test]
    fn backfills_thought_signature_on_function_calls() {
        let mut body = json!({
            "contents": [{ "role": "model", "parts": [
                { "functionCall": { "name": "f", "args": {} } },
                { "text": "hi" },
            ]}]
        });
        ensure_thought_signatures(&mut body);
        assert_eq!(body["contents"][0]["parts"][0]["thoughtSignature"], json!(""));
        assert!(body["contents"][0]["parts"][1].get("thoughtSignature").is_none());
    }

    #[test]
    fn pseudo_split_yields_two_records_with_thoughts() {
        let raw = json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "thinking...", "thought": true },
                    { "text": "answer" },
                ], "role": "model" },
                "finishReason": "STOP",
            }],
            "usageMetadata": { "totalTokenCount": 7 },
        })
        .to_string();

        let PseudoRecords::Split(records) = pseudo_stream_records(&raw) else {
            panic!("expected split");
        };
        assert_eq!(records.len(), 2);
        assert!(records[0].get("usageMetadata").is_none());
        assert!(records[0]["candidates"][0].get("finishReason").is_none());
        assert_eq!(records[0]["candidates"][0]["content"]["parts"][0]["text"], json!("thinking..."));
        assert_eq!(records[1]["candidates"][0]["finishReason"], json!("STOP"));
        assert_eq!(records[1]["candidates"][0]["content"]["parts"].as_array().unwrap().len(), 1);
        assert_eq!(records[1]["usageMetadata"]["totalTokenCount"], json!(7));
    }

    #[test]
    fn pseudo_split_without_thoughts_is_one_record() {
        let raw = json!({
            "candidates": [{
                "content": { "parts": [{ "text": "answer" }] },
                "finishReason": "STOP",
            }]
        })
        .to_string();
        let PseudoRecords::Split(records) = pseudo_stream_records(&raw) else {
            panic!("expected split");
        };
        assert_eq!(records.len(), 1);
    }

    #[test]
    fn pseudo_mismatch_falls_back_to_raw() {
        assert_eq!(
            pseudo_stream_records("not json"),
            PseudoRecords::Raw("not json".into())
        );
        let no_parts = json!({ "error": { "code": 500 } }).to_string();
        assert!(matches!(pseudo_stream_records(&no_parts), PseudoRecords::Raw(_)));
    }

    #[test]
    fn inline_images_become_markdown_parts() {
        let mut body = json!({
            "candidates": [{ "content": { "parts": [
                { "inlineData": { "mimeType": "image/png", "data": "QUJD" } }
            ]}}]
        });
        assert!(rewrite_inline_images(&mut body));
        assert_eq!(
            body["candidates"][0]["content"]["parts"][0]["text"],
            json!("![Generated Image](data:image/png;base64,QUJD)")
        );
    }

    #[test]
    fn pseudo_path_rewrite() {
        assert_eq!(
            pseudo_rewrite_path("/v1beta/models/gemini-2.5-pro:streamGenerateContent"),
            "/v1beta/models/gemini-2.5-pro:generateContent"
        );
    }
}
