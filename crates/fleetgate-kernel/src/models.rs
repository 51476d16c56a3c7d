//! Model catalog.
//!
//! Served from `configs/models.json`, which holds entries in the native
//! list shape (either a bare array or `{"models": [...]}`). The OpenAI
//! surface re-labels them; the native surface returns them verbatim.

use std::path::Path;

use serde_json::{json, Value};
use tracing::warn;

#[derive(Clone, Debug, Default)]
pub struct ModelCatalog {
    entries: Vec<Value>,
}

impl ModelCatalog {
    pub fn load(path: &Path) -> Self {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) => {
                warn!(target: "models", path = %path.display(), %err, "models file unreadable; catalog empty");
                return Self::default();
            }
        };
        Self::from_json_str(&raw)
    }

    pub fn from_json_str(raw: &str) -> Self {
        let value: Value = match serde_json::from_str(raw) {
            Ok(value) => value,
            Err(err) => {
                warn!(target: "models", %err, "models file unparseable; catalog empty");
                return Self::default();
            }
        };
        let entries = match value {
            Value::Array(entries) => entries,
            Value::Object(mut map) => match map.remove("models") {
                Some(Value::Array(entries)) => entries,
                _ => Vec::new(),
            },
            _ => Vec::new(),
        };
        Self { entries }
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Model ids with any `models/` prefix removed.
    pub fn ids(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter_map(|entry| entry.get("name").and_then(Value::as_str))
            .map(|name| name.strip_prefix("models/").unwrap_or(name).to_string())
            .collect()
    }

    /// Native `/v1beta/models` response body.
    pub fn native_list(&self) -> Value {
        json!({ "models": self.entries })
    }

    /// OpenAI `/v1/models` response body.
    pub fn openai_list(&self) -> Value {
        let data: Vec<Value> = self
            .ids()
            .into_iter()
            .map(|id| {
                json!({
                    "id": id,
                    "object": "model",
                    "created": 0,
                    "owned_by": "google",
                })
            })
            .collect();
        json!({ "object": "list", "data": data })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"{"models":[
        {"name":"models/gemini-2.5-flash","displayName":"Gemini 2.5 Flash"},
        {"name":"models/gemini-2.5-pro","displayName":"Gemini 2.5 Pro"}
    ]}"#;

    #[test]
    fn parses_wrapped_and_bare_lists() {
        let catalog = ModelCatalog::from_json_str(SAMPLE);
        assert_eq!(catalog.ids(), vec!["gemini-2.5-flash", "gemini-2.5-pro"]);

        let bare = ModelCatalog::from_json_str(r#"[{"name":"models/x"}]"#);
        assert_eq!(bare.ids(), vec!["x"]);
    }

    #[test]
    fn openai_list_relabels_entries() {
        let catalog = ModelCatalog::from_json_str(SAMPLE);
        let listed = catalog.openai_list();
        assert_eq!(listed["object"], "list");
        assert_eq!(listed["data"][0]["id"], "gemini-2.5-flash");
        assert_eq!(listed["data"][0]["object"], "model");
    }

    #[test]
    fn unparseable_input_yields_empty_catalog() {
        assert!(ModelCatalog::from_json_str("not json").is_empty());
    }
}
