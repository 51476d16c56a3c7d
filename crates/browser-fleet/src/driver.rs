//! Thin wrapper over one page's CDP session.
//!
//! Everything the activation and health code does to a page goes through
//! here: navigation, script evaluation, selector queries, synthesized input.
//! Keeping it command-level (rather than a high-level browser API) lets the
//! stub transport stand in for Chrome in tests.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::time::{sleep, Instant};
use tracing::debug;

use crate::error::FleetError;
use crate::transport::{CdpTransport, CommandTarget};

/// Modifier bit for the platform's primary chord key (Meta on macOS,
/// Control elsewhere), per the CDP Input domain.
fn primary_modifier() -> u64 {
    if cfg!(target_os = "macos") {
        4
    } else {
        2
    }
}

#[derive(Clone)]
pub struct PageDriver {
    transport: Arc<dyn CdpTransport>,
    session_id: String,
    deadline: Duration,
}

impl PageDriver {
    pub fn new(transport: Arc<dyn CdpTransport>, session_id: String, deadline: Duration) -> Self {
        Self {
            transport,
            session_id,
            deadline,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub async fn command(&self, method: &str, params: Value) -> Result<Value, FleetError> {
        self.transport
            .send_command(
                CommandTarget::Session(self.session_id.clone()),
                method,
                params,
            )
            .await
    }

    /// Enable the domains activation relies on (events + evaluation).
    pub async fn enable_domains(&self) -> Result<(), FleetError> {
        self.command("Page.enable", json!({})).await?;
        self.command("Runtime.enable", json!({})).await?;
        Ok(())
    }

    pub async fn navigate(&self, url: &str) -> Result<(), FleetError> {
        self.command("Page.navigate", json!({ "url": url })).await?;
        Ok(())
    }

    pub async fn bring_to_front(&self) -> Result<(), FleetError> {
        self.command("Page.bringToFront", json!({})).await?;
        Ok(())
    }

    /// Evaluate an expression, awaiting promises, returning the JSON value.
    pub async fn evaluate(&self, expression: &str) -> Result<Value, FleetError> {
        let response = self
            .command(
                "Runtime.evaluate",
                json!({
                    "expression": expression,
                    "returnByValue": true,
                    "awaitPromise": true,
                }),
            )
            .await?;
        if let Some(exception) = response.get("exceptionDetails") {
            debug!(target: "fleet-driver", %exception, "evaluate raised");
        }
        Ok(response
            .get("result")
            .and_then(|r| r.get("value"))
            .cloned()
            .unwrap_or(Value::Null))
    }

    pub async fn evaluate_bool(&self, expression: &str) -> Result<bool, FleetError> {
        Ok(self.evaluate(expression).await?.as_bool().unwrap_or(false))
    }

    pub async fn evaluate_string(&self, expression: &str) -> Result<String, FleetError> {
        Ok(self
            .evaluate(expression)
            .await?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    pub async fn current_url(&self) -> Result<String, FleetError> {
        self.evaluate_string("window.location.href").await
    }

    pub async fn body_text(&self) -> Result<String, FleetError> {
        self.evaluate_string("document.body ? document.body.innerText : ''")
            .await
    }

    /// Poll `document.readyState` until interactive/complete.
    pub async fn wait_for_ready(&self, timeout: Duration) -> Result<(), FleetError> {
        self.wait_for_function(
            "['interactive','complete'].includes(document.readyState)",
            timeout,
        )
        .await
    }

    /// Poll an expression until it is truthy or the deadline passes.
    pub async fn wait_for_function(
        &self,
        expression: &str,
        timeout: Duration,
    ) -> Result<(), FleetError> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.evaluate_bool(expression).await? {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FleetError::Transport(format!(
                    "condition not met within {timeout:?}: {expression}"
                )));
            }
            sleep(Duration::from_millis(200)).await;
        }
    }

    pub async fn query_exists(&self, selector: &str) -> Result<bool, FleetError> {
        let literal = serde_json::to_string(selector)?;
        self.evaluate_bool(&format!("!!document.querySelector({literal})"))
            .await
    }

    /// Programmatic click; returns whether a matching element existed.
    pub async fn click_selector(&self, selector: &str) -> Result<bool, FleetError> {
        let literal = serde_json::to_string(selector)?;
        self.evaluate_bool(&format!(
            "(() => {{ const el = document.querySelector({literal}); if (!el) return false; el.click(); return true; }})()"
        ))
        .await
    }

    /// Remove every node matching the selector; returns the removal count.
    pub async fn remove_nodes(&self, selector: &str) -> Result<u64, FleetError> {
        let literal = serde_json::to_string(selector)?;
        let removed = self
            .evaluate(&format!(
                "(() => {{ const nodes = document.querySelectorAll({literal}); nodes.forEach(n => n.remove()); return nodes.length; }})()"
            ))
            .await?;
        Ok(removed.as_u64().unwrap_or(0))
    }

    /// Viewport center of the first matching element, if visible.
    pub async fn element_center(&self, selector: &str) -> Result<Option<(f64, f64)>, FleetError> {
        let literal = serde_json::to_string(selector)?;
        let value = self
            .evaluate(&format!(
                "(() => {{ const el = document.querySelector({literal}); if (!el) return null; \
                 const r = el.getBoundingClientRect(); if (r.width === 0 || r.height === 0) return null; \
                 return {{ x: r.left + r.width / 2, y: r.top + r.height / 2 }}; }})()"
            ))
            .await?;
        let x = value.get("x").and_then(Value::as_f64);
        let y = value.get("y").and_then(Value::as_f64);
        Ok(x.zip(y))
    }

    pub async fn mouse_move(&self, x: f64, y: f64) -> Result<(), FleetError> {
        self.command(
            "Input.dispatchMouseEvent",
            json!({ "type": "mouseMoved", "x": x, "y": y }),
        )
        .await?;
        Ok(())
    }

    pub async fn mouse_press(&self, x: f64, y: f64) -> Result<(), FleetError> {
        self.command(
            "Input.dispatchMouseEvent",
            json!({
                "type": "mousePressed",
                "x": x,
                "y": y,
                "button": "left",
                "clickCount": 1,
            }),
        )
        .await?;
        Ok(())
    }

    pub async fn mouse_release(&self, x: f64, y: f64) -> Result<(), FleetError> {
        self.command(
            "Input.dispatchMouseEvent",
            json!({
                "type": "mouseReleased",
                "x": x,
                "y": y,
                "button": "left",
                "clickCount": 1,
            }),
        )
        .await?;
        Ok(())
    }

    /// Prime the page clipboard right before a paste.
    pub async fn write_clipboard(&self, text: &str) -> Result<(), FleetError> {
        let literal = serde_json::to_string(text)?;
        self.evaluate(&format!(
            "navigator.clipboard.writeText({literal}).then(() => true).catch(() => false)"
        ))
        .await?;
        Ok(())
    }

    async fn key_chord(&self, key: &str, code: &str, virtual_key: u64) -> Result<(), FleetError> {
        let modifiers = primary_modifier();
        self.command(
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyDown",
                "modifiers": modifiers,
                "key": key,
                "code": code,
                "windowsVirtualKeyCode": virtual_key,
            }),
        )
        .await?;
        self.command(
            "Input.dispatchKeyEvent",
            json!({
                "type": "keyUp",
                "modifiers": modifiers,
                "key": key,
                "code": code,
                "windowsVirtualKeyCode": virtual_key,
            }),
        )
        .await?;
        Ok(())
    }

    /// Platform select-all followed by paste from the primed clipboard.
    pub async fn select_all_and_paste(&self) -> Result<(), FleetError> {
        self.key_chord("a", "KeyA", 65).await?;
        sleep(Duration::from_millis(80)).await;
        self.key_chord("v", "KeyV", 86).await?;
        Ok(())
    }

    /// Install a script that runs before any page script on new documents.
    pub async fn add_init_script(&self, source: &str) -> Result<(), FleetError> {
        self.command(
            "Page.addScriptToEvaluateOnNewDocument",
            json!({ "source": source }),
        )
        .await?;
        Ok(())
    }

    /// Fire a benign GET from inside the page to wake the upstream backend.
    pub async fn active_trigger_ping(&self, path: &str) -> Result<(), FleetError> {
        let literal = serde_json::to_string(path)?;
        self.evaluate(&format!(
            "fetch({literal}, {{ method: 'GET', credentials: 'include' }}).then(r => r.status).catch(() => 0)"
        ))
        .await?;
        Ok(())
    }

    pub fn command_deadline(&self) -> Duration {
        self.deadline
    }
}
