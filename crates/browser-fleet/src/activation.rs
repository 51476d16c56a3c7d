//! Agent injection protocol.
//!
//! The upstream web editor comes in two flavours. The legacy flavour exposes
//! the code panel directly behind a "Code" control; the remix flavour first
//! requires submitting a "Remix" dialog, which mints a new app under a
//! stable `/apps/{id}` URL. Activation drives whichever flavour the page
//! presents, pastes the bridge payloads into the editor, starts the preview,
//! and waits for the in-page agent to announce itself.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::driver::PageDriver;
use crate::error::{ActivationStage, FleetError};

/// In-page agent source, pasted into the editor's TypeScript file.
pub const AGENT_SOURCE: &str = include_str!("../assets/agent.js");

/// HTML payload pasted into the remix app's HTML file.
pub const BOOTSTRAP_HTML: &str = include_str!("../assets/bootstrap.html");

/// Status lines the agent emits while coming up; any of them means the
/// bridge code is running.
pub const INIT_MARKERS: &[&str] = &[
    "System initializing",
    "Connecting to server",
    "Connection successful",
];

/// Overlay nodes that swallow clicks aimed at the editor chrome.
const BACKDROP_SELECTOR: &str = ".cdk-overlay-backdrop, .modal-backdrop, [class*='overlay-backdrop']";

/// Buttons dismissed during the popup sweep and by the health monitor.
pub const DISMISS_LABELS: &[&str] = &[
    "Got it",
    "Dismiss",
    "Accept all",
    "No thanks",
    "Not now",
    "Close",
    "Reload",
    "Retry",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EditorFlavour {
    Legacy,
    Remix,
}

#[derive(Clone, Debug)]
pub struct ActivationOutcome {
    pub flavour: EditorFlavour,
    /// Deep link learned from a successful remix, to be persisted as the
    /// identity's `appUrl`.
    pub app_url: Option<String>,
}

#[derive(Clone, Copy, Debug)]
pub struct ActivationTimeouts {
    pub editor_load: Duration,
    pub code_enabled: Duration,
    pub agent_init: Duration,
}

impl Default for ActivationTimeouts {
    fn default() -> Self {
        Self {
            editor_load: Duration::from_secs(60),
            code_enabled: Duration::from_secs(60),
            agent_init: Duration::from_secs(90),
        }
    }
}

/// One console line captured from the page (or its cross-origin preview,
/// which still logs through the page's console).
#[derive(Clone, Debug)]
pub struct ConsoleLine {
    pub session_id: Option<String>,
    pub text: String,
}

pub fn marker_hit(text: &str) -> bool {
    INIT_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Editor-side failures that warrant a reload-and-retry rather than a hard
/// activation error.
pub fn is_recoverable_editor_error(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("concurrent update")
        || lower.contains("snapshot")
        || lower.contains("failed to initialize")
}

/// Extract the stable `/apps/{id}` deep link from a URL, if present.
pub fn extract_app_url(url: &str) -> Option<String> {
    let marker = "/apps/";
    let start = url.find(marker)?;
    let id_start = start + marker.len();
    let id: String = url[id_start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .collect();
    if id.is_empty() {
        return None;
    }
    Some(format!("{}{}{}", &url[..start], marker, id))
}

pub struct Activator {
    driver: PageDriver,
    console: broadcast::Sender<ConsoleLine>,
    timeouts: ActivationTimeouts,
}

impl Activator {
    pub fn new(
        driver: PageDriver,
        console: broadcast::Sender<ConsoleLine>,
        timeouts: ActivationTimeouts,
    ) -> Self {
        Self {
            driver,
            console,
            timeouts,
        }
    }

    /// Drive the full injection protocol. `deep_link` is the saved app URL
    /// used for reloads on recoverable preview failures.
    pub async fn activate(&self, deep_link: Option<&str>) -> Result<ActivationOutcome, FleetError> {
        // Early listener: if the pasted app is already running (reload of an
        // initialized deep link), its init lines show up before any Save.
        let early_initialized = Arc::new(AtomicBool::new(false));
        let early_watcher = self.spawn_console_watcher(Arc::clone(&early_initialized));

        self.wait_for_editor().await?;

        let flavour = self.detect_flavour().await?;
        info!(target: "activation", ?flavour, "editor flavour detected");

        let mut app_url = None;
        if flavour == EditorFlavour::Remix {
            app_url = Some(self.run_remix_flow().await?);
        }

        self.open_code_panel().await?;

        if flavour == EditorFlavour::Remix {
            self.open_file_and_paste("index.html", BOOTSTRAP_HTML).await?;
        }
        let agent_file = match flavour {
            EditorFlavour::Remix => "index.ts",
            EditorFlavour::Legacy => "main.ts",
        };
        self.open_file_and_paste(agent_file, AGENT_SOURCE).await?;

        // A Save control present means the paste changed code, so the next
        // preview restarts the app; watch for the post-restart init lines.
        let saved = self.click_save_if_present().await?;
        let second_initialized = Arc::new(AtomicBool::new(false));
        let second_watcher = if saved {
            Some(self.spawn_console_watcher(Arc::clone(&second_initialized)))
        } else {
            None
        };

        self.start_preview(deep_link, 0).await?;

        let init = self
            .wait_for_agent_init(flavour, &early_initialized, &second_initialized)
            .await;
        early_watcher.abort();
        if let Some(watcher) = second_watcher {
            watcher.abort();
        }
        init?;

        // Poke a benign endpoint from inside the page so the upstream
        // backend spins up before the first real request.
        if let Err(err) = self.driver.active_trigger_ping("/api/ping").await {
            debug!(target: "activation", %err, "active trigger ping failed");
        }

        Ok(ActivationOutcome { flavour, app_url })
    }

    async fn wait_for_editor(&self) -> Result<(), FleetError> {
        self.driver
            .wait_for_function(
                "!!document.querySelector('ms-code-editor, .monaco-editor, [data-test-id=\"app-editor\"]') \
                 || !!document.querySelector('button, [role=\"button\"]')",
                self.timeouts.editor_load,
            )
            .await
            .map_err(|err| FleetError::activation(ActivationStage::EditorLoad, err.to_string()))
    }

    async fn detect_flavour(&self) -> Result<EditorFlavour, FleetError> {
        let has_remix = self
            .driver
            .evaluate_bool(
                "Array.from(document.querySelectorAll('button, [role=\"button\"]'))\
                 .some(b => (b.textContent || '').trim() === 'Remix' || (b.getAttribute('aria-label') || '').includes('Remix'))",
            )
            .await?;
        Ok(if has_remix {
            EditorFlavour::Remix
        } else {
            EditorFlavour::Legacy
        })
    }

    /// Submit the remix dialog until the URL settles on `/apps/{id}`.
    async fn run_remix_flow(&self) -> Result<String, FleetError> {
        const MAX_ATTEMPTS: usize = 5;
        for attempt in 1..=MAX_ATTEMPTS {
            self.driver.remove_nodes(BACKDROP_SELECTOR).await?;
            click_button_with_text(&self.driver, &["Remix"]).await?;
            sleep(Duration::from_millis(600)).await;

            // Dialogs with a confirm button get it clicked; scratch forms
            // submit directly.
            click_button_with_text(&self.driver, &["Remix app", "Create", "Save"]).await?;

            let deadline = Instant::now() + Duration::from_secs(60);
            loop {
                let url = self.driver.current_url().await?;
                if let Some(app_url) = extract_app_url(&url) {
                    info!(target: "activation", %app_url, "remix produced stable app url");
                    return Ok(app_url);
                }
                let body = self.driver.body_text().await?;
                if is_recoverable_editor_error(&body) {
                    warn!(target: "activation", attempt, "remix hit a recoverable editor error");
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(FleetError::activation(
                        ActivationStage::RemixDialog,
                        "url did not settle on /apps/{id} within 60s",
                    ));
                }
                sleep(Duration::from_millis(500)).await;
            }
            sleep(Duration::from_secs(2)).await;
        }
        Err(FleetError::activation(
            ActivationStage::RemixDialog,
            format!("remix failed after {MAX_ATTEMPTS} attempts"),
        ))
    }

    /// Ordered strategies for the "Code" control: exact text, alternate
    /// label, attribute contains, icon child. Backdrops are removed before
    /// each try.
    async fn open_code_panel(&self) -> Result<(), FleetError> {
        let deadline = Instant::now() + self.timeouts.code_enabled;
        loop {
            self.driver.remove_nodes(BACKDROP_SELECTOR).await?;
            let clicked = self
                .driver
                .evaluate_bool(
                    r#"(() => {
  const candidates = Array.from(document.querySelectorAll('button, [role="button"], a'));
  const strategies = [
    (el) => (el.textContent || '').trim() === 'Code',
    (el) => ['Code editor', 'Show code'].includes((el.getAttribute('aria-label') || '').trim()),
    (el) => ((el.getAttribute('data-test-id') || '') + (el.className || '')).toLowerCase().includes('code'),
    (el) => !!el.querySelector('mat-icon, .material-icons') &&
            (el.querySelector('mat-icon, .material-icons').textContent || '').trim() === 'code',
  ];
  for (const hit of strategies) {
    const el = candidates.find((c) => hit(c) && !c.disabled);
    if (el) { el.click(); return true; }
  }
  return false;
})()"#,
                )
                .await?;

            if clicked {
                // Editor surface must come up before we can paste.
                self.driver
                    .wait_for_function(
                        "!!document.querySelector('.monaco-editor textarea, textarea, [contenteditable=\"true\"]')",
                        Duration::from_secs(10),
                    )
                    .await
                    .ok();
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FleetError::activation(
                    ActivationStage::CodePanel,
                    "code control never became clickable",
                ));
            }
            sleep(Duration::from_millis(500)).await;
        }
    }

    async fn open_file_and_paste(&self, file_name: &str, payload: &str) -> Result<(), FleetError> {
        let literal = serde_json::to_string(file_name)?;
        let opened = self
            .driver
            .evaluate_bool(&format!(
                "(() => {{ const tabs = Array.from(document.querySelectorAll('[role=\"tab\"], .file-tab, li, button')); \
                 const el = tabs.find(t => (t.textContent || '').trim() === {literal}); \
                 if (!el) return false; el.click(); return true; }})()"
            ))
            .await?;
        if !opened {
            debug!(target: "activation", file_name, "file tab not found; pasting into current editor");
        }
        sleep(Duration::from_millis(400)).await;

        // Focus the editor surface, prime the clipboard, then the platform
        // select-all + paste chord.
        self.driver
            .evaluate(
                "(() => { const ed = document.querySelector('.monaco-editor textarea, textarea, [contenteditable=\"true\"]'); if (ed) ed.focus(); })()",
            )
            .await?;
        self.driver.write_clipboard(payload).await?;
        self.driver
            .select_all_and_paste()
            .await
            .map_err(|err| FleetError::activation(ActivationStage::Paste, err.to_string()))?;
        sleep(Duration::from_millis(400)).await;
        Ok(())
    }

    async fn click_save_if_present(&self) -> Result<bool, FleetError> {
        self.driver.remove_nodes(BACKDROP_SELECTOR).await?;
        click_button_with_text(&self.driver, &["Save"]).await
    }

    /// Click Preview; on a recoverable editor failure reload the deep link
    /// and try again.
    fn start_preview<'a>(
        &'a self,
        deep_link: Option<&'a str>,
        depth: usize,
    ) -> futures::future::BoxFuture<'a, Result<(), FleetError>> {
        Box::pin(async move {
            const MAX_DEPTH: usize = 3;
            self.driver.remove_nodes(BACKDROP_SELECTOR).await?;
            click_button_with_text(&self.driver, &["Preview"]).await?;
            sleep(Duration::from_secs(2)).await;

            let body = self.driver.body_text().await?;
            if is_recoverable_editor_error(&body) {
                if depth >= MAX_DEPTH {
                    return Err(FleetError::activation(
                        ActivationStage::Preview,
                        "preview kept failing after reloads",
                    ));
                }
                warn!(target: "activation", depth, "preview failed; reloading editor");
                if let Some(url) = deep_link {
                    self.driver.navigate(url).await?;
                    self.driver.wait_for_ready(Duration::from_secs(30)).await?;
                }
                return self.start_preview(deep_link, depth + 1).await;
            }
            Ok(())
        })
    }

    async fn wait_for_agent_init(
        &self,
        flavour: EditorFlavour,
        early: &AtomicBool,
        second: &AtomicBool,
    ) -> Result<(), FleetError> {
        let deadline = Instant::now() + self.timeouts.agent_init;
        loop {
            if early.load(Ordering::SeqCst) || second.load(Ordering::SeqCst) {
                return Ok(());
            }
            // The legacy editor hosts the app same-origin, so the status
            // text is visible in the page body; the remix preview iframe is
            // cross-origin and only the console lines get through.
            if flavour == EditorFlavour::Legacy {
                let body = self.driver.body_text().await?;
                if marker_hit(&body) {
                    return Ok(());
                }
            }
            if Instant::now() >= deadline {
                return Err(FleetError::activation(
                    ActivationStage::AgentInit,
                    "agent did not announce initialization",
                ));
            }
            sleep(Duration::from_millis(500)).await;
        }
    }

    fn spawn_console_watcher(&self, flag: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
        let mut rx = self.console.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(line) => {
                        if marker_hit(&line.text) {
                            flag.store(true, Ordering::SeqCst);
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        })
    }
}

/// Click the first visible button whose trimmed text or aria-label matches
/// one of `labels`. Returns whether anything was clicked.
pub async fn click_button_with_text(
    driver: &PageDriver,
    labels: &[&str],
) -> Result<bool, FleetError> {
    let labels_json = serde_json::to_string(labels)?;
    driver
        .evaluate_bool(&format!(
            "(() => {{ const labels = {labels_json}; \
             const els = Array.from(document.querySelectorAll('button, [role=\"button\"]')); \
             const el = els.find(e => labels.includes((e.textContent || '').trim()) \
               || labels.some(l => (e.getAttribute('aria-label') || '').trim() === l)); \
             if (!el || el.disabled) return false; el.click(); return true; }})()"
        ))
        .await
}
