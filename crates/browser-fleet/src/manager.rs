//! Fleet manager: browser process, identity contexts, activation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex as SyncMutex;
use rand::Rng;
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use connection_registry::ConnectionRegistry;
use fleetgate_core_types::AuthIndex;

use crate::activation::{Activator, ActivationTimeouts, ConsoleLine};
use crate::config::FleetConfig;
use crate::driver::PageDriver;
use crate::error::{ActivationStage, FleetError};
use crate::fingerprint;
use crate::health::{self, StateSaveHook};
use crate::identity::{IdentityRecord, IdentityState, IdentityStore, StoredCookie};
use crate::transport::{CdpTransport, CommandTarget, TransportEvent};
use crate::{activation, humanize};

/// How long the popup sweep keeps polling at minimum / at most.
const POPUP_SWEEP_MIN: Duration = Duration::from_secs(3);
const POPUP_SWEEP_MAX: Duration = Duration::from_secs(6);
const POPUP_SWEEP_STEP: Duration = Duration::from_millis(500);
/// Consecutive polls with nothing to dismiss before the sweep exits early.
const POPUP_IDLE_EXIT: u32 = 4;

/// Deadline for the agent socket to reach the server after injection.
const SOCKET_DEADLINE: Duration = Duration::from_secs(90);

struct ActiveIdentity {
    auth_index: AuthIndex,
    context_id: String,
    wake_notify: Arc<Notify>,
    page_cancel: CancellationToken,
    health_task: JoinHandle<()>,
    wake_task: JoinHandle<()>,
}

pub struct FleetManager {
    cfg: FleetConfig,
    transport: Arc<dyn CdpTransport>,
    store: IdentityStore,
    registry: Arc<ConnectionRegistry>,
    console_tx: broadcast::Sender<ConsoleLine>,
    active: Mutex<Option<ActiveIdentity>>,
    browser_started: AtomicBool,
    pump: SyncMutex<Option<JoinHandle<()>>>,
    shutdown: CancellationToken,
}

impl FleetManager {
    pub fn new(
        cfg: FleetConfig,
        transport: Arc<dyn CdpTransport>,
        registry: Arc<ConnectionRegistry>,
    ) -> Arc<Self> {
        let store = IdentityStore::new(cfg.auth_dir.clone());
        let (console_tx, _) = broadcast::channel(256);
        Arc::new(Self {
            cfg,
            transport,
            store,
            registry,
            console_tx,
            active: Mutex::new(None),
            browser_started: AtomicBool::new(false),
            pump: SyncMutex::new(None),
            shutdown: CancellationToken::new(),
        })
    }

    pub fn store(&self) -> &IdentityStore {
        &self.store
    }

    pub fn identities(&self) -> Result<Vec<IdentityRecord>, FleetError> {
        self.store.enumerate()
    }

    /// Whether the browser process has ever been brought up by this manager.
    pub fn browser_started(&self) -> bool {
        self.browser_started.load(Ordering::SeqCst)
    }

    pub async fn current_identity(&self) -> Option<AuthIndex> {
        self.active.lock().await.as_ref().map(|a| a.auth_index)
    }

    /// A user request arrived; kick the wake loop out of its idle sleep.
    pub async fn notify_user_activity(&self) {
        if let Some(active) = self.active.lock().await.as_ref() {
            active.wake_notify.notify_one();
        }
    }

    /// Bring `auth_index` from cold state to "agent socket live". Steps:
    /// launch browser, persist the outgoing identity, rebuild the context
    /// with stored state and the stealth script, navigate (deep link first),
    /// run diagnostics and the popup sweep, inject the agent, then start the
    /// health and wake loops once the socket is up.
    pub async fn launch_or_switch_context(
        self: &Arc<Self>,
        auth_index: AuthIndex,
    ) -> Result<(), FleetError> {
        let record_email = self
            .store
            .load(auth_index)
            .map(|state| state.account_name.clone())?;

        self.ensure_browser().await?;

        let mut guard = self.active.lock().await;
        if let Some(outgoing) = guard.take() {
            self.teardown_identity(outgoing).await;
        }

        let mut state = self.store.load(auth_index)?;

        // Fresh context preloaded with the identity's persisted state.
        let context_id = self.create_context().await?;
        if !state.cookies.is_empty() {
            self.import_cookies(&context_id, &state.cookies).await?;
        }
        let driver = self.open_page(&context_id).await?;

        let seed = fingerprint::stable_seed(record_email.as_deref(), auth_index.0);
        driver
            .add_init_script(&fingerprint::build_stealth_script(seed))
            .await?;
        if let Some(script) = build_storage_seed_script(&state) {
            driver.add_init_script(&script).await?;
        }

        // Deep link first; fall back to the blank app URL when the saved
        // app no longer exists.
        let mut used_deep_link = state.app_url.is_some();
        let mut target_url = state.app_url.clone().unwrap_or_else(|| self.cfg.app_url.clone());
        loop {
            self.navigate_and_wake(&driver, &target_url).await?;

            let final_url = driver.current_url().await?;
            let body = driver.body_text().await?;
            match classify_navigation(&final_url, &body, used_deep_link) {
                Ok(()) => break,
                Err(FleetError::PageNotFound) if used_deep_link => {
                    info!(target: "fleet", %auth_index, "saved app link is dead; clearing it");
                    self.store.clear_app_url(auth_index)?;
                    state.app_url = None;
                    used_deep_link = false;
                    target_url = self.cfg.app_url.clone();
                }
                Err(err) => {
                    self.dispose_context(&context_id).await;
                    return Err(err);
                }
            }
        }

        self.popup_sweep(&driver).await?;

        let activator = Activator::new(
            driver.clone(),
            self.console_tx.clone(),
            ActivationTimeouts::default(),
        );
        let outcome = match activator.activate(state.app_url.as_deref()).await {
            Ok(outcome) => outcome,
            Err(err) => {
                self.dispose_context(&context_id).await;
                return Err(err);
            }
        };
        if let Some(app_url) = &outcome.app_url {
            state.app_url = Some(app_url.clone());
        }

        // Deliver the identity index into the page until the agent's socket
        // shows up in the registry.
        self.announce_until_connected(&driver, auth_index).await?;

        // Write back refreshed state now that the session is known-good.
        if self.cfg.persist_state {
            match self.export_cookies(&context_id).await {
                Ok(cookies) => state.cookies = cookies,
                Err(err) => warn!(target: "fleet", %err, "cookie export failed; keeping stored cookies"),
            }
            self.store.save(auth_index, &state)?;
        }

        let wake_notify = Arc::new(Notify::new());
        let page_cancel = self.shutdown.child_token();
        let save_hook: StateSaveHook = {
            let manager = Arc::clone(self);
            Arc::new(move || {
                let manager = Arc::clone(&manager);
                Box::pin(async move {
                    manager.save_active_state().await;
                })
            })
        };
        let health_task =
            health::spawn_health_monitor(driver.clone(), page_cancel.clone(), save_hook);
        let wake_task = health::spawn_wake_loop(
            driver.clone(),
            page_cancel.clone(),
            Arc::clone(&wake_notify),
        );

        *guard = Some(ActiveIdentity {
            auth_index,
            context_id,
            wake_notify,
            page_cancel,
            health_task,
            wake_task,
        });
        info!(target: "fleet", %auth_index, "identity activation complete");
        Ok(())
    }

    /// Persist the active identity's refreshed cookies. Called by the
    /// health monitor and during switches/shutdown.
    pub async fn save_active_state(&self) {
        if !self.cfg.persist_state {
            return;
        }
        let guard = self.active.lock().await;
        let Some(active) = guard.as_ref() else {
            return;
        };
        match self.export_cookies(&active.context_id).await {
            Ok(cookies) => {
                match self.store.load(active.auth_index) {
                    Ok(mut state) => {
                        state.cookies = cookies;
                        if let Err(err) = self.store.save(active.auth_index, &state) {
                            warn!(target: "fleet", %err, "state write-back failed");
                        }
                    }
                    Err(err) => warn!(target: "fleet", %err, "state reload failed"),
                }
            }
            Err(err) => debug!(target: "fleet", %err, "cookie export failed"),
        }
    }

    pub async fn shutdown(&self) {
        let mut guard = self.active.lock().await;
        if let Some(active) = guard.take() {
            self.teardown_identity(active).await;
        }
        self.shutdown.cancel();
        if let Some(pump) = self.pump.lock().take() {
            pump.abort();
        }
    }

    async fn ensure_browser(self: &Arc<Self>) -> Result<(), FleetError> {
        self.transport
            .start()
            .await
            .map_err(|err| FleetError::activation(ActivationStage::BrowserLaunch, err.to_string()))?;
        self.browser_started.store(true, Ordering::SeqCst);

        let mut pump = self.pump.lock();
        if pump.is_none() {
            let manager = Arc::clone(self);
            *pump = Some(tokio::spawn(async move {
                manager.event_pump().await;
            }));
        }
        Ok(())
    }

    /// Forward DevTools events; console lines feed the activation watchers.
    async fn event_pump(self: Arc<Self>) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                event = self.transport.next_event() => {
                    let Some(event) = event else {
                        sleep(Duration::from_millis(500)).await;
                        continue;
                    };
                    self.handle_event(event);
                }
            }
        }
    }

    fn handle_event(&self, event: TransportEvent) {
        if event.method == "Runtime.consoleAPICalled" {
            let text = console_text(&event.params);
            if !text.is_empty() {
                let _ = self.console_tx.send(ConsoleLine {
                    session_id: event.session_id,
                    text,
                });
            }
        }
    }

    async fn create_context(&self) -> Result<String, FleetError> {
        let response = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.createBrowserContext",
                json!({ "disposeOnDetach": false }),
            )
            .await?;
        response
            .get("browserContextId")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| {
                FleetError::activation(ActivationStage::ContextSetup, "missing browserContextId")
            })
    }

    async fn dispose_context(&self, context_id: &str) {
        let result = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.disposeBrowserContext",
                json!({ "browserContextId": context_id }),
            )
            .await;
        if let Err(err) = result {
            debug!(target: "fleet", %err, "context dispose failed");
        }
    }

    async fn open_page(&self, context_id: &str) -> Result<PageDriver, FleetError> {
        let created = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.createTarget",
                json!({ "url": "about:blank", "browserContextId": context_id }),
            )
            .await?;
        let target_id = created
            .get("targetId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                FleetError::activation(ActivationStage::ContextSetup, "createTarget missing targetId")
            })?;

        let attached = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Target.attachToTarget",
                json!({ "targetId": target_id, "flatten": true }),
            )
            .await?;
        let session_id = attached
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                FleetError::activation(ActivationStage::ContextSetup, "attach missing sessionId")
            })?;

        let driver = PageDriver::new(
            Arc::clone(&self.transport),
            session_id.to_string(),
            Duration::from_millis(self.cfg.command_deadline_ms),
        );
        driver.enable_domains().await?;
        Ok(driver)
    }

    async fn navigate_and_wake(&self, driver: &PageDriver, url: &str) -> Result<(), FleetError> {
        info!(target: "fleet", %url, "navigating");
        driver.navigate(url).await?;
        driver
            .wait_for_ready(Duration::from_secs(30))
            .await
            .map_err(|_| FleetError::LoadFailed)?;

        humanize::wake_page(driver).await?;
        let settle = {
            let mut rng = rand::thread_rng();
            Duration::from_millis(rng.gen_range(2000..4000))
        };
        sleep(settle).await;
        Ok(())
    }

    /// Short-poll for dismissable interruptions: at least 3 s, at most 6 s,
    /// exiting after four consecutive idle polls.
    async fn popup_sweep(&self, driver: &PageDriver) -> Result<(), FleetError> {
        let started = Instant::now();
        let mut idle_polls = 0u32;
        loop {
            driver
                .remove_nodes(".cdk-overlay-backdrop, .modal-backdrop")
                .await?;
            let dismissed =
                activation::click_button_with_text(driver, activation::DISMISS_LABELS).await?;
            if dismissed {
                idle_polls = 0;
            } else {
                idle_polls += 1;
            }

            let elapsed = started.elapsed();
            if elapsed >= POPUP_SWEEP_MAX {
                break;
            }
            if elapsed >= POPUP_SWEEP_MIN && idle_polls >= POPUP_IDLE_EXIT {
                break;
            }
            sleep(POPUP_SWEEP_STEP).await;
        }
        Ok(())
    }

    async fn announce_until_connected(
        &self,
        driver: &PageDriver,
        auth_index: AuthIndex,
    ) -> Result<(), FleetError> {
        let script = build_announce_script(auth_index);
        let deadline = Instant::now() + SOCKET_DEADLINE;
        loop {
            driver.evaluate(&script).await?;
            if self
                .registry
                .wait_for_socket(auth_index, Duration::from_secs(1))
                .await
            {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(FleetError::activation(
                    ActivationStage::SocketWait,
                    "agent socket never reached the server",
                ));
            }
        }
    }

    async fn teardown_identity(&self, active: ActiveIdentity) {
        // Persist refreshed cookies before the context goes away.
        if self.cfg.persist_state {
            match self.export_cookies(&active.context_id).await {
                Ok(cookies) => {
                    if let Ok(mut state) = self.store.load(active.auth_index) {
                        state.cookies = cookies;
                        if let Err(err) = self.store.save(active.auth_index, &state) {
                            warn!(target: "fleet", %err, "outgoing state save failed");
                        }
                    }
                }
                Err(err) => debug!(target: "fleet", %err, "outgoing cookie export failed"),
            }
        }

        active.page_cancel.cancel();
        active.health_task.abort();
        active.wake_task.abort();
        self.dispose_context(&active.context_id).await;
        info!(target: "fleet", auth_index = %active.auth_index, "identity context destroyed");
    }

    async fn import_cookies(
        &self,
        context_id: &str,
        cookies: &[StoredCookie],
    ) -> Result<(), FleetError> {
        let params: Vec<Value> = cookies.iter().map(cookie_to_cdp).collect();
        self.transport
            .send_command(
                CommandTarget::Browser,
                "Storage.setCookies",
                json!({ "cookies": params, "browserContextId": context_id }),
            )
            .await?;
        Ok(())
    }

    async fn export_cookies(&self, context_id: &str) -> Result<Vec<StoredCookie>, FleetError> {
        let response = self
            .transport
            .send_command(
                CommandTarget::Browser,
                "Storage.getCookies",
                json!({ "browserContextId": context_id }),
            )
            .await?;
        let cookies = response
            .get("cookies")
            .and_then(Value::as_array)
            .map(|list| list.iter().map(cookie_from_cdp).collect())
            .unwrap_or_default();
        Ok(cookies)
    }
}

fn cookie_to_cdp(cookie: &StoredCookie) -> Value {
    let mut object = serde_json::Map::new();
    object.insert("name".into(), json!(cookie.name));
    object.insert("value".into(), json!(cookie.value));
    if let Some(domain) = &cookie.domain {
        object.insert("domain".into(), json!(domain));
    }
    if let Some(path) = &cookie.path {
        object.insert("path".into(), json!(path));
    }
    if let Some(expires) = cookie.expires {
        object.insert("expires".into(), json!(expires));
    }
    if let Some(http_only) = cookie.http_only {
        object.insert("httpOnly".into(), json!(http_only));
    }
    if let Some(secure) = cookie.secure {
        object.insert("secure".into(), json!(secure));
    }
    if let Some(same_site) = &cookie.same_site {
        object.insert("sameSite".into(), json!(same_site));
    }
    Value::Object(object)
}

fn cookie_from_cdp(value: &Value) -> StoredCookie {
    StoredCookie {
        name: value.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        value: value.get("value").and_then(Value::as_str).unwrap_or_default().to_string(),
        domain: value.get("domain").and_then(Value::as_str).map(String::from),
        path: value.get("path").and_then(Value::as_str).map(String::from),
        expires: value.get("expires").and_then(Value::as_f64),
        http_only: value.get("httpOnly").and_then(Value::as_bool),
        secure: value.get("secure").and_then(Value::as_bool),
        same_site: value.get("sameSite").and_then(Value::as_str).map(String::from),
    }
}

fn console_text(params: &Value) -> String {
    params
        .get("args")
        .and_then(Value::as_array)
        .map(|args| {
            args.iter()
                .filter_map(|arg| arg.get("value").and_then(Value::as_str))
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_default()
}

/// Post-navigation diagnostics. `used_deep_link` widens the not-found check
/// to saved `/apps/{id}` links that have since been deleted upstream.
pub fn classify_navigation(url: &str, body: &str, used_deep_link: bool) -> Result<(), FleetError> {
    if url.is_empty() || url == "about:blank" {
        return Err(FleetError::LoadFailed);
    }
    if url.contains("accounts.google.com") || url.contains("ServiceLogin") || url.contains("/signin")
    {
        return Err(FleetError::CredentialExpired);
    }

    let lower = body.to_ascii_lowercase();
    if lower.contains("not available in your country") || lower.contains("not available in your region")
    {
        return Err(FleetError::RegionBlocked);
    }
    if lower.contains("403") && (lower.contains("forbidden") || lower.contains("error")) {
        return Err(FleetError::Forbidden);
    }
    if used_deep_link && (lower.contains("404") || lower.contains("page not found")) {
        return Err(FleetError::PageNotFound);
    }
    Ok(())
}

/// Seed stored per-origin localStorage entries from a first-run script.
pub fn build_storage_seed_script(state: &IdentityState) -> Option<String> {
    if state.origins.is_empty() {
        return None;
    }
    let mut map = serde_json::Map::new();
    for origin in &state.origins {
        let entries: Vec<Value> = origin
            .local_storage
            .iter()
            .map(|entry| json!([entry.name, entry.value]))
            .collect();
        map.insert(origin.origin.clone(), Value::Array(entries));
    }
    let data = Value::Object(map).to_string();
    Some(format!(
        "(() => {{ try {{ const data = {data}; const entries = data[window.location.origin]; \
         if (entries) for (const [k, v] of entries) localStorage.setItem(k, v); }} catch (e) {{}} }})();"
    ))
}

/// Deliver the identity index to the page and any preview iframes.
pub fn build_announce_script(auth_index: AuthIndex) -> String {
    format!(
        "(() => {{ const msg = {{ fleetgateAuthIndex: {} }}; window.postMessage(msg, '*'); \
         document.querySelectorAll('iframe').forEach((f) => {{ \
         try {{ f.contentWindow.postMessage(msg, '*'); }} catch (e) {{}} }}); }})();",
        auth_index.0
    )
}

#[cfg(test)]
mod tests {
    use crate::identity::{OriginState, StorageEntry};

    use super::*;

    #[test]
    fn navigation_diagnostics_classify_error_pages() {
        assert!(matches!(
            classify_navigation("about:blank", "", false),
            Err(FleetError::LoadFailed)
        ));
        assert!(matches!(
            classify_navigation(
                "https://accounts.google.com/v3/signin/identifier",
                "",
                false
            ),
            Err(FleetError::CredentialExpired)
        ));
        assert!(matches!(
            classify_navigation(
                "https://x.test/apps",
                "This service is not available in your country",
                false
            ),
            Err(FleetError::RegionBlocked)
        ));
        assert!(matches!(
            classify_navigation("https://x.test/apps", "403. That's an error.", false),
            Err(FleetError::Forbidden)
        ));
        assert!(matches!(
            classify_navigation("https://x.test/apps/gone", "404. Page not found", true),
            Err(FleetError::PageNotFound)
        ));
        // A 404-looking body on the blank app URL is not the deep-link case.
        assert!(classify_navigation("https://x.test/apps", "404", false).is_ok());
        assert!(classify_navigation("https://x.test/apps/live", "editor ready", true).is_ok());
    }

    #[test]
    fn storage_seed_script_embeds_origin_entries() {
        let state = IdentityState {
            origins: vec![OriginState {
                origin: "https://x.test".into(),
                local_storage: vec![StorageEntry {
                    name: "token".into(),
                    value: "abc".into(),
                }],
            }],
            ..Default::default()
        };
        let script = build_storage_seed_script(&state).unwrap();
        assert!(script.contains("https://x.test"));
        assert!(script.contains("token"));
        assert!(build_storage_seed_script(&IdentityState::default()).is_none());
    }

    #[test]
    fn announce_script_carries_the_index() {
        let script = build_announce_script(AuthIndex(4));
        assert!(script.contains("fleetgateAuthIndex: 4"));
        assert!(script.contains("postMessage"));
    }

    #[test]
    fn cookie_round_trip_preserves_fields() {
        let cookie = StoredCookie {
            name: "SID".into(),
            value: "v".into(),
            domain: Some(".x.test".into()),
            path: Some("/".into()),
            expires: Some(1.9e9),
            http_only: Some(true),
            secure: Some(true),
            same_site: Some("Lax".into()),
        };
        let encoded = cookie_to_cdp(&cookie);
        let decoded = cookie_from_cdp(&encoded);
        assert_eq!(decoded.name, "SID");
        assert_eq!(decoded.domain.as_deref(), Some(".x.test"));
        assert_eq!(decoded.same_site.as_deref(), Some("Lax"));
        assert_eq!(decoded.http_only, Some(true));
    }
}
