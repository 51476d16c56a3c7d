//! CDP transport.
//!
//! One command/event pump over the browser's DevTools WebSocket. Commands
//! are serialized through an mpsc channel into the connection task; events
//! come back out on a second channel. The manager never touches the raw
//! connection, which keeps activation logic testable against a stub.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chromiumoxide::async_process::Child;
use chromiumoxide::browser::BrowserConfig;
use chromiumoxide::cdp::browser_protocol::target::SessionId as CdpSessionId;
use chromiumoxide::cdp::events::CdpEventMessage;
use chromiumoxide::conn::Connection;
use chromiumoxide::error::CdpError;
use chromiumoxide_types::{CallId, CdpJsonEventMessage, Message, MethodId, Response};
use futures::future::BoxFuture;
use futures::io::{AsyncBufReadExt, BufReader};
use futures::stream::StreamExt;
use parking_lot::Mutex as SyncMutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, Mutex, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::FleetConfig;
use crate::error::FleetError;
use crate::prefs;

/// One DevTools event, decoded to JSON.
#[derive(Clone, Debug)]
pub struct TransportEvent {
    pub method: String,
    pub params: Value,
    pub session_id: Option<String>,
}

#[derive(Clone, Debug)]
pub enum CommandTarget {
    Browser,
    Session(String),
}

#[async_trait]
pub trait CdpTransport: Send + Sync {
    async fn start(&self) -> Result<(), FleetError>;
    async fn next_event(&self) -> Option<TransportEvent>;
    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, FleetError>;
}

/// Fallback used when no browser is reachable; every command fails.
#[derive(Default)]
pub struct NoopTransport;

#[async_trait]
impl CdpTransport for NoopTransport {
    async fn start(&self) -> Result<(), FleetError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        None
    }

    async fn send_command(
        &self,
        _target: CommandTarget,
        method: &str,
        _params: Value,
    ) -> Result<Value, FleetError> {
        Err(FleetError::Transport(format!(
            "no browser transport available for {method}"
        )))
    }
}

/// Scripted transport for unit tests: canned responses per method, call log,
/// and an injectable event stream.
pub struct StubTransport {
    responses: SyncMutex<HashMap<String, VecDeque<Value>>>,
    calls: SyncMutex<Vec<(String, Value)>>,
    events: Mutex<mpsc::UnboundedReceiver<TransportEvent>>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl StubTransport {
    pub fn new() -> Arc<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            responses: SyncMutex::new(HashMap::new()),
            calls: SyncMutex::new(Vec::new()),
            events: Mutex::new(events_rx),
            events_tx,
        })
    }

    /// Queue a response for the next call to `method`. Unscripted methods
    /// answer `null`.
    pub fn respond(&self, method: &str, value: Value) {
        self.responses
            .lock()
            .entry(method.to_string())
            .or_default()
            .push_back(value);
    }

    pub fn push_event(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, method: &str) -> Vec<Value> {
        self.calls
            .lock()
            .iter()
            .filter(|(m, _)| m == method)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl CdpTransport for StubTransport {
    async fn start(&self) -> Result<(), FleetError> {
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        self.events.lock().await.recv().await
    }

    async fn send_command(
        &self,
        _target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, FleetError> {
        self.calls.lock().push((method.to_string(), params));
        let scripted = self
            .responses
            .lock()
            .get_mut(method)
            .and_then(|queue| queue.pop_front());
        Ok(scripted.unwrap_or(Value::Null))
    }
}

type RuntimeFactory = Arc<
    dyn Fn(FleetConfig) -> BoxFuture<'static, Result<Arc<BrowserRuntime>, FleetError>>
        + Send
        + Sync,
>;

/// Transport over a real Chromium-family browser, launched on demand and
/// relaunched when the connection dies.
#[derive(Clone)]
pub struct ChromeTransport {
    cfg: FleetConfig,
    state: Arc<OnceCell<Mutex<Option<Arc<BrowserRuntime>>>>>,
    factory: RuntimeFactory,
}

impl ChromeTransport {
    pub fn new(cfg: FleetConfig) -> Self {
        let factory: RuntimeFactory = Arc::new(|cfg: FleetConfig| {
            Box::pin(async move {
                let runtime = BrowserRuntime::start(cfg).await?;
                Ok(Arc::new(runtime))
            })
        });
        Self {
            cfg,
            state: Arc::new(OnceCell::new()),
            factory,
        }
    }

    #[cfg(test)]
    fn with_factory(cfg: FleetConfig, factory: RuntimeFactory) -> Self {
        Self {
            cfg,
            state: Arc::new(OnceCell::new()),
            factory,
        }
    }

    /// True once a browser process has been started (or attached) and its
    /// connection is still alive.
    pub async fn is_running(&self) -> bool {
        let cell = self.state.get_or_init(|| async { Mutex::new(None) }).await;
        let guard = cell.lock().await;
        guard.as_ref().map(|rt| rt.is_alive()).unwrap_or(false)
    }

    async fn runtime(&self) -> Result<Arc<BrowserRuntime>, FleetError> {
        let cell = self.state.get_or_init(|| async { Mutex::new(None) }).await;
        let mut guard = cell.lock().await;

        if let Some(rt) = guard.as_ref() {
            if rt.is_alive() {
                return Ok(rt.clone());
            }
        }

        let runtime = (self.factory)(self.cfg.clone()).await?;
        *guard = Some(runtime.clone());
        Ok(runtime)
    }
}

#[async_trait]
impl CdpTransport for ChromeTransport {
    async fn start(&self) -> Result<(), FleetError> {
        let runtime = self.runtime().await?;
        let deadline = Duration::from_millis(self.cfg.command_deadline_ms);

        runtime
            .send_internal(
                CommandTarget::Browser,
                "Target.setDiscoverTargets",
                json!({ "discover": true }),
                deadline,
            )
            .await?;
        runtime
            .send_internal(
                CommandTarget::Browser,
                "Target.setAutoAttach",
                json!({
                    "autoAttach": true,
                    "waitForDebuggerOnStart": false,
                    "flatten": true,
                }),
                deadline,
            )
            .await?;
        Ok(())
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        match self.runtime().await {
            Ok(runtime) => runtime.next_event().await,
            Err(err) => {
                warn!(target: "fleet-transport", %err, "transport not ready");
                None
            }
        }
    }

    async fn send_command(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
    ) -> Result<Value, FleetError> {
        let runtime = self.runtime().await?;
        runtime
            .send_internal(
                target,
                method,
                params,
                Duration::from_millis(self.cfg.command_deadline_ms),
            )
            .await
    }
}

struct ControlMessage {
    target: CommandTarget,
    method: String,
    params: Value,
    responder: oneshot::Sender<Result<Value, FleetError>>,
}

struct BrowserRuntime {
    command_tx: mpsc::Sender<ControlMessage>,
    events_rx: Mutex<mpsc::Receiver<TransportEvent>>,
    loop_task: JoinHandle<()>,
    heartbeat_task: Option<JoinHandle<()>>,
    child: Mutex<Option<Child>>,
    alive: Arc<AtomicBool>,
}

impl BrowserRuntime {
    async fn start(cfg: FleetConfig) -> Result<Self, FleetError> {
        let (child, ws_url) = if let Some(url) = cfg.websocket_url.clone() {
            (None, url)
        } else {
            let browser_cfg = Self::browser_config(&cfg)?;
            Self::launch_browser(browser_cfg).await?
        };

        let conn = Connection::<CdpEventMessage>::connect(&ws_url)
            .await
            .map_err(FleetError::transport)?;

        let (command_tx, command_rx) = mpsc::channel(128);
        let (events_tx, events_rx) = mpsc::channel(512);

        let alive = Arc::new(AtomicBool::new(true));
        let loop_alive = alive.clone();
        let loop_task = tokio::spawn(async move {
            let result = Self::run_loop(conn, command_rx, events_tx).await;
            loop_alive.store(false, Ordering::Relaxed);
            if let Err(err) = result {
                error!(target: "fleet-transport", %err, "transport loop terminated");
            }
        });

        let heartbeat_task = Self::spawn_heartbeat(
            command_tx.clone(),
            alive.clone(),
            Duration::from_millis(cfg.heartbeat_interval_ms),
        );

        info!(target: "fleet-transport", url = %ws_url, "browser connection established");

        Ok(Self {
            command_tx,
            events_rx: Mutex::new(events_rx),
            loop_task,
            heartbeat_task,
            child: Mutex::new(child),
            alive,
        })
    }

    #[cfg(test)]
    fn test_stub() -> (Arc<Self>, Arc<AtomicBool>) {
        let (command_tx, _command_rx) = mpsc::channel(8);
        let (_events_tx, events_rx) = mpsc::channel(8);
        let alive = Arc::new(AtomicBool::new(true));
        let loop_task = tokio::spawn(futures::future::pending::<()>());
        (
            Arc::new(Self {
                command_tx,
                events_rx: Mutex::new(events_rx),
                loop_task,
                heartbeat_task: None,
                child: Mutex::new(None),
                alive: alive.clone(),
            }),
            alive,
        )
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    async fn send_internal(
        &self,
        target: CommandTarget,
        method: &str,
        params: Value,
        deadline: Duration,
    ) -> Result<Value, FleetError> {
        let (resp_tx, resp_rx) = oneshot::channel();
        let message = ControlMessage {
            target,
            method: method.to_string(),
            params,
            responder: resp_tx,
        };

        self.command_tx
            .send(message)
            .await
            .map_err(|_| FleetError::Transport("command channel closed".into()))?;

        match timeout(deadline, resp_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(FleetError::Transport(
                "command response channel closed".into(),
            )),
            Err(_) => Err(FleetError::Transport(format!("{method} timed out"))),
        }
    }

    async fn next_event(&self) -> Option<TransportEvent> {
        let mut guard = self.events_rx.lock().await;
        guard.recv().await
    }

    fn spawn_heartbeat(
        sender: mpsc::Sender<ControlMessage>,
        alive: Arc<AtomicBool>,
        period: Duration,
    ) -> Option<JoinHandle<()>> {
        if period.as_millis() == 0 {
            return None;
        }

        Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            while alive.load(Ordering::Relaxed) {
                ticker.tick().await;
                if !alive.load(Ordering::Relaxed) {
                    break;
                }

                let (resp_tx, resp_rx) = oneshot::channel();
                let ping = ControlMessage {
                    target: CommandTarget::Browser,
                    method: "Browser.getVersion".to_string(),
                    params: Value::Object(Default::default()),
                    responder: resp_tx,
                };
                if sender.send(ping).await.is_err() {
                    debug!(target: "fleet-transport", "heartbeat channel closed");
                    break;
                }
                match timeout(Duration::from_secs(5), resp_rx).await {
                    Ok(Ok(Ok(_))) => {}
                    Ok(Ok(Err(err))) => {
                        warn!(target: "fleet-transport", %err, "heartbeat command error");
                        break;
                    }
                    Ok(Err(_)) => {
                        debug!(target: "fleet-transport", "heartbeat responder dropped");
                        break;
                    }
                    Err(_) => {
                        warn!(target: "fleet-transport", "heartbeat timed out");
                        break;
                    }
                }
            }
        }))
    }

    fn browser_config(cfg: &FleetConfig) -> Result<BrowserConfig, FleetError> {
        if !cfg.executable.as_os_str().is_empty() && !cfg.executable.exists() {
            return Err(FleetError::Transport(format!(
                "browser executable not found at {} (set FLEETGATE_CHROME)",
                cfg.executable.display()
            )));
        }

        let profile_dir = if cfg.user_data_dir.is_absolute() {
            cfg.user_data_dir.clone()
        } else {
            std::env::current_dir()
                .map_err(FleetError::transport)?
                .join(&cfg.user_data_dir)
        };
        std::fs::create_dir_all(&profile_dir)?;

        let mut builder = BrowserConfig::builder()
            .request_timeout(Duration::from_millis(cfg.command_deadline_ms))
            .launch_timeout(Duration::from_secs(20))
            .args(prefs::launch_args(cfg));

        if !cfg.headless {
            builder = builder.with_head();
        }
        if std::env::var("FLEETGATE_DISABLE_SANDBOX")
            .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true"))
            .unwrap_or(false)
        {
            builder = builder.no_sandbox();
        }
        if !cfg.executable.as_os_str().is_empty() {
            builder = builder.chrome_executable(cfg.executable.clone());
        }
        builder = builder.user_data_dir(profile_dir);

        builder
            .build()
            .map_err(|err| FleetError::Transport(format!("browser config error: {err}")))
    }

    async fn launch_browser(config: BrowserConfig) -> Result<(Option<Child>, String), FleetError> {
        let mut child = config
            .launch()
            .map_err(|err| FleetError::Transport(format!("failed to launch browser: {err}")))?;
        let ws_url = extract_ws_url(&mut child).await?;
        Ok((Some(child), ws_url))
    }

    async fn run_loop(
        mut conn: Connection<CdpEventMessage>,
        mut command_rx: mpsc::Receiver<ControlMessage>,
        mut event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<(), FleetError> {
        let mut inflight: HashMap<CallId, oneshot::Sender<Result<Value, FleetError>>> =
            HashMap::new();

        loop {
            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    Self::submit(&mut conn, cmd, &mut inflight)?;
                }
                message = conn.next() => {
                    match message {
                        Some(Ok(Message::Response(resp))) => {
                            Self::resolve(resp, &mut inflight);
                        }
                        Some(Ok(Message::Event(event))) => {
                            if let Err(err) = Self::forward(event, &mut event_tx).await {
                                warn!(target: "fleet-transport", %err, "failed to forward event");
                            }
                        }
                        Some(Err(err)) => {
                            let fleet_err = Self::map_cdp_error(err);
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(FleetError::Transport(fleet_err.clone())));
                            }
                            return Err(FleetError::Transport(fleet_err));
                        }
                        None => {
                            for (_, sender) in inflight.drain() {
                                let _ = sender.send(Err(FleetError::Transport(
                                    "browser connection closed".into(),
                                )));
                            }
                            return Ok(());
                        }
                    }
                }
            }
        }
    }

    fn submit(
        conn: &mut Connection<CdpEventMessage>,
        cmd: ControlMessage,
        inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, FleetError>>>,
    ) -> Result<(), FleetError> {
        let session = match cmd.target {
            CommandTarget::Browser => None,
            CommandTarget::Session(session_id) => Some(CdpSessionId::from(session_id)),
        };
        let method_id: MethodId = cmd.method.clone().into();
        match conn.submit_command(method_id, session, cmd.params) {
            Ok(call_id) => {
                inflight.insert(call_id, cmd.responder);
                Ok(())
            }
            Err(err) => {
                let fleet_err = FleetError::Transport(err.to_string());
                let _ = cmd
                    .responder
                    .send(Err(FleetError::Transport(err.to_string())));
                Err(fleet_err)
            }
        }
    }

    fn resolve(
        resp: Response,
        inflight: &mut HashMap<CallId, oneshot::Sender<Result<Value, FleetError>>>,
    ) {
        let entry = inflight.remove(&resp.id);
        let result = if let Some(result) = resp.result {
            Ok(result)
        } else if let Some(error) = resp.error {
            Err(FleetError::Transport(format!(
                "cdp error {}: {}",
                error.code, error.message
            )))
        } else {
            Err(FleetError::Transport("empty cdp response".into()))
        };
        if let Some(sender) = entry {
            let _ = sender.send(result);
        }
    }

    async fn forward(
        event: CdpEventMessage,
        event_tx: &mut mpsc::Sender<TransportEvent>,
    ) -> Result<(), FleetError> {
        let raw: CdpJsonEventMessage = event
            .try_into()
            .map_err(|err| FleetError::Transport(format!("failed to decode cdp event: {err}")))?;

        let payload = TransportEvent {
            method: raw.method.into_owned(),
            params: raw.params,
            session_id: raw.session_id,
        };
        event_tx
            .send(payload)
            .await
            .map_err(|err| FleetError::Transport(err.to_string()))
    }

    fn map_cdp_error(err: CdpError) -> String {
        err.to_string()
    }
}

impl Drop for BrowserRuntime {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::Relaxed);
        self.loop_task.abort();
        if let Some(handle) = &self.heartbeat_task {
            handle.abort();
        }
        if let Ok(mut guard) = self.child.try_lock() {
            if let Some(mut child) = guard.take() {
                if let Ok(handle) = tokio::runtime::Handle::try_current() {
                    handle.spawn(async move {
                        if let Err(err) = child.kill().await {
                            warn!(target: "fleet-transport", ?err, "failed to kill browser child");
                        }
                    });
                } else {
                    debug!(target: "fleet-transport", "no runtime available to kill browser child");
                }
            }
        }
    }
}

/// Extract the DevTools websocket URL from the browser's stderr.
async fn extract_ws_url(child: &mut Child) -> Result<String, FleetError> {
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| FleetError::Transport("browser process missing stderr handle".into()))?;
    let mut lines = BufReader::new(stderr).lines();
    let mut preview = Vec::new();

    let reader = async {
        while let Some(line) = lines.next().await {
            let line = line.map_err(FleetError::transport)?;
            preview.push(line.clone());
            if let Some((_, ws)) = line.rsplit_once("listening on ") {
                let ws = ws.trim();
                if ws.starts_with("ws") && ws.contains("devtools/browser") {
                    return Ok(ws.to_string());
                }
            }
        }
        Err(FleetError::Transport(format!(
            "browser exited before exposing devtools url; stderr: {}",
            preview
                .iter()
                .take(8)
                .cloned()
                .collect::<Vec<_>>()
                .join(" | ")
        )))
    };

    timeout(Duration::from_secs(20), reader)
        .await
        .map_err(|_| FleetError::Transport("timed out waiting for devtools url".into()))?
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[tokio::test]
    async fn stub_transport_scripts_and_records() {
        let stub = StubTransport::new();
        stub.respond("Target.createTarget", json!({ "targetId": "t-1" }));

        let first = stub
            .send_command(CommandTarget::Browser, "Target.createTarget", json!({}))
            .await
            .unwrap();
        assert_eq!(first["targetId"], "t-1");

        let second = stub
            .send_command(CommandTarget::Browser, "Target.createTarget", json!({}))
            .await
            .unwrap();
        assert_eq!(second, Value::Null);
        assert_eq!(stub.calls_for("Target.createTarget").len(), 2);
    }

    #[tokio::test]
    async fn recreates_runtime_when_dead() {
        let spawn_count = Arc::new(AtomicUsize::new(0));
        let flags: Arc<Mutex<Vec<Arc<AtomicBool>>>> = Arc::new(Mutex::new(Vec::new()));

        let factory: RuntimeFactory = {
            let spawn_count = spawn_count.clone();
            let flags = flags.clone();
            Arc::new(move |_cfg: FleetConfig| {
                let spawn_count = spawn_count.clone();
                let flags = flags.clone();
                Box::pin(async move {
                    spawn_count.fetch_add(1, Ordering::SeqCst);
                    let (runtime, alive) = BrowserRuntime::test_stub();
                    flags.lock().await.push(alive);
                    Ok(runtime)
                })
            })
        };

        let transport = ChromeTransport::with_factory(FleetConfig::default(), factory);

        let rt1 = transport.runtime().await.expect("runtime #1");
        assert_eq!(spawn_count.load(Ordering::SeqCst), 1);

        flags.lock().await[0].store(false, Ordering::SeqCst);
        drop(rt1);

        let _rt2 = transport.runtime().await.expect("runtime #2");
        assert_eq!(spawn_count.load(Ordering::SeqCst), 2);
    }
}
