//! Pipeline behavior against a scripted in-process agent.
//!
//! These tests wire a real registry and switcher to fake agent sockets whose
//! responses are scripted per identity, covering the retry loop, immediate
//! rotation, cross-identity retry bookkeeping, and the client-disconnect
//! guard without a browser.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep, Instant};

use account_switcher::{
    AccountSwitcher, IdentityActivator, RotationEntry, SwitcherConfig,
};
use agent_protocol::{AgentFrame, ProxyRequest, ServerFrame};
use browser_fleet::transport::StubTransport;
use browser_fleet::{FleetConfig, FleetManager};
use connection_registry::{AgentSocket, ConnectionRegistry};
use fleetgate_core_types::{AuthIndex, CloseReason, RequestId, StreamMode};
use fleetgate_kernel::config::GatewayConfig;
use fleetgate_kernel::error::PipelineError;
use fleetgate_kernel::pipeline::{self, RelayRequest};
use fleetgate_kernel::state::GatewayState;

type Script = Arc<dyn Fn(&ProxyRequest) -> Vec<AgentFrame> + Send + Sync>;

#[derive(Clone, Default)]
struct AgentLog {
    cancels: Arc<Mutex<Vec<(u32, String)>>>,
    served: Arc<Mutex<Vec<u32>>>,
}

fn connect_fake_agent(
    registry: &Arc<ConnectionRegistry>,
    auth_index: AuthIndex,
    script: Script,
    log: AgentLog,
) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    registry.on_socket_open(AgentSocket::new(auth_index, tx));
    let registry = Arc::clone(registry);
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            match frame {
                ServerFrame::ProxyRequest(request) => {
                    log.served.lock().push(auth_index.0);
                    for reply in script(&request) {
                        registry.on_frame(reply);
                    }
                }
                ServerFrame::CancelRequest { request_id } => {
                    log.cancels.lock().push((auth_index.0, request_id));
                }
                ServerFrame::SetLogLevel { .. } => {}
            }
        }
    });
}

struct ScriptedActivator {
    registry: Arc<ConnectionRegistry>,
    scripts: HashMap<u32, Script>,
    log: AgentLog,
}

#[async_trait]
impl IdentityActivator for ScriptedActivator {
    async fn activate(&self, target: AuthIndex) -> anyhow::Result<()> {
        let script = self
            .scripts
            .get(&target.0)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("identity {target} is not scripted"))?;
        connect_fake_agent(&self.registry, target, script, self.log.clone());
        Ok(())
    }
}

fn success_script(text: &str) -> Script {
    let body = serde_json::json!({
        "candidates": [{
            "content": { "parts": [{ "text": text }] },
            "finishReason": "STOP",
        }],
        "usageMetadata": { "promptTokenCount": 1, "candidatesTokenCount": 1, "totalTokenCount": 2 },
    })
    .to_string();
    Arc::new(move |request: &ProxyRequest| {
        vec![
            AgentFrame::ResponseHeaders {
                request_id: request.request_id.clone(),
                status: 200,
                headers: HashMap::from([("content-type".into(), "application/json".into())]),
            },
            AgentFrame::Chunk {
                request_id: request.request_id.clone(),
                data: body.clone(),
            },
            AgentFrame::StreamClose {
                request_id: request.request_id.clone(),
            },
        ]
    })
}

fn error_script(status: u16) -> Script {
    Arc::new(move |request: &ProxyRequest| {
        vec![AgentFrame::Error {
            request_id: request.request_id.clone(),
            status: Some(status),
            message: format!("upstream said {status}"),
        }]
    })
}

/// The agent reports non-2xx upstream responses as ordinary
/// `response_headers` frames; only JS-level failures become `error` frames.
fn error_status_script(status: u16) -> Script {
    Arc::new(move |request: &ProxyRequest| {
        vec![
            AgentFrame::ResponseHeaders {
                request_id: request.request_id.clone(),
                status,
                headers: HashMap::new(),
            },
            AgentFrame::Chunk {
                request_id: request.request_id.clone(),
                data: format!("{{\"error\":{{\"code\":{status}}}}}"),
            },
            AgentFrame::StreamClose {
                request_id: request.request_id.clone(),
            },
        ]
    })
}

fn test_state(scripts: HashMap<u32, Script>, switcher_cfg: SwitcherConfig) -> (GatewayState, AgentLog) {
    let registry = Arc::new(ConnectionRegistry::new());
    let log = AgentLog::default();

    let rotation: Vec<RotationEntry> = {
        let mut indices: Vec<u32> = scripts.keys().copied().collect();
        indices.sort_unstable();
        indices
            .into_iter()
            .map(|i| RotationEntry {
                auth_index: AuthIndex(i),
                email: None,
            })
            .collect()
    };
    let activator = Arc::new(ScriptedActivator {
        registry: Arc::clone(&registry),
        scripts,
        log: log.clone(),
    });
    let switcher = Arc::new(
        AccountSwitcher::new(
            switcher_cfg,
            rotation,
            activator,
            Arc::clone(&registry),
        )
        .with_socket_wait(Duration::from_millis(500)),
    );

    let dir = tempfile::tempdir().expect("tempdir");
    let fleet_cfg = FleetConfig {
        auth_dir: dir.path().to_path_buf(),
        ..FleetConfig::default()
    };
    // The tempdir guard leaks intentionally; these tests never write to it.
    std::mem::forget(dir);
    let fleet = FleetManager::new(fleet_cfg, StubTransport::new(), Arc::clone(&registry));

    let state = GatewayState {
        cfg: Arc::new(GatewayConfig::default()),
        registry,
        switcher,
        fleet,
        models: Arc::new(Default::default()),
    };
    (state, log)
}

fn count_tokens_request() -> RelayRequest {
    RelayRequest {
        request_id: RequestId::new(),
        method: "POST".into(),
        path: "/v1beta/models/gemini-2.5-flash:countTokens".into(),
        query: HashMap::new(),
        headers: HashMap::new(),
        body: Some("{}".into()),
        body_b64: None,
        stream_mode: StreamMode::Fake,
        is_generative: false,
    }
}

fn generative_request() -> RelayRequest {
    RelayRequest {
        request_id: RequestId::new(),
        method: "POST".into(),
        path: "/v1beta/models/gemini-2.5-flash:generateContent".into(),
        query: HashMap::new(),
        headers: HashMap::new(),
        body: Some("{}".into()),
        body_b64: None,
        stream_mode: StreamMode::Fake,
        is_generative: true,
    }
}

fn fast_switcher_cfg() -> SwitcherConfig {
    SwitcherConfig {
        switch_on_uses: 0,
        failure_threshold: 3,
        immediate_switch_status_codes: vec![429],
        max_retries: 3,
        retry_delay: Duration::from_millis(50),
    }
}

async fn wait_for_current(state: &GatewayState, expected: u32, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if state.switcher.current() == Some(AuthIndex(expected)) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn first_start_recovers_and_serves() {
    let (state, _log) = test_state(
        HashMap::from([(0, success_script("hello"))]),
        fast_switcher_cfg(),
    );

    let request = generative_request();
    let dispatched = pipeline::dispatch(&state, &request).await.expect("dispatch");
    assert_eq!(dispatched.identity, AuthIndex(0));
    assert!(matches!(
        dispatched.first,
        agent_protocol::RelayEvent::Headers { status: 200, .. }
    ));
    assert_eq!(state.switcher.usage_count(), 1);
    dispatched.guard.complete();
    assert_eq!(state.registry.queue_count(), 0);
}

#[tokio::test]
async fn immediate_switch_status_rotates_without_consuming_retries() {
    let (state, log) = test_state(
        HashMap::from([(0, error_script(429)), (1, success_script("ok"))]),
        fast_switcher_cfg(),
    );

    let request = generative_request();
    let err = pipeline::dispatch(&state, &request).await.unwrap_err();
    assert_eq!(err.status(), 503);

    // Exactly one attempt hit identity 0 before the rotation.
    assert_eq!(log.served.lock().iter().filter(|&&i| i == 0).count(), 1);

    // Background rotation lands on identity 1; the next request succeeds.
    assert!(wait_for_current(&state, 1, Duration::from_secs(3)).await);
    let request = generative_request();
    let dispatched = pipeline::dispatch(&state, &request).await.expect("dispatch after rotation");
    assert_eq!(dispatched.identity, AuthIndex(1));
    dispatched.guard.complete();
}

#[tokio::test]
async fn retry_crossing_identities_cancels_on_the_old_socket() {
    let (state, log) = test_state(
        HashMap::from([(0, error_script(500)), (1, success_script("ok"))]),
        SwitcherConfig {
            retry_delay: Duration::from_millis(400),
            ..fast_switcher_cfg()
        },
    );

    // Identity 0 active and failing; a concurrent switch moves the system
    // to identity 1 during the retry delay.
    let request = generative_request();
    let request_id = request.request_id.clone();
    let dispatch_state = state.clone();
    let dispatch = tokio::spawn(async move {
        pipeline::dispatch(&dispatch_state, &request).await
    });

    // Let the first attempt fail, then switch identities mid-retry-delay.
    sleep(Duration::from_millis(250)).await;
    state
        .switcher
        .switch_to_specific(AuthIndex(1))
        .await
        .expect("manual switch");

    let dispatched = dispatch.await.unwrap().expect("second attempt succeeds");
    assert_eq!(dispatched.identity, AuthIndex(1));

    // The failed attempt was cancelled on the identity that ran it.
    let cancels = log.cancels.lock().clone();
    assert!(
        cancels.contains(&(0, request_id.0.clone())),
        "expected cancel on identity 0, got {cancels:?}"
    );
    dispatched.guard.complete();
}

#[tokio::test]
async fn dropping_the_guard_cancels_on_the_owning_identity() {
    let (state, log) = test_state(
        HashMap::from([(0, success_script("hello"))]),
        fast_switcher_cfg(),
    );

    let request = generative_request();
    let request_id = request.request_id.clone();
    let dispatched = pipeline::dispatch(&state, &request).await.expect("dispatch");
    let failure_before = state.switcher.failure_count();

    // Simulate the HTTP client going away: guard dropped, not completed.
    let queue = Arc::clone(&dispatched.queue);
    drop(dispatched);
    sleep(Duration::from_millis(100)).await;

    assert_eq!(queue.close_reason(), Some(CloseReason::ClientDisconnect));
    let cancels = log.cancels.lock().clone();
    assert!(cancels.iter().any(|(i, id)| *i == 0 && *id == request_id.0));
    assert_eq!(state.switcher.failure_count(), failure_before);
}

#[tokio::test]
async fn terminal_upstream_status_propagates_after_retries() {
    let (state, _log) = test_state(
        HashMap::from([(0, error_script(502))]),
        SwitcherConfig {
            failure_threshold: 10,
            immediate_switch_status_codes: vec![],
            max_retries: 2,
            retry_delay: Duration::from_millis(30),
            switch_on_uses: 0,
        },
    );

    let request = generative_request();
    let err = pipeline::dispatch(&state, &request).await.unwrap_err();
    match err {
        PipelineError::Upstream { status, .. } => assert_eq!(status, 502),
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(state.switcher.failure_count(), 2);
}

#[tokio::test]
async fn non_generative_upstream_error_status_is_an_attempt_failure() {
    let (state, log) = test_state(
        HashMap::from([(0, error_status_script(429)), (1, success_script("ok"))]),
        fast_switcher_cfg(),
    );

    let request = count_tokens_request();
    let err = pipeline::dispatch(&state, &request).await.unwrap_err();
    assert_eq!(err.status(), 503);

    // The 429 headers frame counted as a failed attempt: no retry burned,
    // no success recorded, and the rotation fires just as for generative
    // calls.
    assert_eq!(log.served.lock().iter().filter(|&&i| i == 0).count(), 1);
    assert!(wait_for_current(&state, 1, Duration::from_secs(3)).await);

    // Usage accounting stays generative-only.
    assert_eq!(state.switcher.usage_count(), 0);
}

#[tokio::test]
async fn usage_quota_schedules_exactly_one_deferred_rotation() {
    let (state, _log) = test_state(
        HashMap::from([(0, success_script("a")), (1, success_script("b"))]),
        SwitcherConfig {
            switch_on_uses: 2,
            ..fast_switcher_cfg()
        },
    );

    for _ in 0..2 {
        let request = generative_request();
        let dispatched = pipeline::dispatch(&state, &request).await.expect("dispatch");
        dispatched.guard.complete();
    }

    // The second completion scheduled the background switch to identity 1.
    assert!(wait_for_current(&state, 1, Duration::from_secs(3)).await);
    assert_eq!(state.switcher.usage_count(), 0);
}
