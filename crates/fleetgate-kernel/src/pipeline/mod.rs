//! Per-request execution engine.
//!
//! Every inbound request funnels through the same skeleton: readiness gate
//! (with recovery), usage accounting, queue allocation, the dispatch/retry
//! loop, and finalization. Streaming response shaping lives in
//! [`streaming`].

pub mod streaming;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{info, warn};

use account_switcher::FailureDisposition;
use agent_protocol::{ProxyRequest, RelayEvent, ServerFrame};
use connection_registry::RelayQueue;
use fleetgate_core_types::{AuthIndex, CloseReason, RequestId, StreamMode};
use frame_queue::{QueueError, DEFAULT_DEQUEUE_TIMEOUT};

use crate::error::PipelineError;
use crate::state::GatewayState;

/// How long the readiness gate waits for the busy interlock to clear.
const BUSY_WAIT: Duration = Duration::from_secs(120);
/// How long to wait for a socket right after recovery/switch.
const SOCKET_WAIT: Duration = Duration::from_secs(10);
/// How long to wait out a live grace window before forcing recovery.
const RECONNECT_WAIT: Duration = Duration::from_secs(60);

/// One request as the agent will execute it.
#[derive(Clone, Debug)]
pub struct RelayRequest {
    pub request_id: RequestId,
    pub method: String,
    pub path: String,
    pub query: HashMap<String, String>,
    pub headers: HashMap<String, String>,
    pub body: Option<String>,
    pub body_b64: Option<String>,
    pub stream_mode: StreamMode,
    pub is_generative: bool,
}

impl RelayRequest {
    pub fn to_frame(&self) -> ServerFrame {
        ServerFrame::ProxyRequest(ProxyRequest {
            request_id: self.request_id.0.clone(),
            method: self.method.clone(),
            path: self.path.clone(),
            query_params: self.query.clone(),
            headers: self.headers.clone(),
            body: self.body.clone(),
            body_b64: self.body_b64.clone(),
            streaming_mode: self.stream_mode,
            is_generative: self.is_generative,
        })
    }
}

/// A successfully started attempt: the first frame plus the queue carrying
/// the rest of the stream.
pub struct Dispatched {
    pub first: RelayEvent,
    pub queue: Arc<RelayQueue>,
    pub identity: AuthIndex,
    pub guard: RequestGuard,
}

impl std::fmt::Debug for Dispatched {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatched")
            .field("first", &self.first)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

/// Owns finalization for one request. When dropped without `complete()`
/// (the client went away), it cancels the upstream fetch on whichever
/// identity currently owns the request id and closes the queue as a client
/// disconnect, without touching the failure counters.
pub struct RequestGuard {
    state: GatewayState,
    request_id: RequestId,
    completed: bool,
}

impl RequestGuard {
    pub fn new(state: GatewayState, request_id: RequestId) -> Self {
        Self {
            state,
            request_id,
            completed: false,
        }
    }

    /// Normal finalization: drop the queue and run any deferred rotation.
    pub fn complete(mut self) {
        self.completed = true;
        self.state
            .registry
            .remove_queue(&self.request_id, CloseReason::RequestComplete);
        if self.state.switcher.take_pending_switch() {
            let switcher = Arc::clone(&self.state.switcher);
            tokio::spawn(async move {
                info!(target: "pipeline", "usage quota reached; rotating in background");
                if let Err(err) = switcher.switch_to_next().await {
                    warn!(target: "pipeline", %err, "deferred rotation failed");
                }
            });
        }
    }
}

impl Drop for RequestGuard {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        // Look the identity up from the registry, not the switcher: retries
        // may have crossed identities since dispatch.
        if let Some(identity) = self.state.registry.identity_for_request(&self.request_id) {
            let cancel = ServerFrame::CancelRequest {
                request_id: self.request_id.0.clone(),
            };
            if self.state.registry.send_to(identity, cancel).is_ok() {
                info!(
                    target: "pipeline",
                    request_id = %self.request_id,
                    %identity,
                    "client went away; upstream request cancelled"
                );
            }
        }
        self.state
            .registry
            .remove_queue(&self.request_id, CloseReason::ClientDisconnect);
    }
}

/// Readiness gate plus the dispatch/retry loop.
pub async fn dispatch(
    state: &GatewayState,
    request: &RelayRequest,
) -> Result<Dispatched, PipelineError> {
    ensure_ready(state).await?;
    state.fleet.notify_user_activity().await;

    if request.is_generative {
        let used = state.switcher.increment_usage();
        info!(target: "pipeline", used, request_id = %request.request_id, "generative request");
    }

    let cfg = state.switcher.config().clone();
    let max_retries = cfg.max_retries.max(1);

    let mut identity = state
        .switcher
        .current()
        .ok_or_else(|| PipelineError::Unavailable("no identity active".into()))?;
    let mut queue = state
        .registry
        .create_queue(request.request_id.clone(), identity);

    let mut last_status: u16 = 503;
    let mut last_message = String::from("no attempt completed");
    let mut disposition = FailureDisposition::Tolerate;
    let mut immediate = false;

    for attempt in 1..=max_retries {
        identity = state.switcher.current().unwrap_or(identity);
        if let Err(err) = state.registry.send_to(identity, request.to_frame()) {
            warn!(target: "pipeline", %err, attempt, "dispatch send failed");
            state
                .registry
                .remove_queue(&request.request_id, CloseReason::Unknown);
            return Err(PipelineError::Unavailable(
                "agent socket unavailable".into(),
            ));
        }

        match queue.dequeue(DEFAULT_DEQUEUE_TIMEOUT).await {
            Ok(RelayEvent::Error { status, message }) => {
                last_status = status.unwrap_or(502);
                last_message = message;
                warn!(
                    target: "pipeline",
                    attempt,
                    status = last_status,
                    request_id = %request.request_id,
                    "upstream error frame"
                );
            }
            Ok(RelayEvent::Headers { status, headers }) if status >= 400 => {
                last_status = status;
                last_message = format!("upstream responded {status}");
                warn!(
                    target: "pipeline",
                    attempt,
                    status,
                    request_id = %request.request_id,
                    "upstream error status"
                );
                let _ = headers;
            }
            Ok(first) => {
                state.switcher.record_success();
                return Ok(Dispatched {
                    first,
                    queue,
                    identity,
                    guard: RequestGuard::new(state.clone(), request.request_id.clone()),
                });
            }
            Err(QueueError::Timeout) => {
                // No frame within the idle window: synthesize a 504 and
                // treat it as a normal failed attempt.
                last_status = 504;
                last_message = "upstream idle timeout".into();
                warn!(target: "pipeline", attempt, request_id = %request.request_id, "attempt timed out");
            }
            Err(QueueError::Closed(reason)) => {
                // The connection died under us; retrying now would only race
                // recovery, and the identity is not at fault.
                info!(
                    target: "pipeline",
                    %reason,
                    request_id = %request.request_id,
                    "queue closed mid-attempt; aborting retries"
                );
                return Err(PipelineError::Unavailable(format!(
                    "connection lost ({reason})"
                )));
            }
        }

        disposition = state.switcher.record_failure(Some(last_status));
        immediate = cfg.immediate_switch_status_codes.contains(&last_status);
        if immediate {
            break;
        }
        if attempt == max_retries {
            break;
        }

        // Cancel on the identity this attempt was dispatched to; it may
        // differ from the one the next attempt lands on.
        let _ = state.registry.send_to(
            identity,
            ServerFrame::CancelRequest {
                request_id: request.request_id.0.clone(),
            },
        );
        state
            .registry
            .remove_queue(&request.request_id, CloseReason::RetryCreatingNewQueue);
        let now_current = state.switcher.current().unwrap_or(identity);
        queue = state
            .registry
            .create_queue(request.request_id.clone(), now_current);
        sleep(cfg.retry_delay).await;
    }

    state
        .registry
        .remove_queue(&request.request_id, CloseReason::Unknown);

    if immediate || disposition == FailureDisposition::Rotate {
        let switcher = Arc::clone(&state.switcher);
        tokio::spawn(async move {
            if let Err(err) = switcher.switch_to_next().await {
                warn!(target: "pipeline", %err, "post-failure rotation failed");
            }
        });
    }

    if immediate {
        Err(PipelineError::Unavailable(format!(
            "upstream returned {last_status}; rotating identity"
        )))
    } else {
        Err(PipelineError::Upstream {
            status: last_status,
            message: last_message,
        })
    }
}

/// Make sure an identity with a live socket is active, driving recovery
/// when it is not.
async fn ensure_ready(state: &GatewayState) -> Result<(), PipelineError> {
    if let Some(current) = state.switcher.current() {
        if state.registry.has_socket(current) {
            return Ok(());
        }
    }

    recover(state).await?;

    if !state.switcher.wait_until_idle(BUSY_WAIT).await {
        return Err(PipelineError::Unavailable(
            "a switch or recovery is taking too long".into(),
        ));
    }
    let current = state
        .switcher
        .current()
        .ok_or_else(|| PipelineError::Unavailable("no identity active".into()))?;
    if state.registry.wait_for_socket(current, SOCKET_WAIT).await {
        Ok(())
    } else {
        Err(PipelineError::Unavailable(
            "agent socket did not come up".into(),
        ))
    }
}

async fn recover(state: &GatewayState) -> Result<(), PipelineError> {
    // A socket dropped moments ago may simply come back; wait out the grace
    // window before doing anything drastic.
    if state.registry.grace_active() || state.registry.recovery_in_progress() {
        if let Some(current) = state.switcher.current() {
            if state
                .registry
                .wait_for_socket(current, RECONNECT_WAIT)
                .await
            {
                return Ok(());
            }
        }
    }

    if state.switcher.rotation_len() == 0 {
        return Err(PipelineError::Unavailable("no accounts configured".into()));
    }

    if !state.fleet.browser_started() {
        // First start: rotation picks the first viable identity.
        info!(target: "pipeline", "browser not started; running first-start rotation");
        match state.switcher.switch_to_next().await {
            Ok(_) | Err(account_switcher::SwitchError::AlreadyInProgress) => return Ok(()),
            Err(account_switcher::SwitchError::Exhausted) => {
                return Err(PipelineError::Unavailable(
                    "no usable identity in the rotation".into(),
                ))
            }
        }
    }

    if let Some(current) = state.switcher.current() {
        // Direct recovery: relaunch the identity that was active, holding
        // the interlock ourselves (the one sanctioned external setter).
        if let Some(guard) = state.switcher.try_begin_recovery() {
            info!(target: "pipeline", %current, "direct recovery of current identity");
            let relaunch = state.fleet.launch_or_switch_context(current).await;
            let recovered = match relaunch {
                Ok(()) => state.registry.wait_for_socket(current, SOCKET_WAIT).await,
                Err(err) => {
                    warn!(target: "pipeline", %err, "direct recovery failed");
                    false
                }
            };
            drop(guard);
            if recovered {
                return Ok(());
            }
        }
    }

    // Fall through to rotation; a concurrent switch already in flight is
    // fine, the gate will wait on the interlock.
    match state.switcher.switch_to_next().await {
        Ok(_) | Err(account_switcher::SwitchError::AlreadyInProgress) => Ok(()),
        Err(account_switcher::SwitchError::Exhausted) => Err(PipelineError::Unavailable(
            "no usable identity in the rotation".into(),
        )),
    }
}
