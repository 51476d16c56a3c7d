//! Registry bridging inbound HTTP requests and the browser-side agents.
//!
//! Holds the identity→socket bindings and the request-id→queue table, routes
//! incoming agent frames onto the owning queue, and runs the reconnection
//! grace window: when the last agent socket drops, outstanding queues are
//! preserved for a grace period before the session is declared lost and the
//! recovery callback fires.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use agent_protocol::{AgentFrame, RelayEvent, ServerFrame};
use fleetgate_core_types::{AuthIndex, CloseReason, RequestId};
use frame_queue::FrameQueue;

/// Grace period after the last socket drops before queues are cancelled.
pub const GRACE_PERIOD: Duration = Duration::from_secs(60);

/// Poll step for socket-presence waits.
const SOCKET_POLL: Duration = Duration::from_millis(50);

pub type RelayQueue = FrameQueue<RelayEvent>;

/// Invoked once per lost session, after the grace window elapses with no
/// socket returning. The callback may restart the browser and reopen
/// sockets; a re-entrancy guard keeps it from stacking.
pub type ConnectionLostHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

#[derive(Clone, Debug, Error)]
pub enum RegistryError {
    #[error("no agent socket for identity {0}")]
    NoSocket(AuthIndex),
    #[error("agent socket for identity {0} is closed")]
    SocketClosed(AuthIndex),
}

/// Handle to one live agent WebSocket. Frames pushed here are written by the
/// owning connection task.
#[derive(Clone)]
pub struct AgentSocket {
    pub auth_index: AuthIndex,
    pub socket_id: Uuid,
    sender: mpsc::UnboundedSender<ServerFrame>,
}

impl AgentSocket {
    pub fn new(auth_index: AuthIndex, sender: mpsc::UnboundedSender<ServerFrame>) -> Self {
        Self {
            auth_index,
            socket_id: Uuid::new_v4(),
            sender,
        }
    }

    pub fn send(&self, frame: ServerFrame) -> Result<(), RegistryError> {
        self.sender
            .send(frame)
            .map_err(|_| RegistryError::SocketClosed(self.auth_index))
    }
}

struct QueueEntry {
    queue: Arc<RelayQueue>,
    identity: AuthIndex,
}

pub struct ConnectionRegistry {
    connections: DashMap<AuthIndex, AgentSocket>,
    queues: DashMap<RequestId, QueueEntry>,
    grace_timer: Mutex<Option<JoinHandle<()>>>,
    grace_period: Duration,
    /// Latched when the grace window elapsed; the next socket open drops all
    /// queues that predate it (they belong to a dead page session).
    session_lost: AtomicBool,
    /// Re-entrancy guard for the lost hook.
    recovery_running: Arc<AtomicBool>,
    lost_hook: RwLock<Option<ConnectionLostHook>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::with_grace_period(GRACE_PERIOD)
    }

    pub fn with_grace_period(grace_period: Duration) -> Self {
        Self {
            connections: DashMap::new(),
            queues: DashMap::new(),
            grace_timer: Mutex::new(None),
            grace_period,
            session_lost: AtomicBool::new(false),
            recovery_running: Arc::new(AtomicBool::new(false)),
            lost_hook: RwLock::new(None),
        }
    }

    /// Install the session-loss callback. Expected once, at wiring time.
    pub fn set_connection_lost_hook(&self, hook: ConnectionLostHook) {
        *self.lost_hook.write() = Some(hook);
    }

    /// A new agent socket reached the server.
    pub fn on_socket_open(&self, socket: AgentSocket) {
        self.cancel_grace_timer();

        if self.session_lost.swap(false, Ordering::SeqCst) {
            // The previous session was declared lost; anything still queued
            // was dispatched into a page that no longer exists.
            let dropped = self.close_all_queues(CloseReason::ConnectionLost);
            if dropped > 0 {
                info!(
                    target: "registry",
                    dropped,
                    "dropped stale queues from previous session"
                );
            }
        }

        let auth_index = socket.auth_index;
        let socket_id = socket.socket_id;
        self.connections.insert(auth_index, socket);
        info!(target: "registry", %auth_index, %socket_id, "agent socket registered");
    }

    /// A socket closed. Ignored when a newer socket already displaced the
    /// binding. Starts the grace window when no socket remains.
    pub fn on_socket_close(self: &Arc<Self>, auth_index: AuthIndex, socket_id: Uuid) {
        let removed = self
            .connections
            .remove_if(&auth_index, |_, socket| socket.socket_id == socket_id)
            .is_some();
        if !removed {
            debug!(target: "registry", %auth_index, "stale socket close ignored");
            return;
        }
        info!(target: "registry", %auth_index, "agent socket closed");

        if self.connections.is_empty() {
            self.start_grace_timer();
        }
    }

    /// Route one agent frame to the queue owning its request id. Frames for
    /// unknown ids (late arrivals after finalization) are dropped.
    pub fn on_frame(&self, frame: AgentFrame) {
        let (request_id, event) = frame.into_event();
        match self.queues.get(&request_id) {
            Some(entry) => entry.queue.enqueue(event),
            None => {
                debug!(target: "registry", %request_id, "frame for unknown request dropped")
            }
        }
    }

    /// Create the queue for a request, bound to the identity that will serve
    /// it. An existing queue under the same id is closed with
    /// `ReplacedOnRetry` and replaced.
    pub fn create_queue(&self, request_id: RequestId, identity: AuthIndex) -> Arc<RelayQueue> {
        let queue = Arc::new(RelayQueue::new());
        let entry = QueueEntry {
            queue: Arc::clone(&queue),
            identity,
        };
        if let Some(prior) = self.queues.insert(request_id, entry) {
            prior.queue.close(CloseReason::ReplacedOnRetry);
        }
        queue
    }

    pub fn remove_queue(&self, request_id: &RequestId, reason: CloseReason) {
        if let Some((_, entry)) = self.queues.remove(request_id) {
            entry.queue.close(reason);
        }
    }

    /// Identity currently bound to a request id. Retries may rebind a
    /// request to a different identity than the one that started it.
    pub fn identity_for_request(&self, request_id: &RequestId) -> Option<AuthIndex> {
        self.queues.get(request_id).map(|entry| entry.identity)
    }

    pub fn socket_for(&self, auth_index: AuthIndex) -> Option<AgentSocket> {
        self.connections.get(&auth_index).map(|s| s.clone())
    }

    pub fn has_socket(&self, auth_index: AuthIndex) -> bool {
        self.connections.contains_key(&auth_index)
    }

    pub fn send_to(&self, auth_index: AuthIndex, frame: ServerFrame) -> Result<(), RegistryError> {
        self.socket_for(auth_index)
            .ok_or(RegistryError::NoSocket(auth_index))?
            .send(frame)
    }

    /// Send a frame to every connected agent.
    pub fn broadcast(&self, frame: &ServerFrame) {
        for socket in self.connections.iter() {
            if socket.send(frame.clone()).is_err() {
                warn!(
                    target: "registry",
                    auth_index = %socket.auth_index,
                    "broadcast to closed socket"
                );
            }
        }
    }

    pub fn connected_identities(&self) -> Vec<AuthIndex> {
        self.connections.iter().map(|s| *s.key()).collect()
    }

    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// True while the grace timer is running (a socket recently dropped and
    /// may still come back).
    pub fn grace_active(&self) -> bool {
        self.grace_timer
            .lock()
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    /// True while the session-loss callback is running (a reconnection is
    /// being driven externally).
    pub fn recovery_in_progress(&self) -> bool {
        self.recovery_running.load(Ordering::SeqCst)
    }

    /// Poll until a socket for `auth_index` exists or the deadline passes.
    pub async fn wait_for_socket(&self, auth_index: AuthIndex, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.has_socket(auth_index) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            sleep(SOCKET_POLL).await;
        }
    }

    fn cancel_grace_timer(&self) {
        if let Some(handle) = self.grace_timer.lock().take() {
            handle.abort();
        }
    }

    fn start_grace_timer(self: &Arc<Self>) {
        let mut guard = self.grace_timer.lock();
        if guard.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }
        let registry = Arc::clone(self);
        let period = self.grace_period;
        *guard = Some(tokio::spawn(async move {
            sleep(period).await;
            registry.declare_session_lost().await;
        }));
        info!(
            target: "registry",
            grace_secs = self.grace_period.as_secs(),
            "grace window started"
        );
    }

    async fn declare_session_lost(self: Arc<Self>) {
        if !self.connections.is_empty() {
            return;
        }
        self.session_lost.store(true, Ordering::SeqCst);
        let closed = self.close_all_queues(CloseReason::ConnectionLost);
        warn!(
            target: "registry",
            closed,
            "grace window elapsed with no socket; session lost"
        );

        let hook = self.lost_hook.read().clone();
        if let Some(hook) = hook {
            // The hook may itself restart the browser and reopen sockets;
            // never stack invocations.
            if self
                .recovery_running
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                let guard = Arc::clone(&self.recovery_running);
                hook().await;
                guard.store(false, Ordering::SeqCst);
            } else {
                debug!(target: "registry", "session-lost hook already running; skipped");
            }
        }
    }

    fn close_all_queues(&self, reason: CloseReason) -> usize {
        let ids: Vec<RequestId> = self.queues.iter().map(|e| e.key().clone()).collect();
        let count = ids.len();
        for id in ids {
            self.remove_queue(&id, reason);
        }
        count
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use frame_queue::QueueError;

    use super::*;

    fn socket(auth: u32) -> (AgentSocket, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (AgentSocket::new(AuthIndex(auth), tx), rx)
    }

    #[tokio::test]
    async fn frames_route_to_owning_queue() {
        let registry = Arc::new(ConnectionRegistry::new());
        let id = RequestId::new();
        let queue = registry.create_queue(id.clone(), AuthIndex(0));

        registry.on_frame(AgentFrame::Chunk {
            request_id: id.0.clone(),
            data: "hello".into(),
        });
        registry.on_frame(AgentFrame::StreamClose {
            request_id: id.0.clone(),
        });

        assert_eq!(
            queue.dequeue(Duration::from_millis(50)).await,
            Ok(RelayEvent::Chunk {
                data: "hello".into()
            })
        );
        assert_eq!(
            queue.dequeue(Duration::from_millis(50)).await,
            Ok(RelayEvent::StreamEnd)
        );
    }

    #[tokio::test]
    async fn unknown_request_frames_are_dropped() {
        let registry = Arc::new(ConnectionRegistry::new());
        registry.on_frame(AgentFrame::StreamClose {
            request_id: "nobody".into(),
        });
        assert_eq!(registry.queue_count(), 0);
    }

    #[tokio::test]
    async fn create_queue_replaces_and_releases_prior_waiter() {
        let registry = Arc::new(ConnectionRegistry::new());
        let id = RequestId::new();
        let first = registry.create_queue(id.clone(), AuthIndex(0));

        let waiter = {
            let first = Arc::clone(&first);
            tokio::spawn(async move { first.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        let _second = registry.create_queue(id.clone(), AuthIndex(1));
        assert_eq!(
            waiter.await.unwrap(),
            Err(QueueError::Closed(CloseReason::ReplacedOnRetry))
        );
        assert_eq!(registry.identity_for_request(&id), Some(AuthIndex(1)));
    }

    #[tokio::test]
    async fn reconnect_within_grace_preserves_queues() {
        let registry = Arc::new(ConnectionRegistry::with_grace_period(
            Duration::from_millis(200),
        ));
        let hook_calls = Arc::new(AtomicUsize::new(0));
        {
            let hook_calls = Arc::clone(&hook_calls);
            registry.set_connection_lost_hook(Arc::new(move || {
                let hook_calls = Arc::clone(&hook_calls);
                Box::pin(async move {
                    hook_calls.fetch_add(1, Ordering::SeqCst);
                })
            }));
        }

        let (sock, _rx) = socket(0);
        let socket_id = sock.socket_id;
        registry.on_socket_open(sock);
        let queue = registry.create_queue(RequestId::new(), AuthIndex(0));

        registry.on_socket_close(AuthIndex(0), socket_id);
        assert!(registry.grace_active());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let (sock2, _rx2) = socket(0);
        registry.on_socket_open(sock2);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!queue.is_closed());
        assert_eq!(hook_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn grace_expiry_closes_queues_and_fires_hook_once() {
        let registry = Arc::new(ConnectionRegistry::with_grace_period(
            Duration::from_millis(50),
        ));
        let hook_calls = Arc::new(AtomicUsize::new(0));
        {
            let hook_calls = Arc::clone(&hook_calls);
            registry.set_connection_lost_hook(Arc::new(move || {
                let hook_calls = Arc::clone(&hook_calls);
                Box::pin(async move {
                    hook_calls.fetch_add(1, Ordering::SeqCst);
                })
            }));
        }

        let (sock, _rx) = socket(0);
        let socket_id = sock.socket_id;
        registry.on_socket_open(sock);
        let queue = registry.create_queue(RequestId::new(), AuthIndex(0));

        registry.on_socket_close(AuthIndex(0), socket_id);
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(queue.close_reason(), Some(CloseReason::ConnectionLost));
        assert_eq!(hook_calls.load(Ordering::SeqCst), 1);
        assert_eq!(registry.queue_count(), 0);
    }

    #[tokio::test]
    async fn open_after_lost_session_drops_stale_queues() {
        let registry = Arc::new(ConnectionRegistry::with_grace_period(
            Duration::from_millis(30),
        ));
        let (sock, _rx) = socket(0);
        let socket_id = sock.socket_id;
        registry.on_socket_open(sock);

        registry.on_socket_close(AuthIndex(0), socket_id);
        tokio::time::sleep(Duration::from_millis(100)).await;

        // A request raced in while the session was already lost.
        let stale = registry.create_queue(RequestId::new(), AuthIndex(0));
        let (sock2, _rx2) = socket(0);
        registry.on_socket_open(sock2);

        assert_eq!(stale.close_reason(), Some(CloseReason::ConnectionLost));
        assert_eq!(registry.queue_count(), 0);
    }

    #[tokio::test]
    async fn stale_socket_close_does_not_unbind_newer_socket() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (old, _rx1) = socket(0);
        let old_id = old.socket_id;
        registry.on_socket_open(old);
        let (new, _rx2) = socket(0);
        registry.on_socket_open(new);

        registry.on_socket_close(AuthIndex(0), old_id);
        assert!(registry.has_socket(AuthIndex(0)));
        assert!(!registry.grace_active());
    }
}
