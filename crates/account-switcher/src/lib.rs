//! Identity rotation state machine.
//!
//! Tracks per-identity usage and failure counters, decides when to rotate to
//! the next account, and owns the `busy` interlock that keeps concurrent
//! switches and recoveries from stacking. The switcher never touches the
//! browser directly; activation goes through the [`IdentityActivator`] seam.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;
use tokio::time::{sleep, Instant};
use tracing::{info, warn};

use connection_registry::ConnectionRegistry;
use fleetgate_core_types::AuthIndex;

/// How long to wait for the agent socket after asking for activation.
const SOCKET_WAIT: Duration = Duration::from_secs(10);

/// Poll step while waiting for the busy interlock to clear.
const IDLE_POLL: Duration = Duration::from_millis(50);

#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum SwitchError {
    /// Another switch or recovery holds the interlock.
    #[error("a switch or recovery is already in progress")]
    AlreadyInProgress,
    /// Every identity in the rotation failed to activate.
    #[error("no usable identity in the rotation")]
    Exhausted,
}

/// Brings an identity from cold state to "agent socket live".
#[async_trait]
pub trait IdentityActivator: Send + Sync {
    async fn activate(&self, target: AuthIndex) -> anyhow::Result<()>;
}

#[derive(Clone, Debug)]
pub struct RotationEntry {
    pub auth_index: AuthIndex,
    pub email: Option<String>,
}

#[derive(Clone, Debug)]
pub struct SwitcherConfig {
    /// Rotate after this many generative uses; 0 disables usage rotation.
    pub switch_on_uses: u32,
    /// Rotate after this many consecutive failures; 0 disables.
    pub failure_threshold: u32,
    /// Upstream statuses that rotate immediately, without burning retries.
    pub immediate_switch_status_codes: Vec<u16>,
    pub max_retries: u32,
    pub retry_delay: Duration,
}

impl Default for SwitcherConfig {
    fn default() -> Self {
        Self {
            switch_on_uses: 0,
            failure_threshold: 3,
            immediate_switch_status_codes: vec![429, 403],
            max_retries: 3,
            retry_delay: Duration::from_secs(2),
        }
    }
}

/// What the attempt loop should do about a recorded failure.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FailureDisposition {
    /// Keep retrying on the current identity.
    Tolerate,
    /// Rotate to the next identity.
    Rotate,
}

/// Clears the busy interlock when dropped, so every exit path of a switch
/// releases it.
pub struct BusyGuard {
    busy: Arc<AtomicBool>,
}

impl Drop for BusyGuard {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
    }
}

pub struct AccountSwitcher {
    cfg: SwitcherConfig,
    rotation: Vec<RotationEntry>,
    current: RwLock<Option<AuthIndex>>,
    usage_count: AtomicU32,
    failure_count: AtomicU32,
    busy: Arc<AtomicBool>,
    needs_switch: AtomicBool,
    socket_wait: Duration,
    activator: Arc<dyn IdentityActivator>,
    registry: Arc<ConnectionRegistry>,
}

impl AccountSwitcher {
    pub fn new(
        cfg: SwitcherConfig,
        rotation: Vec<RotationEntry>,
        activator: Arc<dyn IdentityActivator>,
        registry: Arc<ConnectionRegistry>,
    ) -> Self {
        Self {
            cfg,
            rotation: dedupe_by_email(rotation),
            current: RwLock::new(None),
            usage_count: AtomicU32::new(0),
            failure_count: AtomicU32::new(0),
            busy: Arc::new(AtomicBool::new(false)),
            needs_switch: AtomicBool::new(false),
            socket_wait: SOCKET_WAIT,
            activator,
            registry,
        }
    }

    #[doc(hidden)]
    pub fn with_socket_wait(mut self, wait: Duration) -> Self {
        self.socket_wait = wait;
        self
    }

    pub fn config(&self) -> &SwitcherConfig {
        &self.cfg
    }

    pub fn current(&self) -> Option<AuthIndex> {
        *self.current.read()
    }

    pub fn usage_count(&self) -> u32 {
        self.usage_count.load(Ordering::SeqCst)
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count.load(Ordering::SeqCst)
    }

    pub fn rotation_len(&self) -> usize {
        self.rotation.len()
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    /// Count one generative request. Returns the new count and flags a
    /// deferred rotation once the configured quota is reached; the actual
    /// switch happens in the request finalizer.
    pub fn increment_usage(&self) -> u32 {
        let count = self.usage_count.fetch_add(1, Ordering::SeqCst) + 1;
        if self.cfg.switch_on_uses > 0 && count >= self.cfg.switch_on_uses {
            self.needs_switch.store(true, Ordering::SeqCst);
        }
        count
    }

    /// Consume the deferred-rotation flag.
    pub fn take_pending_switch(&self) -> bool {
        self.needs_switch.swap(false, Ordering::SeqCst)
    }

    /// An attempt delivered its first frame; the identity is healthy.
    pub fn record_success(&self) {
        self.failure_count.store(0, Ordering::SeqCst);
    }

    /// Record a failed attempt and decide whether to rotate.
    pub fn record_failure(&self, status: Option<u16>) -> FailureDisposition {
        let count = self.failure_count.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some(status) = status {
            if self.cfg.immediate_switch_status_codes.contains(&status) {
                info!(target: "switcher", status, "immediate-switch status");
                return FailureDisposition::Rotate;
            }
        }
        if self.cfg.failure_threshold > 0 && count >= self.cfg.failure_threshold {
            info!(target: "switcher", count, "failure threshold reached");
            return FailureDisposition::Rotate;
        }
        FailureDisposition::Tolerate
    }

    /// Acquire the busy interlock for the pipeline's direct-recovery path,
    /// the only sanctioned setter outside the switch methods.
    pub fn try_begin_recovery(&self) -> Option<BusyGuard> {
        self.acquire_busy().ok()
    }

    /// Poll until the interlock clears or the deadline passes.
    pub async fn wait_until_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.is_busy() {
            if Instant::now() >= deadline {
                return false;
            }
            sleep(IDLE_POLL).await;
        }
        true
    }

    /// Advance the rotation, starting after the current identity, and
    /// activate the first account that comes up with a live socket. On
    /// total failure the active identity is cleared.
    pub async fn switch_to_next(&self) -> Result<AuthIndex, SwitchError> {
        let _guard = self.acquire_busy()?;

        if self.rotation.is_empty() {
            return Err(SwitchError::Exhausted);
        }

        let n = self.rotation.len();
        let start = self
            .current()
            .and_then(|current| {
                self.rotation
                    .iter()
                    .position(|entry| entry.auth_index == current)
            })
            .map(|pos| pos + 1)
            .unwrap_or(0);

        for step in 0..n {
            let entry = &self.rotation[(start + step) % n];
            match self.try_activate(entry).await {
                Ok(()) => {
                    self.install_current(entry.auth_index);
                    return Ok(entry.auth_index);
                }
                Err(err) => {
                    warn!(
                        target: "switcher",
                        auth_index = %entry.auth_index,
                        %err,
                        "rotation candidate failed"
                    );
                }
            }
        }

        *self.current.write() = None;
        warn!(target: "switcher", "rotation exhausted; no identity active");
        Err(SwitchError::Exhausted)
    }

    /// Activate one specific identity, without rotating on failure.
    pub async fn switch_to_specific(&self, target: AuthIndex) -> Result<(), SwitchError> {
        let _guard = self.acquire_busy()?;

        let entry = self
            .rotation
            .iter()
            .find(|entry| entry.auth_index == target)
            .cloned()
            .unwrap_or(RotationEntry {
                auth_index: target,
                email: None,
            });
        match self.try_activate(&entry).await {
            Ok(()) => {
                self.install_current(target);
                Ok(())
            }
            Err(err) => {
                warn!(target: "switcher", auth_index = %target, %err, "specific switch failed");
                Err(SwitchError::Exhausted)
            }
        }
    }

    async fn try_activate(&self, entry: &RotationEntry) -> anyhow::Result<()> {
        self.activator.activate(entry.auth_index).await?;
        if self
            .registry
            .wait_for_socket(entry.auth_index, self.socket_wait)
            .await
        {
            Ok(())
        } else {
            anyhow::bail!("agent socket did not appear for identity {}", entry.auth_index)
        }
    }

    fn install_current(&self, auth_index: AuthIndex) {
        *self.current.write() = Some(auth_index);
        self.usage_count.store(0, Ordering::SeqCst);
        self.failure_count.store(0, Ordering::SeqCst);
        self.needs_switch.store(false, Ordering::SeqCst);
        info!(target: "switcher", %auth_index, "identity active");
    }

    fn acquire_busy(&self) -> Result<BusyGuard, SwitchError> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(SwitchError::AlreadyInProgress);
        }
        Ok(BusyGuard {
            busy: Arc::clone(&self.busy),
        })
    }
}

fn dedupe_by_email(rotation: Vec<RotationEntry>) -> Vec<RotationEntry> {
    let mut seen = Vec::new();
    let mut out = Vec::with_capacity(rotation.len());
    for entry in rotation {
        if let Some(email) = entry.email.as_deref() {
            let key = email.trim().to_ascii_lowercase();
            if seen.contains(&key) {
                continue;
            }
            seen.push(key);
        }
        out.push(entry);
    }
    out
}

#[cfg(test)]
mod tests {
    use dashmap::DashSet;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use connection_registry::AgentSocket;

    use super::*;

    /// Activator that succeeds for a configured set of identities and, on
    /// success, registers a socket so the registry wait resolves.
    struct ScriptedActivator {
        healthy: DashSet<u32>,
        registry: Arc<ConnectionRegistry>,
        log: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl IdentityActivator for ScriptedActivator {
        async fn activate(&self, target: AuthIndex) -> anyhow::Result<()> {
            self.log.lock().push(target.0);
            if !self.healthy.contains(&target.0) {
                anyhow::bail!("activation failed");
            }
            let (tx, rx) = mpsc::unbounded_channel();
            std::mem::forget(rx);
            self.registry.on_socket_open(AgentSocket::new(target, tx));
            Ok(())
        }
    }

    fn harness(healthy: &[u32], entries: &[(u32, Option<&str>)]) -> (Arc<AccountSwitcher>, Arc<ScriptedActivator>) {
        let registry = Arc::new(ConnectionRegistry::new());
        let activator = Arc::new(ScriptedActivator {
            healthy: healthy.iter().copied().collect(),
            registry: Arc::clone(&registry),
            log: Mutex::new(Vec::new()),
        });
        let rotation = entries
            .iter()
            .map(|(i, email)| RotationEntry {
                auth_index: AuthIndex(*i),
                email: email.map(|s| s.to_string()),
            })
            .collect();
        let switcher = AccountSwitcher::new(
            SwitcherConfig {
                switch_on_uses: 3,
                failure_threshold: 2,
                immediate_switch_status_codes: vec![429],
                max_retries: 3,
                retry_delay: Duration::from_millis(10),
            },
            rotation,
            Arc::clone(&activator) as Arc<dyn IdentityActivator>,
            registry,
        )
        .with_socket_wait(Duration::from_millis(300));
        (Arc::new(switcher), activator)
    }

    #[tokio::test]
    async fn usage_quota_flags_one_deferred_switch() {
        let (switcher, _) = harness(&[0], &[(0, None)]);
        assert_eq!(switcher.increment_usage(), 1);
        assert!(!switcher.take_pending_switch());
        switcher.increment_usage();
        assert_eq!(switcher.increment_usage(), 3);
        assert!(switcher.take_pending_switch());
        // Consumed: a second read does not schedule another rotation.
        assert!(!switcher.take_pending_switch());
    }

    #[tokio::test]
    async fn failure_threshold_rotates_and_success_resets() {
        let (switcher, _) = harness(&[0], &[(0, None)]);
        assert_eq!(switcher.record_failure(Some(500)), FailureDisposition::Tolerate);
        switcher.record_success();
        assert_eq!(switcher.record_failure(Some(500)), FailureDisposition::Tolerate);
        assert_eq!(switcher.record_failure(Some(502)), FailureDisposition::Rotate);
    }

    #[tokio::test]
    async fn immediate_status_rotates_on_first_failure() {
        let (switcher, _) = harness(&[0], &[(0, None)]);
        assert_eq!(switcher.record_failure(Some(429)), FailureDisposition::Rotate);
    }

    #[tokio::test]
    async fn rotation_skips_broken_identities() {
        let (switcher, activator) = harness(&[2], &[(0, None), (1, None), (2, None)]);
        let chosen = switcher.switch_to_next().await.unwrap();
        assert_eq!(chosen, AuthIndex(2));
        assert_eq!(*activator.log.lock(), vec![0, 1, 2]);
        assert_eq!(switcher.current(), Some(AuthIndex(2)));
    }

    #[tokio::test]
    async fn rotation_starts_after_current() {
        let (switcher, activator) = harness(&[0, 1, 2], &[(0, None), (1, None), (2, None)]);
        switcher.switch_to_next().await.unwrap();
        assert_eq!(switcher.current(), Some(AuthIndex(0)));
        switcher.switch_to_next().await.unwrap();
        assert_eq!(switcher.current(), Some(AuthIndex(1)));
        assert_eq!(*activator.log.lock(), vec![0, 1]);
    }

    #[tokio::test]
    async fn exhaustion_clears_current_identity() {
        let (switcher, _) = harness(&[], &[(0, None), (1, None)]);
        let err = switcher.switch_to_next().await.unwrap_err();
        assert_eq!(err, SwitchError::Exhausted);
        assert_eq!(switcher.current(), None);
    }

    #[tokio::test]
    async fn busy_interlock_rejects_concurrent_switch() {
        let (switcher, _) = harness(&[0], &[(0, None)]);
        let _guard = switcher.try_begin_recovery().expect("interlock free");
        assert!(switcher.is_busy());
        assert_eq!(
            switcher.switch_to_next().await.unwrap_err(),
            SwitchError::AlreadyInProgress
        );
        drop(_guard);
        assert!(!switcher.is_busy());
        switcher.switch_to_next().await.unwrap();
    }

    #[tokio::test]
    async fn rotation_deduplicates_by_email() {
        let (switcher, _) = harness(
            &[0],
            &[
                (0, Some("user@example.com")),
                (1, Some("USER@example.com ")),
                (2, Some("other@example.com")),
            ],
        );
        assert_eq!(switcher.rotation_len(), 2);
    }
}
