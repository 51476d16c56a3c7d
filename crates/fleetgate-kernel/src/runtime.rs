//! Wiring: construct the subsystems and connect the recovery paths.

use std::sync::Arc;

use anyhow::Context;
use tracing::{info, warn};

use account_switcher::{AccountSwitcher, RotationEntry};
use browser_fleet::{ChromeTransport, FleetConfig, FleetManager};
use connection_registry::ConnectionRegistry;

use crate::activator::FleetActivator;
use crate::config::GatewayConfig;
use crate::models::ModelCatalog;
use crate::state::GatewayState;

/// Build a fully wired gateway state from configuration.
pub async fn bootstrap(cfg: GatewayConfig) -> anyhow::Result<GatewayState> {
    let registry = Arc::new(ConnectionRegistry::new());

    let fleet_cfg = FleetConfig {
        auth_dir: cfg.auth_dir.clone(),
        proxy_url: cfg.proxy_url.clone(),
        persist_state: cfg.enable_auth_update,
        ..FleetConfig::default()
    };
    let transport = Arc::new(ChromeTransport::new(fleet_cfg.clone()));
    let fleet = FleetManager::new(fleet_cfg, transport, Arc::clone(&registry));

    let identities = fleet
        .identities()
        .context("failed to enumerate identity files")?;
    if identities.is_empty() {
        warn!(
            target: "runtime",
            dir = %cfg.auth_dir.display(),
            "no identities configured; requests will fail until accounts are added"
        );
    } else {
        info!(target: "runtime", count = identities.len(), "identities enumerated");
    }
    let rotation: Vec<RotationEntry> = identities
        .into_iter()
        .map(|record| RotationEntry {
            auth_index: record.auth_index,
            email: record.email,
        })
        .collect();

    let activator = Arc::new(FleetActivator::new(Arc::clone(&fleet)));
    let switcher = Arc::new(AccountSwitcher::new(
        cfg.switcher.clone(),
        rotation,
        activator,
        Arc::clone(&registry),
    ));

    let models = Arc::new(ModelCatalog::load(&cfg.models_path));
    if models.is_empty() {
        warn!(target: "runtime", path = %cfg.models_path.display(), "model catalog is empty");
    }

    let state = GatewayState {
        cfg: Arc::new(cfg),
        registry: Arc::clone(&registry),
        switcher,
        fleet,
        models,
    };

    install_recovery_hook(&state);
    Ok(state)
}

/// When the grace window elapses with no agent socket, try to relaunch the
/// identity that was active; if that fails, advance the rotation.
fn install_recovery_hook(state: &GatewayState) {
    let hook_state = state.clone();
    state
        .registry
        .set_connection_lost_hook(Arc::new(move || {
            let state = hook_state.clone();
            Box::pin(async move {
                warn!(target: "runtime", "agent session lost; starting recovery");

                if let Some(current) = state.switcher.current() {
                    if let Some(guard) = state.switcher.try_begin_recovery() {
                        let relaunched = state.fleet.launch_or_switch_context(current).await;
                        drop(guard);
                        match relaunched {
                            Ok(()) => {
                                info!(target: "runtime", %current, "recovered current identity");
                                return;
                            }
                            Err(err) => {
                                warn!(target: "runtime", %err, "direct relaunch failed; rotating");
                            }
                        }
                    }
                }

                if let Err(err) = state.switcher.switch_to_next().await {
                    warn!(target: "runtime", %err, "recovery rotation failed");
                }
            })
        }));
}
