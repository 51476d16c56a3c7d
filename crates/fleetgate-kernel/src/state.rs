//! Shared handler state.

use std::sync::Arc;

use account_switcher::AccountSwitcher;
use browser_fleet::FleetManager;
use connection_registry::ConnectionRegistry;

use crate::config::GatewayConfig;
use crate::models::ModelCatalog;

#[derive(Clone)]
pub struct GatewayState {
    pub cfg: Arc<GatewayConfig>,
    pub registry: Arc<ConnectionRegistry>,
    pub switcher: Arc<AccountSwitcher>,
    pub fleet: Arc<FleetManager>,
    pub models: Arc<ModelCatalog>,
}
