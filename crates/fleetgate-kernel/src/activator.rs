//! Adapter from the switcher's activation seam onto the fleet manager.

use std::sync::Arc;

use async_trait::async_trait;

use account_switcher::IdentityActivator;
use browser_fleet::FleetManager;
use fleetgate_core_types::AuthIndex;

pub struct FleetActivator {
    fleet: Arc<FleetManager>,
}

impl FleetActivator {
    pub fn new(fleet: Arc<FleetManager>) -> Self {
        Self { fleet }
    }
}

#[async_trait]
impl IdentityActivator for FleetActivator {
    async fn activate(&self, target: AuthIndex) -> anyhow::Result<()> {
        self.fleet.launch_or_switch_context(target).await?;
        Ok(())
    }
}
