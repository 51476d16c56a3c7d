//! Fleet error taxonomy.

use std::fmt;

use thiserror::Error;

use fleetgate_core_types::AuthIndex;

/// Where an activation attempt gave up.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ActivationStage {
    BrowserLaunch,
    ContextSetup,
    Navigation,
    PopupSweep,
    EditorLoad,
    RemixDialog,
    CodePanel,
    Paste,
    Preview,
    AgentInit,
    SocketWait,
}

impl ActivationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivationStage::BrowserLaunch => "browser_launch",
            ActivationStage::ContextSetup => "context_setup",
            ActivationStage::Navigation => "navigation",
            ActivationStage::PopupSweep => "popup_sweep",
            ActivationStage::EditorLoad => "editor_load",
            ActivationStage::RemixDialog => "remix_dialog",
            ActivationStage::CodePanel => "code_panel",
            ActivationStage::Paste => "paste",
            ActivationStage::Preview => "preview",
            ActivationStage::AgentInit => "agent_init",
            ActivationStage::SocketWait => "socket_wait",
        }
    }
}

impl fmt::Display for ActivationStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("activation failed at {stage}: {message}")]
    ActivationFailed {
        stage: ActivationStage,
        message: String,
    },
    #[error("login redirect detected; stored credentials have expired")]
    CredentialExpired,
    #[error("upstream region block detected")]
    RegionBlocked,
    #[error("upstream returned 403 for the app page")]
    Forbidden,
    #[error("page did not load")]
    LoadFailed,
    #[error("saved app link no longer exists")]
    PageNotFound,
    #[error("identity {0} is not configured")]
    UnknownIdentity(AuthIndex),
    #[error("cdp transport failure: {0}")]
    Transport(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl FleetError {
    pub fn activation(stage: ActivationStage, message: impl Into<String>) -> Self {
        Self::ActivationFailed {
            stage,
            message: message.into(),
        }
    }

    pub fn transport(err: impl fmt::Display) -> Self {
        Self::Transport(err.to_string())
    }
}
