//! Fleet configuration and browser executable discovery.

use std::env;
use std::path::{Path, PathBuf};

use which::which;

/// Canonical URL of the upstream app builder when an identity has no saved
/// deep link yet.
pub const DEFAULT_APP_URL: &str = "https://aistudio.google.com/apps";

#[derive(Clone, Debug)]
pub struct FleetConfig {
    pub executable: PathBuf,
    pub user_data_dir: PathBuf,
    /// Directory holding `auth-<i>.json` identity state files.
    pub auth_dir: PathBuf,
    pub headless: bool,
    /// Forward browser traffic through this proxy (`--proxy-server`).
    pub proxy_url: Option<String>,
    /// Blank-app URL used when an identity has no saved deep link.
    pub app_url: String,
    /// Port the in-page agent connects back to.
    pub agent_ws_port: u16,
    /// Write refreshed cookies back to the identity files.
    pub persist_state: bool,
    pub command_deadline_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Attach to an already-running browser instead of launching one.
    pub websocket_url: Option<String>,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            executable: detect_executable().unwrap_or_default(),
            user_data_dir: default_profile_dir(),
            auth_dir: PathBuf::from("configs/auth"),
            headless: resolve_headless_default(),
            proxy_url: env_nonempty("FLEETGATE_PROXY_URL"),
            app_url: env_nonempty("FLEETGATE_APP_URL").unwrap_or_else(|| DEFAULT_APP_URL.into()),
            agent_ws_port: 9998,
            persist_state: true,
            command_deadline_ms: 30_000,
            heartbeat_interval_ms: 15_000,
            websocket_url: env_nonempty("FLEETGATE_BROWSER_WS"),
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    match env::var(key) {
        Ok(value) => {
            let trimmed = value.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        }
        Err(_) => None,
    }
}

fn resolve_headless_default() -> bool {
    match env::var("FLEETGATE_HEADLESS") {
        Ok(value) => {
            let lower = value.to_ascii_lowercase();
            !matches!(lower.as_str(), "0" | "false" | "no" | "off")
        }
        Err(_) => true,
    }
}

fn default_profile_dir() -> PathBuf {
    if let Some(path) = env_nonempty("FLEETGATE_PROFILE_DIR") {
        return PathBuf::from(path);
    }
    Path::new("./.fleetgate-profile").into()
}

/// Locate a Chromium-family executable: explicit env override, then PATH,
/// then well-known install locations.
pub fn detect_executable() -> Option<PathBuf> {
    if let Some(raw) = env_nonempty("FLEETGATE_CHROME") {
        let candidate = PathBuf::from(raw);
        if candidate.exists() {
            return Some(candidate);
        }
    }

    for name in executable_names() {
        if let Ok(path) = which(name) {
            return Some(path);
        }
    }

    let skip_defaults = env::var("FLEETGATE_SKIP_OS_PATHS")
        .map(|value| !value.trim().is_empty())
        .unwrap_or(false);
    if !skip_defaults {
        for candidate in os_specific_paths() {
            if candidate.exists() {
                return Some(candidate);
            }
        }
    }

    None
}

fn executable_names() -> &'static [&'static str] {
    #[cfg(target_os = "windows")]
    {
        &["chrome.exe", "chromium.exe", "msedge.exe"]
    }

    #[cfg(not(target_os = "windows"))]
    {
        &[
            "google-chrome-stable",
            "google-chrome",
            "chromium",
            "chromium-browser",
        ]
    }
}

fn os_specific_paths() -> Vec<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        let mut paths = Vec::new();
        for key in ["PROGRAMFILES", "PROGRAMFILES(X86)", "LOCALAPPDATA"] {
            if let Ok(value) = env::var(key) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    let root = PathBuf::from(trimmed);
                    paths.push(root.join("Google/Chrome/Application/chrome.exe"));
                    paths.push(root.join("Chromium/Application/chrome.exe"));
                }
            }
        }
        paths
    }

    #[cfg(target_os = "macos")]
    {
        vec![
            PathBuf::from("/Applications/Google Chrome.app/Contents/MacOS/Google Chrome"),
            PathBuf::from("/Applications/Chromium.app/Contents/MacOS/Chromium"),
        ]
    }

    #[cfg(all(not(target_os = "windows"), not(target_os = "macos")))]
    {
        vec![
            PathBuf::from("/usr/bin/google-chrome-stable"),
            PathBuf::from("/usr/bin/google-chrome"),
            PathBuf::from("/usr/bin/chromium-browser"),
            PathBuf::from("/usr/bin/chromium"),
        ]
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn detects_from_env_override() {
        let dir = tempdir().unwrap();
        let exe = dir.path().join("my-chrome");
        fs::write(&exe, b"").unwrap();
        let original = env::var("FLEETGATE_CHROME").ok();
        env::set_var("FLEETGATE_CHROME", exe.to_string_lossy().to_string());
        let detected = detect_executable();
        if let Some(value) = original {
            env::set_var("FLEETGATE_CHROME", value);
        } else {
            env::remove_var("FLEETGATE_CHROME");
        }
        assert_eq!(detected, Some(exe));
    }

    #[test]
    fn default_config_points_at_auth_dir() {
        let cfg = FleetConfig::default();
        assert_eq!(cfg.auth_dir, PathBuf::from("configs/auth"));
        assert_eq!(cfg.agent_ws_port, 9998);
    }
}
