//! Environment-driven gateway configuration.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use account_switcher::SwitcherConfig;
use fleetgate_core_types::StreamMode;

/// Port the agent WebSocket bridge listens on. Fixed: the in-page agent has
/// it baked into its source.
pub const AGENT_WS_PORT: u16 = 9998;

#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub listen_port: u16,
    /// API keys accepted on the inbound surface; empty disables auth.
    pub api_keys: Vec<String>,
    /// Relay mode used when the client asks for streaming.
    pub default_stream_mode: StreamMode,
    pub switcher: SwitcherConfig,
    /// Force `includeThoughts` into generative requests.
    pub force_thinking: bool,
    /// Inject the `googleSearch` tool when the client did not send tools.
    pub force_web_search: bool,
    /// Inject the `urlContext` tool when the client did not send tools.
    pub force_url_context: bool,
    pub proxy_url: Option<String>,
    /// Allow refreshed identity state to be written back to disk.
    pub enable_auth_update: bool,
    pub auth_dir: PathBuf,
    pub models_path: PathBuf,
}

impl GatewayConfig {
    pub fn from_env() -> Self {
        let listen_port = env_parse("FLEETGATE_PORT", 2048u16);
        Self {
            listen_port,
            api_keys: env_csv("FLEETGATE_API_KEYS"),
            default_stream_mode: match env::var("FLEETGATE_STREAM_MODE").as_deref() {
                Ok("fake") => StreamMode::Fake,
                _ => StreamMode::Real,
            },
            switcher: SwitcherConfig {
                switch_on_uses: env_parse("FLEETGATE_SWITCH_ON_USES", 0u32),
                failure_threshold: env_parse("FLEETGATE_FAILURE_THRESHOLD", 3u32),
                immediate_switch_status_codes: match env_nonempty("FLEETGATE_IMMEDIATE_SWITCH_CODES")
                {
                    Some(_) => env_csv("FLEETGATE_IMMEDIATE_SWITCH_CODES")
                        .iter()
                        .filter_map(|v| v.parse().ok())
                        .collect(),
                    None => SwitcherConfig::default().immediate_switch_status_codes,
                },
                max_retries: env_parse("FLEETGATE_MAX_RETRIES", 3u32),
                retry_delay: Duration::from_millis(env_parse("FLEETGATE_RETRY_DELAY_MS", 2000u64)),
            },
            force_thinking: env_bool("FLEETGATE_FORCE_THINKING", false),
            force_web_search: env_bool("FLEETGATE_FORCE_WEB_SEARCH", false),
            force_url_context: env_bool("FLEETGATE_FORCE_URL_CONTEXT", false),
            proxy_url: env_nonempty("FLEETGATE_PROXY_URL"),
            enable_auth_update: env_bool("FLEETGATE_ENABLE_AUTH_UPDATE", true),
            auth_dir: PathBuf::from(
                env_nonempty("FLEETGATE_AUTH_DIR").unwrap_or_else(|| "configs/auth".into()),
            ),
            models_path: PathBuf::from(
                env_nonempty("FLEETGATE_MODELS_PATH").unwrap_or_else(|| "configs/models.json".into()),
            ),
        }
    }

    /// Authority the relay presents in rewritten redirect headers.
    pub fn own_authority(&self) -> String {
        format!("127.0.0.1:{}", self.listen_port)
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: 2048,
            api_keys: Vec::new(),
            default_stream_mode: StreamMode::Real,
            switcher: SwitcherConfig::default(),
            force_thinking: false,
            force_web_search: false,
            force_url_context: false,
            proxy_url: None,
            enable_auth_update: true,
            auth_dir: PathBuf::from("configs/auth"),
            models_path: PathBuf::from("configs/models.json"),
        }
    }
}

fn env_nonempty(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        let trimmed = value.trim().to_string();
        (!trimmed.is_empty()).then_some(trimmed)
    })
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env_nonempty(key)
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_nonempty(key) {
        Some(value) => matches!(value.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_csv(key: &str) -> Vec<String> {
    env_nonempty(key)
        .map(|value| {
            value
                .split(',')
                .map(|part| part.trim().to_string())
                .filter(|part| !part.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn csv_parsing_trims_and_drops_empties() {
        env::set_var("FLEETGATE_TEST_CSV", " 429, 403 ,,503 ");
        let parsed = env_csv("FLEETGATE_TEST_CSV");
        env::remove_var("FLEETGATE_TEST_CSV");
        assert_eq!(parsed, vec!["429", "403", "503"]);
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.listen_port, 2048);
        assert_eq!(cfg.own_authority(), "127.0.0.1:2048");
        assert!(cfg.api_keys.is_empty());
    }
}
