//! Launch-time browser preferences.
//!
//! The fleet runs long-lived automated sessions, so everything that phones
//! home, updates itself, prefetches, or interrupts the page is switched off
//! at launch. Kept as plain switches so the bundle is auditable in logs.

use crate::config::FleetConfig;

/// Switches applied to every browser launch.
const BASE_ARGS: &[&str] = &[
    // updates / component churn
    "--disable-component-update",
    "--disable-background-networking",
    "--disable-default-apps",
    "--no-first-run",
    "--no-default-browser-check",
    // telemetry and crash reporting
    "--metrics-recording-only",
    "--disable-breakpad",
    "--disable-domain-reliability",
    // safe-browsing / phishing lookups
    "--disable-client-side-phishing-detection",
    "--safebrowsing-disable-auto-update",
    // prefetch and speculative connections
    "--dns-prefetch-disable",
    "--disable-features=NetworkPrediction,OptimizationHints,Translate,MediaRouter,InterestFeedContentSuggestions",
    // caches
    "--disk-cache-size=1",
    "--media-cache-size=1",
    // rendering: no GPU acceleration, no smooth scroll, no animation noise
    "--disable-gpu",
    "--disable-smooth-scrolling",
    "--wm-window-animations-disabled",
    // media
    "--autoplay-policy=user-gesture-required",
    "--mute-audio",
    // permissions: never prompt, geolocation effectively denied
    "--deny-permission-prompts",
    "--disable-notifications",
    // account sync and extension churn
    "--disable-sync",
    "--disable-extensions",
    "--disable-extensions-http-throttling",
    // stability for containerized runs
    "--disable-dev-shm-usage",
    "--disable-hang-monitor",
    "--disable-prompt-on-repost",
    "--disable-popup-blocking",
    "--password-store=basic",
    "--use-mock-keychain",
    "--remote-allow-origins=*",
];

/// Build the full launch argument list for a fleet browser.
pub fn launch_args(cfg: &FleetConfig) -> Vec<String> {
    let mut args: Vec<String> = BASE_ARGS.iter().map(|s| s.to_string()).collect();
    if cfg.headless {
        args.push("--headless=new".into());
        args.push("--hide-scrollbars".into());
    }
    if let Some(proxy) = &cfg.proxy_url {
        args.push(format!("--proxy-server={proxy}"));
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxy_flag_present_only_when_configured() {
        let mut cfg = FleetConfig::default();
        cfg.proxy_url = None;
        assert!(!launch_args(&cfg).iter().any(|a| a.starts_with("--proxy-server")));

        cfg.proxy_url = Some("http://127.0.0.1:7890".into());
        assert!(launch_args(&cfg)
            .iter()
            .any(|a| a == "--proxy-server=http://127.0.0.1:7890"));
    }

    #[test]
    fn bundle_has_no_duplicate_switches() {
        let cfg = FleetConfig::default();
        let args = launch_args(&cfg);
        let mut keys: Vec<&str> = args
            .iter()
            .map(|a| a.split('=').next().unwrap_or(a))
            .collect();
        keys.sort_unstable();
        let before = keys.len();
        keys.dedup();
        assert_eq!(before, keys.len());
    }
}
