//! Page keep-alive loops.
//!
//! Each active page runs two background tasks: a 4 s health ticker that
//! keeps the page looking attended (activity traces, anti-idle clicks,
//! popup dismissal, periodic state save) and a wake loop that hunts for the
//! app's "Launch" control and presses it, sleeping longer the longer it
//! finds nothing but waking immediately when a user request arrives.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::activation::{click_button_with_text, DISMISS_LABELS};
use crate::driver::PageDriver;
use crate::humanize;

const TICK: Duration = Duration::from_secs(4);
const ANTI_IDLE_EVERY: Duration = Duration::from_secs(60);
const STATE_SAVE_EVERY: Duration = Duration::from_secs(24 * 60 * 60);

const WAKE_IDLE_MIN: Duration = Duration::from_secs(2);
const WAKE_IDLE_MAX: Duration = Duration::from_secs(30);

/// Persists the identity's refreshed browser state.
pub type StateSaveHook = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

pub fn spawn_health_monitor(
    driver: PageDriver,
    cancel: CancellationToken,
    save: StateSaveHook,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval(TICK);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_anti_idle = Instant::now();
        let mut last_save = Instant::now();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let trace = {
                let mut rng = rand::thread_rng();
                rng.gen_bool(0.3)
            };
            if trace {
                let (from, to) = {
                    let mut rng = rand::thread_rng();
                    (
                        humanize::random_activity_point(&mut rng, humanize::FALLBACK_VIEWPORT),
                        humanize::random_activity_point(&mut rng, humanize::FALLBACK_VIEWPORT),
                    )
                };
                let _ = driver
                    .evaluate("window.scrollBy(0, Math.floor(Math.random() * 7) - 3)")
                    .await;
                if let Err(err) = humanize::human_move(&driver, from, to).await {
                    debug!(target: "health", %err, "activity trace failed");
                }
            }

            if last_anti_idle.elapsed() >= ANTI_IDLE_EVERY {
                last_anti_idle = Instant::now();
                if let Err(err) = humanize::anti_idle_click(&driver).await {
                    debug!(target: "health", %err, "anti-idle click failed");
                }
            }

            if last_save.elapsed() >= STATE_SAVE_EVERY {
                last_save = Instant::now();
                save().await;
            }

            // Interruptions accumulate on long-lived pages; sweep them every
            // tick.
            let _ = driver
                .remove_nodes(".cdk-overlay-backdrop, .modal-backdrop")
                .await;
            match click_button_with_text(&driver, DISMISS_LABELS).await {
                Ok(true) => debug!(target: "health", "dismissed an interruption"),
                Ok(false) => {}
                Err(err) => debug!(target: "health", %err, "dismiss sweep failed"),
            }
        }
        debug!(target: "health", "health monitor stopped");
    })
}

/// Scan for the launch control: a precise match inside an open dialog
/// first, then a broader icon heuristic restricted to the 400..800 px
/// vertical band.
const LAUNCH_SCAN_JS: &str = r#"(() => {
  const center = (el) => {
    const r = el.getBoundingClientRect();
    if (r.width === 0 || r.height === 0) return null;
    return { x: r.left + r.width / 2, y: r.top + r.height / 2 };
  };
  const icon = (el) => {
    const i = el.querySelector('mat-icon, .material-icons');
    return i ? (i.textContent || '').trim() : '';
  };
  const dialogs = Array.from(document.querySelectorAll('[role="dialog"], mat-dialog-container, .modal'));
  for (const dialog of dialogs) {
    const el = Array.from(dialog.querySelectorAll('button')).find(
      (b) => (b.textContent || '').trim() === 'Launch' || icon(b) === 'rocket_launch'
    );
    if (el) { const c = center(el); if (c) return c; }
  }
  const el = Array.from(document.querySelectorAll('button')).find((b) => {
    if (icon(b) !== 'rocket_launch' && (b.textContent || '').trim() !== 'Launch') return false;
    const r = b.getBoundingClientRect();
    return r.top >= 400 && r.top <= 800;
  });
  if (el) return center(el);
  return null;
})()"#;

pub fn spawn_wake_loop(
    driver: PageDriver,
    cancel: CancellationToken,
    activity: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut idle = WAKE_IDLE_MIN;
        loop {
            if cancel.is_cancelled() {
                break;
            }

            match scan_and_press_launch(&driver).await {
                Ok(true) => {
                    idle = WAKE_IDLE_MIN;
                }
                Ok(false) => {
                    idle = (idle * 2).min(WAKE_IDLE_MAX);
                }
                Err(err) => {
                    warn!(target: "wake", %err, "launch scan failed");
                    idle = (idle * 2).min(WAKE_IDLE_MAX);
                }
            }

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = activity.notified() => { idle = WAKE_IDLE_MIN; }
                _ = sleep(idle) => {}
            }
        }
        debug!(target: "wake", "wake loop stopped");
    })
}

async fn scan_and_press_launch(driver: &PageDriver) -> Result<bool, crate::error::FleetError> {
    let hit = driver.evaluate(LAUNCH_SCAN_JS).await?;
    let Some((x, y)) = hit
        .get("x")
        .and_then(serde_json::Value::as_f64)
        .zip(hit.get("y").and_then(serde_json::Value::as_f64))
    else {
        return Ok(false);
    };

    debug!(target: "wake", x, y, "launch control found");
    humanize::human_click(driver, (x, y)).await?;
    sleep(Duration::from_millis(600)).await;

    // Verify it actually went away; stubborn dialogs get the programmatic
    // fallback.
    let still_there = driver.evaluate(LAUNCH_SCAN_JS).await?;
    if still_there.get("x").is_some() {
        let _ = click_button_with_text(driver, &["Launch"]).await;
    }
    Ok(true)
}
