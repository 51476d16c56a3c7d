//! Humanized input synthesis.
//!
//! Long-lived automated pages attract idle timers and bot heuristics; the
//! fleet counters both with short mouse traces, a sub-pixel-jittered path
//! between points, and the periodic near-origin click the upstream treats
//! as user presence.

use std::time::Duration;

use rand::Rng;
use tokio::time::sleep;

use crate::driver::PageDriver;
use crate::error::FleetError;

/// Default viewport used when the page cannot report one.
pub const FALLBACK_VIEWPORT: (f64, f64) = (1280.0, 720.0);

/// Jittered waypoints between two points. The first point eases away from
/// `from`, the last lands exactly on `to`.
pub fn human_path(
    from: (f64, f64),
    to: (f64, f64),
    steps: usize,
    rng: &mut impl Rng,
) -> Vec<(f64, f64)> {
    let steps = steps.max(2);
    let mut path = Vec::with_capacity(steps);
    for i in 1..=steps {
        let t = i as f64 / steps as f64;
        // ease-in-out curve keeps velocity plausible
        let eased = t * t * (3.0 - 2.0 * t);
        let mut x = from.0 + (to.0 - from.0) * eased;
        let mut y = from.1 + (to.1 - from.1) * eased;
        if i != steps {
            x += rng.gen_range(-2.5..2.5);
            y += rng.gen_range(-2.5..2.5);
        }
        path.push((x.max(0.0), y.max(0.0)));
    }
    path
}

/// A random point inside the top-left 80 % of the viewport.
pub fn random_activity_point(rng: &mut impl Rng, viewport: (f64, f64)) -> (f64, f64) {
    (
        rng.gen_range(10.0..viewport.0 * 0.8),
        rng.gen_range(10.0..viewport.1 * 0.8),
    )
}

/// Move the mouse along a humanized path.
pub async fn human_move(
    driver: &PageDriver,
    from: (f64, f64),
    to: (f64, f64),
) -> Result<(), FleetError> {
    let path = {
        let mut rng = rand::thread_rng();
        let steps = rng.gen_range(8..16);
        human_path(from, to, steps, &mut rng)
    };
    for (x, y) in path {
        driver.mouse_move(x, y).await?;
        sleep(Duration::from_millis(8)).await;
    }
    Ok(())
}

/// Physical click at a point: move in, press, settle, release.
pub async fn human_click(driver: &PageDriver, point: (f64, f64)) -> Result<(), FleetError> {
    human_move(driver, (point.0 + 60.0, point.1 + 40.0), point).await?;
    driver.mouse_press(point.0, point.1).await?;
    sleep(Duration::from_millis(60)).await;
    driver.mouse_release(point.0, point.1).await?;
    Ok(())
}

/// The near-origin press/release the upstream counts as presence without
/// hitting any control.
pub async fn anti_idle_click(driver: &PageDriver) -> Result<(), FleetError> {
    let (x, y) = {
        let mut rng = rand::thread_rng();
        (rng.gen_range(1.0..3.0), rng.gen_range(1.0..3.0))
    };
    driver.mouse_move(x, y).await?;
    driver.mouse_press(x, y).await?;
    sleep(Duration::from_millis(40)).await;
    driver.mouse_release(x, y).await?;
    Ok(())
}

/// Wake gesture after navigation: focus the page, wander to a random point,
/// then click near the origin.
pub async fn wake_page(driver: &PageDriver) -> Result<(), FleetError> {
    driver.bring_to_front().await?;
    let target = {
        let mut rng = rand::thread_rng();
        random_activity_point(&mut rng, FALLBACK_VIEWPORT)
    };
    human_move(driver, (5.0, 5.0), target).await?;
    anti_idle_click(driver).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn path_ends_exactly_on_target() {
        let mut rng = StdRng::seed_from_u64(1);
        let path = human_path((0.0, 0.0), (200.0, 120.0), 10, &mut rng);
        assert_eq!(path.len(), 10);
        assert_eq!(*path.last().unwrap(), (200.0, 120.0));
    }

    #[test]
    fn path_never_leaves_the_viewport_origin_quadrant() {
        let mut rng = StdRng::seed_from_u64(2);
        for (x, y) in human_path((1.0, 1.0), (5.0, 5.0), 12, &mut rng) {
            assert!(x >= 0.0 && y >= 0.0);
        }
    }

    #[test]
    fn activity_point_stays_in_top_left_band() {
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..100 {
            let (x, y) = random_activity_point(&mut rng, (1000.0, 800.0));
            assert!(x < 800.0);
            assert!(y < 640.0);
        }
    }
}
