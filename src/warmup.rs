//! Pre-challenge warm-up
//!
//! Simulates a short burst of human-like pointer activity before the
//! challenge executes, to improve behavioral scoring. Every step is
//! best-effort; callers log a failure at debug level and move on.

use std::time::Duration;

use rand::Rng;
use smallvec::SmallVec;
use tokio::time::sleep;

use crate::driver::BrowserPage;
use crate::error::Result;

type Point = (f64, f64);

/// Stack-allocated storage for typical pointer paths
type PointVec = SmallVec<[Point; 16]>;

fn random_range(min: u64, max: u64) -> u64 {
    rand::thread_rng().gen_range(min..max)
}

fn random_f64_range(min: f64, max: f64) -> f64 {
    rand::thread_rng().gen_range(min..max)
}

/// Cubic Bezier path between two points for natural pointer movement
fn bezier_curve(start: Point, end: Point, num_points: usize) -> PointVec {
    let num_points = num_points.max(2);

    let cp1 = (
        start.0 + (end.0 - start.0) * random_f64_range(0.2, 0.4) + random_f64_range(-50.0, 50.0),
        start.1 + (end.1 - start.1) * random_f64_range(0.0, 0.3) + random_f64_range(-50.0, 50.0),
    );
    let cp2 = (
        start.0 + (end.0 - start.0) * random_f64_range(0.6, 0.8) + random_f64_range(-50.0, 50.0),
        start.1 + (end.1 - start.1) * random_f64_range(0.7, 1.0) + random_f64_range(-50.0, 50.0),
    );

    let mut points = PointVec::new();

    for i in 0..num_points {
        let t = i as f64 / (num_points - 1) as f64;
        let t2 = t * t;
        let t3 = t2 * t;
        let mt = 1.0 - t;
        let mt2 = mt * mt;
        let mt3 = mt2 * mt;

        let x = mt3 * start.0 + 3.0 * mt2 * t * cp1.0 + 3.0 * mt * t2 * cp2.0 + t3 * end.0;
        let y = mt3 * start.1 + 3.0 * mt2 * t * cp1.1 + 3.0 * mt * t2 * cp2.1 + t3 * end.1;

        points.push((x, y));
    }

    points
}

async fn glide(page: &dyn BrowserPage, from: Point, to: Point) -> Result<()> {
    // Bind the draw first: ThreadRng must not live across the awaits below
    let steps = rand::thread_rng().gen_range(4..9);
    for (x, y) in bezier_curve(from, to, steps) {
        page.mouse_move(x, y).await?;
        sleep(Duration::from_millis(random_range(20, 80))).await;
    }
    Ok(())
}

/// Run the warm-up gesture sequence: reaction pause, a few pointer glides,
/// a scroll, a final move.
pub async fn pre_challenge_warmup(page: &dyn BrowserPage) -> Result<()> {
    let viewport = page.viewport();
    let w = viewport.width.max(400) as f64;
    let h = viewport.height.max(300) as f64;

    // Reaction time after the page appears
    sleep(Duration::from_millis(random_range(500, 1500))).await;

    let mut cursor = (
        random_f64_range(100.0, w - 100.0),
        random_f64_range(100.0, h - 100.0),
    );

    let moves = rand::thread_rng().gen_range(2..5);
    for _ in 0..moves {
        let target = (
            random_f64_range(100.0, w - 100.0),
            random_f64_range(100.0, h - 100.0),
        );
        glide(page, cursor, target).await?;
        cursor = target;
        sleep(Duration::from_millis(random_range(100, 400))).await;
    }

    page.scroll(random_range(50, 200) as f64).await?;
    sleep(Duration::from_millis(random_range(200, 500))).await;

    let target = (
        random_f64_range(200.0, w - 200.0),
        random_f64_range(200.0, h - 200.0),
    );
    glide(page, cursor, target).await?;
    sleep(Duration::from_millis(random_range(300, 800))).await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bezier_curve_endpoints() {
        let start = (50.0, 75.0);
        let end = (200.0, 300.0);

        let points = bezier_curve(start, end, 8);

        let first = points.first().unwrap();
        assert!((first.0 - start.0).abs() < 0.001);
        assert!((first.1 - start.1).abs() < 0.001);

        let last = points.last().unwrap();
        assert!((last.0 - end.0).abs() < 0.001);
        assert!((last.1 - end.1).abs() < 0.001);
    }

    #[test]
    fn test_bezier_curve_minimum_points() {
        let points = bezier_curve((0.0, 0.0), (10.0, 10.0), 0);
        assert_eq!(points.len(), 2);
    }
}
