//! Terminal discovery around a component body.

use image::GrayImage;

use crate::model::{BoundingRegion, Point, Side};

/// Ink runs `[start, end)` along a probe line.
fn ink_runs(len: u32, ink_at: impl Fn(u32) -> bool) -> Vec<(u32, u32)> {
    let mut runs = Vec::new();
    let mut start = None;
    for i in 0..len {
        match (ink_at(i), start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                runs.push((s, i));
                start = None;
            }
            _ => {}
        }
    }
    if let Some(s) = start {
        runs.push((s, len));
    }
    runs
}

fn run_center(offset: u32, run: (u32, u32)) -> f64 {
    offset as f64 + (run.0 + run.1 - 1) as f64 / 2.0
}

/// Terminals where wires cross a probe line `probe` pixels outside each side
/// of `region`, in pin order: left side top to bottom, bottom side left to
/// right, right side bottom to top, top side right to left.
///
/// Runs longer than half the side (at least 8 px) are not wires and are
/// ignored.
pub(crate) fn probe_terminals(binary: &GrayImage, region: &BoundingRegion, probe: u32) -> Vec<(Side, Point)> {
    let (width, height) = binary.dimensions();
    let ink = |x: u32, y: u32| binary.get_pixel(x, y)[0] > 0;
    let max_run = |side: u32| (side / 2).max(8);
    let mut found = Vec::new();

    if region.x >= probe {
        let x = region.x - probe;
        for run in ink_runs(region.height, |i| ink(x, region.y + i)) {
            if run.1 - run.0 <= max_run(region.height) {
                found.push((Side::Left, Point::new(region.x as f64, run_center(region.y, run))));
            }
        }
    }

    let last_row = region.bottom() - 1;
    if last_row + probe < height {
        let y = last_row + probe;
        for run in ink_runs(region.width, |i| ink(region.x + i, y)) {
            if run.1 - run.0 <= max_run(region.width) {
                found.push((Side::Bottom, Point::new(run_center(region.x, run), last_row as f64)));
            }
        }
    }

    let last_col = region.right() - 1;
    if last_col + probe < width {
        let x = last_col + probe;
        let mut right: Vec<_> = ink_runs(region.height, |i| ink(x, region.y + i))
            .into_iter()
            .filter(|run| run.1 - run.0 <= max_run(region.height))
            .map(|run| (Side::Right, Point::new(last_col as f64, run_center(region.y, run))))
            .collect();
        right.reverse();
        found.extend(right);
    }

    if region.y >= probe {
        let y = region.y - probe;
        let mut top: Vec<_> = ink_runs(region.width, |i| ink(region.x + i, y))
            .into_iter()
            .filter(|run| run.1 - run.0 <= max_run(region.width))
            .map(|run| (Side::Top, Point::new(run_center(region.x, run), region.y as f64)))
            .collect();
        top.reverse();
        found.extend(top);
    }

    found
}
