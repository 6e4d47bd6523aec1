//! Body mask extraction and connected-component candidates.

use image::{GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::geometry::convex_hull;
use imageproc::morphology;
use imageproc::point::Point as PixelPoint;
use imageproc::region_labelling::{connected_components, Connectivity};

use crate::model::BoundingRegion;

/// A connected blob of the body mask.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub region: BoundingRegion,
    pub pixels: u32,
    /// Pixels of this blob only, cropped to `region`; ink = 255.
    pub mask: GrayImage,
    pub solidity: f64,
}

/// Fill enclosed paper regions no larger than `max_hole`.
pub(crate) fn fill_holes(binary: &GrayImage, max_hole: u32) -> GrayImage {
    let (width, height) = binary.dimensions();
    let paper = GrayImage::from_fn(width, height, |x, y| {
        Luma([if binary.get_pixel(x, y)[0] == 0 { 255 } else { 0 }])
    });
    let labels = connected_components(&paper, Connectivity::Four, Luma([0u8]));
    let count = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    let mut sizes = vec![0u32; count + 1];
    let mut touches_border = vec![false; count + 1];
    for (x, y, label) in labels.enumerate_pixels() {
        let l = label[0] as usize;
        if l == 0 {
            continue;
        }
        sizes[l] += 1;
        if x == 0 || y == 0 || x + 1 == width || y + 1 == height {
            touches_border[l] = true;
        }
    }

    let mut filled = binary.clone();
    for (x, y, label) in labels.enumerate_pixels() {
        let l = label[0] as usize;
        if l != 0 && !touches_border[l] && sizes[l] <= max_hole {
            filled.put_pixel(x, y, Luma([255]));
        }
    }
    filled
}

/// Solid symbol bodies: holes filled, then opened so thin wires vanish.
pub(crate) fn body_mask(binary: &GrayImage, max_hole: u32, radius: u8) -> GrayImage {
    let filled = fill_holes(binary, max_hole);
    if radius == 0 {
        filled
    } else {
        morphology::open(&filled, Norm::LInf, radius)
    }
}

/// Share of a candidate's pixels that were ink before hole filling. A wire
/// loop filled solid is mostly paper.
pub(crate) fn ink_fraction(candidate: &Candidate, binary: &GrayImage) -> f64 {
    if candidate.pixels == 0 {
        return 0.0;
    }
    let r = candidate.region;
    let ink = candidate
        .mask
        .enumerate_pixels()
        .filter(|&(x, y, p)| p[0] > 0 && binary.get_pixel(r.x + x, r.y + y)[0] > 0)
        .count();
    ink as f64 / candidate.pixels as f64
}

fn gcd(mut a: i64, mut b: i64) -> i64 {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a.abs()
}

/// Number of lattice points inside or on the convex hull of `points`,
/// by Pick's theorem.
pub(crate) fn hull_lattice_points(points: &[PixelPoint<i32>]) -> f64 {
    if points.is_empty() {
        return 0.0;
    }
    let hull = convex_hull(points);
    let n = hull.len();
    if n == 1 {
        return 1.0;
    }
    let mut twice_area = 0i64;
    let mut boundary = 0i64;
    for i in 0..n {
        let a = hull[i];
        let b = hull[(i + 1) % n];
        twice_area += a.x as i64 * b.y as i64 - b.x as i64 * a.y as i64;
        boundary += gcd((b.x - a.x) as i64, (b.y - a.y) as i64);
    }
    twice_area.abs() as f64 / 2.0 + boundary as f64 / 2.0 + 1.0
}

/// Label the body mask and summarize every blob.
pub(crate) fn extract_candidates(body: &GrayImage) -> Vec<Candidate> {
    let labels = connected_components(body, Connectivity::Eight, Luma([0u8]));
    let count = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
    let mut points: Vec<Vec<(u32, u32)>> = vec![Vec::new(); count + 1];
    for (x, y, label) in labels.enumerate_pixels() {
        if label[0] != 0 {
            points[label[0] as usize].push((x, y));
        }
    }

    points
        .into_iter()
        .skip(1)
        .filter(|pts| !pts.is_empty())
        .map(|pts| summarize(&pts))
        .collect()
}

/// `pts` arrive in raster order.
fn summarize(pts: &[(u32, u32)]) -> Candidate {
    let (mut min_x, mut min_y, mut max_x, mut max_y) = (u32::MAX, u32::MAX, 0, 0);
    for &(x, y) in pts {
        min_x = min_x.min(x);
        max_x = max_x.max(x);
        min_y = min_y.min(y);
        max_y = max_y.max(y);
    }
    let region = BoundingRegion::new(min_x, min_y, max_x - min_x + 1, max_y - min_y + 1);

    let mut mask = GrayImage::new(region.width, region.height);
    // Row extremes are enough to span the hull.
    let mut extremes: Vec<PixelPoint<i32>> = Vec::new();
    for (i, &(x, y)) in pts.iter().enumerate() {
        mask.put_pixel(x - min_x, y - min_y, Luma([255]));
        let row_start = i == 0 || pts[i - 1].1 != y;
        let row_end = i + 1 == pts.len() || pts[i + 1].1 != y;
        if row_start || row_end {
            extremes.push(PixelPoint::new(x as i32, y as i32));
        }
    }

    let pixels = pts.len() as u32;
    let lattice = hull_lattice_points(&extremes);
    let solidity = if lattice > 0.0 {
        (pixels as f64 / lattice).clamp(0.0, 1.0)
    } else {
        0.0
    };
    Candidate {
        region,
        pixels,
        mask,
        solidity,
    }
}
