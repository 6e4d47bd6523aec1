//! Ramer–Douglas–Peucker polyline simplification.

use crate::model::Point;

fn perpendicular_distance(p: &Point, a: &Point, b: &Point) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let norm = (dx * dx + dy * dy).sqrt();
    if norm == 0.0 {
        return p.distance(a);
    }
    ((p.x - a.x) * dy - (p.y - a.y) * dx).abs() / norm
}

/// Keep only the points needed to stay within `epsilon` of `points`.
/// Endpoints are always kept.
pub(crate) fn simplify(points: &[Point], epsilon: f64) -> Vec<Point> {
    if points.len() <= 2 {
        return points.to_vec();
    }
    let mut keep = vec![false; points.len()];
    keep[0] = true;
    keep[points.len() - 1] = true;

    let mut stack = vec![(0, points.len() - 1)];
    while let Some((first, last)) = stack.pop() {
        let mut max = 0.0;
        let mut index = first;
        for i in first + 1..last {
            let d = perpendicular_distance(&points[i], &points[first], &points[last]);
            if d > max {
                max = d;
                index = i;
            }
        }
        if max > epsilon {
            keep[index] = true;
            stack.push((first, index));
            stack.push((index, last));
        }
    }

    points
        .iter()
        .zip(keep)
        .filter_map(|(p, k)| k.then_some(*p))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pts(raw: &[(f64, f64)]) -> Vec<Point> {
        raw.iter().map(|&(x, y)| Point::new(x, y)).collect()
    }

    #[test]
    fn test_straight_run_collapses() {
        let line = pts(&[(0.0, 0.0), (1.0, 0.0), (2.0, 0.0), (3.0, 1.0), (4.0, 0.0), (5.0, 0.0)]);
        assert_eq!(simplify(&line, 1.0), pts(&[(0.0, 0.0), (5.0, 0.0)]));
    }

    #[test]
    fn test_corner_is_kept() {
        let mut raw = Vec::new();
        for x in 0..10 {
            raw.push((x as f64, 0.0));
        }
        for y in 1..10 {
            raw.push((9.0, y as f64));
        }
        let out = simplify(&pts(&raw), 1.0);
        assert_eq!(out, pts(&[(0.0, 0.0), (9.0, 0.0), (9.0, 9.0)]));
    }

    #[test]
    fn test_closed_loop_keeps_shape() {
        let square = pts(&[(0.0, 0.0), (5.0, 0.0), (5.0, 5.0), (0.0, 5.0), (0.0, 0.0)]);
        let out = simplify(&square, 1.0);
        assert!(out.len() >= 4);
        assert_eq!(out.first(), out.last());
    }
}
