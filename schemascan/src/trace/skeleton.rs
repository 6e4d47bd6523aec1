//! Zhang–Suen thinning and skeleton pixel adjacency.

use image::{GrayImage, Luma};

/// One-pixel-wide centreline of a binary mask.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Skeleton {
    width: u32,
    height: u32,
    cells: Vec<bool>,
}

/// Neighbour offsets: the four axis neighbours first, then diagonals.
const AXIS: [(i64, i64); 4] = [(0, -1), (1, 0), (0, 1), (-1, 0)];
const DIAGONAL: [(i64, i64); 4] = [(1, -1), (1, 1), (-1, 1), (-1, -1)];

impl Skeleton {
    /// Thin every pixel with a non-zero value.
    pub fn thin(mask: &GrayImage) -> Self {
        let (width, height) = mask.dimensions();
        let mut skeleton = Self {
            width,
            height,
            cells: mask.pixels().map(|p| p[0] > 0).collect(),
        };
        let mut active: Vec<(u32, u32)> = skeleton.pixels().collect();
        loop {
            let mut changed = false;
            for first_pass in [true, false] {
                let doomed: Vec<(u32, u32)> = active
                    .iter()
                    .copied()
                    .filter(|&(x, y)| skeleton.is_set(x as i64, y as i64) && skeleton.removable(x, y, first_pass))
                    .collect();
                for &(x, y) in &doomed {
                    let i = skeleton.index(x, y);
                    skeleton.cells[i] = false;
                }
                changed |= !doomed.is_empty();
            }
            if !changed {
                break;
            }
            active.retain(|&(x, y)| skeleton.is_set(x as i64, y as i64));
        }
        skeleton
    }

    fn index(&self, x: u32, y: u32) -> usize {
        y as usize * self.width as usize + x as usize
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn is_set(&self, x: i64, y: i64) -> bool {
        x >= 0
            && y >= 0
            && x < self.width as i64
            && y < self.height as i64
            && self.cells[y as usize * self.width as usize + x as usize]
    }

    /// Set pixels in raster order.
    pub fn pixels(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        let width = self.width;
        self.cells
            .iter()
            .enumerate()
            .filter(|(_, set)| **set)
            .map(move |(i, _)| ((i % width as usize) as u32, (i / width as usize) as u32))
    }

    pub fn count(&self) -> usize {
        self.cells.iter().filter(|c| **c).count()
    }

    pub fn to_image(&self) -> GrayImage {
        GrayImage::from_fn(self.width, self.height, |x, y| {
            Luma([if self.cells[self.index(x, y)] { 255 } else { 0 }])
        })
    }

    /// Zhang–Suen deletion test for one sub-iteration.
    fn removable(&self, x: u32, y: u32, first_pass: bool) -> bool {
        let (x, y) = (x as i64, y as i64);
        // P2..P9, clockwise from north
        let p = [
            self.is_set(x, y - 1),
            self.is_set(x + 1, y - 1),
            self.is_set(x + 1, y),
            self.is_set(x + 1, y + 1),
            self.is_set(x, y + 1),
            self.is_set(x - 1, y + 1),
            self.is_set(x - 1, y),
            self.is_set(x - 1, y - 1),
        ];
        let b = p.iter().filter(|v| **v).count();
        if !(2..=6).contains(&b) {
            return false;
        }
        let a = (0..8).filter(|&i| !p[i] && p[(i + 1) % 8]).count();
        if a != 1 {
            return false;
        }
        let (n, e, s, w) = (p[0], p[2], p[4], p[6]);
        if first_pass {
            !(n && e && s) && !(e && s && w)
        } else {
            !(n && e && w) && !(n && s && w)
        }
    }

    /// Adjacent skeleton pixels. Axis neighbours always count; a diagonal
    /// neighbour counts only when no axis neighbour already links the two,
    /// so staircase corners do not look like junctions.
    pub fn neighbours(&self, x: u32, y: u32) -> Vec<(u32, u32)> {
        let (x, y) = (x as i64, y as i64);
        let mut out = Vec::with_capacity(4);
        for (dx, dy) in AXIS {
            if self.is_set(x + dx, y + dy) {
                out.push(((x + dx) as u32, (y + dy) as u32));
            }
        }
        for (dx, dy) in DIAGONAL {
            if self.is_set(x + dx, y + dy) && !self.is_set(x + dx, y) && !self.is_set(x, y + dy) {
                out.push(((x + dx) as u32, (y + dy) as u32));
            }
        }
        out
    }

    pub fn degree(&self, x: u32, y: u32) -> usize {
        self.neighbours(x, y).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    #[test]
    fn test_thick_line_thins_to_one_pixel() {
        let mut mask = GrayImage::new(60, 20);
        draw_filled_rect_mut(&mut mask, Rect::at(5, 8).of_size(50, 3), Luma([255u8]));
        let skeleton = Skeleton::thin(&mask);
        // every column in the middle holds exactly one pixel
        for x in 10..50 {
            let column = (0..20).filter(|&y| skeleton.is_set(x, y)).count();
            assert_eq!(column, 1, "column {}", x);
        }
        assert!(skeleton.is_set(30, 9));
    }

    #[test]
    fn test_cross_has_one_branch_point_region() {
        let mut mask = GrayImage::new(60, 60);
        draw_filled_rect_mut(&mut mask, Rect::at(5, 29).of_size(50, 3), Luma([255u8]));
        draw_filled_rect_mut(&mut mask, Rect::at(29, 5).of_size(3, 50), Luma([255u8]));
        let skeleton = Skeleton::thin(&mask);
        let junctions: Vec<_> = skeleton
            .pixels()
            .filter(|&(x, y)| skeleton.degree(x, y) >= 3)
            .collect();
        assert!(!junctions.is_empty());
        for (x, y) in junctions {
            assert!((26..=34).contains(&x) && (26..=34).contains(&y));
        }
    }

    #[test]
    fn test_staircase_is_not_a_junction() {
        // an L-shaped step: (0,0) (1,0) (1,1) (2,1)
        let mut mask = GrayImage::new(4, 3);
        for (x, y) in [(0, 0), (1, 0), (1, 1), (2, 1)] {
            mask.put_pixel(x, y, Luma([255]));
        }
        let skeleton = Skeleton {
            width: 4,
            height: 3,
            cells: mask.pixels().map(|p| p[0] > 0).collect(),
        };
        assert_eq!(skeleton.degree(1, 0), 2);
        assert_eq!(skeleton.degree(1, 1), 2);
        assert_eq!(skeleton.degree(0, 0), 1);
    }

    #[test]
    fn test_empty_mask() {
        let skeleton = Skeleton::thin(&GrayImage::new(10, 10));
        assert_eq!(skeleton.count(), 0);
    }
}
