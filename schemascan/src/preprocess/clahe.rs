//! Contrast-limited adaptive histogram equalization.

use image::{GrayImage, Luma};

use crate::config::ContrastEnhancement;

/// Per-tile lookup tables on a `tiles_x × tiles_y` grid.
struct TileMaps {
    luts: Vec<[u8; 256]>,
    tiles_x: usize,
    tiles_y: usize,
    tile_w: f64,
    tile_h: f64,
}

fn tile_lut(gray: &GrayImage, x0: u32, y0: u32, x1: u32, y1: u32, clip_limit: f64) -> [u8; 256] {
    let mut hist = [0u32; 256];
    for y in y0..y1 {
        for x in x0..x1 {
            hist[gray.get_pixel(x, y)[0] as usize] += 1;
        }
    }
    let pixels = ((x1 - x0) * (y1 - y0)).max(1);

    let limit = ((clip_limit * pixels as f64 / 256.0).round() as u32).max(1);
    let mut excess = 0u32;
    for count in hist.iter_mut() {
        if *count > limit {
            excess += *count - limit;
            *count = limit;
        }
    }
    let share = excess / 256;
    let mut remainder = (excess % 256) as usize;
    for count in hist.iter_mut() {
        *count += share;
        if remainder > 0 {
            *count += 1;
            remainder -= 1;
        }
    }

    let mut lut = [0u8; 256];
    let mut cdf = 0u32;
    for (value, count) in hist.iter().enumerate() {
        cdf += count;
        lut[value] = ((cdf as f64 * 255.0 / pixels as f64).round()).min(255.0) as u8;
    }
    lut
}

impl TileMaps {
    fn build(gray: &GrayImage, options: &ContrastEnhancement) -> Self {
        let (width, height) = gray.dimensions();
        let tiles_x = (options.tile_size as usize).clamp(1, width.max(1) as usize);
        let tiles_y = (options.tile_size as usize).clamp(1, height.max(1) as usize);
        let tile_w = width as f64 / tiles_x as f64;
        let tile_h = height as f64 / tiles_y as f64;

        let mut luts = Vec::with_capacity(tiles_x * tiles_y);
        for ty in 0..tiles_y {
            let y0 = (ty as f64 * tile_h).floor() as u32;
            let y1 = (((ty + 1) as f64 * tile_h).floor() as u32).clamp(y0 + 1, height);
            for tx in 0..tiles_x {
                let x0 = (tx as f64 * tile_w).floor() as u32;
                let x1 = (((tx + 1) as f64 * tile_w).floor() as u32).clamp(x0 + 1, width);
                luts.push(tile_lut(gray, x0, y0, x1, y1, options.clip_limit));
            }
        }
        Self {
            luts,
            tiles_x,
            tiles_y,
            tile_w,
            tile_h,
        }
    }

    fn lut(&self, tx: usize, ty: usize) -> &[u8; 256] {
        &self.luts[ty * self.tiles_x + tx]
    }

    /// Neighbouring tile indices and blend weight along one axis.
    fn axis(coord: u32, tile: f64, tiles: usize) -> (usize, usize, f64) {
        let pos = (coord as f64 + 0.5) / tile - 0.5;
        if pos <= 0.0 {
            return (0, 0, 0.0);
        }
        let lo = pos.floor() as usize;
        if lo + 1 >= tiles {
            return (tiles - 1, tiles - 1, 0.0);
        }
        (lo, lo + 1, pos - lo as f64)
    }

    fn map(&self, x: u32, y: u32, value: u8) -> u8 {
        let (x0, x1, fx) = Self::axis(x, self.tile_w, self.tiles_x);
        let (y0, y1, fy) = Self::axis(y, self.tile_h, self.tiles_y);
        let v = value as usize;
        let top = self.lut(x0, y0)[v] as f64 * (1.0 - fx) + self.lut(x1, y0)[v] as f64 * fx;
        let bottom = self.lut(x0, y1)[v] as f64 * (1.0 - fx) + self.lut(x1, y1)[v] as f64 * fx;
        (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8
    }
}

pub fn clahe(gray: &GrayImage, options: &ContrastEnhancement) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return gray.clone();
    }
    let maps = TileMaps::build(gray, options);
    GrayImage::from_fn(width, height, |x, y| {
        Luma([maps.map(x, y, gray.get_pixel(x, y)[0])])
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paper_stays_white() {
        let gray = GrayImage::from_pixel(64, 64, Luma([255u8]));
        let out = clahe(&gray, &ContrastEnhancement::default());
        assert!(out.pixels().all(|p| p[0] == 255));
    }

    #[test]
    fn test_stretches_low_contrast() {
        // left half 120, right half 135
        let gray = GrayImage::from_fn(64, 64, |x, _| Luma([if x < 32 { 120 } else { 135 }]));
        let out = clahe(
            &gray,
            &ContrastEnhancement {
                clip_limit: 40.0,
                tile_size: 1,
            },
        );
        let left = out.get_pixel(2, 32)[0] as i32;
        let right = out.get_pixel(61, 32)[0] as i32;
        assert!(right - left > 15, "contrast not increased: {} vs {}", left, right);
    }

    #[test]
    fn test_tiny_image() {
        let gray = GrayImage::from_pixel(3, 2, Luma([10u8]));
        let out = clahe(&gray, &ContrastEnhancement::default());
        assert_eq!(out.dimensions(), (3, 2));
    }
}
