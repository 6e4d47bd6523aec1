//! Inverse adaptive thresholding: ink becomes 255, paper 0.

use image::{GrayImage, Luma};
use imageproc::filter::gaussian_blur_f32;

use crate::config::{AdaptiveThreshold, ThresholdMethod};

/// Gaussian sigma for an odd kernel size, using the same rule OpenCV
/// applies when only a kernel size is given.
pub(crate) fn sigma_for_kernel(size: u32) -> f32 {
    0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8
}

/// Summed-area table with a zero row and column in front.
struct Integral {
    sums: Vec<u64>,
    stride: usize,
}

impl Integral {
    fn new(gray: &GrayImage) -> Self {
        let (width, height) = (gray.width() as usize, gray.height() as usize);
        let stride = width + 1;
        let mut sums = vec![0u64; stride * (height + 1)];
        for y in 0..height {
            let mut row = 0u64;
            for x in 0..width {
                row += gray.get_pixel(x as u32, y as u32)[0] as u64;
                sums[(y + 1) * stride + x + 1] = sums[y * stride + x + 1] + row;
            }
        }
        Self { sums, stride }
    }

    /// Mean over the inclusive window `[x0, x1] × [y0, y1]`.
    fn mean(&self, x0: usize, y0: usize, x1: usize, y1: usize) -> f64 {
        let s = &self.sums;
        let at = |x: usize, y: usize| s[y * self.stride + x];
        let total = at(x1 + 1, y1 + 1) + at(x0, y0) - at(x0, y1 + 1) - at(x1 + 1, y0);
        let count = ((x1 - x0 + 1) * (y1 - y0 + 1)) as f64;
        total as f64 / count
    }
}

fn box_means(gray: &GrayImage, block_size: u32) -> Vec<f64> {
    let (width, height) = (gray.width() as usize, gray.height() as usize);
    let radius = (block_size / 2) as usize;
    let integral = Integral::new(gray);
    let mut means = Vec::with_capacity(width * height);
    for y in 0..height {
        let y0 = y.saturating_sub(radius);
        let y1 = (y + radius).min(height - 1);
        for x in 0..width {
            let x0 = x.saturating_sub(radius);
            let x1 = (x + radius).min(width - 1);
            means.push(integral.mean(x0, y0, x1, y1));
        }
    }
    means
}

fn gaussian_means(gray: &GrayImage, block_size: u32) -> Vec<f64> {
    gaussian_blur_f32(gray, sigma_for_kernel(block_size))
        .pixels()
        .map(|p| p[0] as f64)
        .collect()
}

/// Mark a pixel as ink when it is at least `constant` darker than its
/// neighbourhood mean.
pub fn adaptive_threshold_inv(gray: &GrayImage, options: &AdaptiveThreshold) -> GrayImage {
    let (width, height) = gray.dimensions();
    if width == 0 || height == 0 {
        return GrayImage::new(width, height);
    }
    let means = match options.method {
        ThresholdMethod::Mean => box_means(gray, options.block_size),
        ThresholdMethod::Gaussian => gaussian_means(gray, options.block_size),
    };
    let mut binary = GrayImage::new(width, height);
    for (i, (pixel, out)) in gray.pixels().zip(binary.pixels_mut()).enumerate() {
        let ink = pixel[0] as f64 <= means[i] - options.constant;
        *out = Luma([if ink { 255 } else { 0 }]);
    }
    binary
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(method: ThresholdMethod) -> AdaptiveThreshold {
        AdaptiveThreshold {
            method,
            block_size: 11,
            constant: 2.0,
        }
    }

    #[test]
    fn test_sigma_matches_reference_rule() {
        assert!((sigma_for_kernel(5) - 1.1).abs() < 1e-6);
        assert!((sigma_for_kernel(11) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_uniform_image_has_no_ink() {
        let gray = GrayImage::from_pixel(32, 32, Luma([200u8]));
        for method in [ThresholdMethod::Mean, ThresholdMethod::Gaussian] {
            let binary = adaptive_threshold_inv(&gray, &options(method));
            assert!(binary.pixels().all(|p| p[0] == 0));
        }
    }

    #[test]
    fn test_dark_line_becomes_ink() {
        let mut gray = GrayImage::from_pixel(40, 40, Luma([250u8]));
        for x in 5..35 {
            for y in 19..22 {
                gray.put_pixel(x, y, Luma([10]));
            }
        }
        for method in [ThresholdMethod::Mean, ThresholdMethod::Gaussian] {
            let binary = adaptive_threshold_inv(&gray, &options(method));
            assert_eq!(binary.get_pixel(20, 20)[0], 255);
            assert_eq!(binary.get_pixel(20, 5)[0], 0);
        }
    }

    #[test]
    fn test_box_mean_clips_at_borders() {
        let mut gray = GrayImage::from_pixel(3, 3, Luma([0u8]));
        gray.put_pixel(0, 0, Luma([90]));
        let means = box_means(&gray, 3);
        // corner window covers 2x2 pixels
        assert!((means[0] - 22.5).abs() < 1e-9);
        // centre window covers all nine
        assert!((means[4] - 10.0).abs() < 1e-9);
    }
}
