//! Image normalization ahead of detection and tracing.
//!
//! The chain is fixed: channel reduction, optional bicubic upscale,
//! optional CLAHE, Gaussian denoise, inverse adaptive threshold and a
//! small closing. The same input and options always give the same bytes.

mod clahe;
mod threshold;

use image::imageops::{self, FilterType};
use image::{DynamicImage, GrayImage, Luma};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::morphology;
use std::sync::Arc;
use tracing::debug;

use crate::config::PreprocessConfig;
use crate::debug::{emit_or_warn, DebugArtifact, DebugSink};
use crate::model::Point;

pub use clahe::clahe;
pub use threshold::adaptive_threshold_inv;
pub(crate) use threshold::sigma_for_kernel;

/// Output of the preprocessor, shared read-only by detector and tracer.
#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedImage {
    /// Enhanced, denoised intensity image.
    pub gray: GrayImage,
    /// Ink mask: 255 for ink, 0 for paper.
    pub binary: GrayImage,
    /// Upscale factor applied relative to the source raster.
    pub scale: f64,
    pub source_width: u32,
    pub source_height: u32,
}

impl NormalizedImage {
    pub fn width(&self) -> u32 {
        self.binary.width()
    }

    pub fn height(&self) -> u32 {
        self.binary.height()
    }

    pub fn is_ink(&self, x: u32, y: u32) -> bool {
        self.binary.get_pixel(x, y)[0] > 0
    }

    /// Map a normalized-image point back to source pixel coordinates.
    pub fn to_source(&self, point: Point) -> Point {
        Point::new(point.x / self.scale, point.y / self.scale)
    }

    /// Bytes held by both rasters.
    pub fn buffer_bytes(&self) -> usize {
        self.gray.as_raw().len() + self.binary.as_raw().len()
    }
}

/// Reduce to one channel. Luma when `grayscale` is set, otherwise the
/// darkest of the colour channels.
fn reduce_channels(image: &DynamicImage, grayscale: bool) -> GrayImage {
    if grayscale {
        return image.to_luma8();
    }
    let rgb = image.to_rgb8();
    GrayImage::from_fn(rgb.width(), rgb.height(), |x, y| {
        let p = rgb.get_pixel(x, y);
        Luma([p[0].min(p[1]).min(p[2])])
    })
}

pub struct Preprocessor {
    config: PreprocessConfig,
    debug: Option<Arc<dyn DebugSink>>,
}

impl Preprocessor {
    pub fn new(config: PreprocessConfig) -> Self {
        Self {
            config,
            debug: None,
        }
    }

    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug = Some(sink);
        self
    }

    pub fn config(&self) -> &PreprocessConfig {
        &self.config
    }

    /// Upscale factor the policy applies to an image of this size.
    pub fn upscale_factor(&self, width: u32, height: u32) -> u32 {
        let policy = &self.config.upscale;
        if policy.factor > 1 && width.min(height) < policy.min_short_side {
            policy.factor
        } else {
            1
        }
    }

    pub fn preprocess(&self, image: &DynamicImage) -> NormalizedImage {
        let config = &self.config;
        let (source_width, source_height) = (image.width(), image.height());
        let mut gray = reduce_channels(image, config.grayscale);

        let factor = self.upscale_factor(source_width, source_height);
        if factor > 1 {
            debug!(factor, source_width, source_height, "upscaling small image");
            gray = imageops::resize(
                &gray,
                source_width * factor,
                source_height * factor,
                FilterType::CatmullRom,
            );
        }

        if let Some(contrast) = &config.contrast {
            gray = clahe(&gray, contrast);
        }

        if config.denoise_kernel > 1 && gray.width() > 0 && gray.height() > 0 {
            gray = gaussian_blur_f32(&gray, sigma_for_kernel(config.denoise_kernel));
        }

        let mut binary = adaptive_threshold_inv(&gray, &config.adaptive_threshold);
        if config.close_radius > 0 {
            binary = morphology::close(&binary, Norm::LInf, config.close_radius);
        }

        let sink = self.debug.as_deref();
        emit_or_warn(sink, || DebugArtifact::gray("preprocess_gray", gray.clone()));
        emit_or_warn(sink, || DebugArtifact::gray("preprocess_binary", binary.clone()));

        NormalizedImage {
            gray,
            binary,
            scale: factor as f64,
            source_width,
            source_height,
        }
    }
}

/// Normalize `image` with `options`.
pub fn preprocess(image: &DynamicImage, options: &PreprocessConfig) -> NormalizedImage {
    Preprocessor::new(options.clone()).preprocess(image)
}
