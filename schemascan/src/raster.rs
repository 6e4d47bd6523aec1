//! Input formats and raster loading.
//!
//! Raster files are decoded with `image`. PDF pages need a
//! [`PageRasterizer`] supplied by the caller; each rendered page is then
//! imported as an independent raster.

use image::{DynamicImage, ImageFormat};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::core::SchemaScanError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputFormat {
    Png,
    Jpeg,
    Bmp,
    Tiff,
    Pdf,
}

impl InputFormat {
    /// Identify a file from its leading bytes.
    pub fn sniff(bytes: &[u8]) -> Option<InputFormat> {
        if bytes.starts_with(b"%PDF-") {
            return Some(InputFormat::Pdf);
        }
        match image::guess_format(bytes).ok()? {
            ImageFormat::Png => Some(InputFormat::Png),
            ImageFormat::Jpeg => Some(InputFormat::Jpeg),
            ImageFormat::Bmp => Some(InputFormat::Bmp),
            ImageFormat::Tiff => Some(InputFormat::Tiff),
            _ => None,
        }
    }

    pub fn extensions(&self) -> &'static [&'static str] {
        match self {
            InputFormat::Png => &["png"],
            InputFormat::Jpeg => &["jpg", "jpeg"],
            InputFormat::Bmp => &["bmp"],
            InputFormat::Tiff => &["tif", "tiff"],
            InputFormat::Pdf => &["pdf"],
        }
    }

    pub fn from_extension(ext: &str) -> Option<InputFormat> {
        [
            InputFormat::Png,
            InputFormat::Jpeg,
            InputFormat::Bmp,
            InputFormat::Tiff,
            InputFormat::Pdf,
        ]
        .into_iter()
        .find(|format| format.extensions().iter().any(|e| e.eq_ignore_ascii_case(ext)))
    }

    pub fn is_raster(&self) -> bool {
        !matches!(self, InputFormat::Pdf)
    }

    fn image_format(&self) -> Option<ImageFormat> {
        match self {
            InputFormat::Png => Some(ImageFormat::Png),
            InputFormat::Jpeg => Some(ImageFormat::Jpeg),
            InputFormat::Bmp => Some(ImageFormat::Bmp),
            InputFormat::Tiff => Some(ImageFormat::Tiff),
            InputFormat::Pdf => None,
        }
    }
}

impl fmt::Display for InputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            InputFormat::Png => "PNG",
            InputFormat::Jpeg => "JPEG",
            InputFormat::Bmp => "BMP",
            InputFormat::Tiff => "TIFF",
            InputFormat::Pdf => "PDF",
        };
        f.write_str(name)
    }
}

/// Decode an in-memory raster of a known format.
pub fn decode_raster(bytes: &[u8], format: InputFormat) -> Result<DynamicImage, SchemaScanError> {
    let image_format = format.image_format().ok_or_else(|| {
        SchemaScanError::InvalidInputFormat(format!("{} is not a raster format", format))
    })?;
    Ok(image::load_from_memory_with_format(bytes, image_format)?)
}

/// Renders document pages to rasters. PDF support is delegated to an
/// implementation of this trait.
pub trait PageRasterizer: Send + Sync {
    fn name(&self) -> &str;

    fn page_count(&self, path: &Path) -> Result<usize, SchemaScanError>;

    /// Render one zero-based page at the given resolution.
    fn render_page(&self, path: &Path, page: usize, dpi: f64) -> Result<DynamicImage, SchemaScanError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_magic_bytes() {
        assert_eq!(InputFormat::sniff(b"%PDF-1.7\n"), Some(InputFormat::Pdf));
        assert_eq!(
            InputFormat::sniff(b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR"),
            Some(InputFormat::Png)
        );
        assert_eq!(InputFormat::sniff(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(InputFormat::Jpeg));
        assert_eq!(InputFormat::sniff(b"II*\0\x08\0\0\0"), Some(InputFormat::Tiff));
        assert_eq!(InputFormat::sniff(b"hello world"), None);
    }

    #[test]
    fn test_extensions() {
        assert_eq!(InputFormat::from_extension("JPG"), Some(InputFormat::Jpeg));
        assert_eq!(InputFormat::from_extension("tiff"), Some(InputFormat::Tiff));
        assert_eq!(InputFormat::from_extension("gif"), None);
    }

    #[test]
    fn test_decode_rejects_pdf() {
        let err = decode_raster(b"%PDF-1.4", InputFormat::Pdf).unwrap_err();
        assert!(matches!(err, SchemaScanError::InvalidInputFormat(_)));
    }
}
