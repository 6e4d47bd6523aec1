//! Input path and image quality validation.
//!
//! Both checks are read-only: paths are canonicalized and confined to a
//! set of sanctioned roots, and image files are only opened for reading.

pub mod dpi;

use image::DynamicImage;
use serde::Serialize;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::{InvalidMetadataPolicy, ValidationConfig};
use crate::core::SchemaScanError;
use crate::raster::{decode_raster, InputFormat};

pub use dpi::{read_dpi, DpiReading};

/// Resolution assumed when a file declares none.
pub const DEFAULT_DPI: f64 = 96.0;

/// A canonical, readable path inside a sanctioned root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedPath {
    path: PathBuf,
    format: InputFormat,
}

impl ValidatedPath {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> InputFormat {
        self.format
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DpiSource {
    Embedded,
    Default,
    /// Supplied by the caller, e.g. the resolution a PDF page was rendered at.
    Declared,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageMetadata {
    pub width: u32,
    pub height: u32,
    pub channels: u8,
    pub format: InputFormat,
    pub dpi: f64,
    pub dpi_source: DpiSource,
}

impl ImageMetadata {
    /// Metadata for an in-memory raster whose resolution the caller knows.
    pub fn declared(image: &DynamicImage, format: InputFormat, dpi: f64) -> Self {
        Self {
            width: image.width(),
            height: image.height(),
            channels: image.color().channel_count(),
            format,
            dpi,
            dpi_source: DpiSource::Declared,
        }
    }
}

pub struct PathValidator {
    roots: Vec<PathBuf>,
}

impl PathValidator {
    /// Build a validator over the given roots. An empty list sanctions the
    /// current working directory only.
    pub fn new(roots: Vec<PathBuf>) -> Result<Self, SchemaScanError> {
        let roots = if roots.is_empty() {
            vec![std::env::current_dir()?]
        } else {
            roots
        };
        let roots = roots
            .iter()
            .map(|root| {
                std::fs::canonicalize(root).map_err(|_| SchemaScanError::PathUnsafe {
                    path: root.clone(),
                    reason: "sanctioned root does not exist".to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { roots })
    }

    pub fn from_config(config: &ValidationConfig) -> Result<Self, SchemaScanError> {
        let validator = Self::new(config.allowed_roots.clone())?;
        Ok(if config.allow_temp_dir {
            validator.allow_temp_dir()
        } else {
            validator
        })
    }

    /// Also sanction the system temporary directory.
    pub fn allow_temp_dir(mut self) -> Self {
        match std::fs::canonicalize(std::env::temp_dir()) {
            Ok(temp) => {
                if !self.roots.contains(&temp) {
                    self.roots.push(temp);
                }
            }
            Err(e) => warn!("temporary directory unavailable as input root: {}", e),
        }
        self
    }

    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    fn confine(&self, original: &Path, canonical: &Path) -> Result<(), SchemaScanError> {
        if self.roots.iter().any(|root| canonical.starts_with(root)) {
            Ok(())
        } else {
            Err(SchemaScanError::PathUnsafe {
                path: original.to_path_buf(),
                reason: "resolves outside the sanctioned roots".to_string(),
            })
        }
    }

    /// Resolve `path` and check that it is a readable image or PDF inside a
    /// sanctioned root.
    pub fn validate(&self, path: &Path) -> Result<ValidatedPath, SchemaScanError> {
        let canonical = std::fs::canonicalize(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SchemaScanError::NotFound(path.to_path_buf()),
            _ => SchemaScanError::Io(e),
        })?;
        self.confine(path, &canonical)?;

        if !canonical.is_file() {
            return Err(SchemaScanError::InvalidInputFormat(format!(
                "{} is not a regular file",
                path.display()
            )));
        }

        let mut header = [0u8; 16];
        let read = File::open(&canonical)?.read(&mut header)?;
        let format = InputFormat::sniff(&header[..read]).ok_or_else(|| {
            SchemaScanError::InvalidInputFormat(format!(
                "{} is not a PNG, JPEG, BMP, TIFF or PDF file",
                path.display()
            ))
        })?;

        debug!(path = %canonical.display(), %format, "input path validated");
        Ok(ValidatedPath {
            path: canonical,
            format,
        })
    }

    /// Check that a directory resolves inside a sanctioned root.
    pub fn validate_dir(&self, dir: &Path) -> Result<PathBuf, SchemaScanError> {
        let canonical = std::fs::canonicalize(dir).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SchemaScanError::NotFound(dir.to_path_buf()),
            _ => SchemaScanError::Io(e),
        })?;
        self.confine(dir, &canonical)?;
        if !canonical.is_dir() {
            return Err(SchemaScanError::PathUnsafe {
                path: dir.to_path_buf(),
                reason: "not a directory".to_string(),
            });
        }
        Ok(canonical)
    }
}

/// Resolve the effective resolution from a metadata reading.
pub fn resolve_dpi(
    reading: DpiReading,
    config: &ValidationConfig,
) -> Result<(f64, DpiSource), SchemaScanError> {
    match reading {
        DpiReading::Success(dpi) => {
            if dpi < config.min_dpi {
                Err(SchemaScanError::InsufficientResolution {
                    dpi,
                    min_dpi: config.min_dpi,
                })
            } else {
                Ok((dpi, DpiSource::Embedded))
            }
        }
        DpiReading::MetadataAbsent => Ok((config.default_dpi, DpiSource::Default)),
        DpiReading::MetadataInvalid(reason) => match config.on_invalid_metadata {
            InvalidMetadataPolicy::UseDefault => {
                warn!("ignoring unreadable resolution metadata: {}", reason);
                Ok((config.default_dpi, DpiSource::Default))
            }
            InvalidMetadataPolicy::Reject => Err(SchemaScanError::InvalidInputFormat(format!(
                "invalid resolution metadata: {}",
                reason
            ))),
        },
    }
}

/// Read and decode a validated raster, enforcing the resolution policy.
pub fn load_checked(
    path: &ValidatedPath,
    config: &ValidationConfig,
) -> Result<(DynamicImage, ImageMetadata), SchemaScanError> {
    let bytes = std::fs::read(path.path())?;
    let (dpi, dpi_source) = resolve_dpi(read_dpi(&bytes, path.format()), config)?;
    let image = decode_raster(&bytes, path.format())?;
    let metadata = ImageMetadata {
        width: image.width(),
        height: image.height(),
        channels: image.color().channel_count(),
        format: path.format(),
        dpi,
        dpi_source,
    };
    Ok((image, metadata))
}

/// Inspect an image file's resolution against `min_dpi`.
///
/// Files without resolution metadata get [`DEFAULT_DPI`] instead of
/// failing; a declared resolution below `min_dpi` is
/// `InsufficientResolution`. No sandbox roots are applied here; use
/// [`PathValidator`] first for untrusted paths.
pub fn check_image_quality(path: &Path, min_dpi: f64) -> Result<ImageMetadata, SchemaScanError> {
    let config = ValidationConfig {
        min_dpi,
        default_dpi: DEFAULT_DPI,
        ..ValidationConfig::default()
    };
    check_image_quality_with(path, &config)
}

pub fn check_image_quality_with(
    path: &Path,
    config: &ValidationConfig,
) -> Result<ImageMetadata, SchemaScanError> {
    let bytes = std::fs::read(path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => SchemaScanError::NotFound(path.to_path_buf()),
        _ => SchemaScanError::Io(e),
    })?;
    let format = InputFormat::sniff(&bytes).ok_or_else(|| {
        SchemaScanError::InvalidInputFormat(format!("{} is not a supported image", path.display()))
    })?;
    if !format.is_raster() {
        return Err(SchemaScanError::InvalidInputFormat(format!(
            "{} must be rendered to a raster before quality checks",
            path.display()
        )));
    }
    let (dpi, dpi_source) = resolve_dpi(read_dpi(&bytes, format), config)?;
    let image = decode_raster(&bytes, format)?;
    Ok(ImageMetadata {
        width: image.width(),
        height: image.height(),
        channels: image.color().channel_count(),
        format,
        dpi,
        dpi_source,
    })
}
