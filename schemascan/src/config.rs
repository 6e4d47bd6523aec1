//! Typed configuration for an import run.
//!
//! Every recognized option lives here with its default. Partial JSON files
//! are accepted (`#[serde(default)]` everywhere) and the whole tree is
//! checked once by [`ImportConfig::validate`] when an importer is built.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::core::SchemaScanError;
use crate::export::ExportFormat;
use crate::model::FormatVersion;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImportConfig {
    pub validation: ValidationConfig,
    pub preprocess: PreprocessConfig,
    pub detection: DetectionConfig,
    pub tracer: TracerConfig,
    pub backend: BackendConfig,
    pub parallel: ParallelConfig,
    pub export: ExportConfig,
    /// Emit intermediate images to the injected debug sink.
    pub debug_images: bool,
}

impl Default for ImportConfig {
    fn default() -> Self {
        Self {
            validation: ValidationConfig::default(),
            preprocess: PreprocessConfig::default(),
            detection: DetectionConfig::default(),
            tracer: TracerConfig::default(),
            backend: BackendConfig::default(),
            parallel: ParallelConfig::default(),
            export: ExportConfig::default(),
            debug_images: false,
        }
    }
}

impl ImportConfig {
    pub fn from_json_str(content: &str) -> Result<Self, SchemaScanError> {
        serde_json::from_str(content)
            .map_err(|e| SchemaScanError::InvalidConfig(format!("malformed config: {}", e)))
    }

    pub fn from_json_file(path: &Path) -> Result<Self, SchemaScanError> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::from_json_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_pretty(&self) -> Result<String, SchemaScanError> {
        serde_json::to_string_pretty(self)
            .map_err(|e| SchemaScanError::InvalidConfig(e.to_string()))
    }

    /// Reject out-of-range values before any stage runs.
    pub fn validate(&self) -> Result<(), SchemaScanError> {
        self.validation.validate()?;
        self.preprocess.validate()?;
        self.detection.validate()?;
        self.tracer.validate()?;
        self.backend.validate()?;
        self.parallel.validate()?;
        Ok(())
    }
}

fn invalid(message: impl Into<String>) -> SchemaScanError {
    SchemaScanError::InvalidConfig(message.into())
}

fn check_unit_interval(name: &str, value: f64) -> Result<(), SchemaScanError> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(invalid(format!("{} must be within [0, 1], got {}", name, value)))
    }
}

/// What to do when an image carries resolution metadata that cannot be read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvalidMetadataPolicy {
    /// Treat it like missing metadata and fall back to `default_dpi`.
    UseDefault,
    /// Abort with `InvalidInputFormat`.
    Reject,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub min_dpi: f64,
    /// Assumed resolution when the file carries none.
    pub default_dpi: f64,
    /// Sanctioned input roots. Empty means the current directory.
    pub allowed_roots: Vec<PathBuf>,
    pub allow_temp_dir: bool,
    pub on_invalid_metadata: InvalidMetadataPolicy,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            min_dpi: 300.0,
            default_dpi: 96.0,
            allowed_roots: Vec::new(),
            allow_temp_dir: true,
            on_invalid_metadata: InvalidMetadataPolicy::UseDefault,
        }
    }
}

impl ValidationConfig {
    fn validate(&self) -> Result<(), SchemaScanError> {
        if !(self.min_dpi >= 0.0) {
            return Err(invalid("validation.min_dpi must be non-negative"));
        }
        if !(self.default_dpi > 0.0) {
            return Err(invalid("validation.default_dpi must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThresholdMethod {
    /// Plain box mean over the block.
    Mean,
    /// Gaussian-weighted mean over the block.
    Gaussian,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveThreshold {
    pub method: ThresholdMethod,
    /// Odd neighbourhood size in pixels.
    pub block_size: u32,
    /// Subtracted from the local mean before comparing.
    pub constant: f64,
}

impl Default for AdaptiveThreshold {
    fn default() -> Self {
        Self {
            method: ThresholdMethod::Gaussian,
            block_size: 11,
            constant: 2.0,
        }
    }
}

/// Contrast-limited adaptive histogram equalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContrastEnhancement {
    pub clip_limit: f64,
    /// Number of tiles along each axis.
    pub tile_size: u32,
}

impl Default for ContrastEnhancement {
    fn default() -> Self {
        Self {
            clip_limit: 2.0,
            tile_size: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UpscalePolicy {
    /// Images whose shorter side is below this get upscaled.
    pub min_short_side: u32,
    /// Bicubic scale factor. 1 disables upscaling.
    pub factor: u32,
}

impl Default for UpscalePolicy {
    fn default() -> Self {
        Self {
            min_short_side: 600,
            factor: 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    /// Luma conversion. When false the darkest channel is used instead,
    /// which keeps coloured pen strokes dark.
    pub grayscale: bool,
    /// Odd Gaussian kernel size; 0 or 1 disables denoising.
    pub denoise_kernel: u32,
    pub adaptive_threshold: AdaptiveThreshold,
    pub contrast: Option<ContrastEnhancement>,
    pub upscale: UpscalePolicy,
    /// Radius of the closing applied to the binary image; 0 disables it.
    pub close_radius: u8,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            grayscale: true,
            denoise_kernel: 5,
            adaptive_threshold: AdaptiveThreshold::default(),
            contrast: None,
            upscale: UpscalePolicy::default(),
            close_radius: 1,
        }
    }
}

impl PreprocessConfig {
    fn validate(&self) -> Result<(), SchemaScanError> {
        if self.denoise_kernel > 1 && self.denoise_kernel % 2 == 0 {
            return Err(invalid(format!(
                "preprocess.denoise_kernel must be odd, got {}",
                self.denoise_kernel
            )));
        }
        let block = self.adaptive_threshold.block_size;
        if block < 3 || block % 2 == 0 {
            return Err(invalid(format!(
                "preprocess.adaptive_threshold.block_size must be odd and >= 3, got {}",
                block
            )));
        }
        if !self.adaptive_threshold.constant.is_finite() {
            return Err(invalid("preprocess.adaptive_threshold.constant must be finite"));
        }
        if let Some(contrast) = &self.contrast {
            if !(contrast.clip_limit > 0.0) {
                return Err(invalid("preprocess.contrast.clip_limit must be positive"));
            }
            if contrast.tile_size == 0 {
                return Err(invalid("preprocess.contrast.tile_size must be at least 1"));
            }
        }
        if self.upscale.factor == 0 {
            return Err(invalid("preprocess.upscale.factor must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Minimum template similarity that counts as a match.
    pub matching_tolerance: f64,
    /// Candidates scoring below this are discarded.
    pub detection_threshold: f64,
    /// Matches below this leave the component unclassified.
    pub classification_threshold: f64,
    /// Body area bounds in pixels.
    pub min_area: u32,
    pub max_area: u32,
    /// Largest enclosed paper area filled as a symbol interior. Loops of
    /// wire enclose more than this.
    pub max_hole_area: u32,
    /// Candidates whose own ink covers less than this share of the filled
    /// area are discarded.
    pub min_ink_fraction: f64,
    /// Opening radius that strips wires from symbol bodies.
    pub body_radius: u8,
    /// Distance outside a body where terminals are probed.
    pub terminal_probe: u32,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            matching_tolerance: 0.92,
            detection_threshold: 0.85,
            classification_threshold: 0.90,
            min_area: 100,
            max_area: 40_000,
            max_hole_area: 4_000,
            min_ink_fraction: 0.15,
            body_radius: 2,
            terminal_probe: 3,
        }
    }
}

impl DetectionConfig {
    fn validate(&self) -> Result<(), SchemaScanError> {
        check_unit_interval("detection.matching_tolerance", self.matching_tolerance)?;
        check_unit_interval("detection.detection_threshold", self.detection_threshold)?;
        check_unit_interval("detection.classification_threshold", self.classification_threshold)?;
        if self.min_area == 0 || self.min_area > self.max_area {
            return Err(invalid(format!(
                "detection area bounds are inconsistent: min {} max {}",
                self.min_area, self.max_area
            )));
        }
        if self.max_hole_area == 0 {
            return Err(invalid("detection.max_hole_area must be at least 1"));
        }
        check_unit_interval("detection.min_ink_fraction", self.min_ink_fraction)?;
        if self.terminal_probe == 0 {
            return Err(invalid("detection.terminal_probe must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TracerConfig {
    /// Dangling segments shorter than this are treated as noise.
    pub min_segment_length: f64,
    /// Largest break in a line that still gets bridged.
    pub max_gap: f64,
    /// Junction pixels closer than this merge into one junction.
    pub junction_radius: f64,
    pub angle_tolerance_deg: f64,
    /// Maximum distance between a wire end and the terminal it attaches to.
    pub terminal_tolerance: f64,
    /// Smallest ink radius accepted as a junction dot.
    pub junction_marker_min_radius: f64,
    /// Surface terminals without wires as warnings.
    pub report_singletons: bool,
    pub detect_buses: bool,
    /// A wire counts as a bus when its ink is this many times deeper than
    /// the typical wire's.
    pub bus_width_factor: f64,
}

impl Default for TracerConfig {
    fn default() -> Self {
        Self {
            min_segment_length: 10.0,
            max_gap: 5.0,
            junction_radius: 3.0,
            angle_tolerance_deg: 30.0,
            terminal_tolerance: 6.0,
            junction_marker_min_radius: 3.0,
            report_singletons: true,
            detect_buses: true,
            bus_width_factor: 2.0,
        }
    }
}

impl TracerConfig {
    fn validate(&self) -> Result<(), SchemaScanError> {
        let non_negative = [
            ("tracer.min_segment_length", self.min_segment_length),
            ("tracer.max_gap", self.max_gap),
            ("tracer.junction_radius", self.junction_radius),
            ("tracer.terminal_tolerance", self.terminal_tolerance),
            ("tracer.junction_marker_min_radius", self.junction_marker_min_radius),
        ];
        for (name, value) in non_negative {
            if !(value >= 0.0) {
                return Err(invalid(format!("{} must be non-negative, got {}", name, value)));
            }
        }
        if !(0.0..=90.0).contains(&self.angle_tolerance_deg) {
            return Err(invalid("tracer.angle_tolerance_deg must be within [0, 90]"));
        }
        if !(self.bus_width_factor >= 1.0) {
            return Err(invalid(format!(
                "tracer.bus_width_factor must be at least 1, got {}",
                self.bus_width_factor
            )));
        }
        Ok(())
    }
}

/// Optional external classification service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub enabled: bool,
    pub url: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: None,
            api_key: None,
            timeout_secs: 30,
        }
    }
}

impl BackendConfig {
    fn validate(&self) -> Result<(), SchemaScanError> {
        if self.timeout_secs == 0 {
            return Err(invalid("backend.timeout_secs must be at least 1"));
        }
        if self.enabled && self.url.as_deref().map_or(true, str::is_empty) {
            return Err(invalid("backend.url is required when the backend is enabled"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    pub max_threads: usize,
    /// Foreground pixels per batch of candidate regions.
    pub chunk_size: usize,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            max_threads: 4,
            chunk_size: 1000,
        }
    }
}

impl ParallelConfig {
    fn validate(&self) -> Result<(), SchemaScanError> {
        if self.max_threads == 0 {
            return Err(invalid("parallel.max_threads must be at least 1"));
        }
        if self.chunk_size == 0 {
            return Err(invalid("parallel.chunk_size must be at least 1"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub format: ExportFormat,
    pub version: FormatVersion,
    /// Fail the whole export on the first per-component issue.
    pub strict: bool,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            format: ExportFormat::KicadSchematic,
            version: FormatVersion::Kicad8,
            strict: false,
        }
    }
}
