//! Reference symbol templates used by the detector.
//!
//! A library is built once by the caller and shared behind an `Arc` by every
//! detector and run that needs it. On disk it is a `library.json` manifest
//! next to the PNG silhouettes it names.

use image::{GrayImage, Luma};
use imageproc::drawing::{draw_filled_rect_mut, draw_polygon_mut};
use imageproc::point::Point as PixelPoint;
use imageproc::rect::Rect;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};
use tracing::{debug, info};

use crate::core::SchemaScanError;
use crate::model::{ComponentKind, FormatVersion, SymbolRef};

/// Manifest file name inside a library directory.
pub const MANIFEST_FILE: &str = "library.json";

/// Score given to range-only templates whose ranges accept a region.
pub const DEFAULT_RANGE_SCORE: f64 = 0.95;

/// Closed interval.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Range {
    pub min: f64,
    pub max: f64,
}

impl Range {
    pub const fn new(min: f64, max: f64) -> Self {
        Self { min, max }
    }

    pub fn contains(&self, value: f64) -> bool {
        value >= self.min && value <= self.max
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SymbolTemplate {
    pub name: String,
    pub kind: ComponentKind,
    pub lib_id: String,
    pub footprint: Option<String>,
    pub pin_count: u32,
    /// Long side over short side.
    pub aspect_ratio: Range,
    /// Body area in pixels.
    pub area: Range,
    /// Filled silhouette in landscape orientation, ink = 255.
    pub bitmap: Option<GrayImage>,
    /// Score reported when a template without a bitmap accepts a region.
    pub range_score: f64,
    pub min_version: FormatVersion,
}

impl SymbolTemplate {
    pub fn accepts(&self, aspect_ratio: f64, area: f64) -> bool {
        self.aspect_ratio.contains(aspect_ratio) && self.area.contains(area)
    }

    pub fn symbol_ref(&self) -> SymbolRef {
        SymbolRef {
            lib_id: self.lib_id.clone(),
            footprint: self.footprint.clone(),
            min_version: self.min_version,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Manifest {
    templates: Vec<ManifestEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ManifestEntry {
    name: String,
    kind: ComponentKind,
    lib_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    footprint: Option<String>,
    pin_count: u32,
    aspect_ratio: Range,
    area: Range,
    /// PNG file relative to the manifest.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    bitmap: Option<String>,
    #[serde(default = "default_range_score")]
    range_score: f64,
    #[serde(default = "default_min_version")]
    min_version: FormatVersion,
}

fn default_range_score() -> f64 {
    DEFAULT_RANGE_SCORE
}

fn default_min_version() -> FormatVersion {
    FormatVersion::Kicad6
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SymbolLibrary {
    templates: Vec<SymbolTemplate>,
}

impl SymbolLibrary {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Library seeded with the stock component database.
    pub fn builtin() -> Self {
        let mut library = Self::empty();
        library.push(SymbolTemplate {
            name: "resistor".to_string(),
            kind: ComponentKind::Resistor,
            lib_id: "Device:R".to_string(),
            footprint: Some(
                "Resistor_THT:R_Axial_DIN0207_L6.3mm_D2.5mm_P10.16mm_Horizontal".to_string(),
            ),
            pin_count: 2,
            aspect_ratio: Range::new(3.0, 10.0),
            area: Range::new(100.0, 5000.0),
            bitmap: Some(box_silhouette(72, 24)),
            range_score: DEFAULT_RANGE_SCORE,
            min_version: FormatVersion::Kicad6,
        });
        library.push(SymbolTemplate {
            name: "capacitor".to_string(),
            kind: ComponentKind::Capacitor,
            lib_id: "Device:C".to_string(),
            footprint: Some("Capacitor_THT:C_Disc_D5.0mm_W2.5mm_P5.00mm".to_string()),
            pin_count: 2,
            aspect_ratio: Range::new(0.5, 2.0),
            area: Range::new(100.0, 3000.0),
            bitmap: None,
            range_score: DEFAULT_RANGE_SCORE,
            min_version: FormatVersion::Kicad6,
        });
        library.push(SymbolTemplate {
            name: "inductor".to_string(),
            kind: ComponentKind::Inductor,
            lib_id: "Device:L".to_string(),
            footprint: Some(
                "Inductor_THT:L_Axial_L5.3mm_D2.2mm_P10.16mm_Horizontal_Vishay_IM-1".to_string(),
            ),
            pin_count: 2,
            aspect_ratio: Range::new(1.0, 5.0),
            area: Range::new(100.0, 4000.0),
            bitmap: None,
            range_score: DEFAULT_RANGE_SCORE,
            min_version: FormatVersion::Kicad6,
        });
        library.push(SymbolTemplate {
            name: "diode".to_string(),
            kind: ComponentKind::Diode,
            lib_id: "Device:D".to_string(),
            footprint: Some("Diode_THT:D_DO-35_SOD27_P7.62mm_Horizontal".to_string()),
            pin_count: 2,
            aspect_ratio: Range::new(1.5, 4.0),
            area: Range::new(100.0, 2000.0),
            bitmap: Some(diode_silhouette(48, 24)),
            range_score: DEFAULT_RANGE_SCORE,
            min_version: FormatVersion::Kicad6,
        });
        library.push(SymbolTemplate {
            name: "transistor".to_string(),
            kind: ComponentKind::Transistor,
            lib_id: "Device:Q_NPN_EBC".to_string(),
            footprint: Some("Package_TO_SOT_THT:TO-92_Inline".to_string()),
            pin_count: 3,
            aspect_ratio: Range::new(0.8, 1.2),
            area: Range::new(300.0, 5000.0),
            bitmap: Some(circle_silhouette(48)),
            range_score: DEFAULT_RANGE_SCORE,
            min_version: FormatVersion::Kicad6,
        });
        library.push(SymbolTemplate {
            name: "ic".to_string(),
            kind: ComponentKind::Ic,
            lib_id: "Device:IC".to_string(),
            footprint: Some("Package_DIP:DIP-8_W7.62mm".to_string()),
            pin_count: 8,
            aspect_ratio: Range::new(0.8, 1.5),
            area: Range::new(1000.0, 20000.0),
            bitmap: Some(box_silhouette(48, 48)),
            range_score: DEFAULT_RANGE_SCORE,
            min_version: FormatVersion::Kicad6,
        });
        library.push(SymbolTemplate {
            name: "connector".to_string(),
            kind: ComponentKind::Connector,
            lib_id: "Connector:Conn_01x04_Pin".to_string(),
            footprint: Some(
                "Connector_PinHeader_2.54mm:PinHeader_1x04_P2.54mm_Vertical".to_string(),
            ),
            pin_count: 4,
            aspect_ratio: Range::new(0.2, 5.0),
            area: Range::new(500.0, 10000.0),
            bitmap: None,
            range_score: DEFAULT_RANGE_SCORE,
            min_version: FormatVersion::Kicad7,
        });
        library
    }

    pub fn push(&mut self, template: SymbolTemplate) {
        self.templates.push(template);
    }

    pub fn templates(&self) -> &[SymbolTemplate] {
        &self.templates
    }

    pub fn template(&self, name: &str) -> Option<&SymbolTemplate> {
        self.templates.iter().find(|t| t.name == name)
    }

    /// First template registered for `kind`.
    pub fn for_kind(&self, kind: ComponentKind) -> Option<&SymbolTemplate> {
        self.templates.iter().find(|t| t.kind == kind)
    }

    pub fn len(&self) -> usize {
        self.templates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.templates.is_empty()
    }

    /// Load `library.json` and its bitmaps from `dir`.
    pub fn load(dir: &Path) -> Result<Self, SchemaScanError> {
        let manifest_path = dir.join(MANIFEST_FILE);
        let content = std::fs::read_to_string(&manifest_path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => SchemaScanError::NotFound(manifest_path.clone()),
            _ => SchemaScanError::Io(e),
        })?;
        let manifest: Manifest = serde_json::from_str(&content).map_err(|e| {
            SchemaScanError::InvalidConfig(format!("malformed {}: {}", manifest_path.display(), e))
        })?;

        let mut library = Self::empty();
        for entry in manifest.templates {
            if entry.aspect_ratio.min > entry.aspect_ratio.max || entry.area.min > entry.area.max {
                return Err(SchemaScanError::InvalidConfig(format!(
                    "template '{}' has an empty range",
                    entry.name
                )));
            }
            let bitmap = match &entry.bitmap {
                Some(file) => Some(load_bitmap(dir, file)?),
                None => None,
            };
            debug!(template = %entry.name, kind = %entry.kind, bitmap = bitmap.is_some(), "loaded template");
            library.push(SymbolTemplate {
                name: entry.name,
                kind: entry.kind,
                lib_id: entry.lib_id,
                footprint: entry.footprint,
                pin_count: entry.pin_count,
                aspect_ratio: entry.aspect_ratio,
                area: entry.area,
                bitmap,
                range_score: entry.range_score.clamp(0.0, 1.0),
                min_version: entry.min_version,
            });
        }
        info!(templates = library.len(), dir = %dir.display(), "symbol library loaded");
        Ok(library)
    }

    /// Write the manifest and one `<name>.png` per bitmap into `dir`.
    pub fn save(&self, dir: &Path) -> Result<(), SchemaScanError> {
        std::fs::create_dir_all(dir)?;
        let mut entries = Vec::with_capacity(self.templates.len());
        for template in &self.templates {
            let bitmap = match &template.bitmap {
                Some(img) => {
                    let file = format!("{}.png", template.name);
                    img.save(dir.join(&file))?;
                    Some(file)
                }
                None => None,
            };
            entries.push(ManifestEntry {
                name: template.name.clone(),
                kind: template.kind,
                lib_id: template.lib_id.clone(),
                footprint: template.footprint.clone(),
                pin_count: template.pin_count,
                aspect_ratio: template.aspect_ratio,
                area: template.area,
                bitmap,
                range_score: template.range_score,
                min_version: template.min_version,
            });
        }
        let json = serde_json::to_string_pretty(&Manifest { templates: entries })
            .map_err(|e| SchemaScanError::InvalidConfig(e.to_string()))?;
        std::fs::write(dir.join(MANIFEST_FILE), json)?;
        Ok(())
    }
}

fn load_bitmap(dir: &Path, file: &str) -> Result<GrayImage, SchemaScanError> {
    let relative = Path::new(file);
    if !relative.components().all(|c| matches!(c, Component::Normal(_))) {
        return Err(SchemaScanError::PathUnsafe {
            path: relative.to_path_buf(),
            reason: "template bitmaps must be plain paths inside the library directory"
                .to_string(),
        });
    }
    // Silhouettes are stored ink-white on black, like the binary image.
    let gray = image::open(dir.join(relative))?.to_luma8();
    Ok(GrayImage::from_fn(gray.width(), gray.height(), |x, y| {
        Luma([if gray.get_pixel(x, y)[0] > 127 { 255 } else { 0 }])
    }))
}

fn box_silhouette(width: u32, height: u32) -> GrayImage {
    GrayImage::from_pixel(width, height, Luma([255u8]))
}

/// Disc touching all four edges, like a cropped blob does.
fn circle_silhouette(size: u32) -> GrayImage {
    let c = (size as f64 - 1.0) / 2.0;
    let r2 = (size as f64 / 2.0).powi(2);
    GrayImage::from_fn(size, size, |x, y| {
        let d2 = (x as f64 - c).powi(2) + (y as f64 - c).powi(2);
        Luma([if d2 <= r2 { 255 } else { 0 }])
    })
}

/// Triangle pointing right into a cathode bar.
fn diode_silhouette(width: u32, height: u32) -> GrayImage {
    let mut img = GrayImage::new(width, height);
    let bar = (width / 8).max(2);
    let tip = (width - bar) as i32;
    let h = height as i32;
    draw_polygon_mut(
        &mut img,
        &[
            PixelPoint::new(0, 0),
            PixelPoint::new(tip, h / 2),
            PixelPoint::new(0, h - 1),
        ],
        Luma([255u8]),
    );
    draw_filled_rect_mut(&mut img, Rect::at(tip, 0).of_size(bar, height), Luma([255u8]));
    img
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_covers_every_kind() {
        let library = SymbolLibrary::builtin();
        for kind in ComponentKind::CLASSIFIED {
            assert!(library.for_kind(kind).is_some(), "missing {}", kind);
        }
        assert!(library.for_kind(ComponentKind::Unclassified).is_none());
        assert_eq!(
            library.for_kind(ComponentKind::Connector).unwrap().min_version,
            FormatVersion::Kicad7
        );
    }

    #[test]
    fn test_silhouettes_are_landscape() {
        for template in SymbolLibrary::builtin().templates() {
            if let Some(bitmap) = &template.bitmap {
                assert!(bitmap.width() >= bitmap.height(), "{} is portrait", template.name);
                assert!(bitmap.pixels().any(|p| p[0] == 255));
            }
        }
    }

    #[test]
    fn test_accepts_uses_both_ranges() {
        let library = SymbolLibrary::builtin();
        let resistor = library.template("resistor").unwrap();
        assert!(resistor.accepts(3.0, 1600.0));
        assert!(!resistor.accepts(1.0, 1600.0));
        assert!(!resistor.accepts(3.0, 9000.0));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let library = SymbolLibrary::builtin();
        library.save(dir.path()).unwrap();
        assert!(dir.path().join("diode.png").exists());
        assert!(!dir.path().join("capacitor.png").exists());

        let loaded = SymbolLibrary::load(dir.path()).unwrap();
        assert_eq!(loaded, library);
    }

    #[test]
    fn test_load_rejects_escaping_bitmap() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(MANIFEST_FILE),
            r#"{"templates":[{"name":"x","kind":"resistor","lib_id":"Device:R","pin_count":2,
                "aspect_ratio":{"min":1,"max":2},"area":{"min":1,"max":2},"bitmap":"../x.png"}]}"#,
        )
        .unwrap();
        assert!(matches!(
            SymbolLibrary::load(dir.path()),
            Err(SchemaScanError::PathUnsafe { .. })
        ));
    }

    #[test]
    fn test_load_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            SymbolLibrary::load(dir.path()),
            Err(SchemaScanError::NotFound(_))
        ));
    }
}
