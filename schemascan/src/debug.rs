//! Debug image sinks.
//!
//! Stages hand intermediate rasters to an injected [`DebugSink`] instead of
//! writing files themselves. A failing sink is logged and never aborts a run.

use image::{GrayImage, Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut};
use imageproc::rect::Rect;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::model::DetectedComponent;
use crate::trace::TraceOutcome;

/// Net colours, reused cyclically.
const NET_COLORS: [Rgb<u8>; 6] = [
    Rgb([0, 114, 178]),
    Rgb([213, 94, 0]),
    Rgb([0, 158, 115]),
    Rgb([204, 121, 167]),
    Rgb([230, 159, 0]),
    Rgb([86, 180, 233]),
];
const FLOATING_COLOR: Rgb<u8> = Rgb([160, 160, 160]);
const JUNCTION_COLOR: Rgb<u8> = Rgb([200, 0, 0]);

#[derive(Debug, Clone)]
pub enum DebugImage {
    Gray(GrayImage),
    Rgb(RgbImage),
}

#[derive(Debug, Clone)]
pub struct DebugArtifact {
    /// Stage-qualified name, e.g. `preprocess_binary`.
    pub name: String,
    pub image: DebugImage,
}

impl DebugArtifact {
    pub fn gray(name: impl Into<String>, image: GrayImage) -> Self {
        Self {
            name: name.into(),
            image: DebugImage::Gray(image),
        }
    }

    pub fn rgb(name: impl Into<String>, image: RgbImage) -> Self {
        Self {
            name: name.into(),
            image: DebugImage::Rgb(image),
        }
    }
}

pub trait DebugSink: Send + Sync {
    fn emit(&self, artifact: DebugArtifact) -> io::Result<()>;
}

/// Forward to a sink, logging instead of failing.
pub(crate) fn emit_or_warn(sink: Option<&dyn DebugSink>, artifact: impl FnOnce() -> DebugArtifact) {
    if let Some(sink) = sink {
        let artifact = artifact();
        let name = artifact.name.clone();
        if let Err(e) = sink.emit(artifact) {
            warn!(artifact = %name, "debug sink failed: {}", e);
        }
    }
}

/// Writes each artifact as `<name>.png` into a directory. Files appear
/// atomically: they are written to a temporary file and then renamed.
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

impl DebugSink for DirectorySink {
    fn emit(&self, artifact: DebugArtifact) -> io::Result<()> {
        let target = self.dir.join(format!("{}.png", sanitize(&artifact.name)));
        let mut tmp = NamedTempFile::new_in(&self.dir)?;
        let encoded = match &artifact.image {
            DebugImage::Gray(img) => img.write_to(&mut tmp, image::ImageFormat::Png),
            DebugImage::Rgb(img) => img.write_to(&mut tmp, image::ImageFormat::Png),
        };
        encoded.map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        tmp.persist(&target).map_err(|e| e.error)?;
        Ok(())
    }
}

/// Keeps artifacts in memory.
#[derive(Default)]
pub struct MemorySink {
    artifacts: Mutex<Vec<DebugArtifact>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn names(&self) -> Vec<String> {
        self.artifacts
            .lock()
            .map(|a| a.iter().map(|artifact| artifact.name.clone()).collect())
            .unwrap_or_default()
    }

    pub fn take(&self) -> Vec<DebugArtifact> {
        self.artifacts
            .lock()
            .map(|mut a| std::mem::take(&mut *a))
            .unwrap_or_default()
    }
}

impl DebugSink for MemorySink {
    fn emit(&self, artifact: DebugArtifact) -> io::Result<()> {
        self.artifacts
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "debug sink poisoned"))?
            .push(artifact);
        Ok(())
    }
}

fn faded(binary: &GrayImage) -> RgbImage {
    RgbImage::from_fn(binary.width(), binary.height(), |x, y| {
        let v = 255 - binary.get_pixel(x, y)[0];
        Rgb([v, v, v])
    })
}

/// Binary image with traced wires drawn over it in one colour per net.
/// Wires reaching no terminal are grey; junctions are red dots.
pub fn trace_overlay(binary: &GrayImage, outcome: &TraceOutcome) -> RgbImage {
    let mut overlay = faded(binary);
    let mut color_of = vec![FLOATING_COLOR; outcome.segments.len()];
    for (i, net) in outcome.nets.iter().enumerate() {
        for &segment in &net.segments {
            if let Some(color) = color_of.get_mut(segment) {
                *color = NET_COLORS[i % NET_COLORS.len()];
            }
        }
    }
    for (segment, color) in outcome.segments.iter().zip(color_of) {
        for pair in segment.path.windows(2) {
            let from = (pair[0].x as f32, pair[0].y as f32);
            let to = (pair[1].x as f32, pair[1].y as f32);
            draw_line_segment_mut(&mut overlay, from, to, color);
        }
    }
    for junction in &outcome.junctions {
        let center = (junction.position.x.round() as i32, junction.position.y.round() as i32);
        draw_filled_circle_mut(&mut overlay, center, 2, JUNCTION_COLOR);
    }
    overlay
}

/// Binary image with component boxes drawn on top: green for classified,
/// red for unclassified.
pub fn component_overlay(binary: &GrayImage, components: &[DetectedComponent]) -> RgbImage {
    let mut overlay = faded(binary);
    for component in components {
        let color = if component.kind.is_classified() {
            Rgb([0, 160, 0])
        } else {
            Rgb([220, 0, 0])
        };
        let region = component.region;
        if region.width == 0 || region.height == 0 {
            continue;
        }
        let rect = Rect::at(region.x as i32, region.y as i32).of_size(region.width, region.height);
        draw_hollow_rect_mut(&mut overlay, rect, color);
    }
    overlay
}
