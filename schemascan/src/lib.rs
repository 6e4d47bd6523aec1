//! SchemaScan - schematic image to KiCad conversion library
//!
//! Scanned or photographed schematics go through a fixed pipeline:
//! path and resolution checks, binarization, component detection, wire
//! tracing into nets, and export to a KiCad schematic (or JSON / SVG).
//!
//! # Quick Start
//!
//! ```no_run
//! use schemascan::{CancelFlag, ImportConfig, Importer, SymbolLibrary};
//! use std::path::Path;
//! use std::sync::Arc;
//!
//! let importer = Importer::new(ImportConfig::default(), Arc::new(SymbolLibrary::builtin())).unwrap();
//! let results = importer
//!     .import_file_blocking(Path::new("scan.png"), &CancelFlag::new())
//!     .unwrap();
//!
//! for result in &results {
//!     println!("{}: {} components, {} nets", result.artifact.file_name, result.stats.components, result.stats.nets);
//! }
//! ```
//!
//! # Features
//!
//! - **Validation**: sandboxed input paths, embedded DPI metadata
//! - **Detection**: template matching against a shared symbol library, optional HTTP classifier
//! - **Tracing**: skeleton-based wires, T/L/crossing junctions, union-find nets
//! - **Export**: KiCad 6/7/8 s-expression schematics, JSON snapshots, SVG previews

pub mod ai;
pub mod config;
pub mod core;
pub mod debug;
pub mod detect;
pub mod document;
pub mod export;
pub mod library;
pub mod model;
pub mod parser;
pub mod preprocess;
pub mod raster;
pub mod trace;
pub mod validate;

// Re-export main types
pub use crate::core::{
    discover_images, BatchEntry, CancelFlag, ImportResult, ImportStats, ImportWarning, Importer,
    SchemaScanError, StageTimings,
};
pub use config::ImportConfig;
pub use detect::{ComponentDetector, DetectionOutcome};
pub use document::{DocumentMetadata, NetPartition, PinRef, SchematicDocument};
pub use export::{export, ExportArtifact, ExportFormat, ExportOptions, ExporterRegistry, SchematicExporter};
pub use library::SymbolLibrary;
pub use model::{ComponentKind, DetectedComponent, FormatVersion, Junction, JunctionKind, Net, Point, WireSegment};
pub use parser::kicad::{ImportedSchematic, KicadReader};
pub use preprocess::{NormalizedImage, Preprocessor};
pub use trace::{Bus, ConnectionTracer, TraceOutcome};
pub use validate::{check_image_quality, ImageMetadata, PathValidator};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        CancelFlag, ExportFormat, FormatVersion, ImportConfig, ImportResult, Importer, SchemaScanError,
        SymbolLibrary,
    };
}
