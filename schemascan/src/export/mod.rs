//! Schematic exporters.
//!
//! Each output format implements [`SchematicExporter`]; the
//! [`ExporterRegistry`] picks one by [`ExportFormat`]. Per-component
//! problems are collected as [`ExportIssue`]s unless strict mode turns the
//! first one into an error.

mod json;
mod kicad;
mod svg;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::core::SchemaScanError;
use crate::document::{PlacedComponent, SchematicDocument};
use crate::model::{ComponentId, FormatVersion, SymbolRef};

pub use json::JsonExporter;
pub use kicad::KicadExporter;
pub use svg::SvgExporter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExportFormat {
    KicadSchematic,
    Json,
    Svg,
}

impl ExportFormat {
    pub const ALL: [ExportFormat; 3] = [ExportFormat::KicadSchematic, ExportFormat::Json, ExportFormat::Svg];

    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::KicadSchematic => "kicad",
            ExportFormat::Json => "json",
            ExportFormat::Svg => "svg",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "kicad" | "kicad_sch" | "kicad-schematic" => Ok(ExportFormat::KicadSchematic),
            "json" => Ok(ExportFormat::Json),
            "svg" => Ok(ExportFormat::Svg),
            other => Err(format!("unknown export format '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExportOptions {
    pub version: FormatVersion,
    pub strict: bool,
    /// File stem for the artifact; derived from the document source if unset.
    pub file_stem: Option<String>,
}

impl Default for ExportOptions {
    fn default() -> Self {
        Self {
            version: FormatVersion::Kicad8,
            strict: false,
            file_stem: None,
        }
    }
}

impl ExportOptions {
    pub fn new(version: FormatVersion) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ExportIssueKind {
    /// The component has no symbol to place.
    UnsupportedComponentType,
    /// The symbol needs a newer format revision than the target.
    VersionMismatch { required: FormatVersion },
}

/// A component left out of an export.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExportIssue {
    pub component: ComponentId,
    pub reference: String,
    pub kind: ExportIssueKind,
    pub message: String,
}

impl ExportIssue {
    pub fn to_error(&self, target: FormatVersion) -> SchemaScanError {
        match &self.kind {
            ExportIssueKind::UnsupportedComponentType => SchemaScanError::UnsupportedComponentType {
                reference: self.reference.clone(),
                kind: self.message.clone(),
            },
            ExportIssueKind::VersionMismatch { required } => SchemaScanError::ExportTargetVersionMismatch {
                subject: self.reference.clone(),
                target,
                detail: format!("needs {} or newer", required),
            },
        }
    }
}

impl fmt::Display for ExportIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.reference, self.message)
    }
}

/// Check that a component can be written for `target`.
pub(crate) fn check_component<'a>(
    placed: &'a PlacedComponent,
    target: FormatVersion,
) -> Result<&'a SymbolRef, ExportIssue> {
    let component = &placed.component;
    let symbol = match (&component.symbol, component.kind.is_classified()) {
        (Some(symbol), true) => symbol,
        _ => {
            return Err(ExportIssue {
                component: component.id,
                reference: placed.reference.clone(),
                kind: ExportIssueKind::UnsupportedComponentType,
                message: component.kind.as_str().to_string(),
            })
        }
    };
    if symbol.min_version > target {
        return Err(ExportIssue {
            component: component.id,
            reference: placed.reference.clone(),
            kind: ExportIssueKind::VersionMismatch {
                required: symbol.min_version,
            },
            message: format!("{} requires {}, target is {}", symbol.lib_id, symbol.min_version, target),
        });
    }
    Ok(symbol)
}

/// Split components into exportable ones and issues, honouring strict mode.
pub(crate) fn partition_components<'a>(
    document: &'a SchematicDocument,
    options: &ExportOptions,
) -> Result<(Vec<(&'a PlacedComponent, &'a SymbolRef)>, Vec<ExportIssue>), SchemaScanError> {
    let mut placed = Vec::new();
    let mut issues = Vec::new();
    for component in document.components() {
        match check_component(component, options.version) {
            Ok(symbol) => placed.push((component, symbol)),
            Err(issue) => {
                if options.strict {
                    return Err(issue.to_error(options.version));
                }
                warn!(component = %issue.reference, "skipping component: {}", issue.message);
                issues.push(issue);
            }
        }
    }
    Ok((placed, issues))
}

/// Output of one exporter run.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportArtifact {
    pub format: ExportFormat,
    pub file_name: String,
    pub content: String,
    pub exported_components: usize,
    pub issues: Vec<ExportIssue>,
}

impl ExportArtifact {
    pub fn skipped_components(&self) -> usize {
        self.issues.len()
    }

    /// Write into `dir` via a temporary file and rename, so readers never
    /// see a partial file.
    pub fn write_atomic(&self, dir: &Path) -> Result<PathBuf, SchemaScanError> {
        let target = dir.join(&self.file_name);
        let mut tmp = NamedTempFile::new_in(dir)?;
        tmp.write_all(self.content.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&target).map_err(|e| SchemaScanError::Io(e.error))?;
        debug!(path = %target.display(), bytes = self.content.len(), "artifact written");
        Ok(target)
    }
}

pub trait SchematicExporter: Send + Sync {
    fn format(&self) -> ExportFormat;

    fn extension(&self) -> &'static str;

    fn export(&self, document: &SchematicDocument, options: &ExportOptions) -> Result<ExportArtifact, SchemaScanError>;
}

/// File name for a document: explicit stem, else source stem plus page.
pub(crate) fn file_name(document: &SchematicDocument, options: &ExportOptions, extension: &str) -> String {
    let meta = document.metadata();
    let stem = options.file_stem.clone().unwrap_or_else(|| {
        let base = meta
            .source
            .as_deref()
            .and_then(|s| Path::new(s).file_stem())
            .and_then(|s| s.to_str())
            .unwrap_or("schematic")
            .to_string();
        if meta.page > 0 {
            format!("{}_p{}", base, meta.page + 1)
        } else {
            base
        }
    });
    format!("{}.{}", stem, extension)
}

/// Registry of available exporters.
pub struct ExporterRegistry {
    exporters: Vec<Box<dyn SchematicExporter>>,
}

impl Default for ExporterRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ExporterRegistry {
    /// Registry with the built-in exporters.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Box::new(KicadExporter));
        registry.register(Box::new(JsonExporter));
        registry.register(Box::new(SvgExporter));
        registry
    }

    pub fn empty() -> Self {
        Self {
            exporters: Vec::new(),
        }
    }

    /// Register an exporter, replacing any existing one for its format.
    pub fn register(&mut self, exporter: Box<dyn SchematicExporter>) {
        self.exporters.retain(|e| e.format() != exporter.format());
        self.exporters.push(exporter);
    }

    pub fn get(&self, format: ExportFormat) -> Option<&dyn SchematicExporter> {
        self.exporters
            .iter()
            .find(|e| e.format() == format)
            .map(|e| e.as_ref())
    }

    pub fn formats(&self) -> Vec<ExportFormat> {
        self.exporters.iter().map(|e| e.format()).collect()
    }

    pub fn export(
        &self,
        format: ExportFormat,
        document: &SchematicDocument,
        options: &ExportOptions,
    ) -> Result<ExportArtifact, SchemaScanError> {
        let exporter = self
            .get(format)
            .ok_or_else(|| SchemaScanError::InvalidConfig(format!("no exporter registered for {}", format)))?;
        let artifact = exporter.export(document, options)?;
        info!(
            format = %format,
            file = %artifact.file_name,
            exported = artifact.exported_components,
            skipped = artifact.skipped_components(),
            "export finished"
        );
        Ok(artifact)
    }
}

/// Write `document` as a KiCad schematic for `target`.
pub fn export(
    document: &SchematicDocument,
    target: FormatVersion,
    options: &ExportOptions,
) -> Result<ExportArtifact, SchemaScanError> {
    let options = ExportOptions {
        version: target,
        ..options.clone()
    };
    KicadExporter.export(document, &options)
}
