//! Pipeline orchestration shared by the CLI and library callers.
//! validate -> load -> preprocess -> detect -> (backend) -> trace -> document -> export

use chrono::{DateTime, Utc};
use image::DynamicImage;
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::ai::{ClassifierError, HttpSymbolClassifier, SymbolClassifier};
use crate::config::ImportConfig;
use crate::debug::DebugSink;
use crate::detect::{ComponentDetector, DetectionOutcome, DetectionWarning};
use crate::document::{DocumentMetadata, SchematicDocument};
use crate::export::{ExportArtifact, ExportIssue, ExportOptions, ExporterRegistry};
use crate::library::SymbolLibrary;
use crate::model::FormatVersion;
use crate::parser::sexp::ParseError;
use crate::preprocess::Preprocessor;
use crate::raster::{InputFormat, PageRasterizer};
use crate::trace::{Bus, ConnectionTracer, TraceOutcome, TraceWarning};
use crate::validate::{load_checked, ImageMetadata, PathValidator};

#[derive(Debug, thiserror::Error)]
pub enum SchemaScanError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("Classification backend error: {0}")]
    Backend(#[from] ClassifierError),
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("Unsafe path {path}: {reason}")]
    PathUnsafe { path: PathBuf, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Invalid input format: {0}")]
    InvalidInputFormat(String),
    #[error("Insufficient resolution: {dpi:.0} DPI is below the required {min_dpi:.0} DPI")]
    InsufficientResolution { dpi: f64, min_dpi: f64 },
    #[error("Component recognition failed: {0}")]
    ComponentRecognitionFailure(String),
    #[error("Backend {provider} timed out after {seconds:.1}s")]
    ExternalBackendTimeout { provider: String, seconds: f64 },
    #[error("Document invariant violated: {0}")]
    DocumentInvariant(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Unsupported component type {kind} for {reference}")]
    UnsupportedComponentType { reference: String, kind: String },
    #[error("{subject} cannot be written as {target}: {detail}")]
    ExportTargetVersionMismatch {
        subject: String,
        target: FormatVersion,
        detail: String,
    },
    #[error("Import cancelled")]
    Cancelled,
}

impl From<ParseError> for SchemaScanError {
    fn from(e: ParseError) -> Self {
        SchemaScanError::Parse(e.to_string())
    }
}

impl SchemaScanError {
    /// Recognition and backend failures degrade a run; everything else
    /// aborts it.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            SchemaScanError::ComponentRecognitionFailure(_)
                | SchemaScanError::ExternalBackendTimeout { .. }
                | SchemaScanError::Backend(_)
        )
    }

    /// Raised by an exporter, typically in strict mode.
    pub fn is_export_failure(&self) -> bool {
        matches!(
            self,
            SchemaScanError::UnsupportedComponentType { .. }
                | SchemaScanError::ExportTargetVersionMismatch { .. }
        )
    }
}

/// Cooperative cancellation, checked between stages.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<(), SchemaScanError> {
        if self.is_cancelled() {
            Err(SchemaScanError::Cancelled)
        } else {
            Ok(())
        }
    }
}

fn ms_since(start: Instant) -> f64 {
    start.elapsed().as_secs_f64() * 1000.0
}

/// Wall time per stage, in milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StageTimings {
    pub validate_ms: f64,
    pub load_ms: f64,
    pub preprocess_ms: f64,
    pub detect_ms: f64,
    pub backend_ms: f64,
    pub trace_ms: f64,
    pub document_ms: f64,
    pub export_ms: f64,
    pub total_ms: f64,
}

/// Structured summary of one imported page.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImportStats {
    pub source: Option<String>,
    pub page: u32,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub timings: StageTimings,
    pub image_width: u32,
    pub image_height: u32,
    pub dpi: f64,
    pub scale: f64,
    /// Source raster plus normalized buffers.
    pub buffer_bytes: usize,
    pub candidates: usize,
    pub rejected_by_area: usize,
    pub rejected_sparse: usize,
    pub below_threshold: usize,
    pub components: usize,
    pub classified: usize,
    pub unclassified: usize,
    pub mean_confidence: f64,
    pub backend_requests: usize,
    pub backend_reclassified: usize,
    pub backend_fallbacks: usize,
    pub segments: usize,
    pub dropped_noise: usize,
    pub junctions: usize,
    pub crossings: usize,
    pub bridged_gaps: usize,
    pub nets: usize,
    pub buses: usize,
    pub singleton_nets: usize,
    pub floating_wires: usize,
    pub exported_components: usize,
    pub skipped_components: usize,
    /// Exported share of detected components; 1.0 for an empty page.
    pub success_rate: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "stage", content = "warning", rename_all = "snake_case")]
pub enum ImportWarning {
    Detection(DetectionWarning),
    Trace(TraceWarning),
    Export(ExportIssue),
}

impl ImportWarning {
    /// The recoverable error this warning stands for, if any.
    pub fn as_error(&self) -> Option<SchemaScanError> {
        match self {
            ImportWarning::Detection(w) => Some(SchemaScanError::ComponentRecognitionFailure(w.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for ImportWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportWarning::Detection(w) => write!(f, "detect: {}", w),
            ImportWarning::Trace(w) => write!(f, "trace: {}", w),
            ImportWarning::Export(issue) => write!(f, "export: {} skipped: {}", issue.reference, issue.message),
        }
    }
}

/// Result of importing one raster page.
#[derive(Debug, Clone)]
pub struct ImportResult {
    pub document: SchematicDocument,
    pub artifact: ExportArtifact,
    /// Thick wires found while tracing; not part of the exported document.
    pub buses: Vec<Bus>,
    pub stats: ImportStats,
    pub warnings: Vec<ImportWarning>,
}

/// Outcome for one file of a directory import.
#[derive(Debug)]
pub struct BatchEntry {
    pub path: PathBuf,
    pub result: Result<Vec<ImportResult>, SchemaScanError>,
}

/// Recursively discover importable images in a directory.
pub fn discover_images(dir: &Path) -> Result<Vec<PathBuf>, SchemaScanError> {
    let mut files = Vec::new();
    walk_dir(dir, &mut files, 0)?;
    files.sort();
    Ok(files)
}

fn walk_dir(dir: &Path, files: &mut Vec<PathBuf>, depth: usize) -> Result<(), SchemaScanError> {
    if depth > 20 {
        return Ok(());
    }
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
            if name.starts_with('.') || name == "node_modules" || name == "target" || name == "build" {
                continue;
            }
            walk_dir(&path, files, depth + 1)?;
        } else if path.is_file() {
            if let Some(ext) = path.extension().and_then(|s| s.to_str()) {
                if InputFormat::from_extension(ext).is_some() {
                    files.push(path);
                }
            }
        }
    }
    Ok(())
}

/// Where a raster came from.
struct Origin {
    source: Option<String>,
    page: u32,
}

/// The import pipeline. Build once and reuse across files; the symbol
/// library is shared, not copied.
pub struct Importer {
    config: ImportConfig,
    library: Arc<SymbolLibrary>,
    validator: PathValidator,
    preprocessor: Preprocessor,
    detector: ComponentDetector,
    tracer: ConnectionTracer,
    exporters: ExporterRegistry,
    classifier: Option<Arc<dyn SymbolClassifier>>,
    rasterizer: Option<Arc<dyn PageRasterizer>>,
}

impl Importer {
    /// Validate `config` and build every stage.
    pub fn new(config: ImportConfig, library: Arc<SymbolLibrary>) -> Result<Self, SchemaScanError> {
        config.validate()?;
        let validator = PathValidator::from_config(&config.validation)?;
        let classifier: Option<Arc<dyn SymbolClassifier>> = if config.backend.enabled {
            Some(Arc::new(HttpSymbolClassifier::from_config(&config.backend)?))
        } else {
            None
        };
        Ok(Self {
            preprocessor: Preprocessor::new(config.preprocess.clone()),
            detector: ComponentDetector::new(library.clone(), config.detection.clone(), config.parallel.clone()),
            tracer: ConnectionTracer::new(config.tracer.clone()),
            exporters: ExporterRegistry::new(),
            validator,
            classifier,
            rasterizer: None,
            library,
            config,
        })
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn SymbolClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    /// Route intermediate images to `sink`. Ignored unless `debug_images`
    /// is set in the config.
    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        if !self.config.debug_images {
            warn!("debug sink supplied but debug_images is off; ignoring it");
            return self;
        }
        self.preprocessor = Preprocessor::new(self.config.preprocess.clone()).with_debug_sink(sink.clone());
        self.detector = ComponentDetector::new(
            self.library.clone(),
            self.config.detection.clone(),
            self.config.parallel.clone(),
        )
        .with_debug_sink(sink.clone());
        self.tracer = ConnectionTracer::new(self.config.tracer.clone()).with_debug_sink(sink);
        self
    }

    pub fn with_rasterizer(mut self, rasterizer: Arc<dyn PageRasterizer>) -> Self {
        self.rasterizer = Some(rasterizer);
        self
    }

    pub fn with_validator(mut self, validator: PathValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn library(&self) -> &SymbolLibrary {
        &self.library
    }

    pub fn validator(&self) -> &PathValidator {
        &self.validator
    }

    fn export_options(&self) -> ExportOptions {
        ExportOptions::new(self.config.export.version).strict(self.config.export.strict)
    }

    /// Import one file. Rasters yield one result; PDFs one per page.
    pub async fn import_file(&self, path: &Path, cancel: &CancelFlag) -> Result<Vec<ImportResult>, SchemaScanError> {
        let started = Instant::now();
        let validated = self.validator.validate(path)?;
        let source = path.file_name().and_then(|n| n.to_str()).map(str::to_string);
        let mut timings = StageTimings {
            validate_ms: ms_since(started),
            ..StageTimings::default()
        };
        info!(path = %validated.path().display(), format = %validated.format(), "importing");
        cancel.check()?;

        if validated.format().is_raster() {
            let load_started = Instant::now();
            let (image, metadata) = load_checked(&validated, &self.config.validation)?;
            timings.load_ms = ms_since(load_started);
            let origin = Origin { source, page: 0 };
            let result = self.run(&image, &metadata, origin, timings, started, cancel).await?;
            return Ok(vec![result]);
        }

        let rasterizer = self.rasterizer.as_ref().ok_or_else(|| {
            SchemaScanError::InvalidInputFormat(format!(
                "{} is a PDF and no page rasterizer is configured",
                path.display()
            ))
        })?;
        let pages = rasterizer.page_count(validated.path())?;
        let dpi = self.config.validation.min_dpi;
        debug!(rasterizer = rasterizer.name(), pages, dpi, "rendering PDF pages");
        let mut results = Vec::with_capacity(pages);
        for page in 0..pages {
            cancel.check()?;
            let page_started = Instant::now();
            let image = rasterizer.render_page(validated.path(), page, dpi)?;
            let metadata = ImageMetadata::declared(&image, InputFormat::Pdf, dpi);
            let page_timings = StageTimings {
                load_ms: ms_since(page_started),
                ..timings.clone()
            };
            let origin = Origin {
                source: source.clone(),
                page: page as u32,
            };
            results.push(self.run(&image, &metadata, origin, page_timings, page_started, cancel).await?);
        }
        Ok(results)
    }

    /// Run the pipeline on an in-memory raster.
    pub async fn import_image(
        &self,
        image: &DynamicImage,
        metadata: &ImageMetadata,
        cancel: &CancelFlag,
    ) -> Result<ImportResult, SchemaScanError> {
        if metadata.dpi < self.config.validation.min_dpi {
            return Err(SchemaScanError::InsufficientResolution {
                dpi: metadata.dpi,
                min_dpi: self.config.validation.min_dpi,
            });
        }
        let origin = Origin { source: None, page: 0 };
        self.run(image, metadata, origin, StageTimings::default(), Instant::now(), cancel)
            .await
    }

    /// Blocking wrapper over [`Importer::import_file`] for synchronous callers.
    pub fn import_file_blocking(&self, path: &Path, cancel: &CancelFlag) -> Result<Vec<ImportResult>, SchemaScanError> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        runtime.block_on(self.import_file(path, cancel))
    }

    pub fn import_directory_blocking(&self, dir: &Path, cancel: &CancelFlag) -> Result<Vec<BatchEntry>, SchemaScanError> {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build()?;
        runtime.block_on(self.import_directory(dir, cancel))
    }

    /// Import every image under `dir`. One bad file does not stop the rest.
    pub async fn import_directory(&self, dir: &Path, cancel: &CancelFlag) -> Result<Vec<BatchEntry>, SchemaScanError> {
        let dir = self.validator.validate_dir(dir)?;
        let files = discover_images(&dir)?;
        info!(dir = %dir.display(), files = files.len(), "batch import");
        let mut entries = Vec::with_capacity(files.len());
        for path in files {
            cancel.check()?;
            let result = self.import_file(&path, cancel).await;
            match &result {
                Err(SchemaScanError::Cancelled) => return Err(SchemaScanError::Cancelled),
                Err(e) => warn!(path = %path.display(), "import failed: {}", e),
                Ok(_) => {}
            }
            entries.push(BatchEntry { path, result });
        }
        Ok(entries)
    }

    async fn run(
        &self,
        image: &DynamicImage,
        metadata: &ImageMetadata,
        origin: Origin,
        mut timings: StageTimings,
        started: Instant,
        cancel: &CancelFlag,
    ) -> Result<ImportResult, SchemaScanError> {
        let started_at = Utc::now();

        cancel.check()?;
        let t = Instant::now();
        let normalized = self.preprocessor.preprocess(image);
        timings.preprocess_ms = ms_since(t);

        cancel.check()?;
        let t = Instant::now();
        let mut detection = self.detector.detect(&normalized);
        timings.detect_ms = ms_since(t);

        if let Some(classifier) = &self.classifier {
            cancel.check()?;
            let t = Instant::now();
            let timeout = Duration::from_secs(self.config.backend.timeout_secs);
            detection = self
                .detector
                .refine_with_backend(detection, &normalized, classifier.as_ref(), timeout)
                .await;
            timings.backend_ms = ms_since(t);
        }

        cancel.check()?;
        let t = Instant::now();
        let trace = self.tracer.trace(&normalized, &detection.components);
        timings.trace_ms = ms_since(t);

        cancel.check()?;
        let t = Instant::now();
        let DetectionOutcome {
            components,
            stats: detection_stats,
            warnings: detection_warnings,
        } = detection;
        let TraceOutcome {
            segments,
            junctions,
            nets,
            buses,
            stats: trace_stats,
            warnings: trace_warnings,
        } = trace;
        let mut doc_meta = DocumentMetadata::new(normalized.width(), normalized.height(), metadata.dpi, normalized.scale);
        if let Some(source) = &origin.source {
            doc_meta = doc_meta.with_source(source.clone(), origin.page);
        } else {
            doc_meta.page = origin.page;
        }
        let document = SchematicDocument::new(
            doc_meta,
            components,
            TraceOutcome {
                segments,
                junctions,
                nets,
                buses: Vec::new(),
                stats: trace_stats.clone(),
                warnings: Vec::new(),
            },
        )?;
        timings.document_ms = ms_since(t);

        cancel.check()?;
        let t = Instant::now();
        let artifact = self
            .exporters
            .export(self.config.export.format, &document, &self.export_options())?;
        timings.export_ms = ms_since(t);
        timings.total_ms = ms_since(started);

        let components = detection_stats.components;
        let stats = ImportStats {
            source: origin.source,
            page: origin.page,
            started_at,
            finished_at: Utc::now(),
            timings,
            image_width: metadata.width,
            image_height: metadata.height,
            dpi: metadata.dpi,
            scale: normalized.scale,
            buffer_bytes: image.as_bytes().len() + normalized.buffer_bytes(),
            candidates: detection_stats.candidates,
            rejected_by_area: detection_stats.rejected_by_area,
            rejected_sparse: detection_stats.rejected_sparse,
            below_threshold: detection_stats.below_threshold,
            components,
            classified: detection_stats.classified,
            unclassified: detection_stats.unclassified,
            mean_confidence: detection_stats.mean_confidence,
            backend_requests: detection_stats.backend_requests,
            backend_reclassified: detection_stats.backend_reclassified,
            backend_fallbacks: detection_stats.backend_fallbacks,
            segments: trace_stats.segments,
            dropped_noise: trace_stats.dropped_noise,
            junctions: trace_stats.junctions,
            crossings: trace_stats.crossings,
            bridged_gaps: trace_stats.bridged_gaps,
            nets: trace_stats.nets,
            buses: trace_stats.buses,
            singleton_nets: trace_stats.singleton_nets,
            floating_wires: trace_stats.floating_wires,
            exported_components: artifact.exported_components,
            skipped_components: artifact.skipped_components(),
            success_rate: if components == 0 {
                1.0
            } else {
                artifact.exported_components as f64 / components as f64
            },
        };

        let mut warnings: Vec<ImportWarning> = detection_warnings.into_iter().map(ImportWarning::Detection).collect();
        warnings.extend(trace_warnings.into_iter().map(ImportWarning::Trace));
        warnings.extend(artifact.issues.iter().cloned().map(ImportWarning::Export));

        info!(
            components = stats.components,
            nets = stats.nets,
            exported = stats.exported_components,
            warnings = warnings.len(),
            total_ms = stats.timings.total_ms,
            "import finished"
        );
        Ok(ImportResult {
            document,
            artifact,
            buses,
            stats,
            warnings,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ClassificationRequest, ClassifierVerdict};
    use crate::config::ImportConfig;
    use crate::debug::MemorySink;
    use crate::export::ExportFormat;
    use async_trait::async_trait;
    use image::{GrayImage, Luma};
    use imageproc::drawing::draw_filled_rect_mut;
    use imageproc::rect::Rect;

    fn blank(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageLuma8(GrayImage::from_pixel(width, height, Luma([255u8])))
    }

    /// One filled box with nothing attached.
    fn boxed() -> DynamicImage {
        let mut img = GrayImage::from_pixel(800, 700, Luma([255u8]));
        draw_filled_rect_mut(&mut img, Rect::at(300, 300).of_size(60, 60), Luma([0u8]));
        DynamicImage::ImageLuma8(img)
    }

    fn importer(config: ImportConfig) -> Importer {
        Importer::new(config, Arc::new(SymbolLibrary::builtin())).unwrap()
    }

    /// No templates, so every detected body stays unclassified.
    fn untrained(config: ImportConfig) -> Importer {
        Importer::new(config, Arc::new(SymbolLibrary::empty())).unwrap()
    }

    fn config_in(dir: &Path) -> ImportConfig {
        let mut config = ImportConfig::default();
        config.validation.allowed_roots = vec![dir.to_path_buf()];
        config.validation.allow_temp_dir = false;
        config
    }

    #[test]
    fn test_cancel_flag() {
        let flag = CancelFlag::new();
        assert!(flag.check().is_ok());
        let shared = flag.clone();
        shared.cancel();
        assert!(matches!(flag.check(), Err(SchemaScanError::Cancelled)));
    }

    #[test]
    fn test_error_classification() {
        assert!(SchemaScanError::ComponentRecognitionFailure("x".into()).is_recoverable());
        assert!(SchemaScanError::ExternalBackendTimeout {
            provider: "http".into(),
            seconds: 30.0
        }
        .is_recoverable());
        assert!(!SchemaScanError::InsufficientResolution { dpi: 72.0, min_dpi: 300.0 }.is_recoverable());
        assert!(!SchemaScanError::PathUnsafe {
            path: PathBuf::from("/etc"),
            reason: "outside".into()
        }
        .is_recoverable());
        assert!(SchemaScanError::UnsupportedComponentType {
            reference: "X1".into(),
            kind: "unclassified".into()
        }
        .is_export_failure());
        let parse: SchemaScanError = ParseError::UnexpectedEof.into();
        assert!(matches!(parse, SchemaScanError::Parse(_)));
    }

    #[test]
    fn test_invalid_config_is_rejected_at_construction() {
        let mut config = ImportConfig::default();
        config.parallel.max_threads = 0;
        assert!(matches!(
            Importer::new(config, Arc::new(SymbolLibrary::builtin())),
            Err(SchemaScanError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_blank_page_imports_cleanly() {
        let importer = importer(ImportConfig::default());
        let image = blank(700, 700);
        let meta = ImageMetadata::declared(&image, InputFormat::Png, 300.0);
        let result = importer.import_image(&image, &meta, &CancelFlag::new()).await.unwrap();
        assert_eq!(result.stats.components, 0);
        assert_eq!(result.stats.nets, 0);
        assert_eq!(result.stats.success_rate, 1.0);
        assert!(result.stats.buffer_bytes >= 700 * 700 * 3);
        assert!(result.warnings.is_empty());
        assert_eq!(result.artifact.file_name, "schematic.kicad_sch");
    }

    #[tokio::test]
    async fn test_unclassified_box_is_reported_not_dropped() {
        let mut config = ImportConfig::default();
        config.export.format = ExportFormat::Json;
        let importer = untrained(config);
        let image = boxed();
        let meta = ImageMetadata::declared(&image, InputFormat::Png, 300.0);
        let result = importer.import_image(&image, &meta, &CancelFlag::new()).await.unwrap();
        assert_eq!(result.stats.components, 1);
        assert_eq!(result.stats.unclassified, 1);
        assert_eq!(result.stats.exported_components, 1);
        let failure = result.warnings.iter().find_map(ImportWarning::as_error).unwrap();
        assert!(matches!(failure, SchemaScanError::ComponentRecognitionFailure(_)));
        assert!(failure.is_recoverable());
    }

    #[tokio::test]
    async fn test_strict_kicad_export_fails_on_unclassified() {
        let image = boxed();
        let meta = ImageMetadata::declared(&image, InputFormat::Png, 300.0);

        let lenient = untrained(ImportConfig::default());
        let result = lenient.import_image(&image, &meta, &CancelFlag::new()).await.unwrap();
        assert_eq!(result.stats.skipped_components, 1);
        assert_eq!(result.stats.success_rate, 0.0);
        assert!(result.warnings.iter().any(|w| matches!(w, ImportWarning::Export(_))));

        let mut config = ImportConfig::default();
        config.export.strict = true;
        let strict = untrained(config);
        let err = strict.import_image(&image, &meta, &CancelFlag::new()).await.unwrap_err();
        assert!(matches!(err, SchemaScanError::UnsupportedComponentType { .. }));
        assert!(err.is_export_failure());
    }

    #[tokio::test]
    async fn test_low_declared_resolution_is_rejected() {
        let importer = importer(ImportConfig::default());
        let image = blank(100, 100);
        let meta = ImageMetadata::declared(&image, InputFormat::Png, 72.0);
        let err = importer.import_image(&image, &meta, &CancelFlag::new()).await.unwrap_err();
        assert!(matches!(err, SchemaScanError::InsufficientResolution { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let importer = importer(ImportConfig::default());
        let image = blank(100, 100);
        let meta = ImageMetadata::declared(&image, InputFormat::Png, 300.0);
        let cancel = CancelFlag::new();
        cancel.cancel();
        let err = importer.import_image(&image, &meta, &cancel).await.unwrap_err();
        assert!(matches!(err, SchemaScanError::Cancelled));
    }

    struct NeverAnswers;

    #[async_trait]
    impl SymbolClassifier for NeverAnswers {
        fn name(&self) -> &str {
            "never"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn classify(&self, _request: &ClassificationRequest) -> Result<ClassifierVerdict, ClassifierError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(ClassifierError::NotConfigured)
        }
    }

    #[tokio::test]
    async fn test_backend_timeout_falls_back_to_local_result() {
        let mut config = ImportConfig::default();
        config.backend.timeout_secs = 1;
        config.export.format = ExportFormat::Json;
        let local = untrained(config.clone());
        let remote = untrained(config).with_classifier(Arc::new(NeverAnswers));
        let image = boxed();
        let meta = ImageMetadata::declared(&image, InputFormat::Png, 300.0);

        let expected = local.import_image(&image, &meta, &CancelFlag::new()).await.unwrap();
        let fallback = remote.import_image(&image, &meta, &CancelFlag::new()).await.unwrap();
        assert_eq!(fallback.document, expected.document);
        assert_eq!(fallback.stats.backend_requests, 1);
        assert_eq!(fallback.stats.backend_fallbacks, 1);
    }

    #[test]
    fn test_import_file_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page.png");
        boxed().save(&path).unwrap();
        let importer = importer(config_in(dir.path()));
        let results = importer.import_file_blocking(&path, &CancelFlag::new()).unwrap();
        assert_eq!(results.len(), 1);
        let result = &results[0];
        assert_eq!(result.stats.source.as_deref(), Some("page.png"));
        assert_eq!(result.stats.dpi, 96.0);
        assert_eq!(result.artifact.file_name, "page.kicad_sch");
        assert!(result.stats.timings.total_ms >= result.stats.timings.preprocess_ms);
    }

    #[test]
    fn test_pdf_without_rasterizer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"%PDF-1.7\n%%EOF\n").unwrap();
        let importer = importer(config_in(dir.path()));
        let err = importer.import_file_blocking(&path, &CancelFlag::new()).unwrap_err();
        assert!(matches!(err, SchemaScanError::InvalidInputFormat(_)));
    }

    struct TwoPages;

    impl PageRasterizer for TwoPages {
        fn name(&self) -> &str {
            "two-pages"
        }

        fn page_count(&self, _path: &Path) -> Result<usize, SchemaScanError> {
            Ok(2)
        }

        fn render_page(&self, _path: &Path, _page: usize, _dpi: f64) -> Result<DynamicImage, SchemaScanError> {
            Ok(blank(640, 640))
        }
    }

    #[test]
    fn test_pdf_pages_are_independent_rasters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.pdf");
        std::fs::write(&path, b"%PDF-1.7\n%%EOF\n").unwrap();
        let importer = importer(config_in(dir.path())).with_rasterizer(Arc::new(TwoPages));
        let results = importer.import_file_blocking(&path, &CancelFlag::new()).unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].artifact.file_name, "doc.kicad_sch");
        assert_eq!(results[1].artifact.file_name, "doc_p2.kicad_sch");
        assert_eq!(results[1].stats.page, 1);
    }

    #[test]
    fn test_discover_skips_hidden_and_build_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("sub")).unwrap();
        std::fs::create_dir_all(root.join(".git")).unwrap();
        std::fs::create_dir_all(root.join("target")).unwrap();
        for name in ["a.png", "sub/b.JPG", ".git/c.png", "target/d.png", "notes.txt"] {
            std::fs::write(root.join(name), b"x").unwrap();
        }
        let found: Vec<String> = discover_images(root)
            .unwrap()
            .iter()
            .map(|p| p.strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/"))
            .collect();
        assert_eq!(found, vec!["a.png".to_string(), "sub/b.JPG".to_string()]);
    }

    #[tokio::test]
    async fn test_directory_import_continues_past_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        blank(640, 640).save(dir.path().join("good.png")).unwrap();
        std::fs::write(dir.path().join("broken.png"), b"not an image").unwrap();
        let importer = importer(config_in(dir.path()));
        let entries = importer.import_directory(dir.path(), &CancelFlag::new()).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].result.is_err());
        assert!(entries[1].result.is_ok());
    }

    #[tokio::test]
    async fn test_debug_sink_receives_stage_images() {
        let mut config = ImportConfig::default();
        config.debug_images = true;
        let sink = Arc::new(MemorySink::new());
        let importer = importer(config).with_debug_sink(sink.clone());
        let image = boxed();
        let meta = ImageMetadata::declared(&image, InputFormat::Png, 300.0);
        importer.import_image(&image, &meta, &CancelFlag::new()).await.unwrap();
        let names = sink.names();
        assert!(names.iter().any(|n| n.starts_with("preprocess")));
        assert!(names.iter().any(|n| n == "trace_skeleton"));
        assert!(names.iter().any(|n| n == "trace_overlay"));
    }
}
