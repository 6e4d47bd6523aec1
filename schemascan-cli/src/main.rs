//! SchemaScan CLI - convert schematic images into KiCad files from the command line.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use schemascan::debug::DirectorySink;
use schemascan::validate::check_image_quality_with;
use schemascan::{
    BatchEntry, CancelFlag, ExportFormat, FormatVersion, ImportConfig, ImportResult, Importer,
    PathValidator, SchemaScanError, SymbolLibrary,
};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for a strict-mode export failure.
const EXIT_STRICT_EXPORT: i32 = 2;

#[derive(Parser)]
#[command(name = "schemascan")]
#[command(about = "Convert scanned schematic images into KiCad schematics", long_about = None)]
#[command(version)]
struct Cli {
    /// More log output (-v info, -vv debug)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Import a single image or PDF
    Import {
        /// Path to a PNG, JPEG, BMP, TIFF or PDF file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        #[command(flatten)]
        options: ImportArgs,
    },

    /// Import every image in a directory tree
    Batch {
        #[arg(value_name = "DIR", default_value = ".")]
        dir: PathBuf,

        #[command(flatten)]
        options: ImportArgs,
    },

    /// Show validation and resolution metadata for an image
    Inspect {
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Minimum accepted resolution
        #[arg(long)]
        min_dpi: Option<f64>,

        #[arg(short, long, value_enum, default_value = "human")]
        report: ReportFormat,
    },

    /// List the symbol templates used for classification
    Library {
        /// Show ranges and footprints
        #[arg(long)]
        details: bool,

        /// Load templates from a library directory instead of the builtin set
        #[arg(long, value_name = "DIR")]
        dir: Option<PathBuf>,
    },
}

#[derive(Args, Clone)]
struct ImportArgs {
    /// Output directory
    #[arg(short, long, value_name = "DIR", default_value = ".")]
    output: PathBuf,

    /// Output format
    #[arg(short, long, value_enum, default_value = "kicad")]
    format: OutputFormat,

    /// KiCad file format version
    #[arg(long, value_enum, default_value = "8")]
    kicad_version: KicadVersion,

    /// Fail the export on the first component the target cannot hold
    #[arg(long)]
    strict: bool,

    /// Minimum accepted resolution
    #[arg(long)]
    min_dpi: Option<f64>,

    /// JSON configuration file
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Symbol library directory (builtin templates otherwise)
    #[arg(long, value_name = "DIR")]
    library: Option<PathBuf>,

    /// Write intermediate images into this directory
    #[arg(long, value_name = "DIR")]
    debug_dir: Option<PathBuf>,

    /// Classification backend endpoint
    #[arg(long, value_name = "URL")]
    backend_url: Option<String>,

    /// API key for the classification backend
    #[arg(long, requires = "backend_url")]
    api_key: Option<String>,

    /// Additional sanctioned input root (repeatable)
    #[arg(long = "root", value_name = "DIR")]
    roots: Vec<PathBuf>,

    /// Report format
    #[arg(short, long, value_enum, default_value = "human")]
    report: ReportFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// KiCad schematic (.kicad_sch)
    Kicad,
    /// Document snapshot
    Json,
    /// Vector preview
    Svg,
}

impl From<OutputFormat> for ExportFormat {
    fn from(format: OutputFormat) -> Self {
        match format {
            OutputFormat::Kicad => ExportFormat::KicadSchematic,
            OutputFormat::Json => ExportFormat::Json,
            OutputFormat::Svg => ExportFormat::Svg,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum KicadVersion {
    #[value(name = "5")]
    V5,
    #[value(name = "6")]
    V6,
    #[value(name = "7")]
    V7,
    #[value(name = "8")]
    V8,
}

impl From<KicadVersion> for FormatVersion {
    fn from(version: KicadVersion) -> Self {
        match version {
            KicadVersion::V5 => FormatVersion::Kicad5Legacy,
            KicadVersion::V6 => FormatVersion::Kicad6,
            KicadVersion::V7 => FormatVersion::Kicad7,
            KicadVersion::V8 => FormatVersion::Kicad8,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportFormat {
    /// Human-readable summary
    Human,
    /// JSON for scripts and CI
    Json,
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        "error"
    } else {
        match verbose {
            0 => "warn",
            1 => "info",
            _ => "debug",
        }
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let exit_code = match cli.command {
        Commands::Import { file, options } => handle_import(&file, &options),
        Commands::Batch { dir, options } => handle_batch(&dir, &options),
        Commands::Inspect { file, min_dpi, report } => handle_inspect(&file, min_dpi, report),
        Commands::Library { details, dir } => handle_library(details, dir.as_deref()),
    };

    process::exit(exit_code);
}

/// Exit code for a failed run: 2 for strict export failures, 1 otherwise.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    match err.downcast_ref::<SchemaScanError>() {
        Some(e) if e.is_export_failure() => EXIT_STRICT_EXPORT,
        _ => 1,
    }
}

fn report_error(err: &anyhow::Error) -> i32 {
    eprintln!("Error: {:#}", err);
    exit_code_for(err)
}

fn build_config(options: &ImportArgs) -> Result<ImportConfig> {
    let mut config = match &options.config {
        Some(path) => ImportConfig::from_json_file(path)
            .with_context(|| format!("failed to load config {}", path.display()))?,
        None => ImportConfig::default(),
    };
    config.export.format = options.format.into();
    config.export.version = options.kicad_version.into();
    config.export.strict = config.export.strict || options.strict;
    if let Some(min_dpi) = options.min_dpi {
        config.validation.min_dpi = min_dpi;
    }
    if !options.roots.is_empty() {
        config.validation.allowed_roots.extend(options.roots.iter().cloned());
        if let Ok(cwd) = std::env::current_dir() {
            config.validation.allowed_roots.push(cwd);
        }
    }
    if let Some(url) = &options.backend_url {
        config.backend.enabled = true;
        config.backend.url = Some(url.clone());
        config.backend.api_key = options.api_key.clone();
    }
    if options.debug_dir.is_some() {
        config.debug_images = true;
    }
    Ok(config)
}

fn build_importer(options: &ImportArgs) -> Result<Importer> {
    let config = build_config(options)?;
    let library = match &options.library {
        Some(dir) => SymbolLibrary::load(dir)
            .with_context(|| format!("failed to load symbol library {}", dir.display()))?,
        None => SymbolLibrary::builtin(),
    };
    let mut importer = Importer::new(config, Arc::new(library)).context("invalid configuration")?;
    if let Some(dir) = &options.debug_dir {
        let sink = DirectorySink::new(dir)
            .with_context(|| format!("cannot create debug directory {}", dir.display()))?;
        importer = importer.with_debug_sink(Arc::new(sink));
    }
    Ok(importer)
}

fn prepare_output(importer: &Importer, dir: &Path) -> Result<PathBuf> {
    std::fs::create_dir_all(dir).with_context(|| format!("cannot create output directory {}", dir.display()))?;
    Ok(importer.validator().validate_dir(dir)?)
}

/// Write every artifact and return the written paths.
fn write_results(results: &[ImportResult], out: &Path) -> Result<Vec<PathBuf>> {
    results
        .iter()
        .map(|r| {
            r.artifact
                .write_atomic(out)
                .with_context(|| format!("failed to write {}", r.artifact.file_name))
        })
        .collect()
}

fn handle_import(file: &Path, options: &ImportArgs) -> i32 {
    match run_import(file, options) {
        Ok(code) => code,
        Err(e) => report_error(&e),
    }
}

fn run_import(file: &Path, options: &ImportArgs) -> Result<i32> {
    let importer = build_importer(options)?;
    let out = prepare_output(&importer, &options.output)?;
    let results = importer
        .import_file_blocking(file, &CancelFlag::new())
        .with_context(|| format!("failed to import {}", file.display()))?;
    let written = write_results(&results, &out)?;
    match options.report {
        ReportFormat::Human => output_human(file, &results, &written),
        ReportFormat::Json => {
            let report = file_report(file, &results, &written);
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }
    Ok(0)
}

fn handle_batch(dir: &Path, options: &ImportArgs) -> i32 {
    match run_batch(dir, options) {
        Ok(code) => code,
        Err(e) => report_error(&e),
    }
}

fn run_batch(dir: &Path, options: &ImportArgs) -> Result<i32> {
    let importer = build_importer(options)?;
    let out = prepare_output(&importer, &options.output)?;
    let entries = importer
        .import_directory_blocking(dir, &CancelFlag::new())
        .with_context(|| format!("failed to scan {}", dir.display()))?;

    let mut exit_code = 0;
    let mut reports = Vec::new();
    for BatchEntry { path, result } in entries {
        match result {
            Ok(results) => {
                let written = write_results(&results, &out)?;
                match options.report {
                    ReportFormat::Human => output_human(&path, &results, &written),
                    ReportFormat::Json => reports.push(file_report(&path, &results, &written)),
                }
            }
            Err(e) => {
                let code = if e.is_export_failure() { EXIT_STRICT_EXPORT } else { 1 };
                exit_code = exit_code.max(code);
                match options.report {
                    ReportFormat::Human => eprintln!("Error: {}: {}", path.display(), e),
                    ReportFormat::Json => reports.push(serde_json::json!({
                        "file": path.display().to_string(),
                        "error": e.to_string(),
                    })),
                }
            }
        }
    }
    if let ReportFormat::Json = options.report {
        let output = serde_json::json!({
            "results": reports,
            "summary": {
                "total_files": reports.len(),
                "failed": reports.iter().filter(|r| r.get("error").is_some()).count(),
            }
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Ok(exit_code)
}

fn file_report(file: &Path, results: &[ImportResult], written: &[PathBuf]) -> serde_json::Value {
    serde_json::json!({
        "file": file.display().to_string(),
        "pages": results.iter().zip(written).map(|(r, path)| {
            serde_json::json!({
                "output": path.display().to_string(),
                "stats": r.stats,
                "warnings": r.warnings,
            })
        }).collect::<Vec<_>>(),
    })
}

fn output_human(file: &Path, results: &[ImportResult], written: &[PathBuf]) {
    println!("\nFile: {}", file.display());
    println!("{}", "─".repeat(60));
    for (result, path) in results.iter().zip(written) {
        let stats = &result.stats;
        if results.len() > 1 {
            println!("  Page {}", stats.page + 1);
        }
        println!("  Output:      {}", path.display());
        println!(
            "  Components:  {} ({} classified, {} unclassified)",
            stats.components, stats.classified, stats.unclassified
        );
        println!("  Nets:        {} ({} singleton)", stats.nets, stats.singleton_nets);
        println!(
            "  Wires:       {} segments, {} junctions, {} buses",
            stats.segments, stats.junctions, stats.buses
        );
        println!(
            "  Exported:    {} ({} skipped, {:.0}% success)",
            stats.exported_components,
            stats.skipped_components,
            stats.success_rate * 100.0
        );
        println!("  Time:        {:.1} ms", stats.timings.total_ms);
        if !result.warnings.is_empty() {
            println!("\n  Warnings:");
            for warning in &result.warnings {
                println!("    - {}", warning);
            }
        }
        println!();
    }
}

fn handle_inspect(file: &Path, min_dpi: Option<f64>, report: ReportFormat) -> i32 {
    match run_inspect(file, min_dpi, report) {
        Ok(code) => code,
        Err(e) => report_error(&e),
    }
}

fn run_inspect(file: &Path, min_dpi: Option<f64>, report: ReportFormat) -> Result<i32> {
    let mut config = ImportConfig::default();
    if let Some(min_dpi) = min_dpi {
        config.validation.min_dpi = min_dpi;
    }
    let validator = PathValidator::from_config(&config.validation)?;
    let validated = validator.validate(file)?;
    debug!(path = %validated.path().display(), "inspecting");
    if !validated.format().is_raster() {
        warn!("PDF pages are rendered at import time; only the container was checked");
        println!("{}: {} document", validated.path().display(), validated.format());
        return Ok(0);
    }
    let metadata = check_image_quality_with(validated.path(), &config.validation)?;
    match report {
        ReportFormat::Human => {
            println!("File:       {}", validated.path().display());
            println!("Format:     {}", metadata.format);
            println!("Size:       {}x{} px, {} channel(s)", metadata.width, metadata.height, metadata.channels);
            println!("Resolution: {:.0} DPI ({:?})", metadata.dpi, metadata.dpi_source);
        }
        ReportFormat::Json => println!("{}", serde_json::to_string_pretty(&metadata)?),
    }
    Ok(0)
}

fn handle_library(details: bool, dir: Option<&Path>) -> i32 {
    let library = match dir {
        Some(dir) => match SymbolLibrary::load(dir) {
            Ok(library) => library,
            Err(e) => {
                eprintln!("Error: {}", e);
                return 1;
            }
        },
        None => SymbolLibrary::builtin(),
    };

    println!("Symbol templates:\n");
    for template in library.templates() {
        println!("  {}", template.name);
        println!("    {} -> {} ({} pins)", template.kind, template.lib_id, template.pin_count);
        if details {
            println!(
                "    aspect {:.2}-{:.2}, area {:.0}-{:.0} px, {}",
                template.aspect_ratio.min,
                template.aspect_ratio.max,
                template.area.min,
                template.area.max,
                if template.bitmap.is_some() { "bitmap" } else { "ranges only" }
            );
            if let Some(footprint) = &template.footprint {
                println!("    footprint {}", footprint);
            }
            println!("    requires {}", template.min_version);
        }
        println!();
    }
    0
}
