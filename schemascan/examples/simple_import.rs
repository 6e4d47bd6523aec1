//! Simple import example: convert one schematic image and print what was found.

use schemascan::prelude::*;
use std::path::Path;
use std::sync::Arc;

fn main() -> Result<(), SchemaScanError> {
    let path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "scan.png".to_string());
    let path = Path::new(&path);

    if !path.exists() {
        eprintln!("File not found: {}", path.display());
        eprintln!("Usage: cargo run --example simple_import [path/to/scan.png]");
        std::process::exit(1);
    }

    let mut config = ImportConfig::default();
    // phone photos rarely carry resolution metadata
    config.validation.min_dpi = 150.0;
    config.export.version = FormatVersion::Kicad8;

    let importer = Importer::new(config, Arc::new(SymbolLibrary::builtin()))?;
    let results = importer.import_file_blocking(path, &CancelFlag::new())?;

    for result in &results {
        println!("Page {} of {}", result.stats.page + 1, path.display());
        println!("  {} components, {} nets", result.stats.components, result.stats.nets);

        for placed in result.document.components() {
            let nets = result.document.nets_for_component(placed.component.id);
            let pins: Vec<String> = nets.iter().map(|(pin, net)| format!("{}={}", pin, net.name)).collect();
            println!("  {:<6} {:<12} {}", placed.reference, placed.component.kind, pins.join(" "));
        }

        for warning in &result.warnings {
            println!("  warning: {}", warning);
        }

        let written = result.artifact.write_atomic(Path::new("."))?;
        println!("  wrote {}", written.display());
    }

    Ok(())
}
