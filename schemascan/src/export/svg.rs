//! SVG preview of a document in millimetres.

use std::fmt::Write;

use super::{file_name, ExportArtifact, ExportFormat, ExportOptions, SchematicExporter};
use crate::core::SchemaScanError;
use crate::document::SchematicDocument;
use crate::model::JunctionKind;

const STYLE: &str = ".component{fill:none;stroke:#840000;stroke-width:0.25}\
.unclassified{fill:none;stroke:#888888;stroke-width:0.25;stroke-dasharray:1 1}\
.wire{fill:none;stroke:#008400;stroke-width:0.2}\
.junction{fill:#008400}\
.pin{fill:#000084}\
text{font-family:sans-serif;font-size:1.6px}";

fn escape(text: &str) -> String {
    text.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;").replace('"', "&quot;")
}

pub struct SvgExporter;

impl SvgExporter {
    fn render(document: &SchematicDocument) -> Result<String, std::fmt::Error> {
        let meta = document.metadata();
        let ppm = meta.pixels_per_mm();
        let (w, h) = (meta.width_mm(), meta.height_mm());
        let mut out = String::new();

        writeln!(
            out,
            r#"<svg xmlns="http://www.w3.org/2000/svg" width="{w:.2}mm" height="{h:.2}mm" viewBox="0 0 {w:.2} {h:.2}">"#
        )?;
        writeln!(out, "<style>{}</style>", STYLE)?;

        for placed in document.components() {
            let c = &placed.component;
            let class = if c.kind.is_classified() { "component" } else { "unclassified" };
            let origin = meta.to_mm(crate::model::Point::new(c.region.x as f64, c.region.y as f64));
            writeln!(
                out,
                r#"<g id="{}"><rect class="{}" x="{:.2}" y="{:.2}" width="{:.2}" height="{:.2}"/>"#,
                escape(&placed.reference),
                class,
                origin.x,
                origin.y,
                c.region.width as f64 / ppm,
                c.region.height as f64 / ppm
            )?;
            writeln!(
                out,
                r#"<text x="{:.2}" y="{:.2}">{}</text>"#,
                origin.x,
                origin.y - 0.5,
                escape(&placed.reference)
            )?;
            for t in &c.terminals {
                let p = meta.to_mm(t.position);
                writeln!(out, r#"<circle class="pin" cx="{:.2}" cy="{:.2}" r="0.3"/>"#, p.x, p.y)?;
            }
            writeln!(out, "</g>")?;
        }

        for segment in document.segments() {
            let points: Vec<String> = segment
                .path
                .iter()
                .map(|p| {
                    let p = meta.to_mm(*p);
                    format!("{:.2},{:.2}", p.x, p.y)
                })
                .collect();
            writeln!(out, r#"<polyline class="wire" points="{}"/>"#, points.join(" "))?;
        }

        for junction in document.junctions() {
            if matches!(junction.kind, JunctionKind::T | JunctionKind::Cross) {
                let p = meta.to_mm(junction.position);
                writeln!(out, r#"<circle class="junction" cx="{:.2}" cy="{:.2}" r="0.5"/>"#, p.x, p.y)?;
            }
        }

        out.push_str("</svg>\n");
        Ok(out)
    }
}

impl SchematicExporter for SvgExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::Svg
    }

    fn extension(&self) -> &'static str {
        "svg"
    }

    fn export(&self, document: &SchematicDocument, options: &ExportOptions) -> Result<ExportArtifact, SchemaScanError> {
        let content = Self::render(document)
            .map_err(|_| SchemaScanError::InvalidInputFormat("svg rendering failed".to_string()))?;
        Ok(ExportArtifact {
            format: ExportFormat::Svg,
            file_name: file_name(document, options, self.extension()),
            content,
            exported_components: document.components().len(),
            issues: Vec::new(),
        })
    }
}
