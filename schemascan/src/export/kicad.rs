//! KiCad s-expression schematic writer (KiCad 6, 7 and 8 formats).
//!
//! Detected components keep their detected geometry: each instance gets its
//! own embedded library symbol (`lib_name` `<Ref>_<item>`) with a body the
//! size of the detected region and pins where the terminals were found.
//! Connectivity is carried by net labels on every pin and by a hidden
//! property listing the pin-to-net map.

use std::collections::BTreeMap;
use uuid::Uuid;

use super::{file_name, partition_components, ExportArtifact, ExportFormat, ExportOptions, SchematicExporter};
use crate::core::SchemaScanError;
use crate::document::{PlacedComponent, SchematicDocument};
use crate::model::{FormatVersion, JunctionKind, Point, Side, SymbolRef, TerminalId};
use crate::parser::kicad::{encode_net_map, NETS_PROPERTY};
use crate::parser::sexp::SExp;

/// Schematic grid pitch in millimetres.
pub const GRID_MM: f64 = 1.27;
const PIN_LENGTH_MM: f64 = 2.54;
const GENERATOR: &str = "schemascan";

fn snap(v: f64) -> f64 {
    (v / GRID_MM).round() * GRID_MM
}

fn snap_point(p: Point) -> Point {
    Point::new(snap(p.x), snap(p.y))
}

/// Millimetre value with at most four decimals.
fn num(v: f64) -> SExp {
    let text = format!("{:.4}", v);
    let text = text.trim_end_matches('0').trim_end_matches('.');
    match text {
        "-0" | "" => SExp::atom("0"),
        t => SExp::atom(t),
    }
}

fn xy(head: &str, p: Point) -> SExp {
    SExp::list(head, vec![num(p.x), num(p.y)])
}

fn at(p: Point, angle: f64) -> SExp {
    SExp::list("at", vec![num(p.x), num(p.y), num(angle)])
}

fn yes_no(head: &str, value: bool) -> SExp {
    SExp::pair(head, if value { "yes" } else { "no" })
}

fn font() -> SExp {
    SExp::list("font", vec![SExp::list("size", vec![num(1.27), num(1.27)])])
}

fn effects(version: FormatVersion, hidden: bool) -> SExp {
    let mut items = vec![font()];
    if hidden {
        items.push(if version >= FormatVersion::Kicad8 {
            yes_no("hide", true)
        } else {
            SExp::atom("hide")
        });
    }
    SExp::list("effects", items)
}

fn property(version: FormatVersion, key: &str, value: &str, position: Point, hidden: bool) -> SExp {
    SExp::list(
        "property",
        vec![SExp::text(key), SExp::text(value), at(position, 0.0), effects(version, hidden)],
    )
}

fn uuid(id: Uuid) -> SExp {
    SExp::list("uuid", vec![SExp::text(id.to_string())])
}

/// Deterministic ids derived from the document source.
struct Ids {
    root: Uuid,
}

impl Ids {
    fn new(document: &SchematicDocument) -> Self {
        let meta = document.metadata();
        let seed = format!("{}:{}:{}", GENERATOR, meta.source.as_deref().unwrap_or(""), meta.page);
        Self {
            root: Uuid::new_v5(&Uuid::NAMESPACE_URL, seed.as_bytes()),
        }
    }

    fn id(&self, name: &str) -> Uuid {
        Uuid::new_v5(&self.root, name.as_bytes())
    }
}

/// Pin angle in library coordinates: direction from the pin end to the body.
fn pin_angle(side: Side) -> f64 {
    match side {
        Side::Left => 0.0,
        Side::Right => 180.0,
        Side::Top => 270.0,
        Side::Bottom => 90.0,
    }
}

/// Geometry of one placed symbol in sheet millimetres.
struct Placement {
    origin: Point,
    half_width: f64,
    half_height: f64,
    /// Pin number, side and pin end relative to the origin (sheet axes).
    pins: Vec<(u32, Side, Point)>,
}

impl Placement {
    fn new(document: &SchematicDocument, placed: &PlacedComponent) -> Self {
        let meta = document.metadata();
        let c = &placed.component;
        let ppm = meta.pixels_per_mm();
        let origin = snap_point(meta.to_mm(c.region.center()));
        let pins = c
            .terminals
            .iter()
            .map(|t| {
                let p = meta.to_mm(t.position);
                let (ox, oy) = t.side.outward();
                let rel = Point::new(
                    snap(p.x - origin.x) + ox * PIN_LENGTH_MM,
                    snap(p.y - origin.y) + oy * PIN_LENGTH_MM,
                );
                (t.id.pin, t.side, rel)
            })
            .collect();
        Self {
            origin,
            half_width: c.region.width as f64 / ppm / 2.0,
            half_height: c.region.height as f64 / ppm / 2.0,
            pins,
        }
    }

    fn pin_on_sheet(&self, rel: Point) -> Point {
        Point::new(self.origin.x + rel.x, self.origin.y + rel.y)
    }
}

fn item_name(symbol: &SymbolRef) -> &str {
    symbol.lib_id.rsplit(':').next().unwrap_or(&symbol.lib_id)
}

fn value_of(placed: &PlacedComponent, symbol: &SymbolRef) -> String {
    placed
        .component
        .value
        .clone()
        .unwrap_or_else(|| item_name(symbol).to_string())
}

fn lib_symbol(version: FormatVersion, name: &str, value: &str, reference_prefix: &str, placement: &Placement) -> SExp {
    let body = SExp::list(
        "rectangle",
        vec![
            SExp::list("start", vec![num(-placement.half_width), num(placement.half_height)]),
            SExp::list("end", vec![num(placement.half_width), num(-placement.half_height)]),
            SExp::list("stroke", vec![SExp::pair("width", "0.254"), SExp::pair("type", "default")]),
            SExp::list("fill", vec![SExp::pair("type", "background")]),
        ],
    );
    let pins = placement
        .pins
        .iter()
        .map(|(pin, side, rel)| {
            SExp::list(
                "pin",
                vec![
                    SExp::atom("passive"),
                    SExp::atom("line"),
                    at(Point::new(rel.x, -rel.y), pin_angle(*side)),
                    SExp::pair("length", "2.54"),
                    SExp::list("name", vec![SExp::text("~"), effects(version, false)]),
                    SExp::list("number", vec![SExp::text(pin.to_string()), effects(version, false)]),
                ],
            )
        })
        .collect();
    SExp::list(
        "symbol",
        vec![
            SExp::text(name),
            SExp::list("pin_names", vec![SExp::pair("offset", "0")]),
            yes_no("in_bom", true),
            yes_no("on_board", true),
            property(version, "Reference", reference_prefix, Point::default(), false),
            property(version, "Value", value, Point::default(), false),
            SExp::list("symbol", vec![SExp::text(format!("{}_0_1", name)), body]),
            SExp::list("symbol", [vec![SExp::text(format!("{}_1_1", name))], pins].concat()),
        ],
    )
}

/// Paper that holds `width`×`height` mm.
fn paper(width: f64, height: f64) -> SExp {
    let (w, h) = (width.max(height), width.min(height));
    let named = if w <= 297.0 && h <= 210.0 {
        "A4"
    } else if w <= 420.0 && h <= 297.0 {
        "A3"
    } else {
        return SExp::list("paper", vec![SExp::text("User"), num(width.ceil()), num(height.ceil())]);
    };
    if height > width {
        SExp::list("paper", vec![SExp::text(named), SExp::atom("portrait")])
    } else {
        SExp::list("paper", vec![SExp::text(named)])
    }
}

pub struct KicadExporter;

impl KicadExporter {
    fn legacy_rejected(version: FormatVersion) -> SchemaScanError {
        SchemaScanError::ExportTargetVersionMismatch {
            subject: "document".to_string(),
            target: version,
            detail: "the legacy .sch format is not written; choose KiCad 6 or newer".to_string(),
        }
    }
}

impl SchematicExporter for KicadExporter {
    fn format(&self) -> ExportFormat {
        ExportFormat::KicadSchematic
    }

    fn extension(&self) -> &'static str {
        "kicad_sch"
    }

    fn export(&self, document: &SchematicDocument, options: &ExportOptions) -> Result<ExportArtifact, SchemaScanError> {
        let version = options.version;
        let stamp = version.stamp().ok_or_else(|| Self::legacy_rejected(version))?;
        let (placed, issues) = partition_components(document, options)?;

        let meta = document.metadata();
        let ids = Ids::new(document);
        let file_name = file_name(document, options, self.extension());
        let project = file_name.trim_end_matches(".kicad_sch").to_string();

        let mut items = vec![SExp::pair("version", stamp), SExp::list("generator", vec![SExp::text(GENERATOR)])];
        if version >= FormatVersion::Kicad8 {
            items.push(SExp::list(
                "generator_version",
                vec![SExp::text(env!("CARGO_PKG_VERSION"))],
            ));
        }
        items.push(uuid(ids.root));
        items.push(paper(meta.width_mm(), meta.height_mm()));

        let placements: Vec<Placement> = placed.iter().map(|(p, _)| Placement::new(document, p)).collect();

        let mut lib = Vec::new();
        for ((component, symbol), placement) in placed.iter().zip(&placements) {
            let name = format!("{}_{}", component.reference, item_name(symbol));
            lib.push(lib_symbol(
                version,
                &name,
                &value_of(component, symbol),
                component.component.kind.reference_prefix(),
                placement,
            ));
        }
        items.push(SExp::list("lib_symbols", lib));

        for (i, junction) in document.junctions().iter().enumerate() {
            if matches!(junction.kind, JunctionKind::T | JunctionKind::Cross) {
                items.push(SExp::list(
                    "junction",
                    vec![
                        at_point(snap_point(meta.to_mm(junction.position))),
                        SExp::pair("diameter", "0"),
                        SExp::list("color", vec![SExp::atom(0), SExp::atom(0), SExp::atom(0), SExp::atom(0)]),
                        uuid(ids.id(&format!("junction/{}", i))),
                    ],
                ));
            }
        }

        for segment in document.segments() {
            let mut points: Vec<Point> = segment.path.iter().map(|p| snap_point(meta.to_mm(*p))).collect();
            points.dedup();
            for (k, pair) in points.windows(2).enumerate() {
                items.push(SExp::list(
                    "wire",
                    vec![
                        SExp::list("pts", vec![xy("xy", pair[0]), xy("xy", pair[1])]),
                        SExp::list("stroke", vec![SExp::pair("width", "0"), SExp::pair("type", "default")]),
                        uuid(ids.id(&format!("wire/{}/{}", segment.id, k))),
                    ],
                ));
            }
        }

        for ((component, _), placement) in placed.iter().zip(&placements) {
            for (pin, _, rel) in &placement.pins {
                let terminal = TerminalId {
                    component: component.component.id,
                    pin: *pin,
                };
                if let Some(net) = document.net_of(terminal) {
                    items.push(SExp::list(
                        "label",
                        vec![
                            SExp::text(net.name.clone()),
                            at(placement.pin_on_sheet(*rel), 0.0),
                            SExp::list("effects", vec![font(), SExp::list("justify", vec![SExp::atom("left"), SExp::atom("bottom")])]),
                            uuid(ids.id(&format!("label/{}/{}", component.reference, pin))),
                        ],
                    ));
                }
            }
        }

        let mut symbol_instances = Vec::new();
        for ((component, symbol), placement) in placed.iter().zip(&placements) {
            let reference = component.reference.as_str();
            let symbol_id = ids.id(&format!("symbol/{}", reference));
            let value = value_of(component, symbol);
            let nets: BTreeMap<u32, String> = document
                .nets_for_component(component.component.id)
                .into_iter()
                .map(|(pin, net)| (pin, net.name.clone()))
                .collect();
            let origin = placement.origin;

            let mut body = vec![
                SExp::list("lib_name", vec![SExp::text(format!("{}_{}", reference, item_name(symbol)))]),
                SExp::list("lib_id", vec![SExp::text(symbol.lib_id.clone())]),
                at(origin, 0.0),
                SExp::pair("unit", 1),
            ];
            if version >= FormatVersion::Kicad8 {
                body.push(yes_no("exclude_from_sim", false));
            }
            body.push(yes_no("in_bom", true));
            body.push(yes_no("on_board", true));
            if version >= FormatVersion::Kicad7 {
                body.push(yes_no("dnp", false));
            }
            body.push(uuid(symbol_id));
            let above = Point::new(origin.x, snap(origin.y - placement.half_height - GRID_MM));
            let below = Point::new(origin.x, snap(origin.y + placement.half_height + GRID_MM));
            body.push(property(version, "Reference", reference, above, false));
            body.push(property(version, "Value", &value, below, false));
            body.push(property(
                version,
                "Footprint",
                symbol.footprint.as_deref().unwrap_or(""),
                origin,
                true,
            ));
            body.push(property(version, NETS_PROPERTY, &encode_net_map(&nets), origin, true));
            for (pin, _, _) in &placement.pins {
                body.push(SExp::list(
                    "pin",
                    vec![SExp::text(pin.to_string()), uuid(ids.id(&format!("pin/{}/{}", reference, pin)))],
                ));
            }
            if version >= FormatVersion::Kicad7 {
                body.push(SExp::list(
                    "instances",
                    vec![SExp::list(
                        "project",
                        vec![
                            SExp::text(project.clone()),
                            SExp::list(
                                "path",
                                vec![
                                    SExp::text(format!("/{}", ids.root)),
                                    SExp::list("reference", vec![SExp::text(reference)]),
                                    SExp::pair("unit", 1),
                                ],
                            ),
                        ],
                    )],
                ));
            } else {
                symbol_instances.push(SExp::list(
                    "path",
                    vec![
                        SExp::text(format!("/{}", symbol_id)),
                        SExp::list("reference", vec![SExp::text(reference)]),
                        SExp::pair("unit", 1),
                        SExp::list("value", vec![SExp::text(value.clone())]),
                        SExp::list("footprint", vec![SExp::text(symbol.footprint.clone().unwrap_or_default())]),
                    ],
                ));
            }
            items.push(SExp::list("symbol", body));
        }

        items.push(SExp::list(
            "sheet_instances",
            vec![SExp::list("path", vec![SExp::text("/"), SExp::list("page", vec![SExp::text("1")])])],
        ));
        if version < FormatVersion::Kicad7 {
            items.push(SExp::list("symbol_instances", symbol_instances));
        }

        Ok(ExportArtifact {
            format: ExportFormat::KicadSchematic,
            file_name,
            content: SExp::list("kicad_sch", items).to_pretty(),
            exported_components: placed.len(),
            issues,
        })
    }
}

fn at_point(p: Point) -> SExp {
    SExp::list("at", vec![num(p.x), num(p.y)])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::fixtures;
    use crate::parser::kicad::KicadReader;

    fn export_as(version: FormatVersion) -> ExportArtifact {
        KicadExporter
            .export(&fixtures::document(), &ExportOptions::new(version))
            .unwrap()
    }

    #[test]
    fn test_number_formatting() {
        assert_eq!(num(50.8000001).to_string(), "50.8");
        assert_eq!(num(-0.00001).to_string(), "0");
        assert_eq!(num(12.0).to_string(), "12");
        assert_eq!(num(1.27).to_string(), "1.27");
    }

    #[test]
    fn test_kicad8_round_trips_the_partition() {
        let doc = fixtures::document();
        let artifact = export_as(FormatVersion::Kicad8);
        assert_eq!(artifact.exported_components, 3);
        assert!(artifact.content.contains("(version 20231120)"));
        assert!(artifact.content.contains("(generator_version"));
        assert!(artifact.content.contains("(exclude_from_sim no)"));
        assert!(artifact.content.contains("(dnp no)"));
        assert!(!artifact.content.contains("symbol_instances"));

        let sch = KicadReader::parse_str(&artifact.content).unwrap();
        assert_eq!(sch.format, Some(FormatVersion::Kicad8));
        assert_eq!(sch.symbols.len(), 3);
        assert_eq!(sch.net_partition(), doc.net_partition());
        assert_eq!(sch.junctions.len(), 1);
        assert!(!sch.wires.is_empty());

        let r1 = sch.symbol("R1").unwrap();
        assert_eq!(r1.lib_id, "Device:R");
        assert_eq!(r1.footprint.as_deref(), Some("Resistor_SMD:R_0805_2012Metric"));
        assert_eq!(r1.value, "R");
    }

    #[test]
    fn test_labels_sit_on_pins() {
        let sch = KicadReader::parse_str(&export_as(FormatVersion::Kicad8).content).unwrap();
        for symbol in &sch.symbols {
            let positions = sch.pin_positions(symbol);
            assert_eq!(positions.len(), symbol.nets.len());
            for (pin, at) in positions {
                let label = sch.labels.iter().find(|l| l.position.distance(&at) < 0.01).unwrap();
                assert_eq!(Some(&label.text), symbol.nets.get(&pin));
            }
        }
    }

    #[test]
    fn test_positions_are_on_grid() {
        let sch = KicadReader::parse_str(&export_as(FormatVersion::Kicad7).content).unwrap();
        for symbol in &sch.symbols {
            for v in [symbol.position.x, symbol.position.y] {
                let steps = v / GRID_MM;
                assert!((steps - steps.round()).abs() < 1e-6, "{} is off grid", v);
            }
        }
        for label in &sch.labels {
            let steps = label.position.x / GRID_MM;
            assert!((steps - steps.round()).abs() < 1e-6);
        }
    }

    #[test]
    fn test_version_specific_layout() {
        let v7 = export_as(FormatVersion::Kicad7).content;
        assert!(v7.contains("(version 20230121)"));
        assert!(v7.contains("(dnp no)"));
        assert!(v7.contains("(instances"));
        assert!(!v7.contains("exclude_from_sim"));

        let v6 = export_as(FormatVersion::Kicad6);
        assert!(v6.content.contains("(version 20211123)"));
        assert!(v6.content.contains("(symbol_instances"));
        assert!(!v6.content.contains("(dnp"));
        // the connector needs KiCad 7
        assert_eq!(v6.exported_components, 2);
        let sch = KicadReader::parse_str(&v6.content).unwrap();
        assert!(sch.symbol("J1").is_none());
    }

    #[test]
    fn test_output_is_deterministic() {
        assert_eq!(export_as(FormatVersion::Kicad8), export_as(FormatVersion::Kicad8));
    }

    #[test]
    fn test_paper_selection() {
        assert_eq!(paper(200.0, 100.0).to_string(), "(paper \"A4\")");
        assert_eq!(paper(100.0, 200.0).to_string(), "(paper \"A4\" portrait)");
        assert_eq!(paper(400.0, 280.0).to_string(), "(paper \"A3\")");
        assert_eq!(paper(600.5, 100.0).to_string(), "(paper \"User\" 601 100)");
    }
}
