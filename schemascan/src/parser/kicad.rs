//! Reader for the `.kicad_sch` files SchemaScan writes.
//!
//! Only the parts needed to check an export are read back: symbol
//! instances with their properties and pins, wires, junctions and local
//! labels. Pin nets come from the hidden [`NETS_PROPERTY`] when present and
//! otherwise from labels sitting on pin positions of the embedded library
//! symbols.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::core::SchemaScanError;
use crate::document::{NetPartition, PinRef};
use crate::model::{FormatVersion, Point};
use crate::parser::sexp::{SExp, SExpParser};

/// Hidden symbol property mapping pin numbers to net names.
pub const NETS_PROPERTY: &str = "SchemaScan_Nets";

/// Positions closer than this (mm) are the same point.
const POSITION_EPSILON: f64 = 0.01;

/// `1=N1;2=N2`
pub fn encode_net_map(nets: &BTreeMap<u32, String>) -> String {
    nets.iter()
        .map(|(pin, net)| format!("{}={}", pin, net))
        .collect::<Vec<_>>()
        .join(";")
}

pub fn decode_net_map(value: &str) -> Result<BTreeMap<u32, String>, SchemaScanError> {
    let mut nets = BTreeMap::new();
    for entry in value.split(';').filter(|e| !e.trim().is_empty()) {
        let (pin, net) = entry
            .split_once('=')
            .ok_or_else(|| SchemaScanError::Parse(format!("malformed net entry '{}'", entry)))?;
        let pin: u32 = pin
            .trim()
            .parse()
            .map_err(|_| SchemaScanError::Parse(format!("malformed pin number '{}'", pin)))?;
        nets.insert(pin, net.trim().to_string());
    }
    Ok(nets)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedSymbol {
    pub lib_id: String,
    pub lib_name: Option<String>,
    pub reference: String,
    pub value: String,
    pub footprint: Option<String>,
    pub position: Point,
    pub rotation: f64,
    pub pins: Vec<String>,
    /// Pin number to net name, from the hidden nets property.
    pub nets: BTreeMap<u32, String>,
    pub properties: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImportedLabel {
    pub text: String,
    pub position: Point,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportedSchematic {
    pub version: u32,
    pub format: Option<FormatVersion>,
    pub generator: Option<String>,
    pub uuid: Option<String>,
    pub symbols: Vec<ImportedSymbol>,
    pub wires: Vec<Vec<Point>>,
    pub junctions: Vec<Point>,
    pub labels: Vec<ImportedLabel>,
    /// Pin positions of embedded library symbols, relative to the symbol
    /// origin with y pointing up.
    pub library_pins: HashMap<String, Vec<(u32, Point)>>,
}

impl ImportedSchematic {
    pub fn symbol(&self, reference: &str) -> Option<&ImportedSymbol> {
        self.symbols.iter().find(|s| s.reference == reference)
    }

    /// Sheet position of each pin of `symbol`, from its library definition.
    pub fn pin_positions(&self, symbol: &ImportedSymbol) -> Vec<(u32, Point)> {
        let key = symbol.lib_name.as_deref().unwrap_or(&symbol.lib_id);
        let Some(pins) = self.library_pins.get(key) else {
            return Vec::new();
        };
        let (sin, cos) = symbol.rotation.to_radians().sin_cos();
        pins.iter()
            .map(|&(pin, p)| {
                let (x, y) = (p.x * cos - p.y * sin, p.x * sin + p.y * cos);
                (pin, Point::new(symbol.position.x + x, symbol.position.y - y))
            })
            .collect()
    }

    fn label_at(&self, point: Point) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.position.distance(&point) < POSITION_EPSILON)
            .map(|l| l.text.as_str())
    }

    /// Pins grouped by net name.
    pub fn net_partition(&self) -> NetPartition {
        let mut groups: BTreeMap<String, BTreeSet<PinRef>> = BTreeMap::new();
        for symbol in &self.symbols {
            if !symbol.nets.is_empty() {
                for (pin, net) in &symbol.nets {
                    groups
                        .entry(net.clone())
                        .or_default()
                        .insert(PinRef::new(symbol.reference.clone(), *pin));
                }
                continue;
            }
            for (pin, at) in self.pin_positions(symbol) {
                if let Some(net) = self.label_at(at) {
                    groups
                        .entry(net.to_string())
                        .or_default()
                        .insert(PinRef::new(symbol.reference.clone(), pin));
                }
            }
        }
        groups.into_values().collect()
    }
}

fn point_of(list: &SExp) -> Option<Point> {
    Some(Point::new(list.arg(0)?.as_f64()?, list.arg(1)?.as_f64()?))
}

fn missing(what: &str) -> SchemaScanError {
    SchemaScanError::Parse(format!("missing {}", what))
}

pub struct KicadReader;

impl KicadReader {
    pub fn parse_str(content: &str) -> Result<ImportedSchematic, SchemaScanError> {
        let root = SExpParser::new(content).parse()?;
        match root.head() {
            Some("kicad_sch") => {}
            other => {
                return Err(SchemaScanError::Parse(format!(
                    "expected kicad_sch root, found {}",
                    other.unwrap_or("nothing")
                )))
            }
        }

        let version: u32 = root
            .get("version")
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| missing("version"))?;
        let mut schematic = ImportedSchematic {
            version,
            format: FormatVersion::from_stamp(version),
            generator: root.get("generator").map(str::to_string),
            uuid: root.get("uuid").map(str::to_string),
            ..ImportedSchematic::default()
        };

        if let Some(lib) = root.find("lib_symbols") {
            for symbol in lib.find_all("symbol") {
                if let Some(name) = symbol.arg(0).and_then(SExp::as_atom) {
                    schematic
                        .library_pins
                        .insert(name.to_string(), Self::library_pins(symbol));
                }
            }
        }

        for item in root.args() {
            match item.head() {
                Some("symbol") => schematic.symbols.push(Self::parse_symbol(item)?),
                Some("wire") => {
                    let pts = item.find("pts").ok_or_else(|| missing("wire pts"))?;
                    let points: Vec<Point> = pts.find_all("xy").filter_map(point_of).collect();
                    if points.len() < 2 {
                        return Err(SchemaScanError::Parse("wire with fewer than two points".into()));
                    }
                    schematic.wires.push(points);
                }
                Some("junction") => {
                    let at = item.find("at").and_then(point_of).ok_or_else(|| missing("junction at"))?;
                    schematic.junctions.push(at);
                }
                Some("label") => {
                    let text = item.arg(0).and_then(SExp::as_atom).ok_or_else(|| missing("label text"))?;
                    let at = item.find("at").and_then(point_of).ok_or_else(|| missing("label at"))?;
                    schematic.labels.push(ImportedLabel {
                        text: text.to_string(),
                        position: at,
                    });
                }
                _ => {}
            }
        }
        Ok(schematic)
    }

    /// Pins declared in the unit sub-symbols of a library symbol.
    fn library_pins(symbol: &SExp) -> Vec<(u32, Point)> {
        let mut pins = Vec::new();
        for unit in symbol.find_all("symbol") {
            for pin in unit.find_all("pin") {
                let number = pin
                    .find("number")
                    .and_then(|n| n.arg(0))
                    .and_then(SExp::as_atom)
                    .and_then(|n| n.parse().ok());
                let at = pin.find("at").and_then(point_of);
                if let (Some(number), Some(at)) = (number, at) {
                    pins.push((number, at));
                }
            }
        }
        pins.sort_by_key(|(n, _)| *n);
        pins
    }

    fn parse_symbol(sexp: &SExp) -> Result<ImportedSymbol, SchemaScanError> {
        let lib_id = sexp.get("lib_id").ok_or_else(|| missing("symbol lib_id"))?;
        let at = sexp.find("at").ok_or_else(|| missing("symbol at"))?;
        let position = point_of(at).ok_or_else(|| missing("symbol position"))?;
        let rotation = at.arg(2).and_then(SExp::as_f64).unwrap_or(0.0);

        let mut properties = HashMap::new();
        for prop in sexp.find_all("property") {
            let key = prop.arg(0).and_then(SExp::as_atom);
            let value = prop.arg(1).and_then(SExp::as_atom);
            if let (Some(key), Some(value)) = (key, value) {
                properties.insert(key.to_string(), value.to_string());
            }
        }
        let nets = match properties.get(NETS_PROPERTY) {
            Some(value) => decode_net_map(value)?,
            None => BTreeMap::new(),
        };
        let pins = sexp
            .find_all("pin")
            .filter_map(|p| p.arg(0).and_then(SExp::as_atom))
            .map(str::to_string)
            .collect();

        Ok(ImportedSymbol {
            lib_id: lib_id.to_string(),
            lib_name: sexp.get("lib_name").map(str::to_string),
            reference: properties.get("Reference").cloned().unwrap_or_default(),
            value: properties.get("Value").cloned().unwrap_or_default(),
            footprint: properties.get("Footprint").filter(|f| !f.is_empty()).cloned(),
            position,
            rotation,
            pins,
            nets,
            properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"(kicad_sch (version 20231120) (generator "schemascan")
  (uuid "0f6f6d1e-0000-5000-8000-000000000000")
  (lib_symbols
    (symbol "R1_R"
      (symbol "R1_R_1_1"
        (pin passive line (at -5.08 0 0) (length 1.27) (number "1"))
        (pin passive line (at 5.08 0 180) (length 1.27) (number "2")))))
  (symbol (lib_name "R1_R") (lib_id "Device:R") (at 50.8 50.8 0) (unit 1)
    (property "Reference" "R1" (at 50.8 48.26 0))
    (property "Value" "10k" (at 50.8 53.34 0))
    (property "Footprint" "Resistor_SMD:R_0805_2012Metric" (at 50.8 50.8 0))
    (pin "1" (uuid "a")) (pin "2" (uuid "b")))
  (symbol (lib_id "Device:C") (at 76.2 50.8 0)
    (property "Reference" "C1" (at 0 0 0))
    (property "SchemaScan_Nets" "1=N2;2=N3" (at 0 0 0))
    (pin "1" (uuid "c")) (pin "2" (uuid "d")))
  (wire (pts (xy 55.88 50.8) (xy 71.12 50.8)) (uuid "w"))
  (junction (at 60.96 50.8))
  (label "N1" (at 45.72 50.8 0))
  (label "N2" (at 55.88 50.8 0))
)"#;

    #[test]
    fn test_reads_header_and_items() {
        let sch = KicadReader::parse_str(SAMPLE).unwrap();
        assert_eq!(sch.version, 20231120);
        assert_eq!(sch.format, Some(FormatVersion::Kicad8));
        assert_eq!(sch.generator.as_deref(), Some("schemascan"));
        assert_eq!(sch.symbols.len(), 2);
        assert_eq!(sch.wires, vec![vec![Point::new(55.88, 50.8), Point::new(71.12, 50.8)]]);
        assert_eq!(sch.junctions, vec![Point::new(60.96, 50.8)]);
        assert_eq!(sch.labels.len(), 2);

        let r1 = sch.symbol("R1").unwrap();
        assert_eq!(r1.value, "10k");
        assert_eq!(r1.lib_name.as_deref(), Some("R1_R"));
        assert_eq!(r1.footprint.as_deref(), Some("Resistor_SMD:R_0805_2012Metric"));
        assert_eq!(r1.pins, vec!["1", "2"]);
    }

    #[test]
    fn test_partition_uses_nets_property_then_labels() {
        let sch = KicadReader::parse_str(SAMPLE).unwrap();
        let partition = sch.net_partition();
        let n2: BTreeSet<PinRef> = [PinRef::new("R1", 2), PinRef::new("C1", 1)].into_iter().collect();
        assert!(partition.contains(&n2));
        let n1: BTreeSet<PinRef> = [PinRef::new("R1", 1)].into_iter().collect();
        assert!(partition.contains(&n1));
        assert_eq!(partition.len(), 3);
    }

    #[test]
    fn test_net_map_round_trip() {
        let mut nets = BTreeMap::new();
        nets.insert(1, "N1".to_string());
        nets.insert(2, "N7".to_string());
        let encoded = encode_net_map(&nets);
        assert_eq!(encoded, "1=N1;2=N7");
        assert_eq!(decode_net_map(&encoded).unwrap(), nets);
        assert!(decode_net_map("1N1").is_err());
        assert!(decode_net_map("").unwrap().is_empty());
    }

    #[test]
    fn test_rejects_other_roots_and_missing_version() {
        assert!(matches!(
            KicadReader::parse_str("(kicad_pcb (version 1))"),
            Err(SchemaScanError::Parse(_))
        ));
        assert!(KicadReader::parse_str("(kicad_sch (generator x))").is_err());
        assert!(KicadReader::parse_str("(kicad_sch").is_err());
    }
}
