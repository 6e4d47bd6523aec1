//! Data model shared by every pipeline stage.
//!
//! All coordinates are in pixels of the normalized image produced by the
//! preprocessor. Conversion to millimetres happens at export time.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(&self, other: &Point) -> f64 {
        ((self.x - other.x).powi(2) + (self.y - other.y).powi(2)).sqrt()
    }
}

/// Axis-aligned pixel region of a detected symbol.
///
/// `rotation` is 0 for landscape bodies and 90 for portrait ones; the
/// symbol library stores every template in landscape orientation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingRegion {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
    pub rotation: f64,
}

impl BoundingRegion {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        let rotation = if height > width { 90.0 } else { 0.0 };
        Self {
            x,
            y,
            width,
            height,
            rotation,
        }
    }

    /// Exclusive right edge.
    pub fn right(&self) -> u32 {
        self.x + self.width
    }

    /// Exclusive bottom edge.
    pub fn bottom(&self) -> u32 {
        self.y + self.height
    }

    pub fn area(&self) -> u64 {
        self.width as u64 * self.height as u64
    }

    pub fn center(&self) -> Point {
        Point::new(
            self.x as f64 + self.width as f64 / 2.0,
            self.y as f64 + self.height as f64 / 2.0,
        )
    }

    /// Long side over short side, so it is independent of orientation.
    pub fn aspect_ratio(&self) -> f64 {
        let long = self.width.max(self.height) as f64;
        let short = self.width.min(self.height).max(1) as f64;
        long / short
    }

    pub fn is_portrait(&self) -> bool {
        self.height > self.width
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && x < self.right() && y >= self.y && y < self.bottom()
    }

    /// Grow by `margin` on every side, clamped to an image of `width`×`height`.
    pub fn expanded(&self, margin: u32, width: u32, height: u32) -> BoundingRegion {
        let x = self.x.saturating_sub(margin);
        let y = self.y.saturating_sub(margin);
        let right = (self.right() + margin).min(width);
        let bottom = (self.bottom() + margin).min(height);
        BoundingRegion {
            x,
            y,
            width: right.saturating_sub(x),
            height: bottom.saturating_sub(y),
            rotation: self.rotation,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Resistor,
    Capacitor,
    Inductor,
    Diode,
    Transistor,
    Ic,
    Connector,
    Unclassified,
}

impl ComponentKind {
    /// Every kind a symbol template can classify to.
    pub const CLASSIFIED: [ComponentKind; 7] = [
        ComponentKind::Resistor,
        ComponentKind::Capacitor,
        ComponentKind::Inductor,
        ComponentKind::Diode,
        ComponentKind::Transistor,
        ComponentKind::Ic,
        ComponentKind::Connector,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Resistor => "resistor",
            ComponentKind::Capacitor => "capacitor",
            ComponentKind::Inductor => "inductor",
            ComponentKind::Diode => "diode",
            ComponentKind::Transistor => "transistor",
            ComponentKind::Ic => "ic",
            ComponentKind::Connector => "connector",
            ComponentKind::Unclassified => "unclassified",
        }
    }

    /// Reference designator prefix used when annotating a document.
    pub fn reference_prefix(&self) -> &'static str {
        match self {
            ComponentKind::Resistor => "R",
            ComponentKind::Capacitor => "C",
            ComponentKind::Inductor => "L",
            ComponentKind::Diode => "D",
            ComponentKind::Transistor => "Q",
            ComponentKind::Ic => "U",
            ComponentKind::Connector => "J",
            ComponentKind::Unclassified => "X",
        }
    }

    pub fn is_classified(&self) -> bool {
        !matches!(self, ComponentKind::Unclassified)
    }

    /// Lenient parse used for backend verdicts and library manifests.
    ///
    /// Accepts names ("Resistor"), common abbreviations ("res", "cap") and
    /// reference prefixes ("R", "U"). Underscores, dashes and spaces are
    /// ignored, and qualifiers such as "electrolytic_capacitor" still resolve.
    pub fn parse_lenient(input: &str) -> Option<ComponentKind> {
        let normalized: String = input
            .chars()
            .filter(|c| !matches!(c, '_' | '-' | ' '))
            .collect::<String>()
            .to_lowercase();

        let exact = match normalized.as_str() {
            "r" | "res" | "resistor" => Some(ComponentKind::Resistor),
            "c" | "cap" | "capacitor" => Some(ComponentKind::Capacitor),
            "l" | "ind" | "inductor" | "coil" => Some(ComponentKind::Inductor),
            "d" | "diode" | "led" | "zener" => Some(ComponentKind::Diode),
            "q" | "t" | "transistor" | "bjt" | "mosfet" | "fet" => Some(ComponentKind::Transistor),
            "u" | "ic" | "chip" | "integratedcircuit" | "opamp" => Some(ComponentKind::Ic),
            "j" | "p" | "conn" | "connector" | "header" => Some(ComponentKind::Connector),
            "x" | "unknown" | "unclassified" | "none" => Some(ComponentKind::Unclassified),
            _ => None,
        };
        if exact.is_some() {
            return exact;
        }

        // Qualified names: longest keyword match wins.
        const KEYWORDS: [(&str, ComponentKind); 9] = [
            ("resistor", ComponentKind::Resistor),
            ("capacitor", ComponentKind::Capacitor),
            ("inductor", ComponentKind::Inductor),
            ("diode", ComponentKind::Diode),
            ("transistor", ComponentKind::Transistor),
            ("mosfet", ComponentKind::Transistor),
            ("connector", ComponentKind::Connector),
            ("header", ComponentKind::Connector),
            ("regulator", ComponentKind::Ic),
        ];
        KEYWORDS
            .iter()
            .filter(|(keyword, _)| normalized.contains(keyword))
            .max_by_key(|(keyword, _)| keyword.len())
            .map(|(_, kind)| *kind)
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ComponentKind::parse_lenient(s).ok_or_else(|| format!("unknown component kind '{}'", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ComponentId(pub usize);

impl fmt::Display for ComponentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Side of a component body a terminal leaves from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Left,
    Bottom,
    Right,
    Top,
}

impl Side {
    /// Unit vector pointing away from the body (image coordinates, y down).
    pub fn outward(&self) -> (f64, f64) {
        match self {
            Side::Left => (-1.0, 0.0),
            Side::Right => (1.0, 0.0),
            Side::Top => (0.0, -1.0),
            Side::Bottom => (0.0, 1.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TerminalId {
    pub component: ComponentId,
    pub pin: u32,
}

impl fmt::Display for TerminalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.component, self.pin)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Terminal {
    pub id: TerminalId,
    pub position: Point,
    pub side: Side,
}

/// Target schematic format revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FormatVersion {
    Kicad5Legacy,
    Kicad6,
    Kicad7,
    Kicad8,
}

impl FormatVersion {
    /// File format stamp written into `(version ...)`, `None` for legacy.
    pub fn stamp(&self) -> Option<u32> {
        match self {
            FormatVersion::Kicad5Legacy => None,
            FormatVersion::Kicad6 => Some(20211123),
            FormatVersion::Kicad7 => Some(20230121),
            FormatVersion::Kicad8 => Some(20231120),
        }
    }

    pub fn from_stamp(stamp: u32) -> Option<FormatVersion> {
        match stamp {
            20211014..=20220914 => Some(FormatVersion::Kicad6),
            20220915..=20231119 => Some(FormatVersion::Kicad7),
            s if s >= 20231120 => Some(FormatVersion::Kicad8),
            _ => None,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            FormatVersion::Kicad5Legacy => "KiCad 5 (legacy)",
            FormatVersion::Kicad6 => "KiCad 6",
            FormatVersion::Kicad7 => "KiCad 7",
            FormatVersion::Kicad8 => "KiCad 8",
        }
    }
}

impl Default for FormatVersion {
    fn default() -> Self {
        FormatVersion::Kicad8
    }
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Library symbol a classified component maps to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolRef {
    pub lib_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footprint: Option<String>,
    /// Oldest format revision that ships this symbol.
    #[serde(default = "oldest_sexpr_version")]
    pub min_version: FormatVersion,
}

fn oldest_sexpr_version() -> FormatVersion {
    FormatVersion::Kicad6
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionSource {
    Local,
    Backend { provider: String },
}

/// A symbol found in the image. Created once by the detector; corrections
/// (backend reclassification) produce a new value through [`reclassified`].
///
/// [`reclassified`]: DetectedComponent::reclassified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedComponent {
    pub id: ComponentId,
    pub kind: ComponentKind,
    pub region: BoundingRegion,
    /// Detection confidence in [0, 1].
    pub confidence: f64,
    /// Confidence of the kind assignment in [0, 1]; 0 when unclassified.
    pub kind_confidence: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub terminals: Vec<Terminal>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<SymbolRef>,
    pub source: DetectionSource,
}

impl DetectedComponent {
    pub fn new(id: ComponentId, kind: ComponentKind, region: BoundingRegion, confidence: f64) -> Self {
        Self {
            id,
            kind,
            region,
            confidence: confidence.clamp(0.0, 1.0),
            kind_confidence: 0.0,
            template: None,
            label: None,
            value: None,
            terminals: Vec::new(),
            symbol: None,
            source: DetectionSource::Local,
        }
    }

    pub fn with_terminals(mut self, terminals: Vec<Terminal>) -> Self {
        self.terminals = terminals;
        self
    }

    pub fn with_symbol(mut self, symbol: SymbolRef) -> Self {
        self.symbol = Some(symbol);
        self
    }

    pub fn with_kind_confidence(mut self, confidence: f64) -> Self {
        self.kind_confidence = confidence.clamp(0.0, 1.0);
        self
    }

    /// Copy of this component with a new classification.
    pub fn reclassified(
        &self,
        kind: ComponentKind,
        kind_confidence: f64,
        symbol: Option<SymbolRef>,
        source: DetectionSource,
    ) -> DetectedComponent {
        DetectedComponent {
            kind,
            kind_confidence: kind_confidence.clamp(0.0, 1.0),
            symbol,
            source,
            template: None,
            ..self.clone()
        }
    }

    pub fn terminal(&self, pin: u32) -> Option<&Terminal> {
        self.terminals.iter().find(|t| t.id.pin == pin)
    }
}

/// A traced wire: a simplified polyline through skeleton pixels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireSegment {
    pub id: usize,
    pub path: Vec<Point>,
    /// Length of the unsimplified pixel path.
    pub length: f64,
}

impl WireSegment {
    pub fn start(&self) -> Point {
        self.path.first().copied().unwrap_or_default()
    }

    pub fn end(&self) -> Point {
        self.path.last().copied().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JunctionKind {
    /// Three branches meeting.
    T,
    /// Two segments joined at an angle.
    L,
    /// Four or more branches joined by a junction dot.
    Cross,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Junction {
    pub position: Point,
    pub kind: JunctionKind,
    pub branches: usize,
}

/// Transitively connected terminals and wires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Net {
    pub id: usize,
    pub name: String,
    pub terminals: Vec<TerminalId>,
    pub segments: Vec<usize>,
}

impl Net {
    pub fn is_singleton(&self) -> bool {
        self.terminals.len() == 1
    }
}
