//! The reconstructed schematic: components, wires and nets.
//!
//! A [`SchematicDocument`] is built once from detector and tracer output and
//! is immutable afterwards. Construction checks that the nets partition the
//! terminal set; connectivity queries go through a bipartite petgraph of
//! component and net nodes whose edges carry pin numbers.

use petgraph::algo::connected_components;
use petgraph::graph::{NodeIndex, UnGraph};
use petgraph::visit::EdgeRef;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::core::SchemaScanError;
use crate::model::{ComponentId, DetectedComponent, Junction, Net, Point, TerminalId, WireSegment};
use crate::trace::TraceOutcome;

const MM_PER_INCH: f64 = 25.4;

/// Where a document came from and how its pixels map to paper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    /// Source file name, if the image came from disk.
    pub source: Option<String>,
    /// Zero-based page for multi-page inputs.
    pub page: u32,
    /// Normalized image size in pixels.
    pub width: u32,
    pub height: u32,
    /// Resolution of the source raster.
    pub dpi: f64,
    /// Upscale factor between source and normalized image.
    pub scale: f64,
}

impl DocumentMetadata {
    pub fn new(width: u32, height: u32, dpi: f64, scale: f64) -> Self {
        Self {
            source: None,
            page: 0,
            width,
            height,
            dpi,
            scale,
        }
    }

    pub fn with_source(mut self, source: impl Into<String>, page: u32) -> Self {
        self.source = Some(source.into());
        self.page = page;
        self
    }

    /// Normalized-image pixels per millimetre of paper.
    pub fn pixels_per_mm(&self) -> f64 {
        self.dpi * self.scale / MM_PER_INCH
    }

    pub fn to_mm(&self, point: Point) -> Point {
        let ppm = self.pixels_per_mm();
        Point::new(point.x / ppm, point.y / ppm)
    }

    pub fn width_mm(&self) -> f64 {
        self.width as f64 / self.pixels_per_mm()
    }

    pub fn height_mm(&self) -> f64 {
        self.height as f64 / self.pixels_per_mm()
    }
}

/// A component with its annotated reference designator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlacedComponent {
    pub reference: String,
    pub component: DetectedComponent,
}

/// One pin, identified the way a netlist names it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PinRef {
    pub reference: String,
    pub pin: u32,
}

impl PinRef {
    pub fn new(reference: impl Into<String>, pin: u32) -> Self {
        Self {
            reference: reference.into(),
            pin,
        }
    }
}

impl fmt::Display for PinRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.reference, self.pin)
    }
}

/// Pins grouped by net, independent of net names and ordering.
pub type NetPartition = BTreeSet<BTreeSet<PinRef>>;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DocumentStats {
    pub components: usize,
    pub classified: usize,
    pub unclassified: usize,
    pub terminals: usize,
    pub segments: usize,
    pub junctions: usize,
    pub nets: usize,
    pub singleton_nets: usize,
    /// Islands in the component/net graph.
    pub connected_groups: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DocumentNode {
    Component(usize),
    Net(usize),
}

/// Serialized form of a document; the graph is rebuilt on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct DocumentSnapshot {
    metadata: DocumentMetadata,
    components: Vec<PlacedComponent>,
    segments: Vec<WireSegment>,
    junctions: Vec<Junction>,
    nets: Vec<Net>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(into = "DocumentSnapshot", try_from = "DocumentSnapshot")]
pub struct SchematicDocument {
    metadata: DocumentMetadata,
    components: Vec<PlacedComponent>,
    segments: Vec<WireSegment>,
    junctions: Vec<Junction>,
    nets: Vec<Net>,
    graph: UnGraph<DocumentNode, u32>,
    component_nodes: HashMap<ComponentId, NodeIndex>,
    net_nodes: Vec<NodeIndex>,
}

impl PartialEq for SchematicDocument {
    fn eq(&self, other: &Self) -> bool {
        self.metadata == other.metadata
            && self.components == other.components
            && self.segments == other.segments
            && self.junctions == other.junctions
            && self.nets == other.nets
    }
}

/// Reference designators in component order: R1, R2, C1, ...
fn annotate(components: Vec<DetectedComponent>) -> Vec<PlacedComponent> {
    let mut counters: BTreeMap<&'static str, usize> = BTreeMap::new();
    components
        .into_iter()
        .map(|component| {
            let prefix = component.kind.reference_prefix();
            let n = counters.entry(prefix).or_insert(0);
            *n += 1;
            PlacedComponent {
                reference: format!("{}{}", prefix, n),
                component,
            }
        })
        .collect()
}

fn invariant(message: impl Into<String>) -> SchemaScanError {
    SchemaScanError::DocumentInvariant(message.into())
}

impl SchematicDocument {
    /// Assemble a document, checking that every terminal sits in exactly one
    /// net and that nets only name terminals and segments that exist.
    pub fn new(
        metadata: DocumentMetadata,
        components: Vec<DetectedComponent>,
        trace: TraceOutcome,
    ) -> Result<Self, SchemaScanError> {
        Self::assemble(
            metadata,
            annotate(components),
            trace.segments,
            trace.junctions,
            trace.nets,
        )
    }

    fn assemble(
        metadata: DocumentMetadata,
        components: Vec<PlacedComponent>,
        segments: Vec<WireSegment>,
        junctions: Vec<Junction>,
        nets: Vec<Net>,
    ) -> Result<Self, SchemaScanError> {
        let mut ids = HashSet::new();
        let mut terminals = HashSet::new();
        for placed in &components {
            let c = &placed.component;
            if !ids.insert(c.id) {
                return Err(invariant(format!("component {} appears twice", c.id)));
            }
            for t in &c.terminals {
                if t.id.component != c.id || !terminals.insert(t.id) {
                    return Err(invariant(format!("terminal {} is malformed or duplicated", t.id)));
                }
            }
        }

        let mut seen: HashSet<TerminalId> = HashSet::new();
        let mut names = HashSet::new();
        for net in &nets {
            if !names.insert(net.name.as_str()) {
                return Err(invariant(format!("net name {} is used twice", net.name)));
            }
            for t in &net.terminals {
                if !terminals.contains(t) {
                    return Err(invariant(format!("net {} refers to unknown terminal {}", net.name, t)));
                }
                if !seen.insert(*t) {
                    return Err(invariant(format!("terminal {} is in more than one net", t)));
                }
            }
            if let Some(s) = net.segments.iter().find(|&&s| s >= segments.len()) {
                return Err(invariant(format!("net {} refers to unknown segment {}", net.name, s)));
            }
        }
        if let Some(missing) = terminals.difference(&seen).min() {
            return Err(invariant(format!("terminal {} is not in any net", missing)));
        }

        let mut graph = UnGraph::new_undirected();
        let mut component_nodes = HashMap::new();
        for (i, placed) in components.iter().enumerate() {
            component_nodes.insert(placed.component.id, graph.add_node(DocumentNode::Component(i)));
        }
        let mut net_nodes = Vec::with_capacity(nets.len());
        for (i, net) in nets.iter().enumerate() {
            let node = graph.add_node(DocumentNode::Net(i));
            for t in &net.terminals {
                if let Some(&c) = component_nodes.get(&t.component) {
                    graph.add_edge(c, node, t.pin);
                }
            }
            net_nodes.push(node);
        }

        Ok(Self {
            metadata,
            components,
            segments,
            junctions,
            nets,
            graph,
            component_nodes,
            net_nodes,
        })
    }

    /// Pin-labelled neighbours of a node.
    fn linked(&self, node: NodeIndex) -> impl Iterator<Item = (DocumentNode, u32)> + '_ {
        self.graph.edges(node).map(move |e| {
            let other = if e.source() == node { e.target() } else { e.source() };
            (self.graph[other], *e.weight())
        })
    }

    pub fn metadata(&self) -> &DocumentMetadata {
        &self.metadata
    }

    pub fn components(&self) -> &[PlacedComponent] {
        &self.components
    }

    pub fn segments(&self) -> &[WireSegment] {
        &self.segments
    }

    pub fn junctions(&self) -> &[Junction] {
        &self.junctions
    }

    pub fn nets(&self) -> &[Net] {
        &self.nets
    }

    pub fn component(&self, id: ComponentId) -> Option<&PlacedComponent> {
        let node = self.component_nodes.get(&id)?;
        match self.graph[*node] {
            DocumentNode::Component(i) => self.components.get(i),
            DocumentNode::Net(_) => None,
        }
    }

    pub fn reference(&self, id: ComponentId) -> Option<&str> {
        self.component(id).map(|p| p.reference.as_str())
    }

    pub fn net(&self, name: &str) -> Option<&Net> {
        self.nets.iter().find(|n| n.name == name)
    }

    /// The net holding `terminal`.
    pub fn net_of(&self, terminal: TerminalId) -> Option<&Net> {
        let node = self.component_nodes.get(&terminal.component)?;
        self.linked(*node)
            .filter(|(_, pin)| *pin == terminal.pin)
            .find_map(|(other, _)| match other {
                DocumentNode::Net(i) => self.nets.get(i),
                DocumentNode::Component(_) => None,
            })
    }

    /// `(pin, net)` pairs for a component, ordered by pin.
    pub fn nets_for_component(&self, id: ComponentId) -> Vec<(u32, &Net)> {
        let Some(node) = self.component_nodes.get(&id) else {
            return Vec::new();
        };
        let mut out: Vec<(u32, &Net)> = self
            .linked(*node)
            .filter_map(|(other, pin)| match other {
                DocumentNode::Net(i) => Some((pin, &self.nets[i])),
                DocumentNode::Component(_) => None,
            })
            .collect();
        out.sort_by_key(|(pin, _)| *pin);
        out
    }

    /// `(component, pin)` pairs on a net, in component order.
    pub fn components_on_net(&self, name: &str) -> Vec<(&PlacedComponent, u32)> {
        let Some(index) = self.nets.iter().position(|n| n.name == name) else {
            return Vec::new();
        };
        let node = self.net_nodes[index];
        let mut out: Vec<(&PlacedComponent, u32)> = self
            .linked(node)
            .filter_map(|(other, pin)| match other {
                DocumentNode::Component(i) => Some((&self.components[i], pin)),
                DocumentNode::Net(_) => None,
            })
            .collect();
        out.sort_by_key(|(c, pin)| (c.component.id, *pin));
        out
    }

    pub fn net_partition(&self) -> NetPartition {
        self.nets
            .iter()
            .map(|net| {
                net.terminals
                    .iter()
                    .filter_map(|t| Some(PinRef::new(self.reference(t.component)?, t.pin)))
                    .collect()
            })
            .collect()
    }

    pub fn stats(&self) -> DocumentStats {
        let classified = self
            .components
            .iter()
            .filter(|p| p.component.kind.is_classified())
            .count();
        DocumentStats {
            components: self.components.len(),
            classified,
            unclassified: self.components.len() - classified,
            terminals: self.components.iter().map(|p| p.component.terminals.len()).sum(),
            segments: self.segments.len(),
            junctions: self.junctions.len(),
            nets: self.nets.len(),
            singleton_nets: self.nets.iter().filter(|n| n.is_singleton()).count(),
            connected_groups: connected_components(&self.graph),
        }
    }
}

impl From<SchematicDocument> for DocumentSnapshot {
    fn from(doc: SchematicDocument) -> Self {
        Self {
            metadata: doc.metadata,
            components: doc.components,
            segments: doc.segments,
            junctions: doc.junctions,
            nets: doc.nets,
        }
    }
}

impl TryFrom<DocumentSnapshot> for SchematicDocument {
    type Error = SchemaScanError;

    fn try_from(s: DocumentSnapshot) -> Result<Self, Self::Error> {
        Self::assemble(s.metadata, s.components, s.segments, s.junctions, s.nets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoundingRegion, ComponentKind, Side, Terminal};
    use crate::trace::TraceStats;

    fn component(id: usize, kind: ComponentKind, pins: u32) -> DetectedComponent {
        let terminals = (1..=pins)
            .map(|pin| Terminal {
                id: TerminalId {
                    component: ComponentId(id),
                    pin,
                },
                position: Point::new(id as f64 * 50.0, pin as f64 * 10.0),
                side: Side::Left,
            })
            .collect();
        DetectedComponent::new(ComponentId(id), kind, BoundingRegion::new(id as u32 * 50, 0, 30, 30), 0.9)
            .with_terminals(terminals)
    }

    fn tid(component: usize, pin: u32) -> TerminalId {
        TerminalId {
            component: ComponentId(component),
            pin,
        }
    }

    fn net(id: usize, terminals: Vec<TerminalId>, segments: Vec<usize>) -> Net {
        Net {
            id,
            name: format!("N{}", id + 1),
            terminals,
            segments,
        }
    }

    fn trace_with(nets: Vec<Net>, segments: usize) -> TraceOutcome {
        TraceOutcome {
            segments: (0..segments)
                .map(|id| WireSegment {
                    id,
                    path: vec![Point::new(0.0, 0.0), Point::new(10.0, 0.0)],
                    length: 10.0,
                })
                .collect(),
            junctions: Vec::new(),
            nets,
            buses: Vec::new(),
            stats: TraceStats::default(),
            warnings: Vec::new(),
        }
    }

    /// R1 pin 2 and C1 pin 1 share a net; the other pins are singletons.
    fn sample() -> SchematicDocument {
        let components = vec![
            component(0, ComponentKind::Resistor, 2),
            component(1, ComponentKind::Capacitor, 2),
            component(2, ComponentKind::Resistor, 1),
        ];
        let nets = vec![
            net(0, vec![tid(0, 1)], vec![]),
            net(1, vec![tid(0, 2), tid(1, 1)], vec![0]),
            net(2, vec![tid(1, 2)], vec![]),
            net(3, vec![tid(2, 1)], vec![]),
        ];
        SchematicDocument::new(DocumentMetadata::new(400, 300, 300.0, 1.0), components, trace_with(nets, 1))
            .unwrap()
    }

    #[test]
    fn test_references_count_per_prefix() {
        let doc = sample();
        let refs: Vec<&str> = doc.components().iter().map(|p| p.reference.as_str()).collect();
        assert_eq!(refs, vec!["R1", "C1", "R2"]);
    }

    #[test]
    fn test_connectivity_queries() {
        let doc = sample();
        let pins: Vec<(u32, &str)> = doc
            .nets_for_component(ComponentId(0))
            .into_iter()
            .map(|(pin, n)| (pin, n.name.as_str()))
            .collect();
        assert_eq!(pins, vec![(1, "N1"), (2, "N2")]);

        let on_net: Vec<(&str, u32)> = doc
            .components_on_net("N2")
            .into_iter()
            .map(|(c, pin)| (c.reference.as_str(), pin))
            .collect();
        assert_eq!(on_net, vec![("R1", 2), ("C1", 1)]);
        assert_eq!(doc.net_of(tid(1, 2)).map(|n| n.name.as_str()), Some("N3"));
        assert!(doc.components_on_net("N99").is_empty());
    }

    #[test]
    fn test_stats_and_partition() {
        let doc = sample();
        let stats = doc.stats();
        assert_eq!(stats.components, 3);
        assert_eq!(stats.terminals, 5);
        assert_eq!(stats.nets, 4);
        assert_eq!(stats.singleton_nets, 3);
        // R1 and C1 are joined through N2; R2 is on its own
        assert_eq!(stats.connected_groups, 2);

        let partition = doc.net_partition();
        assert_eq!(partition.len(), 4);
        let shared: BTreeSet<PinRef> = [PinRef::new("R1", 2), PinRef::new("C1", 1)].into_iter().collect();
        assert!(partition.contains(&shared));
    }

    #[test]
    fn test_terminal_in_two_nets_is_rejected() {
        let components = vec![component(0, ComponentKind::Resistor, 2)];
        let nets = vec![
            net(0, vec![tid(0, 1), tid(0, 2)], vec![]),
            net(1, vec![tid(0, 2)], vec![]),
        ];
        let err = SchematicDocument::new(DocumentMetadata::new(10, 10, 300.0, 1.0), components, trace_with(nets, 0))
            .unwrap_err();
        assert!(matches!(err, SchemaScanError::DocumentInvariant(_)));
    }

    #[test]
    fn test_unassigned_and_unknown_terminals_are_rejected() {
        let meta = DocumentMetadata::new(10, 10, 300.0, 1.0);
        let missing = SchematicDocument::new(
            meta.clone(),
            vec![component(0, ComponentKind::Resistor, 2)],
            trace_with(vec![net(0, vec![tid(0, 1)], vec![])], 0),
        );
        assert!(matches!(missing, Err(SchemaScanError::DocumentInvariant(_))));

        let unknown = SchematicDocument::new(
            meta.clone(),
            vec![component(0, ComponentKind::Resistor, 1)],
            trace_with(vec![net(0, vec![tid(0, 1), tid(7, 1)], vec![])], 0),
        );
        assert!(matches!(unknown, Err(SchemaScanError::DocumentInvariant(_))));

        let bad_segment = SchematicDocument::new(
            meta,
            vec![component(0, ComponentKind::Resistor, 1)],
            trace_with(vec![net(0, vec![tid(0, 1)], vec![3])], 1),
        );
        assert!(matches!(bad_segment, Err(SchemaScanError::DocumentInvariant(_))));
    }

    #[test]
    fn test_json_snapshot_round_trip() {
        let doc = sample();
        let json = serde_json::to_string(&doc).unwrap();
        let back: SchematicDocument = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
        assert_eq!(back.nets_for_component(ComponentId(1)).len(), 2);
    }

    #[test]
    fn test_millimetre_conversion() {
        let meta = DocumentMetadata::new(1200, 600, 300.0, 2.0);
        let ppm = meta.pixels_per_mm();
        assert!((ppm - 600.0 / 25.4).abs() < 1e-9);
        let p = meta.to_mm(Point::new(600.0, 0.0));
        assert!((p.x - 25.4).abs() < 1e-9);
        assert!((meta.width_mm() - 50.8).abs() < 1e-9);
    }
}
