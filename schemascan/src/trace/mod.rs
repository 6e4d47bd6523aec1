//! Connection tracing: wires, junctions and nets.
//!
//! Component bodies are erased from the ink mask, the rest is thinned to a
//! one-pixel skeleton and split into runs between nodes. Runs are attached
//! to terminals, joined at junctions and across small gaps, and finally
//! partitioned into nets with a union-find over segments and terminals.

mod graph;
mod simplify;
mod skeleton;

use image::{GrayImage, Luma};
use imageproc::distance_transform::{distance_transform, Norm};
use petgraph::unionfind::UnionFind;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::TracerConfig;
use crate::debug::{emit_or_warn, trace_overlay, DebugArtifact, DebugSink};
use crate::model::{ComponentId, DetectedComponent, Junction, JunctionKind, Net, Point, Terminal, TerminalId, WireSegment};
use crate::preprocess::NormalizedImage;

use graph::{End, RawSegment};
use skeleton::Skeleton;

pub(crate) use simplify::simplify;

/// Pixels erased around each component body before thinning.
const BODY_MARGIN: u32 = 2;
/// How far into a wire its direction is sampled.
const DIRECTION_REACH: usize = 6;
/// Paths shorter than this have no usable direction.
const MIN_DIRECTED_PIXELS: usize = 4;
/// Furthest a free end is followed through ink to find where the line stops.
const MAX_TIP_WALK: u32 = 16;
const SIMPLIFY_EPSILON: f64 = 1.0;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TraceStats {
    pub skeleton_pixels: usize,
    pub segments: usize,
    /// Short dangling segments discarded as noise.
    pub dropped_noise: usize,
    pub junctions: usize,
    /// Four-way crossings without a junction dot.
    pub crossings: usize,
    pub bridged_gaps: usize,
    pub attached_ends: usize,
    pub nets: usize,
    pub buses: usize,
    pub singleton_nets: usize,
    /// Wire groups that reach no terminal.
    pub floating_wires: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TraceWarning {
    /// A terminal that shares its net with no other terminal.
    SingletonNet { terminal: TerminalId, net: String },
}

impl fmt::Display for TraceWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TraceWarning::SingletonNet { terminal, net } => {
                write!(f, "terminal {} reaches no other terminal (singleton net {})", terminal, net)
            }
        }
    }
}

/// A wire drawn markedly thicker than the rest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Bus {
    /// `B1`, `B2`, ... in segment order.
    pub name: String,
    /// Index into [`TraceOutcome::segments`].
    pub segment: usize,
    pub start: Point,
    pub end: Point,
    /// Drawn line width in pixels.
    pub width: f64,
    /// Components with a terminal on the bus's net.
    pub components: Vec<ComponentId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceOutcome {
    pub segments: Vec<WireSegment>,
    pub junctions: Vec<Junction>,
    pub nets: Vec<Net>,
    pub buses: Vec<Bus>,
    pub stats: TraceStats,
    pub warnings: Vec<TraceWarning>,
}

fn angle_deg(a: (f64, f64), b: (f64, f64)) -> f64 {
    let dot = (a.0 * b.0 + a.1 * b.1).clamp(-1.0, 1.0);
    dot.acos().to_degrees()
}

fn end_index(at_start: bool) -> usize {
    if at_start {
        0
    } else {
        1
    }
}

/// Mutable state while segments are being joined.
struct Wiring<'a> {
    config: &'a TracerConfig,
    terminals: &'a [&'a Terminal],
    segments: Vec<RawSegment>,
    alive: Vec<bool>,
    attached: Vec<[Option<usize>; 2]>,
    sets: UnionFind<usize>,
    junctions: Vec<Junction>,
    stats: TraceStats,
}

impl<'a> Wiring<'a> {
    fn new(config: &'a TracerConfig, terminals: &'a [&'a Terminal], segments: Vec<RawSegment>) -> Self {
        let n = segments.len();
        Self {
            config,
            terminals,
            alive: vec![true; n],
            attached: vec![[None, None]; n],
            sets: UnionFind::new(n + terminals.len()),
            segments,
            junctions: Vec::new(),
            stats: TraceStats::default(),
        }
    }

    fn terminal_node(&self, terminal: usize) -> usize {
        self.segments.len() + terminal
    }

    fn is_loose(&self, segment: usize, at_start: bool) -> bool {
        self.segments[segment].end_kind(at_start) == End::Free
            && self.attached[segment][end_index(at_start)].is_none()
    }

    /// Nearest terminal the given end may attach to.
    fn find_terminal(&self, segment: usize, at_start: bool) -> Option<usize> {
        let seg = &self.segments[segment];
        let point = seg.end_point(at_start);
        let direction = seg.direction_from(at_start, DIRECTION_REACH);
        let check_angle = seg.pixels.len() >= MIN_DIRECTED_PIXELS;

        self.terminals
            .iter()
            .enumerate()
            .filter_map(|(i, terminal)| {
                let distance = point.distance(&terminal.position);
                if distance > self.config.terminal_tolerance {
                    return None;
                }
                if check_angle && angle_deg(direction, terminal.side.outward()) > self.config.angle_tolerance_deg {
                    return None;
                }
                Some((i, distance))
            })
            .min_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)))
            .map(|(i, _)| i)
    }

    fn attach(&mut self, segment: usize, at_start: bool) {
        if !self.is_loose(segment, at_start) {
            return;
        }
        if let Some(terminal) = self.find_terminal(segment, at_start) {
            self.attached[segment][end_index(at_start)] = Some(terminal);
            let node = self.terminal_node(terminal);
            self.sets.union(segment, node);
            self.stats.attached_ends += 1;
        }
    }

    fn attach_all(&mut self) {
        for segment in 0..self.segments.len() {
            self.attach(segment, true);
            self.attach(segment, false);
        }
    }

    fn drop_noise(&mut self) {
        for segment in 0..self.segments.len() {
            let short = self.segments[segment].length < self.config.min_segment_length;
            if short && (self.is_loose(segment, true) || self.is_loose(segment, false)) {
                self.stats.attached_ends -= self.attached[segment].iter().flatten().count();
                self.alive[segment] = false;
                self.stats.dropped_noise += 1;
            }
        }
    }

    fn branches(&self, cluster: usize) -> Vec<(usize, bool)> {
        let mut out = Vec::new();
        for (i, seg) in self.segments.iter().enumerate() {
            if !self.alive[i] {
                continue;
            }
            if seg.start == End::Cluster(cluster) {
                out.push((i, true));
            }
            if seg.end == End::Cluster(cluster) {
                out.push((i, false));
            }
        }
        out
    }

    fn direction(&self, branch: (usize, bool)) -> (f64, f64) {
        self.segments[branch.0].direction_from(branch.1, DIRECTION_REACH)
    }

    fn union_all(&mut self, branches: &[(usize, bool)]) {
        for pair in branches.windows(2) {
            self.sets.union(pair[0].0, pair[1].0);
        }
    }

    fn record(&mut self, position: Point, kind: JunctionKind, branches: usize) {
        self.junctions.push(Junction {
            position,
            kind,
            branches,
        });
    }

    /// Join the branches meeting at `cluster`.
    fn resolve_cluster(&mut self, cluster: usize, center: Point, has_dot: bool) {
        let branches = self.branches(cluster);
        match branches.len() {
            0 => {}
            1 => {
                // everything else at this node was noise
                let (segment, at_start) = branches[0];
                if at_start {
                    self.segments[segment].start = End::Free;
                } else {
                    self.segments[segment].end = End::Free;
                }
                self.attach(segment, at_start);
            }
            2 => {
                self.union_all(&branches);
                let angle = angle_deg(self.direction(branches[0]), self.direction(branches[1]));
                if angle < 180.0 - self.config.angle_tolerance_deg {
                    self.record(center, JunctionKind::L, 2);
                }
            }
            3 => {
                self.union_all(&branches);
                self.record(center, JunctionKind::T, 3);
            }
            4 if !has_dot => {
                let dirs: Vec<(f64, f64)> = branches.iter().map(|&b| self.direction(b)).collect();
                let cos = |a: usize, b: usize| dirs[a].0 * dirs[b].0 + dirs[a].1 * dirs[b].1;
                let pairings = [[(0, 1), (2, 3)], [(0, 2), (1, 3)], [(0, 3), (1, 2)]];
                let best = pairings
                    .iter()
                    .min_by(|p, q| {
                        let sp = cos(p[0].0, p[0].1) + cos(p[1].0, p[1].1);
                        let sq = cos(q[0].0, q[0].1) + cos(q[1].0, q[1].1);
                        sp.total_cmp(&sq)
                    })
                    .copied()
                    .unwrap_or(pairings[0]);
                for (a, b) in best {
                    self.sets.union(branches[a].0, branches[b].0);
                }
                self.stats.crossings += 1;
            }
            n => {
                self.union_all(&branches);
                self.record(center, JunctionKind::Cross, n);
            }
        }
    }

    fn loose_ends(&self) -> Vec<(usize, bool)> {
        (0..self.segments.len())
            .filter(|&s| self.alive[s])
            .flat_map(|s| [(s, true), (s, false)])
            .filter(|&(s, at_start)| self.is_loose(s, at_start))
            .collect()
    }

    /// Last ink pixel reached walking outward from a free end. Thinning eats
    /// into line ends, so gaps are measured between tips.
    fn ink_tip(&self, (segment, at_start): (usize, bool), gauge: &InkGauge) -> Point {
        let seg = &self.segments[segment];
        let from = seg.end_point(at_start);
        let (dx, dy) = seg.direction_from(at_start, DIRECTION_REACH);
        let mut tip = from;
        for step in 1..=MAX_TIP_WALK {
            let x = (from.x - dx * step as f64).round();
            let y = (from.y - dy * step as f64).round();
            if gauge.depth_at(x, y) == 0 {
                break;
            }
            tip = Point::new(x, y);
        }
        tip
    }

    fn bridge_gaps(&mut self, gauge: &InkGauge) {
        let max_gap = self.config.max_gap;
        let ends = self.loose_ends();
        let tips: Vec<Point> = ends.iter().map(|&end| self.ink_tip(end, gauge)).collect();

        // paper pixels between two tips
        let mut pairs = Vec::new();
        for i in 0..ends.len() {
            for j in i + 1..ends.len() {
                if ends[i].0 == ends[j].0 {
                    continue;
                }
                let gap = tips[i].distance(&tips[j]) - 1.0;
                if gap <= max_gap {
                    pairs.push((gap, i, j));
                }
            }
        }
        pairs.sort_by(|x, y| x.0.total_cmp(&y.0));

        let mut used = vec![false; ends.len()];
        for (_, i, j) in pairs {
            if used[i] || used[j] {
                continue;
            }
            used[i] = true;
            used[j] = true;
            let (a, b) = (ends[i], ends[j]);
            self.sets.union(a.0, b.0);
            self.stats.bridged_gaps += 1;

            let (da, db) = (self.direction(a), self.direction(b));
            if angle_deg(da, (-db.0, -db.1)) > self.config.angle_tolerance_deg {
                let (pa, pb) = (tips[i], tips[j]);
                self.record(Point::new((pa.x + pb.x) / 2.0, (pa.y + pb.y) / 2.0), JunctionKind::L, 2);
            }
        }

        // a free end stopping short of another wire's side
        for (k, &end) in ends.iter().enumerate() {
            if used[k] {
                continue;
            }
            let tip = tips[k];
            let nearest = (0..self.segments.len())
                .filter(|&s| s != end.0 && self.alive[s])
                .flat_map(|s| {
                    let pixels = &self.segments[s].pixels;
                    let last = pixels.len() - 1;
                    pixels.iter().enumerate().map(move |(n, &(x, y))| (s, n == 0 || n == last, x, y))
                })
                .map(|(s, at_endpoint, x, y)| {
                    let at = Point::new(x as f64, y as f64);
                    let gap = tip.distance(&at) - gauge.depth_at(at.x, at.y) as f64;
                    (gap, s, at_endpoint, at)
                })
                .filter(|c| c.0 <= max_gap)
                .min_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
            if let Some((_, other, at_endpoint, at)) = nearest {
                self.sets.union(end.0, other);
                self.stats.bridged_gaps += 1;
                if !at_endpoint {
                    self.record(at, JunctionKind::T, 3);
                }
            }
        }
    }
}

pub struct ConnectionTracer {
    config: TracerConfig,
    debug: Option<Arc<dyn DebugSink>>,
}

impl ConnectionTracer {
    pub fn new(config: TracerConfig) -> Self {
        Self {
            config,
            debug: None,
        }
    }

    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug = Some(sink);
        self
    }

    pub fn config(&self) -> &TracerConfig {
        &self.config
    }

    /// Ink that is not part of any component body.
    fn wire_mask(image: &NormalizedImage, components: &[DetectedComponent]) -> GrayImage {
        let mut mask = image.binary.clone();
        let (width, height) = mask.dimensions();
        for component in components {
            let r = component.region.expanded(BODY_MARGIN, width, height);
            for y in r.y..r.bottom() {
                for x in r.x..r.right() {
                    mask.put_pixel(x, y, Luma([0]));
                }
            }
        }
        mask
    }

    pub fn trace(&self, image: &NormalizedImage, components: &[DetectedComponent]) -> TraceOutcome {
        let config = &self.config;
        let mask = Self::wire_mask(image, components);
        let skeleton = Skeleton::thin(&mask);
        let graph = graph::build(&skeleton, config.junction_radius);
        debug!(
            skeleton_pixels = skeleton.count(),
            runs = graph.segments.len(),
            clusters = graph.clusters.len(),
            "skeleton graph built"
        );

        let mut terminals: Vec<&Terminal> = components.iter().flat_map(|c| c.terminals.iter()).collect();
        terminals.sort_by_key(|t| t.id);

        let mut wiring = Wiring::new(config, &terminals, graph.segments);
        wiring.stats.skeleton_pixels = skeleton.count();
        wiring.attach_all();
        wiring.drop_noise();

        let gauge = InkGauge::new(&mask, &skeleton, config.junction_marker_min_radius);
        for (id, cluster) in graph.clusters.iter().enumerate() {
            let has_dot = gauge.is_dot(&cluster.pixels);
            wiring.resolve_cluster(id, cluster.center, has_dot);
        }
        wiring.bridge_gaps(&gauge);

        let outcome = self.partition(wiring, &terminals, &gauge);
        emit_or_warn(self.debug.as_deref(), || {
            DebugArtifact::gray("trace_skeleton", skeleton.to_image())
        });
        emit_or_warn(self.debug.as_deref(), || {
            DebugArtifact::rgb("trace_overlay", trace_overlay(&image.binary, &outcome))
        });
        info!(
            segments = outcome.stats.segments,
            junctions = outcome.stats.junctions,
            nets = outcome.stats.nets,
            buses = outcome.stats.buses,
            singletons = outcome.stats.singleton_nets,
            "tracing finished"
        );
        outcome
    }

    /// Group surviving segments and terminals into nets.
    fn partition(&self, wiring: Wiring<'_>, terminals: &[&Terminal], gauge: &InkGauge) -> TraceOutcome {
        let mut renumber = HashMap::new();
        let mut segments = Vec::new();
        for (i, raw) in wiring.segments.iter().enumerate() {
            if !wiring.alive[i] {
                continue;
            }
            let path: Vec<Point> = raw.pixels.iter().map(|&(x, y)| Point::new(x as f64, y as f64)).collect();
            renumber.insert(i, segments.len());
            segments.push(WireSegment {
                id: segments.len(),
                path: simplify(&path, SIMPLIFY_EPSILON),
                length: raw.length,
            });
        }

        let mut net_of_root: HashMap<usize, usize> = HashMap::new();
        let mut nets: Vec<Net> = Vec::new();
        for (t, terminal) in terminals.iter().enumerate() {
            let root = wiring.sets.find(wiring.terminal_node(t));
            let index = *net_of_root.entry(root).or_insert_with(|| {
                nets.push(Net {
                    id: nets.len(),
                    name: format!("N{}", nets.len() + 1),
                    terminals: Vec::new(),
                    segments: Vec::new(),
                });
                nets.len() - 1
            });
            nets[index].terminals.push(terminal.id);
        }

        let mut floating = Vec::new();
        for (&old, &new) in &renumber {
            let root = wiring.sets.find(old);
            match net_of_root.get(&root) {
                Some(&net) => nets[net].segments.push(new),
                None => {
                    if !floating.contains(&root) {
                        floating.push(root);
                    }
                }
            }
        }
        for net in &mut nets {
            net.segments.sort_unstable();
        }

        let mut warnings = Vec::new();
        for net in nets.iter().filter(|n| n.is_singleton()) {
            if self.config.report_singletons {
                let terminal = net.terminals[0];
                warn!(terminal = %terminal, net = %net.name, "terminal reaches no other terminal");
                warnings.push(TraceWarning::SingletonNet {
                    terminal,
                    net: net.name.clone(),
                });
            }
        }

        let buses = if self.config.detect_buses {
            self.find_buses(&wiring, &renumber, &segments, &nets, gauge)
        } else {
            Vec::new()
        };

        let mut stats = wiring.stats;
        stats.segments = segments.len();
        stats.buses = buses.len();
        stats.junctions = wiring.junctions.len();
        stats.nets = nets.len();
        stats.singleton_nets = nets.iter().filter(|n| n.is_singleton()).count();
        stats.floating_wires = floating.len();

        TraceOutcome {
            segments,
            junctions: wiring.junctions,
            nets,
            buses,
            stats,
            warnings,
        }
    }

    /// Segments drawn markedly thicker than the typical wire, each with the
    /// components its net reaches.
    fn find_buses(
        &self,
        wiring: &Wiring<'_>,
        renumber: &HashMap<usize, usize>,
        segments: &[WireSegment],
        nets: &[Net],
        gauge: &InkGauge,
    ) -> Vec<Bus> {
        let threshold = self.config.bus_width_factor * gauge.typical;
        let mut thick: Vec<(usize, f64)> = renumber
            .iter()
            .filter(|&(&old, _)| wiring.segments[old].length >= self.config.min_segment_length)
            .filter_map(|(&old, &new)| {
                let depth = gauge.median_depth(&wiring.segments[old].pixels);
                (depth > gauge.typical && depth >= threshold).then_some((new, depth))
            })
            .collect();
        thick.sort_by_key(|&(segment, _)| segment);

        thick
            .into_iter()
            .enumerate()
            .map(|(i, (segment, depth))| {
                let mut components: Vec<ComponentId> = nets
                    .iter()
                    .find(|net| net.segments.binary_search(&segment).is_ok())
                    .map(|net| net.terminals.iter().map(|t| t.component).collect())
                    .unwrap_or_default();
                components.sort_unstable();
                components.dedup();
                let wire = &segments[segment];
                debug!(bus = i + 1, segment, depth, components = components.len(), "bus found");
                Bus {
                    name: format!("B{}", i + 1),
                    segment,
                    start: wire.start(),
                    end: wire.end(),
                    width: 2.0 * depth - 1.0,
                    components,
                }
            })
            .collect()
    }
}

/// Ink thickness around the skeleton: decides junction dots, ink tips at
/// free ends and bus width.
struct InkGauge {
    /// LInf distance from each ink pixel to the nearest paper pixel.
    depth: GrayImage,
    /// Median depth under the skeleton.
    typical: f64,
    dot_threshold: f64,
}

impl InkGauge {
    fn new(mask: &GrayImage, skeleton: &Skeleton, min_radius: f64) -> Self {
        let paper = GrayImage::from_fn(mask.width(), mask.height(), |x, y| {
            Luma([if mask.get_pixel(x, y)[0] > 0 { 0 } else { 255 }])
        });
        let depth = distance_transform(&paper, Norm::LInf);

        let mut widths: Vec<u8> = skeleton.pixels().map(|(x, y)| depth.get_pixel(x, y)[0]).collect();
        widths.sort_unstable();
        let typical = widths.get(widths.len() / 2).copied().unwrap_or(1) as f64;
        Self {
            depth,
            typical,
            dot_threshold: min_radius.max(2.0 * typical + 1.0),
        }
    }

    /// Zero on paper and outside the image.
    fn depth_at(&self, x: f64, y: f64) -> u8 {
        if x < 0.0 || y < 0.0 || x >= self.depth.width() as f64 || y >= self.depth.height() as f64 {
            return 0;
        }
        self.depth.get_pixel(x as u32, y as u32)[0]
    }

    fn median_depth(&self, pixels: &[(u32, u32)]) -> f64 {
        let mut depths: Vec<u8> = pixels.iter().map(|&(x, y)| self.depth.get_pixel(x, y)[0]).collect();
        depths.sort_unstable();
        depths.get(depths.len() / 2).copied().unwrap_or(0) as f64
    }

    fn is_dot(&self, pixels: &[(u32, u32)]) -> bool {
        pixels
            .iter()
            .map(|&(x, y)| self.depth.get_pixel(x, y)[0] as f64)
            .fold(0.0, f64::max)
            >= self.dot_threshold
    }
}

/// Trace `components`' connections in `image` with `config`.
pub fn trace(image: &NormalizedImage, components: &[DetectedComponent], config: &TracerConfig) -> TraceOutcome {
    ConnectionTracer::new(config.clone()).trace(image, components)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BoundingRegion, ComponentId, ComponentKind, Side};
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
    use imageproc::rect::Rect;
    use std::collections::HashSet;

    const INK: Luma<u8> = Luma([255u8]);

    fn normalized(binary: GrayImage) -> NormalizedImage {
        let (w, h) = binary.dimensions();
        NormalizedImage {
            gray: GrayImage::from_pixel(w, h, Luma([255u8])),
            binary,
            scale: 1.0,
            source_width: w,
            source_height: h,
        }
    }

    /// A 20×20 body at (x, y) with one terminal on `side`.
    fn part(id: usize, x: u32, y: u32, side: Side) -> DetectedComponent {
        let region = BoundingRegion::new(x, y, 20, 20);
        let position = match side {
            Side::Left => Point::new(x as f64, y as f64 + 10.0),
            Side::Right => Point::new(x as f64 + 19.0, y as f64 + 10.0),
            Side::Top => Point::new(x as f64 + 10.0, y as f64),
            Side::Bottom => Point::new(x as f64 + 10.0, y as f64 + 19.0),
        };
        DetectedComponent::new(ComponentId(id), ComponentKind::Resistor, region, 0.9).with_terminals(vec![
            Terminal {
                id: TerminalId {
                    component: ComponentId(id),
                    pin: 1,
                },
                position,
                side,
            },
        ])
    }

    fn draw_bodies(binary: &mut GrayImage, parts: &[DetectedComponent]) {
        for p in parts {
            let r = p.region;
            draw_filled_rect_mut(binary, Rect::at(r.x as i32, r.y as i32).of_size(r.width, r.height), INK);
        }
    }

    fn hwire(binary: &mut GrayImage, x0: i32, x1: i32, y: i32) {
        draw_filled_rect_mut(binary, Rect::at(x0, y - 1).of_size((x1 - x0) as u32, 3), INK);
    }

    fn vwire(binary: &mut GrayImage, x: i32, y0: i32, y1: i32) {
        draw_filled_rect_mut(binary, Rect::at(x - 1, y0).of_size(3, (y1 - y0) as u32), INK);
    }

    fn assert_partition(outcome: &TraceOutcome, parts: &[DetectedComponent]) {
        let mut seen = HashSet::new();
        for net in &outcome.nets {
            for t in &net.terminals {
                assert!(seen.insert(*t), "terminal {} in two nets", t);
            }
        }
        let all: HashSet<TerminalId> = parts.iter().flat_map(|p| p.terminals.iter().map(|t| t.id)).collect();
        assert_eq!(seen, all);
    }

    fn net_with(outcome: &TraceOutcome, component: usize) -> &Net {
        outcome
            .nets
            .iter()
            .find(|n| n.terminals.iter().any(|t| t.component == ComponentId(component)))
            .unwrap()
    }

    /// Horizontal A–B at y = 100 and vertical C–D at x = 100.
    fn crossing_scene(dot: bool) -> (GrayImage, Vec<DetectedComponent>) {
        let parts = vec![
            part(0, 10, 90, Side::Right),
            part(1, 170, 90, Side::Left),
            part(2, 90, 10, Side::Bottom),
            part(3, 90, 170, Side::Top),
        ];
        let mut binary = GrayImage::new(200, 200);
        draw_bodies(&mut binary, &parts);
        hwire(&mut binary, 30, 170, 100);
        vwire(&mut binary, 100, 30, 170);
        if dot {
            draw_filled_circle_mut(&mut binary, (100, 100), 9, INK);
        }
        (binary, parts)
    }

    #[test]
    fn test_straight_wire_joins_two_terminals() {
        let parts = vec![part(0, 20, 40, Side::Right), part(1, 120, 40, Side::Left)];
        let mut binary = GrayImage::new(160, 100);
        draw_bodies(&mut binary, &parts);
        hwire(&mut binary, 40, 120, 50);

        let outcome = trace(&normalized(binary), &parts, &TracerConfig::default());
        assert_partition(&outcome, &parts);
        assert_eq!(outcome.nets.len(), 1);
        assert_eq!(outcome.nets[0].name, "N1");
        assert_eq!(outcome.nets[0].terminals.len(), 2);
        assert_eq!(outcome.stats.attached_ends, 2);
        assert_eq!(outcome.segments.len(), 1);
        // a straight run simplifies to its two ends
        assert_eq!(outcome.segments[0].path.len(), 2);
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_unwired_terminal_is_singleton_warning() {
        let parts = vec![part(0, 20, 20, Side::Left)];
        let mut binary = GrayImage::new(80, 80);
        draw_bodies(&mut binary, &parts);

        let outcome = trace(&normalized(binary), &parts, &TracerConfig::default());
        assert_partition(&outcome, &parts);
        assert_eq!(outcome.stats.singleton_nets, 1);
        assert!(matches!(
            outcome.warnings.as_slice(),
            [TraceWarning::SingletonNet { net, .. }] if net == "N1"
        ));

        let quiet = TracerConfig {
            report_singletons: false,
            ..TracerConfig::default()
        };
        let outcome = trace(&normalized(GrayImage::new(80, 80)), &parts, &quiet);
        assert!(outcome.warnings.is_empty());
        assert_eq!(outcome.stats.singleton_nets, 1);
    }

    #[test]
    fn test_tee_joins_three_terminals() {
        let parts = vec![
            part(0, 10, 40, Side::Right),
            part(1, 150, 40, Side::Left),
            part(2, 70, 120, Side::Top),
        ];
        let mut binary = GrayImage::new(190, 160);
        draw_bodies(&mut binary, &parts);
        hwire(&mut binary, 30, 150, 50);
        vwire(&mut binary, 80, 50, 120);

        let outcome = trace(&normalized(binary), &parts, &TracerConfig::default());
        assert_partition(&outcome, &parts);
        assert_eq!(outcome.nets.len(), 1);
        assert_eq!(outcome.nets[0].terminals.len(), 3);
        assert!(outcome.junctions.iter().any(|j| j.kind == JunctionKind::T));
    }

    #[test]
    fn test_crossing_without_dot_keeps_nets_apart() {
        let (binary, parts) = crossing_scene(false);
        let outcome = trace(&normalized(binary), &parts, &TracerConfig::default());
        assert_partition(&outcome, &parts);
        assert_eq!(outcome.nets.len(), 2);
        assert_eq!(outcome.stats.crossings, 1);
        assert_eq!(net_with(&outcome, 0).terminals, vec![
            TerminalId { component: ComponentId(0), pin: 1 },
            TerminalId { component: ComponentId(1), pin: 1 },
        ]);
        assert!(!outcome.junctions.iter().any(|j| j.kind == JunctionKind::Cross));
    }

    #[test]
    fn test_dot_makes_crossing_a_junction() {
        let (binary, parts) = crossing_scene(true);
        let outcome = trace(&normalized(binary), &parts, &TracerConfig::default());
        assert_partition(&outcome, &parts);
        assert_eq!(outcome.nets.len(), 1);
        assert_eq!(outcome.stats.crossings, 0);
        let cross = outcome.junctions.iter().find(|j| j.kind == JunctionKind::Cross).unwrap();
        assert!(cross.position.distance(&Point::new(100.0, 100.0)) < 4.0);
    }

    /// Two wires at y = 50 separated by `gap` paper pixels.
    fn broken_wire(gap: i32) -> (GrayImage, Vec<DetectedComponent>) {
        let parts = vec![part(0, 20, 40, Side::Right), part(1, 140, 40, Side::Left)];
        let mut binary = GrayImage::new(180, 100);
        draw_bodies(&mut binary, &parts);
        hwire(&mut binary, 40, 90, 50);
        hwire(&mut binary, 90 + gap, 140, 50);
        (binary, parts)
    }

    #[test]
    fn test_small_gap_is_bridged() {
        let (binary, parts) = broken_wire(2);
        let outcome = trace(&normalized(binary), &parts, &TracerConfig::default());
        assert_partition(&outcome, &parts);
        assert_eq!(outcome.nets.len(), 1);
        assert_eq!(outcome.stats.bridged_gaps, 1);
        assert_eq!(outcome.nets[0].segments.len(), 2);
        // collinear, so no corner
        assert!(outcome.junctions.is_empty());
    }

    #[test]
    fn test_gaps_up_to_max_gap_are_bridged() {
        for gap in 1..=5 {
            let (binary, parts) = broken_wire(gap);
            let outcome = trace(&normalized(binary), &parts, &TracerConfig::default());
            assert_eq!(outcome.nets.len(), 1, "gap of {} px", gap);
            assert_eq!(outcome.stats.bridged_gaps, 1, "gap of {} px", gap);
        }
        for gap in [8, 12] {
            let (binary, parts) = broken_wire(gap);
            let outcome = trace(&normalized(binary), &parts, &TracerConfig::default());
            assert_eq!(outcome.nets.len(), 2, "gap of {} px", gap);
            assert_eq!(outcome.stats.bridged_gaps, 0, "gap of {} px", gap);
        }
    }

    #[test]
    fn test_wire_stopping_short_of_another_makes_tee() {
        let parts = vec![
            part(0, 10, 40, Side::Right),
            part(1, 150, 40, Side::Left),
            part(2, 70, 120, Side::Top),
        ];
        let mut binary = GrayImage::new(190, 160);
        draw_bodies(&mut binary, &parts);
        hwire(&mut binary, 30, 150, 50);
        // four paper rows between the wires
        vwire(&mut binary, 80, 56, 120);

        let outcome = trace(&normalized(binary), &parts, &TracerConfig::default());
        assert_partition(&outcome, &parts);
        assert_eq!(outcome.nets.len(), 1);
        assert_eq!(outcome.stats.bridged_gaps, 1);
        let tee = outcome.junctions.iter().find(|j| j.kind == JunctionKind::T).unwrap();
        assert!(tee.position.distance(&Point::new(80.0, 50.0)) < 3.0);
    }

    #[test]
    fn test_wide_gap_is_not_bridged() {
        let parts = vec![part(0, 20, 40, Side::Right), part(1, 140, 40, Side::Left)];
        let mut binary = GrayImage::new(180, 100);
        draw_bodies(&mut binary, &parts);
        hwire(&mut binary, 40, 80, 50);
        hwire(&mut binary, 100, 140, 50);

        let outcome = trace(&normalized(binary), &parts, &TracerConfig::default());
        assert_partition(&outcome, &parts);
        assert_eq!(outcome.nets.len(), 2);
        assert_eq!(outcome.stats.bridged_gaps, 0);
    }

    #[test]
    fn test_speckle_is_noise_and_wire_floats() {
        let mut binary = GrayImage::new(120, 80);
        draw_filled_rect_mut(&mut binary, Rect::at(10, 10).of_size(5, 3), INK);
        hwire(&mut binary, 20, 100, 50);

        let outcome = trace(&normalized(binary), &[], &TracerConfig::default());
        assert_eq!(outcome.stats.dropped_noise, 1);
        assert_eq!(outcome.stats.floating_wires, 1);
        assert!(outcome.nets.is_empty());
    }

    #[test]
    fn test_bent_wire_simplifies_to_corner() {
        let parts = vec![part(0, 10, 40, Side::Right), part(1, 90, 120, Side::Top)];
        let mut binary = GrayImage::new(160, 160);
        draw_bodies(&mut binary, &parts);
        hwire(&mut binary, 30, 101, 50);
        vwire(&mut binary, 100, 49, 120);

        let outcome = trace(&normalized(binary), &parts, &TracerConfig::default());
        assert_partition(&outcome, &parts);
        assert_eq!(outcome.nets.len(), 1);
        let path = &outcome.segments[0].path;
        assert_eq!(path.len(), 3);
        assert!(path[1].distance(&Point::new(100.0, 50.0)) < 3.0);
    }

    #[test]
    fn test_thick_wire_is_bus() {
        let parts = vec![
            part(0, 20, 40, Side::Right),
            part(1, 140, 40, Side::Left),
            part(2, 20, 140, Side::Right),
            part(3, 260, 140, Side::Left),
        ];
        let mut binary = GrayImage::new(300, 200);
        draw_bodies(&mut binary, &parts);
        draw_filled_rect_mut(&mut binary, Rect::at(40, 46).of_size(100, 9), INK);
        hwire(&mut binary, 40, 260, 150);
        let config = TracerConfig {
            terminal_tolerance: 10.0,
            ..TracerConfig::default()
        };

        let outcome = trace(&normalized(binary.clone()), &parts, &config);
        assert_partition(&outcome, &parts);
        assert_eq!(outcome.nets.len(), 2);
        assert_eq!(outcome.stats.buses, 1);
        let bus = &outcome.buses[0];
        assert_eq!(bus.name, "B1");
        assert_eq!(bus.width, 9.0);
        assert_eq!(bus.components, vec![ComponentId(0), ComponentId(1)]);
        assert!((bus.start.y - 50.0).abs() < 2.0 && (bus.end.y - 50.0).abs() < 2.0);

        let off = TracerConfig {
            detect_buses: false,
            ..config
        };
        let outcome = trace(&normalized(binary), &parts, &off);
        assert!(outcome.buses.is_empty());
        assert_eq!(outcome.stats.buses, 0);
    }

    #[test]
    fn test_uniform_wires_have_no_bus() {
        let (binary, parts) = crossing_scene(false);
        let outcome = trace(&normalized(binary), &parts, &TracerConfig::default());
        assert!(outcome.buses.is_empty());
    }

    #[test]
    fn test_debug_sink_receives_skeleton_and_overlay() {
        let sink = Arc::new(crate::debug::MemorySink::new());
        let tracer = ConnectionTracer::new(TracerConfig::default()).with_debug_sink(sink.clone());
        let parts = vec![part(0, 20, 40, Side::Right), part(1, 120, 40, Side::Left)];
        let mut binary = GrayImage::new(160, 100);
        draw_bodies(&mut binary, &parts);
        hwire(&mut binary, 40, 120, 50);
        tracer.trace(&normalized(binary), &parts);
        assert_eq!(sink.names(), vec!["trace_skeleton", "trace_overlay"]);

        let artifacts = sink.take();
        match &artifacts[1].image {
            crate::debug::DebugImage::Rgb(overlay) => {
                assert_eq!(overlay.dimensions(), (160, 100));
                // the wire is drawn in its net's colour, not the paper's
                assert_ne!(overlay.get_pixel(80, 50), &image::Rgb([0, 0, 0]));
                assert_ne!(overlay.get_pixel(80, 50), &image::Rgb([255, 255, 255]));
            }
            other => panic!("expected an RGB overlay, got {:?}", other),
        }
    }
}
