//! Skeleton graph: node clusters joined by pixel runs.

use petgraph::unionfind::UnionFind;

use super::skeleton::Skeleton;
use crate::model::Point;

/// What a run of skeleton pixels ends in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum End {
    /// A line end.
    Free,
    /// A junction cluster.
    Cluster(usize),
    /// The run is a closed loop and has no ends.
    Closed,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct RawSegment {
    pub pixels: Vec<(u32, u32)>,
    pub start: End,
    pub end: End,
    pub length: f64,
}

impl RawSegment {
    fn new(pixels: Vec<(u32, u32)>, start: End, end: End) -> Self {
        let length = pixels
            .windows(2)
            .map(|w| {
                let dx = w[0].0 as f64 - w[1].0 as f64;
                let dy = w[0].1 as f64 - w[1].1 as f64;
                (dx * dx + dy * dy).sqrt()
            })
            .sum();
        Self {
            pixels,
            start,
            end,
            length,
        }
    }

    pub fn end_kind(&self, at_start: bool) -> End {
        if at_start {
            self.start
        } else {
            self.end
        }
    }

    pub fn end_point(&self, at_start: bool) -> Point {
        let (x, y) = if at_start {
            self.pixels[0]
        } else {
            self.pixels[self.pixels.len() - 1]
        };
        Point::new(x as f64, y as f64)
    }

    /// Unit vector from an end back along the wire, looking up to `reach`
    /// pixels in.
    pub fn direction_from(&self, at_start: bool, reach: usize) -> (f64, f64) {
        let n = self.pixels.len();
        let k = reach.min(n.saturating_sub(1));
        let (from, to) = if at_start {
            (self.pixels[0], self.pixels[k])
        } else {
            (self.pixels[n - 1], self.pixels[n - 1 - k])
        };
        let dx = to.0 as f64 - from.0 as f64;
        let dy = to.1 as f64 - from.1 as f64;
        let norm = (dx * dx + dy * dy).sqrt();
        if norm == 0.0 {
            (0.0, 0.0)
        } else {
            (dx / norm, dy / norm)
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Cluster {
    pub pixels: Vec<(u32, u32)>,
    pub center: Point,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct SkeletonGraph {
    pub segments: Vec<RawSegment>,
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    /// Degree 2: part of a run.
    Path,
    Endpoint,
    Junction(usize),
}

/// Split `skeleton` into runs between nodes. Junction pixels within
/// `radius` of each other form one cluster; short runs that start and end
/// in the same cluster are artefacts of thinning and are dropped.
pub(crate) fn build(skeleton: &Skeleton, radius: f64) -> SkeletonGraph {
    let width = skeleton.width() as usize;
    let index = |x: u32, y: u32| y as usize * width + x as usize;

    let pixels: Vec<(u32, u32)> = skeleton.pixels().collect();
    let junction_pixels: Vec<(u32, u32)> = pixels
        .iter()
        .copied()
        .filter(|&(x, y)| skeleton.degree(x, y) >= 3)
        .collect();

    // cluster junction pixels
    let mut sets = UnionFind::<usize>::new(junction_pixels.len());
    for i in 0..junction_pixels.len() {
        for j in i + 1..junction_pixels.len() {
            let (a, b) = (junction_pixels[i], junction_pixels[j]);
            let dx = a.0 as f64 - b.0 as f64;
            let dy = a.1 as f64 - b.1 as f64;
            if (dx * dx + dy * dy).sqrt() <= radius {
                sets.union(i, j);
            }
        }
    }
    let mut cluster_of_root = std::collections::HashMap::new();
    let mut clusters: Vec<Cluster> = Vec::new();
    let mut nodes = vec![Node::Path; width * skeleton.height() as usize];
    for (i, &(x, y)) in junction_pixels.iter().enumerate() {
        let root = sets.find(i);
        let id = *cluster_of_root.entry(root).or_insert_with(|| {
            clusters.push(Cluster {
                pixels: Vec::new(),
                center: Point::default(),
            });
            clusters.len() - 1
        });
        clusters[id].pixels.push((x, y));
        nodes[index(x, y)] = Node::Junction(id);
    }
    for cluster in &mut clusters {
        let n = cluster.pixels.len() as f64;
        let (sx, sy) = cluster
            .pixels
            .iter()
            .fold((0.0, 0.0), |(sx, sy), &(x, y)| (sx + x as f64, sy + y as f64));
        cluster.center = Point::new(sx / n, sy / n);
    }
    for &(x, y) in &pixels {
        if skeleton.degree(x, y) <= 1 {
            nodes[index(x, y)] = Node::Endpoint;
        }
    }

    let end_of = |node: Node| match node {
        Node::Junction(c) => End::Cluster(c),
        _ => End::Free,
    };

    let mut visited = vec![false; nodes.len()];
    let mut segments = Vec::new();
    for &(x, y) in &pixels {
        let start = nodes[index(x, y)];
        if start == Node::Path || skeleton.degree(x, y) == 0 {
            continue;
        }
        for (nx, ny) in skeleton.neighbours(x, y) {
            let next = nodes[index(nx, ny)];
            if next != Node::Path {
                let same_cluster = matches!((start, next), (Node::Junction(a), Node::Junction(b)) if a == b);
                if !same_cluster && index(x, y) < index(nx, ny) {
                    segments.push(RawSegment::new(vec![(x, y), (nx, ny)], end_of(start), end_of(next)));
                }
                continue;
            }
            if visited[index(nx, ny)] {
                continue;
            }

            let mut run = vec![(x, y), (nx, ny)];
            visited[index(nx, ny)] = true;
            let (mut prev, mut cur) = ((x, y), (nx, ny));
            let finish = loop {
                let step = skeleton.neighbours(cur.0, cur.1).into_iter().find(|&p| p != prev);
                let Some(step) = step else {
                    break End::Free;
                };
                run.push(step);
                let kind = nodes[index(step.0, step.1)];
                if kind != Node::Path {
                    break end_of(kind);
                }
                if visited[index(step.0, step.1)] {
                    break End::Free;
                }
                visited[index(step.0, step.1)] = true;
                prev = cur;
                cur = step;
            };
            segments.push(RawSegment::new(run, end_of(start), finish));
        }
    }

    // whatever is left unvisited are closed loops without nodes
    for &(x, y) in &pixels {
        if nodes[index(x, y)] != Node::Path || visited[index(x, y)] {
            continue;
        }
        let mut run = vec![(x, y)];
        visited[index(x, y)] = true;
        let (mut prev, mut cur) = ((x, y), (x, y));
        loop {
            let step = skeleton
                .neighbours(cur.0, cur.1)
                .into_iter()
                .find(|&p| p != prev && !visited[index(p.0, p.1)]);
            match step {
                Some(step) => {
                    visited[index(step.0, step.1)] = true;
                    run.push(step);
                    prev = cur;
                    cur = step;
                }
                None => break,
            }
        }
        run.push((x, y));
        segments.push(RawSegment::new(run, End::Closed, End::Closed));
    }

    let limit = 2.0 * radius + 2.0;
    segments.retain(|s| !matches!((s.start, s.end), (End::Cluster(a), End::Cluster(b)) if a == b && s.length <= limit));

    SkeletonGraph { segments, clusters }
}
