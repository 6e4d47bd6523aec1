//! Component detection.
//!
//! Candidate bodies come from the binary image: enclosed holes are filled,
//! thin wires are opened away, and what remains is labelled. Each blob is
//! scored for solidity (detection confidence) and against the symbol
//! library (classification), then probed for terminals.

mod matching;
mod region;
mod terminals;

use image::{imageops, GrayImage};
use rayon::prelude::*;
use rayon::ThreadPool;
use serde::Serialize;
use std::fmt;
use std::io::Cursor;
use std::ops::Range;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::ai::{ClassificationRequest, SymbolClassifier};
use crate::config::{DetectionConfig, ParallelConfig};
use crate::core::SchemaScanError;
use crate::debug::{component_overlay, emit_or_warn, DebugArtifact, DebugSink};
use crate::library::SymbolLibrary;
use crate::model::{
    ComponentId, ComponentKind, DetectedComponent, DetectionSource, Point, Side, Terminal,
    TerminalId,
};
use crate::preprocess::NormalizedImage;

use matching::TemplateScore;
use region::Candidate;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DetectionStats {
    /// Blobs found in the body mask.
    pub candidates: usize,
    pub rejected_by_area: usize,
    /// Filled outlines with too little ink of their own, typically wire loops.
    pub rejected_sparse: usize,
    /// Candidates discarded for confidence below the detection threshold.
    pub below_threshold: usize,
    pub components: usize,
    pub classified: usize,
    pub unclassified: usize,
    pub terminals: usize,
    pub mean_confidence: f64,
    pub backend_requests: usize,
    pub backend_reclassified: usize,
    pub backend_fallbacks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DetectionWarning {
    /// No template matched well enough; the component stays unclassified.
    Unclassified { component: ComponentId, best_score: f64 },
    /// The backend failed or timed out and the local result was kept.
    BackendFallback { component: ComponentId, reason: String },
}

impl fmt::Display for DetectionWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectionWarning::Unclassified {
                component,
                best_score,
            } => write!(
                f,
                "component {} left unclassified (best template score {:.3})",
                component, best_score
            ),
            DetectionWarning::BackendFallback { component, reason } => {
                write!(f, "component {} kept local result: {}", component, reason)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionOutcome {
    pub components: Vec<DetectedComponent>,
    pub stats: DetectionStats,
    pub warnings: Vec<DetectionWarning>,
}

impl DetectionOutcome {
    fn recount(&mut self) {
        let stats = &mut self.stats;
        stats.components = self.components.len();
        stats.classified = self.components.iter().filter(|c| c.kind.is_classified()).count();
        stats.unclassified = stats.components - stats.classified;
        stats.terminals = self.components.iter().map(|c| c.terminals.len()).sum();
        stats.mean_confidence = if self.components.is_empty() {
            0.0
        } else {
            self.components.iter().map(|c| c.confidence).sum::<f64>() / self.components.len() as f64
        };
    }
}

/// Per-candidate result of the parallel scoring pass.
struct Scored {
    best: Option<TemplateScore>,
    best_score: f64,
    terminals: Vec<(Side, Point)>,
}

pub struct ComponentDetector {
    library: Arc<SymbolLibrary>,
    config: DetectionConfig,
    parallel: ParallelConfig,
    pool: Option<ThreadPool>,
    debug: Option<Arc<dyn DebugSink>>,
}

impl ComponentDetector {
    pub fn new(library: Arc<SymbolLibrary>, config: DetectionConfig, parallel: ParallelConfig) -> Self {
        let pool = if parallel.max_threads > 1 {
            match rayon::ThreadPoolBuilder::new()
                .num_threads(parallel.max_threads)
                .thread_name(|i| format!("schemascan-detect-{}", i))
                .build()
            {
                Ok(pool) => Some(pool),
                Err(e) => {
                    warn!("detector thread pool unavailable, scoring sequentially: {}", e);
                    None
                }
            }
        } else {
            None
        };
        Self {
            library,
            config,
            parallel,
            pool,
            debug: None,
        }
    }

    pub fn with_debug_sink(mut self, sink: Arc<dyn DebugSink>) -> Self {
        self.debug = Some(sink);
        self
    }

    pub fn library(&self) -> &SymbolLibrary {
        &self.library
    }

    pub fn config(&self) -> &DetectionConfig {
        &self.config
    }

    pub fn detect(&self, image: &NormalizedImage) -> DetectionOutcome {
        let config = &self.config;
        let body = region::body_mask(&image.binary, config.max_hole_area, config.body_radius);
        let found = region::extract_candidates(&body);

        let mut stats = DetectionStats {
            candidates: found.len(),
            ..DetectionStats::default()
        };
        let mut accepted = Vec::with_capacity(found.len());
        for candidate in found {
            if candidate.pixels < config.min_area || candidate.pixels > config.max_area {
                stats.rejected_by_area += 1;
                continue;
            }
            let ink = region::ink_fraction(&candidate, &image.binary);
            if ink < config.min_ink_fraction {
                debug!(
                    x = candidate.region.x,
                    y = candidate.region.y,
                    ink,
                    "candidate is mostly filled paper"
                );
                stats.rejected_sparse += 1;
                continue;
            }
            if candidate.solidity < config.detection_threshold {
                debug!(
                    x = candidate.region.x,
                    y = candidate.region.y,
                    solidity = candidate.solidity,
                    "candidate below detection threshold"
                );
                stats.below_threshold += 1;
                continue;
            }
            accepted.push(candidate);
        }
        accepted.sort_by_key(|c| (c.region.y, c.region.x));

        let scored = self.score_all(&accepted, &image.binary);

        let mut warnings = Vec::new();
        let components: Vec<DetectedComponent> = accepted
            .iter()
            .zip(scored)
            .enumerate()
            .map(|(index, (candidate, scored))| {
                let id = ComponentId(index);
                let terminals = scored
                    .terminals
                    .into_iter()
                    .enumerate()
                    .map(|(i, (side, position))| Terminal {
                        id: TerminalId {
                            component: id,
                            pin: i as u32 + 1,
                        },
                        position,
                        side,
                    })
                    .collect();

                let classified = scored
                    .best
                    .filter(|m| m.score >= config.classification_threshold)
                    .and_then(|m| self.library.templates().get(m.index).map(|t| (m, t)));
                match classified {
                    Some((m, template)) => {
                        let mut component =
                            DetectedComponent::new(id, template.kind, candidate.region, candidate.solidity)
                                .with_terminals(terminals)
                                .with_symbol(template.symbol_ref())
                                .with_kind_confidence(m.score);
                        component.template = Some(template.name.clone());
                        component
                    }
                    None => {
                        warnings.push(DetectionWarning::Unclassified {
                            component: id,
                            best_score: scored.best_score,
                        });
                        DetectedComponent::new(
                            id,
                            ComponentKind::Unclassified,
                            candidate.region,
                            candidate.solidity,
                        )
                        .with_terminals(terminals)
                    }
                }
            })
            .collect();

        let mut outcome = DetectionOutcome {
            components,
            stats,
            warnings,
        };
        outcome.recount();
        info!(
            candidates = outcome.stats.candidates,
            components = outcome.stats.components,
            classified = outcome.stats.classified,
            discarded = outcome.stats.below_threshold + outcome.stats.rejected_by_area + outcome.stats.rejected_sparse,
            "detection finished"
        );

        let sink = self.debug.as_deref();
        emit_or_warn(sink, || DebugArtifact::gray("detect_body", body.clone()));
        emit_or_warn(sink, || {
            DebugArtifact::rgb("detect_overlay", component_overlay(&image.binary, &outcome.components))
        });
        outcome
    }

    /// Batch boundaries so each batch carries about `chunk_size` pixels.
    fn batches(&self, candidates: &[Candidate]) -> Vec<Range<usize>> {
        let mut batches = Vec::new();
        let mut start = 0;
        let mut pixels = 0usize;
        for (i, candidate) in candidates.iter().enumerate() {
            pixels += candidate.pixels as usize;
            if pixels >= self.parallel.chunk_size {
                batches.push(start..i + 1);
                start = i + 1;
                pixels = 0;
            }
        }
        if start < candidates.len() {
            batches.push(start..candidates.len());
        }
        batches
    }

    fn score_one(&self, candidate: &Candidate, binary: &GrayImage) -> Scored {
        let scores = matching::score_library(
            &self.library,
            &candidate.mask,
            candidate.pixels,
            candidate.region.aspect_ratio(),
        );
        Scored {
            best: matching::best_match(&scores, self.config.matching_tolerance),
            best_score: matching::best_score(&scores),
            terminals: terminals::probe_terminals(binary, &candidate.region, self.config.terminal_probe),
        }
    }

    fn score_all(&self, candidates: &[Candidate], binary: &GrayImage) -> Vec<Scored> {
        let batches = self.batches(candidates);
        let work = |range: &Range<usize>| -> Vec<Scored> {
            candidates[range.clone()]
                .iter()
                .map(|c| self.score_one(c, binary))
                .collect()
        };
        let results: Vec<Vec<Scored>> = match &self.pool {
            Some(pool) if batches.len() > 1 => pool.install(|| batches.par_iter().map(work).collect()),
            _ => batches.iter().map(work).collect(),
        };
        results.into_iter().flatten().collect()
    }

    /// Ask `classifier` about every unclassified component.
    ///
    /// Accepted verdicts replace the component with a corrected copy. Any
    /// failure, timeout or low-confidence verdict leaves the local result in
    /// place, so running this twice against a dead backend changes nothing.
    pub async fn refine_with_backend(
        &self,
        mut outcome: DetectionOutcome,
        image: &NormalizedImage,
        classifier: &dyn SymbolClassifier,
        timeout: Duration,
    ) -> DetectionOutcome {
        let pending: Vec<usize> = outcome
            .components
            .iter()
            .enumerate()
            .filter(|(_, c)| !c.kind.is_classified())
            .map(|(i, _)| i)
            .collect();
        if pending.is_empty() {
            return outcome;
        }

        let available = tokio::time::timeout(timeout, classifier.is_available())
            .await
            .unwrap_or(false);
        if !available {
            warn!(backend = classifier.name(), "classification backend unavailable, keeping local results");
            for &i in &pending {
                outcome.warnings.push(DetectionWarning::BackendFallback {
                    component: outcome.components[i].id,
                    reason: "backend unavailable".to_string(),
                });
            }
            outcome.stats.backend_fallbacks += pending.len();
            return outcome;
        }

        for i in pending {
            let component = &outcome.components[i];
            let id = component.id;
            let request = match self.crop_request(component, image) {
                Ok(request) => request,
                Err(e) => {
                    outcome.stats.backend_fallbacks += 1;
                    outcome.warnings.push(DetectionWarning::BackendFallback {
                        component: id,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            outcome.stats.backend_requests += 1;

            let reason = match tokio::time::timeout(timeout, classifier.classify(&request)).await {
                Ok(Ok(verdict))
                    if verdict.kind.is_classified()
                        && verdict.confidence >= self.config.classification_threshold =>
                {
                    let symbol = self.library.for_kind(verdict.kind).map(|t| t.symbol_ref());
                    let mut corrected = component.reclassified(
                        verdict.kind,
                        verdict.confidence,
                        symbol,
                        DetectionSource::Backend {
                            provider: classifier.name().to_string(),
                        },
                    );
                    if verdict.label.is_some() {
                        corrected.label = verdict.label;
                    }
                    if verdict.value.is_some() {
                        corrected.value = verdict.value;
                    }
                    debug!(component = %id, kind = %corrected.kind, "backend reclassified component");
                    outcome.components[i] = corrected;
                    outcome.stats.backend_reclassified += 1;
                    outcome
                        .warnings
                        .retain(|w| !matches!(w, DetectionWarning::Unclassified { component, .. } if *component == id));
                    continue;
                }
                Ok(Ok(verdict)) => {
                    debug!(component = %id, confidence = verdict.confidence, "backend verdict below threshold");
                    continue;
                }
                Ok(Err(e)) => e.to_string(),
                Err(_) => SchemaScanError::ExternalBackendTimeout {
                    provider: classifier.name().to_string(),
                    seconds: timeout.as_secs_f64(),
                }
                .to_string(),
            };
            warn!(component = %id, "{}", reason);
            outcome.stats.backend_fallbacks += 1;
            outcome
                .warnings
                .push(DetectionWarning::BackendFallback { component: id, reason });
        }

        outcome.recount();
        outcome
    }

    fn crop_request(
        &self,
        component: &DetectedComponent,
        image: &NormalizedImage,
    ) -> Result<ClassificationRequest, SchemaScanError> {
        let area = component
            .region
            .expanded(self.config.terminal_probe, image.width(), image.height());
        let crop = imageops::crop_imm(&image.binary, area.x, area.y, area.width, area.height).to_image();
        let mut png = Vec::new();
        crop.write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)?;
        Ok(ClassificationRequest {
            component: component.id,
            png,
            width: area.width,
            height: area.height,
            rotation: component.region.rotation,
        })
    }
}

/// Detect with default thresholds and a single thread.
pub fn detect(image: &NormalizedImage, library: Arc<SymbolLibrary>) -> DetectionOutcome {
    let parallel = ParallelConfig {
        max_threads: 1,
        ..ParallelConfig::default()
    };
    ComponentDetector::new(library, DetectionConfig::default(), parallel).detect(image)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::{ClassifierError, ClassifierVerdict};
    use async_trait::async_trait;
    use image::Luma;
    use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut};
    use imageproc::rect::Rect;
    use std::sync::atomic::{AtomicUsize, Ordering};

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

    fn detector(max_threads: usize) -> ComponentDetector {
        ComponentDetector::new(
            Arc::new(SymbolLibrary::builtin()),
            DetectionConfig::default(),
            ParallelConfig {
                max_threads,
                chunk_size: 1000,
            },
        )
    }

    fn scene() -> GrayImage {
        let mut binary = GrayImage::new(400, 300);
        let ink = Luma([255u8]);
        // resistor body with leads
        draw_filled_rect_mut(&mut binary, Rect::at(40, 40).of_size(60, 20), ink);
        draw_filled_rect_mut(&mut binary, Rect::at(10, 49).of_size(30, 3), ink);
        draw_filled_rect_mut(&mut binary, Rect::at(100, 49).of_size(30, 3), ink);
        // square IC body
        draw_filled_rect_mut(&mut binary, Rect::at(200, 150).of_size(50, 50), ink);
        // transistor disc
        draw_filled_circle_mut(&mut binary, (320, 80), 22, ink);
        // an L-shaped blob, not solid enough to be a body
        draw_filled_rect_mut(&mut binary, Rect::at(40, 200).of_size(60, 12), ink);
        draw_filled_rect_mut(&mut binary, Rect::at(40, 200).of_size(12, 60), ink);
        // speckle below min_area
        draw_filled_rect_mut(&mut binary, Rect::at(350, 250).of_size(6, 6), ink);
        binary
    }

    #[test]
    fn test_detects_and_classifies_scene() {
        let outcome = detector(1).detect(&normalized(scene()));
        let kinds: Vec<ComponentKind> = outcome.components.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ComponentKind::Resistor, ComponentKind::Transistor, ComponentKind::Ic]
        );
        assert_eq!(outcome.stats.below_threshold, 1);
        assert_eq!(outcome.stats.rejected_by_area, 1);
        assert_eq!(outcome.stats.classified, 3);

        let resistor = &outcome.components[0];
        assert_eq!(resistor.terminals.len(), 2);
        assert_eq!(resistor.terminals[0].side, crate::model::Side::Left);
        assert_eq!(resistor.symbol.as_ref().unwrap().lib_id, "Device:R");
        assert_eq!(resistor.template.as_deref(), Some("resistor"));
    }

    #[test]
    fn test_parallel_resistors_stay_separate() {
        let ink = Luma([255u8]);
        let mut binary = GrayImage::new(400, 300);
        // rails
        draw_filled_rect_mut(&mut binary, Rect::at(99, 50).of_size(3, 200), ink);
        draw_filled_rect_mut(&mut binary, Rect::at(299, 50).of_size(3, 200), ink);
        for y in [90, 190] {
            draw_filled_rect_mut(&mut binary, Rect::at(170, y).of_size(60, 20), ink);
            draw_filled_rect_mut(&mut binary, Rect::at(101, y + 9).of_size(69, 3), ink);
            draw_filled_rect_mut(&mut binary, Rect::at(230, y + 9).of_size(69, 3), ink);
        }

        let outcome = detector(1).detect(&normalized(binary));
        let kinds: Vec<ComponentKind> = outcome.components.iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ComponentKind::Resistor, ComponentKind::Resistor]);
        assert_eq!(outcome.components[0].region.y, 90);
        assert_eq!(outcome.components[1].region.y, 190);
        for c in &outcome.components {
            assert_eq!(c.terminals.len(), 2);
        }
    }

    #[test]
    fn test_small_hairline_loop_is_sparse() {
        let mut binary = GrayImage::new(200, 200);
        imageproc::drawing::draw_hollow_rect_mut(&mut binary, Rect::at(60, 60).of_size(50, 50), Luma([255u8]));

        let outcome = detector(1).detect(&normalized(binary));
        assert!(outcome.components.is_empty());
        assert_eq!(outcome.stats.rejected_sparse, 1);
    }

    #[test]
    fn test_confidence_in_unit_interval_and_above_threshold() {
        let outcome = detector(1).detect(&normalized(scene()));
        for c in &outcome.components {
            assert!((0.0..=1.0).contains(&c.confidence));
            assert!(c.confidence >= DetectionConfig::default().detection_threshold);
            assert!((0.0..=1.0).contains(&c.kind_confidence));
        }
    }

    #[test]
    fn test_thread_count_does_not_change_output() {
        let image = normalized(scene());
        let sequential = detector(1).detect(&image);
        let parallel = ComponentDetector::new(
            Arc::new(SymbolLibrary::builtin()),
            DetectionConfig::default(),
            ParallelConfig {
                max_threads: 4,
                chunk_size: 1,
            },
        )
        .detect(&image);
        assert_eq!(sequential, parallel);
    }

    #[test]
    fn test_unknown_shape_is_unclassified() {
        let mut binary = GrayImage::new(200, 200);
        // solid, but longer and thinner than any template accepts
        draw_filled_rect_mut(&mut binary, Rect::at(20, 90).of_size(150, 12), Luma([255u8]));
        let outcome = detector(1).detect(&normalized(binary));
        assert_eq!(outcome.components.len(), 1);
        assert_eq!(outcome.components[0].kind, ComponentKind::Unclassified);
        assert!(outcome.components[0].symbol.is_none());
        assert!(matches!(
            outcome.warnings[0],
            DetectionWarning::Unclassified { .. }
        ));
    }

    #[test]
    fn test_debug_sink_gets_overlay() {
        let sink = Arc::new(crate::debug::MemorySink::new());
        detector(1)
            .with_debug_sink(sink.clone())
            .detect(&normalized(scene()));
        assert_eq!(sink.names(), vec!["detect_body", "detect_overlay"]);
    }

    struct FixedClassifier {
        verdict: Option<ClassifierVerdict>,
        delay: Duration,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl SymbolClassifier for FixedClassifier {
        fn name(&self) -> &str {
            "fixed"
        }

        async fn is_available(&self) -> bool {
            true
        }

        async fn classify(
            &self,
            _request: &ClassificationRequest,
        ) -> Result<ClassifierVerdict, ClassifierError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.verdict
                .clone()
                .ok_or_else(|| ClassifierError::ParseError("no verdict".into()))
        }
    }

    fn unclassified_outcome() -> (DetectionOutcome, NormalizedImage) {
        let mut binary = GrayImage::new(120, 120);
        draw_filled_rect_mut(&mut binary, Rect::at(10, 50).of_size(100, 8), Luma([255u8]));
        let image = normalized(binary);
        let outcome = detector(1).detect(&image);
        assert_eq!(outcome.components[0].kind, ComponentKind::Unclassified);
        (outcome, image)
    }

    #[tokio::test]
    async fn test_backend_reclassifies_copy() {
        let (outcome, image) = unclassified_outcome();
        let classifier = FixedClassifier {
            verdict: Some(ClassifierVerdict {
                kind: ComponentKind::Capacitor,
                confidence: 0.97,
                label: Some("C7".into()),
                value: Some("100n".into()),
            }),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        };
        let refined = detector(1)
            .refine_with_backend(outcome.clone(), &image, &classifier, Duration::from_secs(5))
            .await;
        let c = &refined.components[0];
        assert_eq!(c.kind, ComponentKind::Capacitor);
        assert_eq!(c.label.as_deref(), Some("C7"));
        assert_eq!(c.symbol.as_ref().unwrap().lib_id, "Device:C");
        assert!(matches!(c.source, DetectionSource::Backend { .. }));
        assert_eq!(refined.stats.backend_reclassified, 1);
        assert_eq!(refined.stats.classified, 1);
        assert!(refined.warnings.is_empty());
        // the original outcome is untouched
        assert_eq!(outcome.components[0].kind, ComponentKind::Unclassified);
    }

    #[tokio::test]
    async fn test_backend_timeout_falls_back() {
        let (outcome, image) = unclassified_outcome();
        let classifier = FixedClassifier {
            verdict: Some(ClassifierVerdict {
                kind: ComponentKind::Capacitor,
                confidence: 0.99,
                label: None,
                value: None,
            }),
            delay: Duration::from_millis(500),
            calls: AtomicUsize::new(0),
        };
        let det = detector(1);
        let first = det
            .refine_with_backend(outcome.clone(), &image, &classifier, Duration::from_millis(20))
            .await;
        let second = det
            .refine_with_backend(outcome.clone(), &image, &classifier, Duration::from_millis(20))
            .await;
        assert_eq!(first.components, outcome.components);
        assert_eq!(first, second);
        assert_eq!(first.stats.backend_fallbacks, 1);
        assert!(first
            .warnings
            .iter()
            .any(|w| matches!(w, DetectionWarning::BackendFallback { .. })));
        assert_eq!(classifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_low_confidence_verdict_is_ignored() {
        let (outcome, image) = unclassified_outcome();
        let classifier = FixedClassifier {
            verdict: Some(ClassifierVerdict {
                kind: ComponentKind::Inductor,
                confidence: 0.4,
                label: None,
                value: None,
            }),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
        };
        let refined = detector(1)
            .refine_with_backend(outcome.clone(), &image, &classifier, Duration::from_secs(1))
            .await;
        assert_eq!(refined.components, outcome.components);
        assert_eq!(refined.stats.backend_fallbacks, 0);
    }
}
