//! Scoring candidate silhouettes against the symbol library.

use image::imageops::{self, FilterType};
use image::GrayImage;
use imageproc::template_matching::{match_template, MatchTemplateMethod};
use std::cmp::Ordering;

use crate::library::{SymbolLibrary, SymbolTemplate};

/// Score of one library template against one candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) struct TemplateScore {
    /// Index into the library.
    pub index: usize,
    pub score: f64,
    /// Candidate pixels explained by the template; 0 for range-only entries.
    pub matched_area: f64,
}

/// Normalized cross-correlation between a landscape mask and a template,
/// best over the four axis-aligned mirrorings.
pub(crate) fn bitmap_score(mask: &GrayImage, template: &GrayImage) -> f64 {
    if mask.width() == 0 || mask.height() == 0 || template.width() == 0 || template.height() == 0 {
        return 0.0;
    }
    let landscape = if mask.height() > mask.width() {
        imageops::rotate90(mask)
    } else {
        mask.clone()
    };
    let resized = imageops::resize(&landscape, template.width(), template.height(), FilterType::Triangle);
    if resized.pixels().all(|p| p[0] == 0) {
        return 0.0;
    }

    let variants = [
        imageops::flip_horizontal(&resized),
        imageops::flip_vertical(&resized),
        imageops::rotate180(&resized),
        resized,
    ];
    variants
        .iter()
        .map(|variant| {
            let result = match_template(variant, template, MatchTemplateMethod::CrossCorrelationNormalized);
            result.get_pixel(0, 0)[0] as f64
        })
        .filter(|score| score.is_finite())
        .fold(0.0, f64::max)
        .clamp(0.0, 1.0)
}

fn score_template(template: &SymbolTemplate, mask: &GrayImage) -> f64 {
    match &template.bitmap {
        Some(bitmap) => bitmap_score(mask, bitmap),
        None => template.range_score,
    }
}

/// Score every template whose ranges accept the candidate.
pub(crate) fn score_library(
    library: &SymbolLibrary,
    mask: &GrayImage,
    pixels: u32,
    aspect_ratio: f64,
) -> Vec<TemplateScore> {
    let area = pixels as f64;
    library
        .templates()
        .iter()
        .enumerate()
        .filter(|(_, t)| t.accepts(aspect_ratio, area))
        .map(|(index, t)| {
            let score = score_template(t, mask);
            let matched_area = if t.bitmap.is_some() { score * area } else { 0.0 };
            TemplateScore {
                index,
                score,
                matched_area,
            }
        })
        .collect()
}

/// Higher score first, then larger matched area, then earlier entry.
fn rank(a: &TemplateScore, b: &TemplateScore) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then(b.matched_area.partial_cmp(&a.matched_area).unwrap_or(Ordering::Equal))
        .then(a.index.cmp(&b.index))
}

/// Best score at or above `tolerance`, if any.
pub(crate) fn best_match(scores: &[TemplateScore], tolerance: f64) -> Option<TemplateScore> {
    scores
        .iter()
        .filter(|s| s.score >= tolerance)
        .min_by(|a, b| rank(a, b))
        .copied()
}

/// Highest score regardless of tolerance, for diagnostics.
pub(crate) fn best_score(scores: &[TemplateScore]) -> f64 {
    scores.iter().map(|s| s.score).fold(0.0, f64::max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;
    use imageproc::drawing::draw_filled_circle_mut;

    fn filled(width: u32, height: u32) -> GrayImage {
        GrayImage::from_pixel(width, height, Luma([255u8]))
    }

    #[test]
    fn test_square_matches_ic_box() {
        let library = SymbolLibrary::builtin();
        let scores = score_library(&library, &filled(40, 40), 1600, 1.0);
        let best = best_match(&scores, 0.92).unwrap();
        assert_eq!(library.templates()[best.index].name, "ic");
        assert!(best.score > 0.99);
    }

    #[test]
    fn test_portrait_box_matches_resistor() {
        let library = SymbolLibrary::builtin();
        let scores = score_library(&library, &filled(12, 40), 480, 40.0 / 12.0);
        let best = best_match(&scores, 0.92).unwrap();
        assert_eq!(library.templates()[best.index].name, "resistor");
    }

    #[test]
    fn test_disc_prefers_transistor() {
        let mut disc = GrayImage::new(41, 41);
        draw_filled_circle_mut(&mut disc, (20, 20), 20, Luma([255u8]));
        let library = SymbolLibrary::builtin();
        let transistor = library.template("transistor").unwrap();
        let ic = library.template("ic").unwrap();
        let on_circle = bitmap_score(&disc, transistor.bitmap.as_ref().unwrap());
        let on_box = bitmap_score(&disc, ic.bitmap.as_ref().unwrap());
        assert!(on_circle > 0.95, "{}", on_circle);
        assert!(on_box < 0.92, "{}", on_box);
    }

    #[test]
    fn test_tie_prefers_larger_area_then_order() {
        let scores = [
            TemplateScore { index: 0, score: 0.95, matched_area: 0.0 },
            TemplateScore { index: 3, score: 0.95, matched_area: 500.0 },
            TemplateScore { index: 1, score: 0.95, matched_area: 500.0 },
            TemplateScore { index: 2, score: 0.80, matched_area: 900.0 },
        ];
        assert_eq!(best_match(&scores, 0.92).unwrap().index, 1);
        assert!(best_match(&scores, 0.96).is_none());
        assert_eq!(best_score(&scores), 0.95);
    }

    #[test]
    fn test_empty_mask_scores_zero() {
        assert_eq!(bitmap_score(&GrayImage::new(10, 10), &filled(8, 8)), 0.0);
    }
}
