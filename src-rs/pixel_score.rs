use crate::consolidate::consolidate;
use crate::regions::{extract_from_image, Region, RegionParams, RegionSet};
use image::RgbaImage;
use serde::Serialize;

pub const MAX_SCORE: f64 = 100.0;
/// How many of the largest target regions are scored.
pub const TOP_REGIONS: usize = 5;
pub const MAX_INSTRUCTIONS: usize = 4;
pub const MISSING_PENALTY: f64 = 25.0;
/// Deltas at or below this many pixels produce no instruction.
pub const FIX_THRESHOLD: u32 = 10;

// (delta above, deduction), checked largest first
const POSITION_TIERS: [(u32, f64); 3] = [(100, 15.0), (50, 10.0), (20, 5.0)];
const SIZE_TIERS: [(u32, f64); 3] = [(100, 10.0), (50, 6.0), (20, 3.0)];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchVerdict {
    Matched {
        candidate: usize,
    },
    Mismatched {
        candidate: usize,
        position_delta: u32,
        size_delta: u32,
    },
    Missing,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionMatch {
    pub target: usize,
    pub verdict: MatchVerdict,
    pub deduction: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PixelVerdict {
    pub score: f64,
    pub instructions: Vec<String>,
    pub matches: Vec<RegionMatch>,
}

/// Extracts and consolidates one image's regions.
pub fn analyze(image: &RgbaImage, params: &RegionParams) -> RegionSet {
    let raw = extract_from_image(image, params);
    consolidate(&raw, image.width(), image.height())
}

pub fn compare_images(
    target: &RgbaImage,
    candidate: &RgbaImage,
    params: &RegionParams,
) -> PixelVerdict {
    let target_set = analyze(target, params);
    let candidate_set = analyze(candidate, params);
    score_regions(&target_set, &candidate_set)
}

pub fn score_regions(target: &RegionSet, candidate: &RegionSet) -> PixelVerdict {
    let mut score = MAX_SCORE;
    let mut instructions = Vec::new();
    let mut matches = Vec::new();

    for (idx, wanted) in target.top(TOP_REGIONS).iter().enumerate() {
        let Some((cand_idx, found)) = best_candidate(wanted, candidate) else {
            score -= MISSING_PENALTY;
            instructions.push(add_instruction(wanted));
            matches.push(RegionMatch {
                target: idx,
                verdict: MatchVerdict::Missing,
                deduction: MISSING_PENALTY,
            });
            continue;
        };

        let position_delta = position_delta(wanted, found);
        let size_delta = size_delta(wanted, found);
        let deduction = tier_deduction(&POSITION_TIERS, position_delta)
            + tier_deduction(&SIZE_TIERS, size_delta);
        score -= deduction;

        let verdict = if position_delta > FIX_THRESHOLD || size_delta > FIX_THRESHOLD {
            instructions.push(fix_instruction(wanted, found, position_delta, size_delta));
            MatchVerdict::Mismatched {
                candidate: cand_idx,
                position_delta,
                size_delta,
            }
        } else {
            MatchVerdict::Matched {
                candidate: cand_idx,
            }
        };
        matches.push(RegionMatch {
            target: idx,
            verdict,
            deduction,
        });
    }

    instructions.truncate(MAX_INSTRUCTIONS);

    PixelVerdict {
        score: score.max(0.0),
        instructions,
        matches,
    }
}

fn best_candidate<'a>(wanted: &Region, candidate: &'a RegionSet) -> Option<(usize, &'a Region)> {
    candidate
        .regions
        .iter()
        .enumerate()
        .filter(|(_, r)| r.class == wanted.class)
        .min_by_key(|(idx, r)| (position_delta(wanted, r) + size_delta(wanted, r), *idx))
}

fn position_delta(a: &Region, b: &Region) -> u32 {
    a.x.abs_diff(b.x) + a.y.abs_diff(b.y)
}

fn size_delta(a: &Region, b: &Region) -> u32 {
    a.w.abs_diff(b.w) + a.h.abs_diff(b.h)
}

fn tier_deduction(tiers: &[(u32, f64)], delta: u32) -> f64 {
    tiers
        .iter()
        .find(|(above, _)| delta > *above)
        .map(|(_, deduction)| *deduction)
        .unwrap_or(0.0)
}

fn shape_word(region: &Region) -> &'static str {
    if region.is_elongated() {
        "line"
    } else {
        "rectangle"
    }
}

fn add_instruction(wanted: &Region) -> String {
    format!(
        "add {} {} at ({}, {}) size {}x{}",
        wanted.class,
        shape_word(wanted),
        wanted.x,
        wanted.y,
        wanted.w,
        wanted.h
    )
}

fn fix_instruction(
    wanted: &Region,
    found: &Region,
    position_delta: u32,
    size_delta: u32,
) -> String {
    let color = &wanted.class;
    let shape = shape_word(wanted);
    match (position_delta > FIX_THRESHOLD, size_delta > FIX_THRESHOLD) {
        (true, false) => format!(
            "move {color} {shape} from ({}, {}) to ({}, {})",
            found.x, found.y, wanted.x, wanted.y
        ),
        (false, true) => format!(
            "resize {color} {shape} at ({}, {}) from {}x{} to {}x{}",
            wanted.x, wanted.y, found.w, found.h, wanted.w, wanted.h
        ),
        _ => format!(
            "fix {color} {shape}: move to ({}, {}) size {}x{} (currently ({}, {}) size {}x{})",
            wanted.x, wanted.y, wanted.w, wanted.h, found.x, found.y, found.w, found.h
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fill_rect, red_square_target, solid_image};

    fn params() -> RegionParams {
        RegionParams::default()
    }

    #[test]
    fn identical_images_score_max_without_instructions() {
        let target = red_square_target();
        let verdict = compare_images(&target, &target.clone(), &params());
        assert_eq!(verdict.score, MAX_SCORE);
        assert!(verdict.instructions.is_empty());
    }

    #[test]
    fn missing_region_costs_fixed_penalty_and_one_add_line() {
        let target = red_square_target();
        let blank = solid_image(400, 400, [255, 255, 255, 255]);
        let verdict = compare_images(&target, &blank, &params());

        assert_eq!(verdict.score, MAX_SCORE - MISSING_PENALTY);
        assert_eq!(
            verdict.instructions,
            vec!["add red rectangle at (150, 150) size 100x100".to_string()]
        );
    }

    #[test]
    fn score_never_increases_as_region_drifts_away() {
        let target = red_square_target();
        let target_set = analyze(&target, &params());

        let mut last = f64::INFINITY;
        for offset in [0u32, 10, 30, 60, 120, 200] {
            let mut cand = solid_image(400, 400, [255, 255, 255, 255]);
            let (x, y) = (150 - offset.min(150), 150 + offset.min(150) / 2);
            fill_rect(&mut cand, x, y, 100, 100, [255, 0, 0, 255]);
            let verdict = score_regions(&target_set, &analyze(&cand, &params()));
            assert!(verdict.score <= last, "offset {offset}: {} > {last}", verdict.score);
            last = verdict.score;
        }
        assert!(last < MAX_SCORE);
    }

    #[test]
    fn misplaced_region_gets_move_instruction() {
        let target = red_square_target();
        let mut cand = solid_image(400, 400, [255, 255, 255, 255]);
        fill_rect(&mut cand, 40, 150, 100, 100, [255, 0, 0, 255]);
        let verdict = compare_images(&target, &cand, &params());
        assert_eq!(verdict.score, MAX_SCORE - 15.0);
        assert_eq!(
            verdict.instructions,
            vec!["move red rectangle from (40, 150) to (150, 150)".to_string()]
        );
    }

    #[test]
    fn instructions_are_capped() {
        let mut target = solid_image(400, 400, [255, 255, 255, 255]);
        fill_rect(&mut target, 10, 10, 80, 80, [255, 0, 0, 255]);
        fill_rect(&mut target, 200, 10, 80, 80, [0, 0, 255, 255]);
        fill_rect(&mut target, 10, 200, 80, 80, [250, 220, 0, 255]);
        fill_rect(&mut target, 200, 200, 80, 80, [0, 0, 0, 255]);
        fill_rect(&mut target, 0, 380, 400, 6, [120, 120, 120, 255]);
        let blank = solid_image(400, 400, [255, 255, 255, 255]);

        let verdict = compare_images(&target, &blank, &params());
        assert_eq!(verdict.instructions.len(), MAX_INSTRUCTIONS);
        assert_eq!(verdict.score, 0.0);
    }

    #[test]
    fn empty_target_scores_max() {
        let empty = RegionSet {
            width: 10,
            height: 10,
            regions: Vec::new(),
        };
        assert_eq!(score_regions(&empty, &empty).score, MAX_SCORE);
    }
}
