use crate::color::ColorClass;
use crate::regions::{Orientation, Region, RegionSet, ELONGATED_ASPECT};
use std::cmp::Ordering;

/// Same-color boxes closer than this many pixels count as touching.
pub const MERGE_MARGIN: u32 = 4;
/// Max offset on the shared axis for two line fragments to count as collinear.
pub const COLLINEAR_TOLERANCE: u32 = 5;

const BACKGROUND_SHARE: f64 = 0.5;
const FOREGROUND_SHARE: f64 = 0.1;
const SIGNIFICANT_SHARE: f64 = 0.02;
const LINE_AREA_FLOOR: u32 = 40;
const FRAME_ASPECT: f64 = 2.0;

/// Merges same-color fragments, drops insignificant regions and sorts the
/// survivors largest-first. Running it on its own output changes nothing.
pub fn consolidate(raw: &[Region], width: u32, height: u32) -> RegionSet {
    let image_area = u64::from(width) * u64::from(height);
    let mut regions: Vec<Region> = raw.to_vec();

    while let Some((i, j)) = find_merge_pair(&regions, image_area) {
        let absorbed = regions.remove(j);
        let merged = merge_pair(&regions[i], &absorbed);
        regions[i] = merged;
    }

    let largest = regions.iter().map(|r| r.area).max().unwrap_or(0);
    regions.retain(|r| is_significant(r, largest));
    regions.sort_by(region_order);

    RegionSet {
        width,
        height,
        regions,
    }
}

impl RegionSet {
    pub fn consolidated(&self) -> RegionSet {
        consolidate(&self.regions, self.width, self.height)
    }

    /// The `n` largest regions.
    pub fn top(&self, n: usize) -> &[Region] {
        &self.regions[..n.min(self.regions.len())]
    }
}

fn find_merge_pair(regions: &[Region], image_area: u64) -> Option<(usize, usize)> {
    for i in 0..regions.len() {
        for j in (i + 1)..regions.len() {
            let (a, b) = (&regions[i], &regions[j]);
            if a.class != b.class {
                continue;
            }
            if boxes_touch(a, b, MERGE_MARGIN) && should_merge(a, b, image_area) {
                return Some((i, j));
            }
        }
    }
    None
}

fn boxes_touch(a: &Region, b: &Region, margin: u32) -> bool {
    a.x <= b.x2() + margin
        && b.x <= a.x2() + margin
        && a.y <= b.y2() + margin
        && b.y <= a.y2() + margin
}

fn should_merge(a: &Region, b: &Region, image_area: u64) -> bool {
    if image_area > 0 {
        let share = |r: &Region| f64::from(r.area) / image_area as f64;
        let (big, small) = if a.area >= b.area { (a, b) } else { (b, a) };
        if share(big) > BACKGROUND_SHARE && share(small) < FOREGROUND_SHARE {
            return false;
        }
    }

    match (a.is_elongated(), b.is_elongated()) {
        (false, false) => true,
        (true, true) => a.orientation() == b.orientation() && collinear(a, b),
        _ => false,
    }
}

fn collinear(a: &Region, b: &Region) -> bool {
    let within = |p: u32, q: u32| p.abs_diff(q) <= COLLINEAR_TOLERANCE;
    match a.orientation() {
        Orientation::Horizontal => within(a.y, b.y) && within(a.y2(), b.y2()),
        Orientation::Vertical => within(a.x, b.x) && within(a.x2(), b.x2()),
    }
}

fn merge_pair(a: &Region, b: &Region) -> Region {
    let x = a.x.min(b.x);
    let y = a.y.min(b.y);
    let x2 = a.x2().max(b.x2());
    let y2 = a.y2().max(b.y2());
    let rgb = if a.area >= b.area { a.rgb } else { b.rgb };
    let mut merged = Region::new(rgb, x, y, x2 - x, y2 - y, a.pixels + b.pixels);
    // keep the class both fragments agreed on
    merged.class = a.class;
    merged
}

fn is_significant(region: &Region, largest: u32) -> bool {
    if f64::from(region.area) >= f64::from(largest) * SIGNIFICANT_SHARE {
        return true;
    }
    if region.class == ColorClass::Red {
        return true;
    }
    if region.aspect_ratio() > ELONGATED_ASPECT && region.area >= LINE_AREA_FLOOR {
        return true;
    }
    region.class == ColorClass::Black && region.aspect_ratio() <= FRAME_ASPECT
}

fn region_order(a: &Region, b: &Region) -> Ordering {
    b.area
        .cmp(&a.area)
        .then(a.y.cmp(&b.y))
        .then(a.x.cmp(&b.x))
        .then_with(|| a.class.name().cmp(&b.class.name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::regions::{extract_from_image, RegionParams};
    use crate::testing::{fill_rect, solid_image};

    fn region(rgb: [u8; 3], x: u32, y: u32, w: u32, h: u32) -> Region {
        Region::new(rgb, x, y, w, h, (w * h) / 4)
    }

    #[test]
    fn adjacent_same_color_fragments_merge() {
        let raw = vec![
            region([0, 0, 255], 10, 10, 50, 50),
            region([0, 0, 250], 62, 10, 40, 50),
        ];
        let set = consolidate(&raw, 400, 400);
        assert_eq!(set.len(), 1);
        let merged = &set.regions[0];
        assert_eq!((merged.x, merged.y, merged.w, merged.h), (10, 10, 92, 50));
        assert_eq!(merged.class, ColorClass::Blue);
    }

    #[test]
    fn different_colors_never_merge() {
        let raw = vec![
            region([0, 0, 255], 10, 10, 50, 50),
            region([255, 0, 0], 30, 30, 50, 50),
        ];
        assert_eq!(consolidate(&raw, 400, 400).len(), 2);
    }

    #[test]
    fn background_does_not_swallow_foreground() {
        let raw = vec![
            region([255, 255, 255], 0, 0, 400, 300),
            region([255, 255, 255], 100, 302, 60, 60),
        ];
        assert_eq!(consolidate(&raw, 400, 400).len(), 2);
    }

    #[test]
    fn parallel_dividers_stay_separate() {
        let raw = vec![
            region([0, 0, 0], 0, 100, 300, 6),
            region([0, 0, 0], 0, 109, 300, 6),
        ];
        assert_eq!(consolidate(&raw, 300, 300).len(), 2);
    }

    #[test]
    fn collinear_line_fragments_join() {
        let raw = vec![
            region([0, 0, 0], 0, 100, 140, 6),
            region([0, 0, 0], 142, 101, 150, 6),
        ];
        let set = consolidate(&raw, 300, 300);
        assert_eq!(set.len(), 1);
        assert_eq!((set.regions[0].x, set.regions[0].w), (0, 292));
    }

    #[test]
    fn small_regions_filtered_except_protected_kinds() {
        let raw = vec![
            region([255, 255, 255], 0, 0, 400, 400),
            region([0, 200, 0], 10, 10, 12, 12),
            region([255, 0, 0], 300, 300, 10, 10),
            region([0, 0, 0], 200, 30, 10, 10),
            region([0, 0, 0], 40, 200, 100, 2),
        ];
        let set = consolidate(&raw, 400, 400);
        let kept: Vec<ColorClass> = set.regions.iter().map(|r| r.class).collect();
        assert_eq!(set.len(), 4);
        assert!(kept.contains(&ColorClass::Red));
        assert!(!kept.iter().any(|c| matches!(c, ColorClass::Other(_))));
        assert_eq!(set.regions[0].class, ColorClass::White);
    }

    #[test]
    fn sorted_by_area_descending() {
        let raw = vec![
            region([255, 0, 0], 0, 0, 20, 20),
            region([0, 0, 255], 100, 100, 60, 60),
            region([250, 220, 0], 200, 200, 40, 40),
        ];
        let set = consolidate(&raw, 400, 400);
        let areas: Vec<u32> = set.regions.iter().map(|r| r.area).collect();
        assert_eq!(areas, vec![3600, 1600, 400]);
    }

    #[test]
    fn consolidation_is_idempotent() {
        let mut img = solid_image(300, 300, [255, 255, 255, 255]);
        fill_rect(&mut img, 0, 140, 300, 6, [0, 0, 0, 255]);
        fill_rect(&mut img, 140, 0, 6, 300, [0, 0, 0, 255]);
        fill_rect(&mut img, 10, 10, 100, 100, [255, 0, 0, 255]);
        fill_rect(&mut img, 160, 160, 120, 60, [0, 0, 255, 255]);
        fill_rect(&mut img, 200, 20, 50, 50, [250, 220, 0, 255]);

        let raw = extract_from_image(&img, &RegionParams::default());
        let once = consolidate(&raw, 300, 300);
        let twice = once.consolidated();
        assert_eq!(once, twice);
        assert!(!once.is_empty());
    }
}
