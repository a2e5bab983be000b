use crate::pixel_score::{MatchVerdict, PixelVerdict, TOP_REGIONS};
use crate::regions::{Region, RegionSet};
use font8x8::{UnicodeFonts, BASIC_FONTS};
use image::{Pixel, Rgba, RgbaImage};

const MISSING: Rgba<u8> = Rgba([255, 59, 48, 255]);
const MISMATCHED: Rgba<u8> = Rgba([255, 149, 0, 255]);
const MATCHED: Rgba<u8> = Rgba([52, 199, 89, 255]);
const LABEL_BG: Rgba<u8> = Rgba([0, 0, 0, 170]);
const LABEL_FG: Rgba<u8> = Rgba([255, 255, 255, 255]);
const GLYPH: u32 = 8;
const LABEL_SCALE: u32 = 2;

/// Draws each scored target region over the candidate: red when missing,
/// orange when off, green when matched, labelled by rank.
pub fn annotate_regions(
    candidate: &RgbaImage,
    target: &RegionSet,
    verdict: &PixelVerdict,
) -> RgbaImage {
    let mut out = candidate.clone();
    let top = target.top(TOP_REGIONS);
    let thickness = (out.width().min(out.height()) / 200).clamp(2, 4);
    let mut painter = Painter::new(&mut out);

    for m in &verdict.matches {
        let Some(region) = top.get(m.target) else {
            continue;
        };
        let color = match m.verdict {
            MatchVerdict::Missing => MISSING,
            MatchVerdict::Mismatched { .. } => MISMATCHED,
            MatchVerdict::Matched { .. } => MATCHED,
        };
        if let Some(bounds) = painter.clip(region) {
            painter.outline(bounds, color, thickness);
        }
        painter.badge(region.x + thickness, region.y + thickness, &(m.target + 1).to_string());
    }
    out
}

/// Inclusive pixel bounds already clipped to the canvas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bounds {
    left: u32,
    top: u32,
    right: u32,
    bottom: u32,
}

struct Painter<'a> {
    img: &'a mut RgbaImage,
}

impl<'a> Painter<'a> {
    fn new(img: &'a mut RgbaImage) -> Self {
        Self { img }
    }

    fn clip(&self, region: &Region) -> Option<Bounds> {
        self.clip_box(region.x, region.y, region.w, region.h)
    }

    fn clip_box(&self, x: u32, y: u32, w: u32, h: u32) -> Option<Bounds> {
        let (width, height) = self.img.dimensions();
        if w == 0 || h == 0 || x >= width || y >= height {
            return None;
        }
        Some(Bounds {
            left: x,
            top: y,
            right: x.saturating_add(w - 1).min(width - 1),
            bottom: y.saturating_add(h - 1).min(height - 1),
        })
    }

    /// Rings grow inward so a box on the canvas edge stays visible.
    fn outline(&mut self, bounds: Bounds, color: Rgba<u8>, thickness: u32) {
        let mut ring = bounds;
        for _ in 0..thickness.max(1) {
            for x in ring.left..=ring.right {
                self.img.put_pixel(x, ring.top, color);
                self.img.put_pixel(x, ring.bottom, color);
            }
            for y in ring.top..=ring.bottom {
                self.img.put_pixel(ring.left, y, color);
                self.img.put_pixel(ring.right, y, color);
            }
            if ring.right - ring.left < 2 || ring.bottom - ring.top < 2 {
                break;
            }
            ring = Bounds {
                left: ring.left + 1,
                top: ring.top + 1,
                right: ring.right - 1,
                bottom: ring.bottom - 1,
            };
        }
    }

    fn shade(&mut self, bounds: Bounds, color: Rgba<u8>) {
        for y in bounds.top..=bounds.bottom {
            for x in bounds.left..=bounds.right {
                self.img.get_pixel_mut(x, y).blend(&color);
            }
        }
    }

    /// White bitmap text on a translucent plate with a 2px margin.
    fn badge(&mut self, x: u32, y: u32, text: &str) {
        let cell = GLYPH * LABEL_SCALE;
        let len = text.chars().count() as u32;
        let plate = self.clip_box(
            x.saturating_sub(2),
            y.saturating_sub(2),
            len * cell + 4,
            cell + 4,
        );
        if let Some(plate) = plate {
            self.shade(plate, LABEL_BG);
        }
        for (idx, ch) in text.chars().enumerate() {
            let glyph = BASIC_FONTS.get(ch).or_else(|| BASIC_FONTS.get('?'));
            if let Some(glyph) = glyph {
                self.glyph(x + idx as u32 * cell, y, &glyph, LABEL_FG);
            }
        }
    }

    fn glyph(&mut self, x: u32, y: u32, rows: &[u8; 8], color: Rgba<u8>) {
        for (row, bits) in (0u32..).zip(rows) {
            for col in (0..GLYPH).filter(|col| bits & (1 << col) != 0) {
                let cell = self.clip_box(
                    x + col * LABEL_SCALE,
                    y + row * LABEL_SCALE,
                    LABEL_SCALE,
                    LABEL_SCALE,
                );
                if let Some(cell) = cell {
                    self.shade(cell, color);
                }
            }
        }
    }
}
