use crate::color::{classify, hex, rgb_distance, ColorClass};
use image::RgbaImage;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Fills with fewer sampled pixels than this are noise.
pub const MIN_FILL_PIXELS: u32 = 5;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegionParams {
    pub sampling_step: u32,
    pub color_tolerance: f64,
    pub alpha_threshold: u8,
    pub min_region_area: u32,
}

impl Default for RegionParams {
    fn default() -> Self {
        Self {
            sampling_step: 2,
            color_tolerance: 30.0,
            alpha_threshold: 128,
            min_region_area: 400,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Orientation {
    Horizontal,
    Vertical,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Region {
    pub class: ColorClass,
    pub hex: String,
    #[serde(skip)]
    pub rgb: [u8; 3],
    pub x: u32,
    pub y: u32,
    pub w: u32,
    pub h: u32,
    pub pixels: u32,
    pub area: u32,
}

impl Region {
    pub fn new(rgb: [u8; 3], x: u32, y: u32, w: u32, h: u32, pixels: u32) -> Self {
        Self {
            class: classify(rgb),
            hex: hex(rgb),
            rgb,
            x,
            y,
            w,
            h,
            pixels,
            area: w.saturating_mul(h),
        }
    }

    pub fn x2(&self) -> u32 {
        self.x + self.w
    }

    pub fn y2(&self) -> u32 {
        self.y + self.h
    }

    pub fn aspect_ratio(&self) -> f64 {
        let long = self.w.max(self.h).max(1) as f64;
        let short = self.w.min(self.h).max(1) as f64;
        long / short
    }

    pub fn orientation(&self) -> Orientation {
        if self.w >= self.h {
            Orientation::Horizontal
        } else {
            Orientation::Vertical
        }
    }

    /// Line-like regions get line phrasing and collinearity-guarded merging.
    pub fn is_elongated(&self) -> bool {
        self.aspect_ratio() > ELONGATED_ASPECT
    }
}

pub const ELONGATED_ASPECT: f64 = 8.0;
pub const VERY_ELONGATED_ASPECT: f64 = 20.0;

/// Ordered regions for one image, in the image's own pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RegionSet {
    pub width: u32,
    pub height: u32,
    pub regions: Vec<Region>,
}

impl RegionSet {
    pub fn image_area(&self) -> u64 {
        u64::from(self.width) * u64::from(self.height)
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }
}

pub fn extract_from_image(image: &RgbaImage, params: &RegionParams) -> Vec<Region> {
    let (width, height) = image.dimensions();
    extract_regions(image.as_raw(), width, height, params)
}

/// Sampled flood fill over an RGBA buffer. Output is unsorted.
pub fn extract_regions(
    pixels: &[u8],
    width: u32,
    height: u32,
    params: &RegionParams,
) -> Vec<Region> {
    let step = params.sampling_step.max(1);
    if width == 0 || height == 0 || pixels.len() < (width as usize) * (height as usize) * 4 {
        return Vec::new();
    }

    let cols = width.div_ceil(step);
    let rows = height.div_ceil(step);
    let mut visited = vec![false; (cols * rows) as usize];

    let rgba_at = |gx: u32, gy: u32| -> [u8; 4] {
        let idx = (((gy * step) * width + gx * step) * 4) as usize;
        [pixels[idx], pixels[idx + 1], pixels[idx + 2], pixels[idx + 3]]
    };

    let mut regions = Vec::new();

    for gy in 0..rows {
        for gx in 0..cols {
            let start = (gy * cols + gx) as usize;
            if visited[start] {
                continue;
            }
            let seed_px = rgba_at(gx, gy);
            if seed_px[3] < params.alpha_threshold {
                visited[start] = true;
                continue;
            }
            let seed = [seed_px[0], seed_px[1], seed_px[2]];

            let mut queue = VecDeque::new();
            queue.push_back((gx, gy));
            visited[start] = true;

            let (mut minx, mut maxx, mut miny, mut maxy) = (gx, gx, gy, gy);
            let mut count: u32 = 0;
            let mut sums = [0u64; 3];

            while let Some((cx, cy)) = queue.pop_front() {
                let px = rgba_at(cx, cy);
                count += 1;
                sums[0] += u64::from(px[0]);
                sums[1] += u64::from(px[1]);
                sums[2] += u64::from(px[2]);
                minx = minx.min(cx);
                maxx = maxx.max(cx);
                miny = miny.min(cy);
                maxy = maxy.max(cy);

                let mut neighbours = [None; 4];
                if cx > 0 {
                    neighbours[0] = Some((cx - 1, cy));
                }
                if cx + 1 < cols {
                    neighbours[1] = Some((cx + 1, cy));
                }
                if cy > 0 {
                    neighbours[2] = Some((cx, cy - 1));
                }
                if cy + 1 < rows {
                    neighbours[3] = Some((cx, cy + 1));
                }

                for (nx, ny) in neighbours.into_iter().flatten() {
                    let idx = (ny * cols + nx) as usize;
                    if visited[idx] {
                        continue;
                    }
                    let npx = rgba_at(nx, ny);
                    if npx[3] < params.alpha_threshold {
                        continue;
                    }
                    if rgb_distance(seed, [npx[0], npx[1], npx[2]]) <= params.color_tolerance {
                        visited[idx] = true;
                        queue.push_back((nx, ny));
                    }
                }
            }

            if count < MIN_FILL_PIXELS {
                continue;
            }

            let x = minx * step;
            let y = miny * step;
            let w = ((maxx - minx) * step + step).min(width - x);
            let h = ((maxy - miny) * step + step).min(height - y);
            let n = u64::from(count);
            let rgb = [
                (sums[0] / n) as u8,
                (sums[1] / n) as u8,
                (sums[2] / n) as u8,
            ];

            let region = Region::new(rgb, x, y, w, h, count);
            if region.area >= admission_threshold(&region, params.min_region_area) {
                regions.push(region);
            }
        }
    }

    regions
}

fn admission_threshold(region: &Region, min_region_area: u32) -> u32 {
    let aspect = region.aspect_ratio();
    if aspect > VERY_ELONGATED_ASPECT {
        (min_region_area / 20).max(1)
    } else if aspect > ELONGATED_ASPECT {
        (min_region_area / 4).max(1)
    } else {
        min_region_area
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{fill_rect, solid_image};
    use image::Rgba;

    #[test]
    fn red_square_on_white_yields_two_regions() {
        let mut img = solid_image(400, 400, [255, 255, 255, 255]);
        fill_rect(&mut img, 150, 150, 100, 100, [255, 0, 0, 255]);

        let mut regions = extract_from_image(&img, &RegionParams::default());
        regions.sort_by(|a, b| b.area.cmp(&a.area));

        assert_eq!(regions.len(), 2);
        assert_eq!(regions[0].class, ColorClass::White);
        assert_eq!((regions[0].x, regions[0].y, regions[0].w, regions[0].h), (0, 0, 400, 400));
        assert_eq!(regions[1].class, ColorClass::Red);
        assert_eq!((regions[1].x, regions[1].y, regions[1].w, regions[1].h), (150, 150, 100, 100));
        assert_eq!(regions[1].hex, "#FF0000");
    }

    #[test]
    fn transparent_image_yields_nothing() {
        let img = solid_image(64, 64, [10, 20, 30, 0]);
        assert!(extract_from_image(&img, &RegionParams::default()).is_empty());
    }

    #[test]
    fn any_opaque_content_yields_regions() {
        let mut img = solid_image(80, 80, [0, 0, 0, 0]);
        fill_rect(&mut img, 10, 10, 40, 40, [0, 0, 255, 255]);
        let regions = extract_from_image(&img, &RegionParams::default());
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].class, ColorClass::Blue);
    }

    #[test]
    fn thin_divider_survives_area_cutoff() {
        let mut img = solid_image(300, 300, [255, 255, 255, 255]);
        // area 480 is below min_region_area; only the aspect rule admits it
        fill_rect(&mut img, 20, 100, 120, 4, [0, 0, 0, 255]);
        let params = RegionParams {
            min_region_area: 2000,
            ..RegionParams::default()
        };
        let regions = extract_from_image(&img, &params);
        let line = regions
            .iter()
            .find(|r| r.class == ColorClass::Black)
            .expect("divider kept");
        assert!(line.is_elongated());
        assert_eq!(line.orientation(), Orientation::Horizontal);
        assert_eq!((line.x, line.y, line.w, line.h), (20, 100, 120, 4));
    }

    #[test]
    fn small_speckles_are_discarded() {
        let mut img = solid_image(100, 100, [255, 255, 255, 255]);
        img.put_pixel(50, 50, Rgba([255, 0, 0, 255]));
        let regions = extract_from_image(&img, &RegionParams::default());
        assert!(regions.iter().all(|r| r.class != ColorClass::Red));
    }
}
