use serde::{Serialize, Serializer};
use std::fmt;

/// Named color buckets the region analyzer reasons about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColorClass {
    Black,
    White,
    Red,
    Yellow,
    Blue,
    Gray,
    /// Catch-all keyed by a 3-bit-per-channel quantization of the raw color.
    Other(u16),
}

impl ColorClass {
    pub fn name(&self) -> String {
        match self {
            ColorClass::Black => "black".to_string(),
            ColorClass::White => "white".to_string(),
            ColorClass::Red => "red".to_string(),
            ColorClass::Yellow => "yellow".to_string(),
            ColorClass::Blue => "blue".to_string(),
            ColorClass::Gray => "gray".to_string(),
            ColorClass::Other(bucket) => {
                let [r, g, b] = bucket_center(*bucket);
                format!("color {}", hex([r, g, b]))
            }
        }
    }
}

impl fmt::Display for ColorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

impl Serialize for ColorClass {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.name())
    }
}

#[derive(Debug, Clone, Copy)]
struct NamedColor {
    class: ColorClass,
    rgb: [u8; 3],
    radius: f64,
}

// Order is resolution order for equal distances.
const NAMED_COLORS: [NamedColor; 6] = [
    NamedColor {
        class: ColorClass::Black,
        rgb: [0, 0, 0],
        radius: 80.0,
    },
    NamedColor {
        class: ColorClass::White,
        rgb: [255, 255, 255],
        radius: 60.0,
    },
    NamedColor {
        class: ColorClass::Red,
        rgb: [225, 35, 35],
        radius: 110.0,
    },
    NamedColor {
        class: ColorClass::Yellow,
        rgb: [245, 210, 40],
        radius: 100.0,
    },
    NamedColor {
        class: ColorClass::Blue,
        rgb: [30, 60, 200],
        radius: 110.0,
    },
    NamedColor {
        class: ColorClass::Gray,
        rgb: [128, 128, 128],
        radius: 40.0,
    },
];

type HeuristicRule = fn([u8; 3]) -> Option<ColorClass>;

const HEURISTIC_RULES: [HeuristicRule; 4] =
    [dominant_red, dominant_blue, warm_yellow, neutral_luma];

/// Resolves a color through the rule table: nearest named reference within its
/// own radius, then the heuristic rules in order, then the quantized catch-all.
pub fn classify(rgb: [u8; 3]) -> ColorClass {
    if let Some(class) = nearest_named(rgb) {
        return class;
    }
    for rule in HEURISTIC_RULES {
        if let Some(class) = rule(rgb) {
            return class;
        }
    }
    ColorClass::Other(quantize(rgb))
}

fn nearest_named(rgb: [u8; 3]) -> Option<ColorClass> {
    let mut best: Option<(f64, ColorClass)> = None;
    for named in NAMED_COLORS {
        let dist = rgb_distance(rgb, named.rgb);
        if dist > named.radius {
            continue;
        }
        match best {
            Some((best_dist, _)) if best_dist <= dist => {}
            _ => best = Some((dist, named.class)),
        }
    }
    best.map(|(_, class)| class)
}

fn dominant_red([r, g, b]: [u8; 3]) -> Option<ColorClass> {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    (r > 100 && r > g + 60 && r > b + 60).then_some(ColorClass::Red)
}

fn dominant_blue([r, g, b]: [u8; 3]) -> Option<ColorClass> {
    let (r, g, b) = (i32::from(r), i32::from(g), i32::from(b));
    (b > 120 && b > r + 60 && b > g + 30).then_some(ColorClass::Blue)
}

fn warm_yellow([r, g, b]: [u8; 3]) -> Option<ColorClass> {
    (r > 180 && g > 160 && b < 110).then_some(ColorClass::Yellow)
}

fn neutral_luma(rgb: [u8; 3]) -> Option<ColorClass> {
    let max = rgb.iter().copied().max().unwrap_or(0);
    let min = rgb.iter().copied().min().unwrap_or(0);
    if max - min >= 24 {
        return None;
    }
    let luma = color_luma(rgb);
    Some(if luma < 0.25 {
        ColorClass::Black
    } else if luma > 0.8 {
        ColorClass::White
    } else {
        ColorClass::Gray
    })
}

pub fn rgb_distance(a: [u8; 3], b: [u8; 3]) -> f64 {
    let dr = f64::from(a[0]) - f64::from(b[0]);
    let dg = f64::from(a[1]) - f64::from(b[1]);
    let db = f64::from(a[2]) - f64::from(b[2]);
    (dr * dr + dg * dg + db * db).sqrt()
}

pub fn color_luma([r, g, b]: [u8; 3]) -> f64 {
    (0.2126 * f64::from(r) + 0.7152 * f64::from(g) + 0.0722 * f64::from(b)) / 255.0
}

pub fn hex([r, g, b]: [u8; 3]) -> String {
    format!("#{r:02X}{g:02X}{b:02X}")
}

fn quantize([r, g, b]: [u8; 3]) -> u16 {
    (u16::from(r >> 5) << 6) | (u16::from(g >> 5) << 3) | u16::from(b >> 5)
}

fn bucket_center(bucket: u16) -> [u8; 3] {
    let channel = |shift: u16| (((bucket >> shift) & 0b111) as u8) * 32 + 16;
    [channel(6), channel(3), channel(0)]
}
