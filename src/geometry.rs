use serde::{Deserialize, Serialize};

/// Added to the union area so degenerate (zero-area) boxes never divide by zero.
const UNION_EPSILON: f64 = 1e-6;

/// Axis-aligned box in pixel coordinates, `(x1, y1)` top-left and `(x2, y2)` bottom-right.
///
/// Serialized as a four element array, matching the event wire schema.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BBox {
    /// Builds a box, swapping corners if needed so that `x2 >= x1` and `y2 >= y1`.
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self {
            x1: x1.min(x2),
            y1: y1.min(y2),
            x2: x1.max(x2),
            y2: y1.max(y2),
        }
    }

    /// Truncates float corners (as produced by detectors) to integer pixels.
    pub fn from_f32(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32)
    }

    pub fn width(&self) -> i64 {
        (i64::from(self.x2) - i64::from(self.x1)).max(0)
    }

    pub fn height(&self) -> i64 {
        (i64::from(self.y2) - i64::from(self.y1)).max(0)
    }

    /// Area in square pixels. Computed in `f64`; a full-range `i32` box overflows `i64`.
    pub fn area(&self) -> f64 {
        self.width() as f64 * self.height() as f64
    }

    pub fn to_array(self) -> [i32; 4] {
        [self.x1, self.y1, self.x2, self.y2]
    }
}

impl From<[i32; 4]> for BBox {
    fn from(v: [i32; 4]) -> Self {
        Self::new(v[0], v[1], v[2], v[3])
    }
}

impl From<BBox> for [i32; 4] {
    fn from(b: BBox) -> Self {
        b.to_array()
    }
}

/// Intersection-over-union of two boxes, in `[0, 1]`.
pub fn iou(a: &BBox, b: &BBox) -> f64 {
    let ix1 = i64::from(a.x1.max(b.x1));
    let iy1 = i64::from(a.y1.max(b.y1));
    let ix2 = i64::from(a.x2.min(b.x2));
    let iy2 = i64::from(a.y2.min(b.y2));
    let inter = (ix2 - ix1).max(0) as f64 * (iy2 - iy1).max(0) as f64;
    let union = a.area() + b.area() - inter + UNION_EPSILON;
    (inter / union).clamp(0.0, 1.0)
}
