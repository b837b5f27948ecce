use anyhow::Result;

use crate::detect::backend::{DetectionAdapter, InferenceParams};
use crate::detect::result::Detection;
use crate::frame::Frame;
use crate::geometry::BBox;

/// Reference adapter: reports one person covering the pixels brighter than a
/// luminance threshold.
///
/// Not a person detector in any real sense. It pairs with the `stub://`
/// synthetic source so the daemon and the tests can exercise the whole
/// pipeline without an inference engine.
pub struct BrightBlobDetector {
    luma_threshold: u8,
    min_pixels: u64,
}

impl BrightBlobDetector {
    pub fn new(luma_threshold: u8, min_pixels: u64) -> Self {
        Self {
            luma_threshold,
            min_pixels,
        }
    }
}

impl Default for BrightBlobDetector {
    fn default() -> Self {
        Self::new(200, 16)
    }
}

impl DetectionAdapter for BrightBlobDetector {
    fn name(&self) -> &'static str {
        "bright-blob"
    }

    fn detect(&mut self, frame: &Frame, params: &InferenceParams) -> Result<Vec<Detection>> {
        let width = frame.width as usize;
        let mut count = 0u64;
        let (mut x1, mut y1, mut x2, mut y2) = (usize::MAX, usize::MAX, 0usize, 0usize);

        for (i, px) in frame.pixels().chunks_exact(3).enumerate() {
            // Integer Rec.601 luma.
            let luma = (299 * px[0] as u32 + 587 * px[1] as u32 + 114 * px[2] as u32) / 1000;
            if luma < self.luma_threshold as u32 {
                continue;
            }
            let (x, y) = (i % width, i / width);
            x1 = x1.min(x);
            y1 = y1.min(y);
            x2 = x2.max(x + 1);
            y2 = y2.max(y + 1);
            count += 1;
        }

        if count < self.min_pixels {
            return Ok(Vec::new());
        }

        let area = ((x2 - x1) * (y2 - y1)) as f32;
        let fill = count as f32 / area;
        let score = (0.5 + 0.5 * fill).min(1.0);
        if score < params.conf {
            return Ok(Vec::new());
        }

        let bbox = BBox::new(x1 as i32, y1 as i32, x2 as i32, y2 as i32);
        Ok(vec![Detection::person(bbox, score)])
    }
}
