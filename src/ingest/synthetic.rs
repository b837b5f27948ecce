//! Synthetic frame source (`stub://`).
//!
//! Produces a dark scene with a bright rectangular "subject" following a
//! fixed script, so the whole pipeline can run without a camera:
//! - frames 0..60: subject standing still (with a pixel of jitter)
//! - frames 60..100: subject walking to the right
//! - frames 100..140: empty scene
//! - frames 140..200: subject standing still elsewhere
//!
//! The script repeats every 200 frames.

use anyhow::Result;

use super::VideoBackend;
use crate::frame::Frame;
use crate::geometry::BBox;

pub const SYNTHETIC_WIDTH: u32 = 640;
pub const SYNTHETIC_HEIGHT: u32 = 480;
const SCRIPT_PERIOD: u64 = 200;
const BACKGROUND_LEVEL: u8 = 30;
const SUBJECT_LEVEL: u8 = 230;

pub struct SyntheticBackend {
    name: String,
    width: u32,
    height: u32,
    frame_count: u64,
}

impl SyntheticBackend {
    pub fn new(name: &str) -> Self {
        Self::with_size(name, SYNTHETIC_WIDTH, SYNTHETIC_HEIGHT)
    }

    pub fn with_size(name: &str, width: u32, height: u32) -> Self {
        log::info!("SyntheticBackend: connected to stub://{}", name);
        Self {
            name: name.to_string(),
            width,
            height,
            frame_count: 0,
        }
    }

    /// Where the scripted subject is in frame `sequence`, if anywhere.
    ///
    /// Coordinates are laid out for 640x480 and scaled to the configured size.
    pub fn subject_at(&self, sequence: u64) -> Option<BBox> {
        let phase = sequence % SCRIPT_PERIOD;
        let jitter = (phase % 2) as i32;
        let (x1, y1, x2, y2) = match phase {
            0..=59 => (100 + jitter, 120 + jitter, 260 - jitter, 420 - jitter),
            60..=99 => {
                let dx = ((phase - 60) * 6) as i32;
                (100 + dx, 120, 260 + dx, 420)
            }
            100..=139 => return None,
            _ => (360 + jitter, 100, 520, 400 - jitter),
        };
        let sx = |v: i32| (v as i64 * self.width as i64 / SYNTHETIC_WIDTH as i64) as i32;
        let sy = |v: i32| (v as i64 * self.height as i64 / SYNTHETIC_HEIGHT as i64) as i32;
        Some(BBox::new(sx(x1), sy(y1), sx(x2), sy(y2)))
    }

    fn render(&self, sequence: u64) -> Result<Frame> {
        let width = self.width as usize;
        let height = self.height as usize;
        let mut pixels = vec![BACKGROUND_LEVEL; width * height * 3];
        if let Some(subject) = self.subject_at(sequence) {
            let x1 = subject.x1.clamp(0, self.width as i32) as usize;
            let x2 = subject.x2.clamp(0, self.width as i32) as usize;
            let y1 = subject.y1.clamp(0, self.height as i32) as usize;
            let y2 = subject.y2.clamp(0, self.height as i32) as usize;
            for y in y1..y2 {
                let row = y * width * 3;
                pixels[row + x1 * 3..row + x2 * 3].fill(SUBJECT_LEVEL);
            }
        }
        Frame::from_rgb(pixels, self.width, self.height, sequence)
    }
}

impl VideoBackend for SyntheticBackend {
    fn name(&self) -> &'static str {
        "synthetic"
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let frame = self.render(self.frame_count)?;
        self.frame_count += 1;
        Ok(Some(frame))
    }

    fn skip(&mut self) -> Result<()> {
        self.frame_count += 1;
        Ok(())
    }

    fn close(&mut self) {
        log::info!(
            "SyntheticBackend: stub://{} closed after {} frames",
            self.name,
            self.frame_count
        );
    }
}
