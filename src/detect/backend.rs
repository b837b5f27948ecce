use anyhow::Result;

use crate::config::ModelSettings;
use crate::detect::result::Detection;
use crate::frame::Frame;

/// Per-call inference settings, resolved from the camera and model config sections.
#[derive(Clone, Debug, PartialEq)]
pub struct InferenceParams {
    /// Square input size the model resizes frames to.
    pub imgsz: u32,
    /// Minimum score a detection must reach to be returned.
    pub conf: f32,
    /// Execution device requested by configuration ("cpu", "cuda", ...).
    pub device: String,
}

/// Object detector contract.
///
/// The kernel treats `detect` as an opaque, possibly slow, blocking call. It
/// is always invoked off the async scheduler, and an `Err` only skips the
/// current frame; it never stops the loop.
///
/// Implementations must treat the frame as borrowed for the duration of the
/// call and return boxes in the frame's pixel coordinates.
pub trait DetectionAdapter: Send {
    /// Adapter identifier.
    fn name(&self) -> &'static str;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame, params: &InferenceParams) -> Result<Vec<Detection>>;

    /// Optional warm-up hook, run once before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Supplies a fresh detection adapter for each loop start.
///
/// The model section of the config may change between restarts, so adapters
/// are loaded per start rather than held by the service.
pub trait DetectorProvider: Send + Sync {
    fn load(&self, model: &ModelSettings) -> Result<Box<dyn DetectionAdapter>>;
}
