mod backend;
mod backends;
mod registry;
mod result;

pub use backend::{DetectionAdapter, DetectorProvider, InferenceParams};
pub use backends::BrightBlobDetector;
pub use registry::DetectorRegistry;
pub use result::{persons, Detection, PERSON_CLASS_ID};
