pub mod bright_blob;

pub use bright_blob::BrightBlobDetector;
