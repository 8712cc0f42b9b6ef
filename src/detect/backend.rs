use anyhow::Result;

use crate::detect::result::{Detection, FallSignal};
use crate::frame::Frame;

/// Detection capabilities a backend may advertise.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DetectionCapability {
    ObjectDetection,
    /// Detections carry stable `track_id`s across frames.
    Tracking,
}

/// Object detector collaborator.
///
/// The model behind it is opaque. Implementations must treat the frame as
/// read-only and must not retain it beyond the `detect` call.
pub trait DetectorBackend: Send {
    /// Backend identifier.
    fn name(&self) -> &'static str;

    /// Returns true when the backend supports a capability.
    fn supports(&self, capability: DetectionCapability) -> bool;

    /// Run detection on a frame.
    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Optional warm-up hook.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Optional dedicated fall-detection model.
///
/// When absent the pipeline runs in heuristic-only mode.
pub trait FallModel: Send {
    fn name(&self) -> &'static str;

    fn detect(&mut self, frame: &Frame) -> Result<FallSignal>;
}
