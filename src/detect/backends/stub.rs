use anyhow::Result;

use crate::detect::backend::{DetectionCapability, DetectorBackend};
use crate::detect::result::{BBox, Detection};
use crate::detect::PERSON_CLASS_ID;
use crate::frame::Frame;

/// Length of the scripted scenario, in frames.
const SCENARIO_FRAMES: u64 = 600;

/// Stub backend for `stub://` sources and tests.
///
/// Replays a fixed scenario keyed on the frame sequence number:
/// - track 2 stands still in the left half of the frame
/// - track 1 walks right into the bathroom area, stays, lies down, then leaves view
pub struct StubBackend {
    tracking: bool,
}

impl StubBackend {
    pub fn new() -> Self {
        Self { tracking: true }
    }

    /// Drop track ids, forcing consumers into pseudo-identity mode.
    pub fn without_tracking() -> Self {
        Self { tracking: false }
    }

    fn scripted(&self, sequence: u64) -> Vec<Detection> {
        let t = sequence % SCENARIO_FRAMES;
        let mut out = vec![self.person(2, BBox::centered(0.3, 0.5, 0.1, 0.4), 0.91)];

        let walker = match t {
            0..=199 => {
                let cx = 0.2 + 0.6 * (t as f32 / 200.0);
                Some(BBox::centered(cx, 0.5, 0.1, 0.4))
            }
            200..=499 => Some(BBox::centered(0.8, 0.5, 0.1, 0.4)),
            500..=559 => Some(BBox::centered(0.8, 0.8, 0.3, 0.12)),
            _ => None,
        };
        if let Some(bbox) = walker {
            out.push(self.person(1, bbox, 0.87));
        }
        out
    }

    fn person(&self, track: u64, bbox: BBox, confidence: f32) -> Detection {
        Detection {
            bbox,
            class_id: PERSON_CLASS_ID,
            confidence,
            track_id: self.tracking.then_some(track),
        }
    }
}

impl Default for StubBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DetectorBackend for StubBackend {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn supports(&self, capability: DetectionCapability) -> bool {
        match capability {
            DetectionCapability::ObjectDetection => true,
            DetectionCapability::Tracking => self.tracking,
        }
    }

    fn detect(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        Ok(self.scripted(frame.sequence))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Timestamp;

    #[test]
    fn scenario_walker_enters_and_leaves() -> Result<()> {
        let mut backend = StubBackend::new();
        let first = backend.detect(&Frame::blank(64, 48, 0, Timestamp(0)))?;
        assert_eq!(first.len(), 2);
        let gone = backend.detect(&Frame::blank(64, 48, 580, Timestamp(0)))?;
        assert_eq!(gone.len(), 1);
        assert_eq!(gone[0].track_id, Some(2));
        Ok(())
    }

    #[test]
    fn untracked_mode_omits_ids() -> Result<()> {
        let mut backend = StubBackend::without_tracking();
        assert!(!backend.supports(DetectionCapability::Tracking));
        let dets = backend.detect(&Frame::blank(64, 48, 10, Timestamp(0)))?;
        assert!(dets.iter().all(|d| d.track_id.is_none()));
        Ok(())
    }
}
