use serde::{Deserialize, Serialize};

/// Bounding box in normalized `0..=1` frame coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct BBox {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl BBox {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// Box of normalized size `w` x `h` centred on `(cx, cy)`.
    pub fn centered(cx: f32, cy: f32, w: f32, h: f32) -> Self {
        Self {
            x1: cx - w / 2.0,
            y1: cy - h / 2.0,
            x2: cx + w / 2.0,
            y2: cy + h / 2.0,
        }
    }

    pub fn width(&self) -> f32 {
        self.x2 - self.x1
    }

    pub fn height(&self) -> f32 {
        self.y2 - self.y1
    }

    pub fn center(&self) -> (f32, f32) {
        ((self.x1 + self.x2) / 2.0, (self.y1 + self.y2) / 2.0)
    }
}

/// One object reported by the detector for the current frame.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub bbox: BBox,
    pub class_id: u32,
    pub confidence: f32,
    /// Stable id from the detector's tracker, when tracking is available.
    pub track_id: Option<u64>,
}

/// Output of the optional custom fall model.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FallSignal {
    pub fall_detected: bool,
    pub confidence: f32,
    pub bbox: Option<BBox>,
}
