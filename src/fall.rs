//! Per-frame fall arbitration.
//!
//! A custom fall model, when present and confident enough, decides alone.
//! Otherwise a geometric heuristic flags any person box that is wider than
//! tall (in pixels) and centred in the lower half of the frame. Nothing is
//! carried between frames: one ambiguous frame can raise a fall and the next
//! can retract it.

use serde::Serialize;

use crate::detect::{BBox, Detection, FallSignal};

pub const DEFAULT_ASPECT_RATIO_MAX: f32 = 0.7;
pub const DEFAULT_MODEL_CONFIDENCE_FLOOR: f32 = 0.4;

#[derive(Clone, Copy, Debug)]
pub struct FallSettings {
    pub enabled: bool,
    /// Minimum model confidence for a model-reported fall to count.
    pub model_confidence_floor: f32,
    /// Height/width below which a person box counts as lying down.
    pub aspect_ratio_max: f32,
}

impl Default for FallSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            model_confidence_floor: DEFAULT_MODEL_CONFIDENCE_FLOOR,
            aspect_ratio_max: DEFAULT_ASPECT_RATIO_MAX,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FallSource {
    Model,
    Heuristic,
}

impl FallSource {
    pub fn as_str(self) -> &'static str {
        match self {
            FallSource::Model => "model",
            FallSource::Heuristic => "heuristic",
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct FallVerdict {
    pub fall_detected: bool,
    pub confidence: f32,
    pub source: Option<FallSource>,
    pub bbox: Option<BBox>,
}

#[derive(Clone, Debug, Default)]
pub struct FallArbiter {
    settings: FallSettings,
}

impl FallArbiter {
    pub fn new(settings: FallSettings) -> Self {
        Self { settings }
    }

    /// Decide fall / no-fall for one frame.
    ///
    /// `persons` must already be filtered to person detections. Geometry is
    /// evaluated in pixels, so the frame size is needed to undo normalization.
    pub fn evaluate(
        &self,
        persons: &[Detection],
        model: Option<&FallSignal>,
        frame_width: u32,
        frame_height: u32,
    ) -> FallVerdict {
        if !self.settings.enabled {
            return FallVerdict::default();
        }

        if let Some(signal) = model {
            if signal.fall_detected && signal.confidence >= self.settings.model_confidence_floor {
                log::info!("fall detected source=model confidence={:.2}", signal.confidence);
                return FallVerdict {
                    fall_detected: true,
                    confidence: signal.confidence,
                    source: Some(FallSource::Model),
                    bbox: signal.bbox,
                };
            }
        }

        let (fw, fh) = (frame_width as f32, frame_height as f32);
        let best = persons
            .iter()
            .filter(|d| self.looks_fallen(&d.bbox, fw, fh))
            .max_by(|a, b| a.confidence.total_cmp(&b.confidence));

        match best {
            Some(det) => {
                log::info!("fall detected source=heuristic confidence={:.2}", det.confidence);
                FallVerdict {
                    fall_detected: true,
                    confidence: det.confidence,
                    source: Some(FallSource::Heuristic),
                    bbox: Some(det.bbox),
                }
            }
            None => FallVerdict::default(),
        }
    }

    fn looks_fallen(&self, bbox: &BBox, fw: f32, fh: f32) -> bool {
        let width = bbox.width() * fw;
        let height = bbox.height() * fh;
        if width <= 0.0 {
            return false;
        }
        let aspect_ratio = height / width;
        let (_, cy) = bbox.center();
        aspect_ratio < self.settings.aspect_ratio_max && cy * fh > fh / 2.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const W: u32 = 1000;
    const H: u32 = 1000;

    /// Person box with the given pixel aspect ratio (h/w) centred at `cy`.
    fn person(aspect: f32, cy: f32) -> Detection {
        let w = 0.2;
        Detection {
            bbox: BBox::centered(0.5, cy, w, w * aspect),
            class_id: 0,
            confidence: 0.8,
            track_id: None,
        }
    }

    #[test]
    fn wide_box_low_in_frame_is_a_fall() {
        let arbiter = FallArbiter::default();
        let v = arbiter.evaluate(&[person(0.5, 0.9)], None, W, H);
        assert!(v.fall_detected);
        assert_eq!(v.source, Some(FallSource::Heuristic));
    }

    #[test]
    fn tall_box_is_never_a_fall() {
        let arbiter = FallArbiter::default();
        for cy in [0.1, 0.5, 0.9] {
            let v = arbiter.evaluate(&[person(1.5, cy)], None, W, H);
            assert!(!v.fall_detected, "cy={cy}");
        }
    }

    #[test]
    fn wide_box_in_upper_half_is_not_a_fall() {
        let arbiter = FallArbiter::default();
        assert!(!arbiter.evaluate(&[person(0.5, 0.3)], None, W, H).fall_detected);
    }

    #[test]
    fn aspect_ratio_uses_pixel_geometry() {
        // Normalized 0.2 x 0.2 square in a 16:9 frame is 256x144 px: wide.
        let arbiter = FallArbiter::default();
        let det = Detection {
            bbox: BBox::centered(0.5, 0.8, 0.2, 0.2),
            class_id: 0,
            confidence: 0.7,
            track_id: None,
        };
        assert!(arbiter.evaluate(&[det.clone()], None, 1280, 720).fall_detected);
        assert!(!arbiter.evaluate(&[det], None, 720, 1280).fall_detected);
    }

    #[test]
    fn zero_width_boxes_are_skipped() {
        let arbiter = FallArbiter::default();
        let det = Detection {
            bbox: BBox::new(0.5, 0.8, 0.5, 0.9),
            class_id: 0,
            confidence: 0.9,
            track_id: None,
        };
        assert!(!arbiter.evaluate(&[det], None, W, H).fall_detected);
    }

    #[test]
    fn confident_model_overrides_heuristic() {
        let arbiter = FallArbiter::default();
        let signal = FallSignal {
            fall_detected: true,
            confidence: 0.9,
            bbox: None,
        };
        let v = arbiter.evaluate(&[person(1.5, 0.5)], Some(&signal), W, H);
        assert!(v.fall_detected);
        assert_eq!(v.source, Some(FallSource::Model));
    }

    #[test]
    fn weak_model_signal_falls_back_to_heuristic() {
        let arbiter = FallArbiter::default();
        let weak = FallSignal {
            fall_detected: true,
            confidence: 0.1,
            bbox: None,
        };
        assert!(!arbiter.evaluate(&[person(1.5, 0.5)], Some(&weak), W, H).fall_detected);
        let v = arbiter.evaluate(&[person(0.5, 0.9)], Some(&weak), W, H);
        assert_eq!(v.source, Some(FallSource::Heuristic));
    }

    #[test]
    fn disabled_arbiter_never_flags() {
        let arbiter = FallArbiter::new(FallSettings {
            enabled: false,
            ..FallSettings::default()
        });
        assert!(!arbiter.evaluate(&[person(0.5, 0.9)], None, W, H).fall_detected);
    }

    #[test]
    fn evaluation_is_stateless() {
        let arbiter = FallArbiter::default();
        assert!(arbiter.evaluate(&[person(0.5, 0.9)], None, W, H).fall_detected);
        assert!(!arbiter.evaluate(&[person(1.5, 0.9)], None, W, H).fall_detected);
        assert!(!arbiter.evaluate(&[], None, W, H).fall_detected);
    }
}
