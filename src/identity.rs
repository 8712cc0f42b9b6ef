//! Per-frame identity resolution.
//!
//! With a tracker, identity is the detector's `track_id`, namespaced by the
//! source it came from so two cameras never share a track. Without one, the
//! identity is a pseudo-id: the bbox top-left corner quantized to a coarse
//! pixel grid. Pseudo-ids are imprecise on purpose and match the alerting
//! behaviour of the deployed system:
//! - two people in the same grid cell across frames merge into one identity
//! - one person drifting across a cell edge splits into two identities

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::detect::Detection;

pub const DEFAULT_GRID_PX: u32 = 10;

#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum Identity {
    /// Stable id supplied by the detector's tracker, scoped to `source`.
    Tracked { source: String, id: u64 },
    /// Grid cell of the bbox top-left corner.
    Pseudo { col: i64, row: i64 },
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Identity::Tracked { source, id } if source.is_empty() => write!(f, "track:{}", id),
            Identity::Tracked { source, id } => write!(f, "{}/track:{}", source, id),
            Identity::Pseudo { col, row } => write!(f, "temp_{}_{}", col, row),
        }
    }
}

impl Identity {
    pub fn tracked(source: &str, id: u64) -> Self {
        Identity::Tracked {
            source: source.to_string(),
            id,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TrackIdentity {
    tracking_enabled: bool,
    grid_px: u32,
    source: String,
}

impl TrackIdentity {
    pub fn new(tracking_enabled: bool, grid_px: u32) -> Self {
        Self {
            tracking_enabled,
            grid_px: grid_px.max(1),
            source: String::new(),
        }
    }

    /// Namespace tracked ids with `source`.
    pub fn for_source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    pub fn tracking_enabled(&self) -> bool {
        self.tracking_enabled
    }

    /// Fall back to pseudo-ids regardless of what detections carry.
    pub fn without_tracking(mut self) -> Self {
        self.tracking_enabled = false;
        self
    }

    /// Resolve a detection in a `frame_width` x `frame_height` frame.
    pub fn resolve(&self, detection: &Detection, frame_width: u32, frame_height: u32) -> Identity {
        if self.tracking_enabled {
            if let Some(id) = detection.track_id {
                return Identity::tracked(&self.source, id);
            }
        }
        let grid = self.grid_px as f64;
        let x1_px = detection.bbox.x1 as f64 * frame_width as f64;
        let y1_px = detection.bbox.y1 as f64 * frame_height as f64;
        Identity::Pseudo {
            col: (x1_px / grid).floor() as i64,
            row: (y1_px / grid).floor() as i64,
        }
    }
}

impl Default for TrackIdentity {
    fn default() -> Self {
        Self::new(true, DEFAULT_GRID_PX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::BBox;

    fn det(x1: f32, y1: f32, track_id: Option<u64>) -> Detection {
        Detection {
            bbox: BBox::new(x1, y1, x1 + 0.1, y1 + 0.2),
            class_id: 0,
            confidence: 0.9,
            track_id,
        }
    }

    #[test]
    fn track_id_wins_when_present() {
        let ids = TrackIdentity::default();
        assert_eq!(ids.resolve(&det(0.1, 0.1, Some(7)), 1000, 1000), Identity::tracked("", 7));
    }

    #[test]
    fn pseudo_id_quantizes_top_left_corner() {
        let ids = TrackIdentity::default();
        // 0.123 * 1000 = 123px -> cell 12; 0.456 * 1000 = 456px -> cell 45
        assert_eq!(
            ids.resolve(&det(0.123, 0.456, None), 1000, 1000),
            Identity::Pseudo { col: 12, row: 45 }
        );
    }

    #[test]
    fn tracking_disabled_ignores_track_ids() {
        let ids = TrackIdentity::new(false, 10);
        assert!(matches!(
            ids.resolve(&det(0.5, 0.5, Some(3)), 100, 100),
            Identity::Pseudo { .. }
        ));
    }

    #[test]
    fn pseudo_ids_merge_within_a_cell_and_split_across_edges() {
        let ids = TrackIdentity::default();
        // Two different people 4px apart inside one 10px cell merge.
        let a = ids.resolve(&det(0.201, 0.3, None), 1000, 1000);
        let b = ids.resolve(&det(0.205, 0.3, None), 1000, 1000);
        assert_eq!(a, b);
        // The same person moving 2px across a cell edge splits.
        let before = ids.resolve(&det(0.209, 0.3, None), 1000, 1000);
        let after = ids.resolve(&det(0.211, 0.3, None), 1000, 1000);
        assert_ne!(before, after);
    }

    #[test]
    fn track_ids_are_scoped_to_their_source() {
        let ward = TrackIdentity::default().for_source("ward-3");
        let hall = TrackIdentity::default().for_source("hall");
        let a = ward.resolve(&det(0.1, 0.1, Some(7)), 100, 100);
        let b = hall.resolve(&det(0.1, 0.1, Some(7)), 100, 100);
        assert_ne!(a, b);
        assert_eq!(a.to_string(), "ward-3/track:7");
    }

    #[test]
    fn display_is_stable() {
        assert_eq!(Identity::tracked("", 4).to_string(), "track:4");
        assert_eq!(Identity::tracked("ward-3", 4).to_string(), "ward-3/track:4");
        assert_eq!(Identity::Pseudo { col: 1, row: 2 }.to_string(), "temp_1_2");
    }
}
