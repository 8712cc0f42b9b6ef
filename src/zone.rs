//! Named rectangular zones in normalized frame coordinates.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::OnceLock;

/// Axis-aligned rectangle in normalized `0..=1` coordinates.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct NormRect {
    pub x1: f32,
    pub y1: f32,
    pub x2: f32,
    pub y2: f32,
}

impl NormRect {
    pub fn new(x1: f32, y1: f32, x2: f32, y2: f32) -> Result<Self> {
        let rect = Self { x1, y1, x2, y2 };
        rect.validate()?;
        Ok(rect)
    }

    pub fn validate(&self) -> Result<()> {
        for (name, v) in [("x1", self.x1), ("y1", self.y1), ("x2", self.x2), ("y2", self.y2)] {
            if !v.is_finite() || !(0.0..=1.0).contains(&v) {
                return Err(anyhow!("zone rect {} = {} is outside [0, 1]", name, v));
            }
        }
        if self.x1 >= self.x2 {
            return Err(anyhow!("zone rect requires x1 < x2 (got {} >= {})", self.x1, self.x2));
        }
        if self.y1 >= self.y2 {
            return Err(anyhow!("zone rect requires y1 < y2 (got {} >= {})", self.y1, self.y2));
        }
        Ok(())
    }

    /// Inclusive containment on all four edges.
    pub fn contains(&self, px: f32, py: f32) -> bool {
        self.x1 <= px && px <= self.x2 && self.y1 <= py && py <= self.y2
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ZoneKind {
    /// Occupancy counting only.
    Count,
    /// Occupancy counting plus per-identity dwell-time alerts.
    Dwell,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: String,
    pub name: String,
    pub rect: NormRect,
    pub kind: ZoneKind,
}

impl Zone {
    pub fn is_dwell_monitored(&self) -> bool {
        self.kind == ZoneKind::Dwell
    }
}

pub fn validate_zone_id(zone_id: &str) -> Result<()> {
    static ZONE_ID_RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = ZONE_ID_RE.get_or_init(|| {
        regex::Regex::new(r"^[a-z0-9_-]{1,64}$").expect("zone id pattern is valid")
    });
    if !re.is_match(zone_id) {
        return Err(anyhow!(
            "zone id '{}' must match ^[a-z0-9_-]{{1,64}}$",
            zone_id
        ));
    }
    Ok(())
}

/// Immutable set of zones loaded at startup.
#[derive(Clone, Debug)]
pub struct ZoneRegistry {
    zones: Vec<Zone>,
}

impl ZoneRegistry {
    /// Validate and freeze a zone list. Any invalid zone rejects the whole set.
    pub fn new(zones: Vec<Zone>) -> Result<Self> {
        if zones.is_empty() {
            return Err(anyhow!("at least one zone must be configured"));
        }
        let mut seen = HashSet::new();
        for zone in &zones {
            validate_zone_id(&zone.id)?;
            zone.rect
                .validate()
                .map_err(|e| anyhow!("zone '{}': {}", zone.id, e))?;
            if !seen.insert(zone.id.as_str()) {
                return Err(anyhow!("duplicate zone id '{}'", zone.id));
            }
        }
        Ok(Self { zones })
    }

    /// All zones containing the point, in configuration order.
    pub fn classify(&self, px: f32, py: f32) -> Vec<&str> {
        self.zones
            .iter()
            .filter(|z| z.rect.contains(px, py))
            .map(|z| z.id.as_str())
            .collect()
    }

    pub fn zones(&self) -> &[Zone] {
        &self.zones
    }

    pub fn get(&self, id: &str) -> Option<&Zone> {
        self.zones.iter().find(|z| z.id == id)
    }

    pub fn dwell_zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter().filter(|z| z.is_dwell_monitored())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zone(id: &str, x1: f32, y1: f32, x2: f32, y2: f32, kind: ZoneKind) -> Zone {
        Zone {
            id: id.to_string(),
            name: id.to_string(),
            rect: NormRect { x1, y1, x2, y2 },
            kind,
        }
    }

    #[test]
    fn boundaries_are_inclusive() -> Result<()> {
        let reg = ZoneRegistry::new(vec![zone("bath", 0.6, 0.0, 1.0, 1.0, ZoneKind::Dwell)])?;
        assert_eq!(reg.classify(0.6, 0.0), vec!["bath"]);
        assert_eq!(reg.classify(1.0, 1.0), vec!["bath"]);
        assert!(reg.classify(0.599, 0.5).is_empty());
        Ok(())
    }

    #[test]
    fn overlapping_zones_all_match() -> Result<()> {
        let reg = ZoneRegistry::new(vec![
            zone("room", 0.0, 0.0, 1.0, 1.0, ZoneKind::Count),
            zone("bath", 0.6, 0.0, 1.0, 1.0, ZoneKind::Dwell),
        ])?;
        assert_eq!(reg.classify(0.8, 0.5), vec!["room", "bath"]);
        assert_eq!(reg.classify(0.2, 0.5), vec!["room"]);
        Ok(())
    }

    #[test]
    fn classify_matches_rect_containment_on_a_grid() -> Result<()> {
        let rect = NormRect::new(0.25, 0.3, 0.75, 0.6)?;
        let reg = ZoneRegistry::new(vec![Zone {
            id: "z".into(),
            name: "z".into(),
            rect,
            kind: ZoneKind::Count,
        }])?;
        for i in 0..=20 {
            for j in 0..=20 {
                let (px, py) = (i as f32 / 20.0, j as f32 / 20.0);
                let expected = px >= 0.25 && px <= 0.75 && py >= 0.3 && py <= 0.6;
                assert_eq!(reg.classify(px, py).contains(&"z"), expected, "({px}, {py})");
            }
        }
        Ok(())
    }

    #[test]
    fn rejects_degenerate_and_out_of_range_rects() {
        assert!(NormRect::new(0.5, 0.0, 0.5, 1.0).is_err());
        assert!(NormRect::new(0.0, 0.7, 1.0, 0.2).is_err());
        assert!(NormRect::new(-0.1, 0.0, 1.0, 1.0).is_err());
        assert!(NormRect::new(0.0, 0.0, 1.2, 1.0).is_err());
        assert!(NormRect::new(0.0, 0.0, f32::NAN, 1.0).is_err());
    }

    #[test]
    fn rejects_duplicate_and_malformed_ids() {
        let dup = ZoneRegistry::new(vec![
            zone("room", 0.0, 0.0, 1.0, 1.0, ZoneKind::Count),
            zone("room", 0.0, 0.0, 0.5, 0.5, ZoneKind::Count),
        ]);
        assert!(dup.is_err());
        assert!(ZoneRegistry::new(vec![zone("Bad Id", 0.0, 0.0, 1.0, 1.0, ZoneKind::Count)]).is_err());
        assert!(ZoneRegistry::new(vec![]).is_err());
    }
}
