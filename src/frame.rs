//! Video frames and the annotation overlay.
//!
//! - `Frame`: one decoded RGB frame plus its capture metadata.
//! - `Overlay`: what gets drawn on the frame before publishing.
//!
//! Frames are produced by the ingestion layer, read by the detector,
//! annotated once per cycle and then shared (read-only) by every publisher
//! output.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;

use crate::detect::BBox;
use crate::zone::{Zone, ZoneKind};
use crate::Timestamp;

const COUNT_ZONE_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const DWELL_ZONE_COLOR: Rgb<u8> = Rgb([0, 0, 255]);
const PERSON_COLOR: Rgb<u8> = Rgb([255, 220, 0]);
const FLAGGED_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const BANNER_HEIGHT_PX: u32 = 12;

#[derive(Clone, Debug)]
pub struct Frame {
    pub image: RgbImage,
    /// Monotonic per-source frame counter.
    pub sequence: u64,
    pub captured_at: Timestamp,
}

impl Frame {
    pub fn new(image: RgbImage, sequence: u64, captured_at: Timestamp) -> Self {
        Self {
            image,
            sequence,
            captured_at,
        }
    }

    pub fn from_rgb(
        pixels: Vec<u8>,
        width: u32,
        height: u32,
        sequence: u64,
        captured_at: Timestamp,
    ) -> Result<Self> {
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("pixel buffer does not match {}x{} RGB", width, height))?;
        Ok(Self::new(image, sequence, captured_at))
    }

    pub fn blank(width: u32, height: u32, sequence: u64, captured_at: Timestamp) -> Self {
        Self::new(RgbImage::new(width, height), sequence, captured_at)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Packed RGB24 bytes, row-major, no padding.
    pub fn as_rgb_bytes(&self) -> &[u8] {
        self.image.as_raw()
    }

    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.as_rgb_bytes().len() / 8);
        JpegEncoder::new_with_quality(&mut out, quality)
            .encode_image(&self.image)
            .context("encode frame as JPEG")?;
        Ok(out)
    }
}

/// Boxes and flags to draw on one frame.
#[derive(Clone, Debug, Default)]
pub struct Overlay {
    pub persons: Vec<(BBox, bool)>,
    pub alert_active: bool,
}

/// Draw zone outlines, person boxes and the alert banner onto a copy of `frame`.
pub fn annotate(frame: &Frame, zones: &[Zone], overlay: &Overlay) -> Frame {
    let mut out = frame.clone();
    let (w, h) = (out.width(), out.height());
    if w == 0 || h == 0 {
        return out;
    }

    for zone in zones {
        let color = match zone.kind {
            ZoneKind::Count => COUNT_ZONE_COLOR,
            ZoneKind::Dwell => DWELL_ZONE_COLOR,
        };
        let r = &zone.rect;
        if let Some(rect) = to_pixel_rect(r.x1, r.y1, r.x2, r.y2, w, h) {
            draw_hollow_rect_mut(&mut out.image, rect, color);
        }
    }

    for (bbox, flagged) in &overlay.persons {
        let color = if *flagged { FLAGGED_COLOR } else { PERSON_COLOR };
        if let Some(rect) = to_pixel_rect(bbox.x1, bbox.y1, bbox.x2, bbox.y2, w, h) {
            draw_hollow_rect_mut(&mut out.image, rect, color);
        }
    }

    if overlay.alert_active {
        let banner = Rect::at(0, 0).of_size(w, BANNER_HEIGHT_PX.min(h));
        draw_filled_rect_mut(&mut out.image, banner, FLAGGED_COLOR);
    }

    out
}

fn to_pixel_rect(x1: f32, y1: f32, x2: f32, y2: f32, w: u32, h: u32) -> Option<Rect> {
    let clamp = |v: f32| v.clamp(0.0, 1.0);
    let px1 = (clamp(x1) * w as f32) as i32;
    let py1 = (clamp(y1) * h as f32) as i32;
    let px2 = (clamp(x2) * w as f32) as i32;
    let py2 = (clamp(y2) * h as f32) as i32;
    let rw = px2.saturating_sub(px1);
    let rh = py2.saturating_sub(py1);
    if rw <= 0 || rh <= 0 {
        return None;
    }
    Some(Rect::at(px1, py1).of_size(rw as u32, rh as u32))
}
