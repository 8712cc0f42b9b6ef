//! Decoding for single-head YOLO detection outputs.
//!
//! The model emits one `[4 + classes, anchors]` tensor per image: rows 0..4
//! hold `cx, cy, w, h` in input pixels, the remaining rows hold per-class
//! scores. Decoded boxes are normalized to the model input and suppressed
//! per class.

use crate::detect::result::{BBox, Detection};

pub const DEFAULT_IOU_THRESHOLD: f32 = 0.45;

/// Decode a row-major `[4 + classes, anchors]` output.
///
/// Returns an empty list when the buffer does not match the shape.
pub fn decode(
    output: &[f32],
    classes: usize,
    anchors: usize,
    input_size: u32,
    min_confidence: f32,
) -> Vec<Detection> {
    if classes == 0 || output.len() != (4 + classes) * anchors {
        return Vec::new();
    }
    let at = |row: usize, anchor: usize| output[row * anchors + anchor];
    let scale = input_size.max(1) as f32;

    let mut candidates = Vec::new();
    for anchor in 0..anchors {
        let (class_id, confidence) = (0..classes)
            .map(|c| (c, at(4 + c, anchor)))
            .fold((0, f32::NEG_INFINITY), |best, cur| if cur.1 > best.1 { cur } else { best });
        if !confidence.is_finite() || confidence < min_confidence {
            continue;
        }
        let (cx, cy, w, h) = (at(0, anchor), at(1, anchor), at(2, anchor), at(3, anchor));
        let bbox = BBox::new(
            ((cx - w / 2.0) / scale).clamp(0.0, 1.0),
            ((cy - h / 2.0) / scale).clamp(0.0, 1.0),
            ((cx + w / 2.0) / scale).clamp(0.0, 1.0),
            ((cy + h / 2.0) / scale).clamp(0.0, 1.0),
        );
        if bbox.width() <= 0.0 || bbox.height() <= 0.0 {
            continue;
        }
        candidates.push(Detection {
            bbox,
            class_id: class_id as u32,
            confidence,
            track_id: None,
        });
    }
    suppress(candidates, DEFAULT_IOU_THRESHOLD)
}

/// Greedy non-maximum suppression, per class.
pub fn suppress(mut candidates: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    candidates.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    let mut kept: Vec<Detection> = Vec::new();
    for det in candidates {
        let overlaps = kept
            .iter()
            .any(|k| k.class_id == det.class_id && iou(&k.bbox, &det.bbox) > iou_threshold);
        if !overlaps {
            kept.push(det);
        }
    }
    kept
}

fn iou(a: &BBox, b: &BBox) -> f32 {
    let w = (a.x2.min(b.x2) - a.x1.max(b.x1)).max(0.0);
    let h = (a.y2.min(b.y2) - a.y1.max(b.y1)).max(0.0);
    let inter = w * h;
    let union = a.width() * a.height() + b.width() * b.height() - inter;
    if union <= 0.0 {
        0.0
    } else {
        inter / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lay out `(cx, cy, w, h, scores)` anchors as a `[4 + classes, anchors]` buffer.
    fn tensor(anchors: &[(f32, f32, f32, f32, Vec<f32>)]) -> Vec<f32> {
        let classes = anchors[0].4.len();
        let n = anchors.len();
        let mut out = vec![0.0; (4 + classes) * n];
        for (i, (cx, cy, w, h, scores)) in anchors.iter().enumerate() {
            out[i] = *cx;
            out[n + i] = *cy;
            out[2 * n + i] = *w;
            out[3 * n + i] = *h;
            for (c, s) in scores.iter().enumerate() {
                out[(4 + c) * n + i] = *s;
            }
        }
        out
    }

    #[test]
    fn decodes_and_normalizes_boxes() {
        let out = tensor(&[
            (320.0, 320.0, 64.0, 128.0, vec![0.9, 0.1]),
            (100.0, 100.0, 20.0, 20.0, vec![0.05, 0.2]),
        ]);
        let dets = decode(&out, 2, 2, 640, 0.4);
        assert_eq!(dets.len(), 1);
        assert_eq!(dets[0].class_id, 0);
        assert_eq!(dets[0].track_id, None);
        assert_eq!(dets[0].bbox, BBox::new(0.45, 0.4, 0.55, 0.6));
    }

    #[test]
    fn overlapping_boxes_of_one_class_collapse() {
        let out = tensor(&[
            (320.0, 320.0, 100.0, 200.0, vec![0.7, 0.0]),
            (324.0, 322.0, 100.0, 200.0, vec![0.9, 0.0]),
            (322.0, 320.0, 100.0, 200.0, vec![0.0, 0.8]),
        ]);
        let dets = decode(&out, 2, 3, 640, 0.4);
        assert_eq!(dets.len(), 2);
        assert_eq!((dets[0].class_id, dets[0].confidence), (0, 0.9));
        assert_eq!((dets[1].class_id, dets[1].confidence), (1, 0.8));
    }

    #[test]
    fn mismatched_buffer_decodes_to_nothing() {
        assert!(decode(&[0.0; 10], 2, 3, 640, 0.1).is_empty());
    }
}
