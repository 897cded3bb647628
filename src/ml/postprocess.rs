//! Decoding of raw model outputs into face boxes and expression scores

use std::cmp::Ordering;

use crate::expression::{Emotion, ExpressionScores};

/// Axis-aligned face box in normalised frame coordinates (0..1)
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FaceBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl FaceBox {
    pub fn from_corners(x1: f32, y1: f32, x2: f32, y2: f32) -> Self {
        Self {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }

    /// Intersection over union with another box
    pub fn iou(&self, other: &Self) -> f32 {
        let x1 = self.x.max(other.x);
        let y1 = self.y.max(other.y);
        let x2 = (self.x + self.width).min(other.x + other.width);
        let y2 = (self.y + self.height).min(other.y + other.height);

        let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
        if intersection <= 0.0 {
            return 0.0;
        }

        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }

    /// Clip to the unit square
    pub fn clamped(&self) -> Self {
        let x1 = self.x.clamp(0.0, 1.0);
        let y1 = self.y.clamp(0.0, 1.0);
        let x2 = (self.x + self.width).clamp(0.0, 1.0);
        let y2 = (self.y + self.height).clamp(0.0, 1.0);
        Self::from_corners(x1, y1, x2, y2)
    }

    /// Pixel rectangle `(x, y, width, height)` for a frame of the given size
    pub fn to_pixels(&self, frame_width: u32, frame_height: u32) -> (f32, f32, f32, f32) {
        let w = frame_width as f32;
        let h = frame_height as f32;
        (self.x * w, self.y * h, self.width * w, self.height * h)
    }
}

/// Face box with its detector score
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub bbox: FaceBox,
    pub score: f32,
}

/// Decode UltraFace-style outputs: `scores` is N×2 (background, face),
/// `boxes` is N×4 normalised corners. Returns candidates best-first after NMS.
pub fn decode_faces(
    scores: &[f32],
    boxes: &[f32],
    score_threshold: f32,
    nms_threshold: f32,
) -> Vec<Candidate> {
    let count = (scores.len() / 2).min(boxes.len() / 4);
    let mut candidates = Vec::new();

    for i in 0..count {
        let score = scores[i * 2 + 1];
        if !score.is_finite() || score < score_threshold {
            continue;
        }

        let b = &boxes[i * 4..i * 4 + 4];
        let bbox = FaceBox::from_corners(b[0], b[1], b[2], b[3]).clamped();
        if bbox.width <= 0.0 || bbox.height <= 0.0 {
            continue;
        }

        candidates.push(Candidate { bbox, score });
    }

    candidates.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    if nms_threshold > 0.0 && candidates.len() > 1 {
        candidates = non_max_suppression(candidates, nms_threshold);
    }

    candidates
}

/// Greedy NMS over candidates sorted best-first
pub fn non_max_suppression(mut candidates: Vec<Candidate>, threshold: f32) -> Vec<Candidate> {
    let mut kept: Vec<Candidate> = Vec::with_capacity(candidates.len());
    for candidate in candidates.drain(..) {
        if kept.iter().all(|k| candidate.bbox.iou(&k.bbox) <= threshold) {
            kept.push(candidate);
        }
    }
    kept
}

pub fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&v| (v - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    if sum <= 0.0 || !sum.is_finite() {
        return vec![0.0; logits.len()];
    }
    exps.into_iter().map(|v| v / sum).collect()
}

/// Classifier output order
const CLASSIFIER_CLASSES: [Emotion; 8] = [
    Emotion::Neutral,
    Emotion::Happy,
    Emotion::Surprised,
    Emotion::Sad,
    Emotion::Angry,
    Emotion::Disgusted,
    Emotion::Fearful,
    // contempt has no mask of its own
    Emotion::Disgusted,
];

/// Turn the eight classifier logits into per-emotion probabilities
pub fn expression_scores(logits: &[f32]) -> ExpressionScores {
    let probabilities = softmax(logits);
    let mut scores = ExpressionScores::new();
    for (emotion, p) in CLASSIFIER_CLASSES.iter().zip(probabilities) {
        scores.add(*emotion, p);
    }
    scores
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iou() {
        let a = FaceBox { x: 0.0, y: 0.0, width: 0.5, height: 0.5 };
        let b = FaceBox { x: 0.25, y: 0.0, width: 0.5, height: 0.5 };
        let iou = a.iou(&b);
        assert!((iou - 1.0 / 3.0).abs() < 1e-5);

        let far = FaceBox { x: 0.8, y: 0.8, width: 0.1, height: 0.1 };
        assert_eq!(a.iou(&far), 0.0);
    }

    #[test]
    fn test_decode_filters_sorts_and_suppresses() {
        let scores = [
            0.9, 0.1, // background
            0.2, 0.8, // face
            0.05, 0.95, // overlapping face, higher score
            0.3, 0.7, // separate face
        ];
        let boxes = [
            0.0, 0.0, 0.1, 0.1, //
            0.1, 0.1, 0.5, 0.5, //
            0.11, 0.1, 0.51, 0.5, //
            0.6, 0.6, 0.9, 0.9, //
        ];

        let faces = decode_faces(&scores, &boxes, 0.6, 0.3);
        assert_eq!(faces.len(), 2);
        assert!((faces[0].score - 0.95).abs() < 1e-6);
        assert!((faces[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_decode_clamps_boxes() {
        let faces = decode_faces(&[0.0, 1.0], &[-0.2, 0.5, 0.4, 1.3], 0.5, 0.3);
        let bbox = faces[0].bbox;
        assert_eq!(bbox.x, 0.0);
        assert!((bbox.height - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_softmax_sums_to_one() {
        let p = softmax(&[1.0, 2.0, 3.0]);
        let sum: f32 = p.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(p[2] > p[1] && p[1] > p[0]);
    }

    #[test]
    fn test_contempt_folds_into_disgusted() {
        let logits = [0.0, 0.0, 0.0, 0.0, 0.0, 5.0, 0.0, 5.0];
        let scores = expression_scores(&logits);
        assert_eq!(scores.top().0, Emotion::Disgusted);
        assert!(scores.get(Emotion::Disgusted) > 0.9);
    }
}
