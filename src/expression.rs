//! Expression labels, classifier emotions and the shared expression selector
//!
//! The selector is the one piece of mutable state shared between the render
//! loop (reader), the soundboard (explicit writer) and the detector worker
//! (automatic writer). The detector's mode lives under the same lock as the
//! label, so an explicit selection and an automatic write never interleave.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::detector::state::{DetectorEvent, DetectorMode, DetectorState};

/// Mask names, one per image in the mask directory
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpressionLabel {
    Angry0,
    Angry1,
    Disgusted0,
    Fearful0,
    Happy0,
    Happy1,
    Happy2,
    Neutral0,
    Sad0,
    Surprised0,
    Surprised1,
}

impl ExpressionLabel {
    /// Every label, in the order the mask table reports them
    pub const ALL: [ExpressionLabel; 11] = [
        Self::Angry0,
        Self::Angry1,
        Self::Disgusted0,
        Self::Fearful0,
        Self::Happy0,
        Self::Happy1,
        Self::Happy2,
        Self::Neutral0,
        Self::Sad0,
        Self::Surprised0,
        Self::Surprised1,
    ];

    /// Fallback mask when a label has no image
    pub const NEUTRAL: ExpressionLabel = Self::Neutral0;

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Angry0 => "angry0",
            Self::Angry1 => "angry1",
            Self::Disgusted0 => "disgusted0",
            Self::Fearful0 => "fearful0",
            Self::Happy0 => "happy0",
            Self::Happy1 => "happy1",
            Self::Happy2 => "happy2",
            Self::Neutral0 => "neutral0",
            Self::Sad0 => "sad0",
            Self::Surprised0 => "surprised0",
            Self::Surprised1 => "surprised1",
        }
    }

    /// Image file name inside the mask directory
    pub fn file_name(&self) -> String {
        format!("{}.png", self.as_str())
    }
}

impl Default for ExpressionLabel {
    fn default() -> Self {
        Self::NEUTRAL
    }
}

impl fmt::Display for ExpressionLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExpressionLabel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|label| label.as_str() == wanted)
            .ok_or_else(|| format!("unknown expression label `{}`", s))
    }
}

/// Emotion classes reported by the expression classifier
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Emotion {
    Neutral,
    Happy,
    Sad,
    Angry,
    Fearful,
    Disgusted,
    Surprised,
}

impl Emotion {
    pub const ALL: [Emotion; 7] = [
        Self::Neutral,
        Self::Happy,
        Self::Sad,
        Self::Angry,
        Self::Fearful,
        Self::Disgusted,
        Self::Surprised,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Neutral => "neutral",
            Self::Happy => "happy",
            Self::Sad => "sad",
            Self::Angry => "angry",
            Self::Fearful => "fearful",
            Self::Disgusted => "disgusted",
            Self::Surprised => "surprised",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Emotion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-emotion confidence for one detected face
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct ExpressionScores {
    scores: [f32; 7],
}

impl ExpressionScores {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs(pairs: &[(Emotion, f32)]) -> Self {
        let mut scores = Self::new();
        for &(emotion, confidence) in pairs {
            scores.set(emotion, confidence);
        }
        scores
    }

    pub fn get(&self, emotion: Emotion) -> f32 {
        self.scores[emotion.index()]
    }

    pub fn set(&mut self, emotion: Emotion, confidence: f32) {
        self.scores[emotion.index()] = confidence.clamp(0.0, 1.0);
    }

    pub fn add(&mut self, emotion: Emotion, confidence: f32) {
        let total = self.get(emotion) + confidence;
        self.set(emotion, total);
    }

    pub fn iter(&self) -> impl Iterator<Item = (Emotion, f32)> + '_ {
        Emotion::ALL.iter().map(move |&e| (e, self.get(e)))
    }

    /// Highest-confidence emotion.
    ///
    /// Starts from `(Neutral, 0.0)` and only replaces on a strictly greater
    /// score, so ties keep the earlier emotion.
    pub fn top(&self) -> (Emotion, f32) {
        self.iter().fold((Emotion::Neutral, 0.0), |best, (emotion, confidence)| {
            if confidence > best.1 {
                (emotion, confidence)
            } else {
                best
            }
        })
    }
}

/// Map an emotion onto the first available label whose name contains it.
pub fn resolve_emotion(emotion: Emotion, available: &[ExpressionLabel]) -> Option<ExpressionLabel> {
    let needle = emotion.as_str();
    available
        .iter()
        .copied()
        .find(|label| label.as_str().contains(needle))
}

struct Selection {
    current: ExpressionLabel,
    mode: DetectorMode,
}

/// Shared handle to the current expression and the detector mode
#[derive(Clone)]
pub struct ExpressionSelector {
    inner: Arc<Mutex<Selection>>,
    revision: Arc<AtomicU64>,
}

impl ExpressionSelector {
    pub fn new(initial: ExpressionLabel) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Selection {
                current: initial,
                mode: DetectorMode::default(),
            })),
            revision: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Label the next render tick will draw
    pub fn current(&self) -> ExpressionLabel {
        self.inner.lock().current
    }

    /// Number of writes so far
    pub fn revision(&self) -> u64 {
        self.revision.load(Ordering::Acquire)
    }

    /// Explicit selection from the UI. Always wins, and switches automatic
    /// detection off until it is re-enabled.
    pub fn select_explicit(&self, label: ExpressionLabel) {
        let mut selection = self.inner.lock();
        let before = selection.mode.state();
        selection.mode = selection.mode.apply(DetectorEvent::ExplicitSelection);
        selection.current = label;
        self.revision.fetch_add(1, Ordering::AcqRel);

        if before == DetectorState::Running {
            log::info!("Explicit mask {} selected, mood detection disabled", label);
        } else {
            log::debug!("Explicit mask {} selected", label);
        }
    }

    /// Automatic write from the detector. Only lands while the detector is
    /// running and the label actually changes.
    pub fn apply_detected(&self, label: ExpressionLabel) -> bool {
        let mut selection = self.inner.lock();
        if selection.mode.state() != DetectorState::Running || selection.current == label {
            return false;
        }
        selection.current = label;
        self.revision.fetch_add(1, Ordering::AcqRel);
        true
    }

    pub fn detector_state(&self) -> DetectorState {
        self.inner.lock().mode.state()
    }

    pub fn detector_mode(&self) -> DetectorMode {
        self.inner.lock().mode
    }

    /// Feed a lifecycle event to the detector mode, returning the new state
    pub fn transition(&self, event: DetectorEvent) -> DetectorState {
        let mut selection = self.inner.lock();
        let before = selection.mode.state();
        selection.mode = selection.mode.apply(event);
        let after = selection.mode.state();
        if before != after {
            log::info!("Detector {:?} -> {:?} ({:?})", before, after, event);
        }
        after
    }
}

impl Default for ExpressionSelector {
    fn default() -> Self {
        Self::new(ExpressionLabel::NEUTRAL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn running_selector() -> ExpressionSelector {
        let selector = ExpressionSelector::default();
        selector.transition(DetectorEvent::Ready);
        selector.transition(DetectorEvent::Enable);
        assert_eq!(selector.detector_state(), DetectorState::Running);
        selector
    }

    #[test]
    fn test_label_names_round_trip() {
        for label in ExpressionLabel::ALL {
            assert_eq!(label.as_str().parse::<ExpressionLabel>(), Ok(label));
        }
        assert_eq!(ExpressionLabel::Happy2.file_name(), "happy2.png");
        assert!("grumpy0".parse::<ExpressionLabel>().is_err());
    }

    #[test]
    fn test_top_emotion_prefers_highest() {
        let scores = ExpressionScores::from_pairs(&[
            (Emotion::Happy, 0.7),
            (Emotion::Sad, 0.2),
            (Emotion::Neutral, 0.1),
        ]);
        assert_eq!(scores.top(), (Emotion::Happy, 0.7));
    }

    #[test]
    fn test_top_emotion_ties_keep_first() {
        let scores = ExpressionScores::from_pairs(&[(Emotion::Sad, 0.4), (Emotion::Angry, 0.4)]);
        assert_eq!(scores.top().0, Emotion::Sad);
        assert_eq!(ExpressionScores::new().top(), (Emotion::Neutral, 0.0));
    }

    #[test]
    fn test_resolve_emotion_substring_match() {
        let available = [
            ExpressionLabel::Angry0,
            ExpressionLabel::Happy1,
            ExpressionLabel::Happy2,
        ];
        assert_eq!(resolve_emotion(Emotion::Happy, &available), Some(ExpressionLabel::Happy1));
        assert_eq!(resolve_emotion(Emotion::Angry, &available), Some(ExpressionLabel::Angry0));
        assert_eq!(resolve_emotion(Emotion::Sad, &available), None);
    }

    #[test]
    fn test_resolve_emotion_is_pure() {
        let available = ExpressionLabel::ALL;
        let first = resolve_emotion(Emotion::Surprised, &available);
        let second = resolve_emotion(Emotion::Surprised, &available);
        assert_eq!(first, second);
        assert_eq!(first, Some(ExpressionLabel::Surprised0));
    }

    #[test]
    fn test_detected_writes_need_running_detector() {
        let selector = ExpressionSelector::default();
        assert!(!selector.apply_detected(ExpressionLabel::Happy0));
        assert_eq!(selector.current(), ExpressionLabel::Neutral0);

        let selector = running_selector();
        assert!(selector.apply_detected(ExpressionLabel::Happy0));
        assert_eq!(selector.current(), ExpressionLabel::Happy0);
    }

    #[test]
    fn test_detected_write_is_idempotent() {
        let selector = running_selector();
        assert!(selector.apply_detected(ExpressionLabel::Sad0));
        let revision = selector.revision();
        assert!(!selector.apply_detected(ExpressionLabel::Sad0));
        assert_eq!(selector.revision(), revision);
    }

    #[test]
    fn test_explicit_selection_overrides_and_suspends_detection() {
        let selector = running_selector();
        selector.apply_detected(ExpressionLabel::Happy0);

        selector.select_explicit(ExpressionLabel::Angry1);
        assert_eq!(selector.current(), ExpressionLabel::Angry1);
        assert_eq!(selector.detector_state(), DetectorState::Disabled);

        assert!(!selector.apply_detected(ExpressionLabel::Happy0));
        assert_eq!(selector.current(), ExpressionLabel::Angry1);

        selector.transition(DetectorEvent::Enable);
        assert!(selector.apply_detected(ExpressionLabel::Happy0));
    }
}
