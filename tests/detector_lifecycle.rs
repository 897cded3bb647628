use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use mood_mask::assets::MaskTable;
use mood_mask::camera::{CameraCapture, CameraFrame, CaptureStatus, FrameFeed, FrameSource, RawFrame};
use mood_mask::detector::{Detector, DetectorConfig, DetectorEvent, DetectorState, FaceTracker};
use mood_mask::expression::ExpressionScores;
use mood_mask::ml::{FaceAnalyzer, FaceBox, FaceDetection};
use mood_mask::{Emotion, ExpressionLabel, ExpressionSelector, MoodMaskError, Result};

const TIMEOUT: Duration = Duration::from_secs(5);

/// Feed that hands out the same frame while `live` is set
struct StillFeed {
    live: AtomicBool,
}

impl StillFeed {
    fn new(live: bool) -> Arc<Self> {
        Arc::new(Self {
            live: AtomicBool::new(live),
        })
    }
}

impl FrameFeed for StillFeed {
    fn playable_frame(&self) -> Option<CameraFrame> {
        self.live.load(Ordering::Acquire).then(|| CameraFrame {
            data: vec![0; 8 * 8 * 4],
            width: 8,
            height: 8,
            frame_number: 0,
            timestamp: Instant::now(),
        })
    }
}

/// Camera that can never be opened
struct NoCamera;

impl FrameSource for NoCamera {
    fn name(&self) -> String {
        "none".to_string()
    }

    fn next_frame(&mut self) -> Result<RawFrame> {
        Err(MoodMaskError::camera("no device"))
    }

    fn stop(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Always sees one face wearing the same expression
struct SteadyFace {
    emotion: Emotion,
    confidence: f32,
}

impl FaceAnalyzer for SteadyFace {
    fn analyze(&mut self, _frame: &CameraFrame) -> Result<Vec<FaceDetection>> {
        Ok(vec![FaceDetection {
            bbox: FaceBox {
                x: 0.25,
                y: 0.25,
                width: 0.5,
                height: 0.5,
            },
            score: 0.95,
            expressions: ExpressionScores::from_pairs(&[(self.emotion, self.confidence)]),
        }])
    }
}

fn all_masks() -> MaskTable {
    let table = MaskTable::new();
    for label in ExpressionLabel::ALL {
        table.insert(label, image::RgbaImage::new(2, 2));
    }
    table
}

fn fast_config() -> DetectorConfig {
    DetectorConfig {
        interval: Duration::from_millis(10),
        ..DetectorConfig::default()
    }
}

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + TIMEOUT;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn spawn_happy(feed: Arc<StillFeed>, selector: &ExpressionSelector, tracker: &FaceTracker) -> Detector {
    Detector::spawn(
        || {
            Ok(SteadyFace {
                emotion: Emotion::Happy,
                confidence: 0.9,
            })
        },
        feed,
        all_masks(),
        selector.clone(),
        tracker.clone(),
        fast_config(),
    )
    .unwrap()
}

#[test]
fn detector_arms_then_switches_masks_once_enabled() {
    let selector = ExpressionSelector::default();
    let tracker = FaceTracker::new();
    let detector = spawn_happy(StillFeed::new(true), &selector, &tracker);

    assert!(wait_until(|| detector.state() == DetectorState::Armed));

    // Armed only tracks the face
    assert!(wait_until(|| tracker.latest().is_some()));
    assert_eq!(selector.current(), ExpressionLabel::Neutral0);

    assert_eq!(detector.set_mood_detection(true), DetectorState::Running);
    assert!(wait_until(|| selector.current() == ExpressionLabel::Happy0));
}

#[test]
fn enable_before_ready_is_remembered() {
    let selector = ExpressionSelector::default();
    let tracker = FaceTracker::new();
    let feed = StillFeed::new(false);
    let detector = spawn_happy(feed.clone(), &selector, &tracker);

    assert_eq!(detector.set_mood_detection(true), DetectorState::Disabled);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(detector.ticks(), 0);
    assert_eq!(selector.current(), ExpressionLabel::Neutral0);

    feed.live.store(true, Ordering::Release);
    assert!(wait_until(|| detector.state() == DetectorState::Running));
    assert!(wait_until(|| selector.current() == ExpressionLabel::Happy0));
}

#[test]
fn explicit_selection_wins_over_detection() {
    let selector = ExpressionSelector::default();
    let tracker = FaceTracker::new();
    let detector = spawn_happy(StillFeed::new(true), &selector, &tracker);

    assert!(wait_until(|| detector.state() == DetectorState::Armed));
    detector.set_mood_detection(true);
    assert!(wait_until(|| selector.current() == ExpressionLabel::Happy0));

    selector.select_explicit(ExpressionLabel::Sad0);
    assert_eq!(detector.state(), DetectorState::Disabled);

    let ticks = detector.ticks();
    assert!(wait_until(|| detector.ticks() >= ticks + 5));
    assert_eq!(selector.current(), ExpressionLabel::Sad0);

    // Re-enabling hands control back to the detector
    assert_eq!(detector.set_mood_detection(true), DetectorState::Running);
    assert!(wait_until(|| selector.current() == ExpressionLabel::Happy0));
}

#[test]
fn shutdown_stops_ticking_and_is_terminal() {
    let selector = ExpressionSelector::default();
    let tracker = FaceTracker::new();
    let mut detector = spawn_happy(StillFeed::new(true), &selector, &tracker);

    assert!(wait_until(|| detector.ticks() > 2));
    detector.shutdown();
    detector.shutdown();
    assert!(detector.is_stopped());

    let ticks = detector.ticks();
    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(detector.ticks(), ticks);

    assert_eq!(detector.set_mood_detection(true), DetectorState::Disabled);
    assert_eq!(selector.current(), ExpressionLabel::Neutral0);
}

#[test]
fn model_load_failure_leaves_detection_off() {
    let selector = ExpressionSelector::default();
    let detector = Detector::spawn(
        || -> Result<SteadyFace> { Err(MoodMaskError::model("face model not found")) },
        StillFeed::new(true),
        all_masks(),
        selector.clone(),
        FaceTracker::new(),
        fast_config(),
    )
    .unwrap();

    assert!(wait_until(|| detector.models_failed()));
    assert!(!detector.is_available());
    assert_eq!(detector.set_mood_detection(true), DetectorState::Disabled);
    assert!(!selector.detector_mode().detection_requested());
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(detector.ticks(), 0);
    assert_eq!(selector.current(), ExpressionLabel::Neutral0);
}

#[test]
fn weak_expressions_never_change_the_mask() {
    let selector = ExpressionSelector::default();
    let detector = Detector::spawn(
        || {
            Ok(SteadyFace {
                emotion: Emotion::Angry,
                confidence: 0.5,
            })
        },
        StillFeed::new(true),
        all_masks(),
        selector.clone(),
        FaceTracker::new(),
        fast_config(),
    )
    .unwrap();

    assert!(wait_until(|| detector.state() == DetectorState::Armed));
    detector.set_mood_detection(true);
    let ticks = detector.ticks();
    assert!(wait_until(|| detector.ticks() >= ticks + 5));
    assert_eq!(selector.current(), ExpressionLabel::Neutral0);
}

#[test]
fn failed_camera_refuses_mood_detection() {
    let capture = CameraCapture::with_source(
        || -> Result<NoCamera> { Err(MoodMaskError::camera("permission denied")) },
        Duration::from_secs(1),
    )
    .unwrap();
    assert!(wait_until(|| capture.status() == CaptureStatus::Failed));

    let selector = ExpressionSelector::default();
    // Requested at startup, before the camera outcome was known
    selector.transition(DetectorEvent::Enable);
    let detector = Detector::spawn(
        || {
            Ok(SteadyFace {
                emotion: Emotion::Happy,
                confidence: 0.9,
            })
        },
        Arc::new(capture.feed()),
        all_masks(),
        selector.clone(),
        FaceTracker::new(),
        fast_config(),
    )
    .unwrap();

    assert!(wait_until(|| detector.source_failed()));
    assert!(!detector.is_available());
    assert!(!selector.detector_mode().detection_requested());

    assert_eq!(detector.set_mood_detection(true), DetectorState::Disabled);
    assert!(!selector.detector_mode().detection_requested());
    assert_eq!(detector.ticks(), 0);
    assert_eq!(selector.current(), ExpressionLabel::Neutral0);
}

#[test]
fn shutdown_during_model_load_runs_no_ticks() {
    let selector = ExpressionSelector::default();
    let mut detector = Detector::spawn(
        || {
            std::thread::sleep(Duration::from_millis(100));
            Ok(SteadyFace {
                emotion: Emotion::Happy,
                confidence: 0.9,
            })
        },
        StillFeed::new(true),
        all_masks(),
        selector.clone(),
        FaceTracker::new(),
        fast_config(),
    )
    .unwrap();

    detector.set_mood_detection(true);
    detector.shutdown();

    assert!(detector.is_stopped());
    assert_eq!(detector.ticks(), 0);
    assert_eq!(detector.state(), DetectorState::Disabled);
    assert_eq!(selector.current(), ExpressionLabel::Neutral0);
}
