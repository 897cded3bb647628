//! Mood detector
//!
//! A worker thread that, on a fixed cadence, looks at the latest camera
//! frame, finds the face and (while mood detection is on) switches the mask
//! to the strongest detected emotion. The cadence is deliberately slower
//! than the inference rate so the mask does not flicker between emotions.
//!
//! Detection is best-effort. A failing tick is logged and the next tick runs
//! as usual; the mask simply stays where it was.

pub mod state;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;

use crate::assets::MaskTable;
use crate::camera::{CameraFrame, FrameFeed};
use crate::error::Result;
use crate::expression::{resolve_emotion, Emotion, ExpressionLabel, ExpressionSelector};
use crate::ml::{FaceAnalyzer, FaceBox};

pub use state::{DetectorEvent, DetectorMode, DetectorState};

/// Detector tuning
#[derive(Clone, Copy, Debug)]
pub struct DetectorConfig {
    /// Time between ticks
    pub interval: Duration,
    /// The top emotion must score strictly above this
    pub confidence_threshold: f32,
    /// Keep localising faces while expression writes are off, so the
    /// positioned overlay keeps following the face
    pub track_faces: bool,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(200),
            confidence_threshold: 0.5,
            track_faces: true,
        }
    }
}

/// Latest face box seen by the detector, read by the render loop
#[derive(Clone, Default)]
pub struct FaceTracker {
    latest: Arc<Mutex<Option<FaceBox>>>,
}

impl FaceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, bbox: FaceBox) {
        *self.latest.lock() = Some(bbox);
    }

    /// `None` until a face has been found once. A miss never clears it.
    pub fn latest(&self) -> Option<FaceBox> {
        *self.latest.lock()
    }
}

/// What a single tick did
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum TickOutcome {
    /// Nothing to do in the current mode
    Idle,
    /// No live frame to look at
    NotPlayable,
    /// No mask has loaded yet
    NoMasks,
    NoFace,
    /// Face located, expression not evaluated (detection off)
    Tracked,
    /// Top emotion at or below the threshold
    Inconclusive { emotion: Emotion, confidence: f32 },
    /// No loaded mask matches the emotion
    NoMatchingMask { emotion: Emotion },
    /// Resolved mask is already showing
    Unchanged(ExpressionLabel),
    /// Mask changed
    Applied(ExpressionLabel),
    /// Detection was switched off while this tick ran
    Suspended,
}

/// Run one detection pass.
///
/// `frame` is `None` when the capture has no fresh frame.
pub fn run_tick(
    analyzer: &mut dyn FaceAnalyzer,
    frame: Option<&CameraFrame>,
    masks: &MaskTable,
    selector: &ExpressionSelector,
    tracker: &FaceTracker,
    config: &DetectorConfig,
) -> Result<TickOutcome> {
    let evaluate_expression = selector.detector_state() == DetectorState::Running;
    if !evaluate_expression && !config.track_faces {
        return Ok(TickOutcome::Idle);
    }

    let Some(frame) = frame else {
        return Ok(TickOutcome::NotPlayable);
    };
    if masks.is_empty() {
        return Ok(TickOutcome::NoMasks);
    }

    let detections = analyzer.analyze(frame)?;

    // Single subject: only the best face counts
    let Some(face) = detections.first() else {
        return Ok(TickOutcome::NoFace);
    };
    tracker.update(face.bbox);

    if !evaluate_expression {
        return Ok(TickOutcome::Tracked);
    }

    let (emotion, confidence) = face.expressions.top();
    if confidence <= config.confidence_threshold {
        return Ok(TickOutcome::Inconclusive { emotion, confidence });
    }

    let Some(label) = resolve_emotion(emotion, &masks.labels()) else {
        return Ok(TickOutcome::NoMatchingMask { emotion });
    };

    if selector.current() == label {
        return Ok(TickOutcome::Unchanged(label));
    }

    if selector.apply_detected(label) {
        log::info!("Mood {} ({:.2}) -> mask {}", emotion, confidence, label);
        Ok(TickOutcome::Applied(label))
    } else if selector.current() == label {
        Ok(TickOutcome::Unchanged(label))
    } else {
        Ok(TickOutcome::Suspended)
    }
}

/// Cancels the detector worker. Checked at the top of every tick.
#[derive(Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
    wake_tx: Sender<()>,
    wake_rx: Receiver<()>,
}

impl CancellationToken {
    pub fn new() -> Self {
        let (wake_tx, wake_rx) = crossbeam_channel::bounded(1);
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
            wake_tx,
            wake_rx,
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        // Wake a sleeping worker; a full channel means it is already woken
        let _ = self.wake_tx.try_send(());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn wake_receiver(&self) -> &Receiver<()> {
        &self.wake_rx
    }
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything the worker thread needs
struct Worker {
    feed: Arc<dyn FrameFeed>,
    masks: MaskTable,
    selector: ExpressionSelector,
    tracker: FaceTracker,
    config: DetectorConfig,
    token: CancellationToken,
    ticks: Arc<AtomicU64>,
    model_failed: Arc<AtomicBool>,
    source_failed: Arc<AtomicBool>,
}

impl Worker {
    fn run<F, A>(self, load: F)
    where
        F: FnOnce() -> Result<A>,
        A: FaceAnalyzer,
    {
        log::info!("Detector thread started");

        // Load failure leaves the detector disabled for the session
        let mut analyzer = match load() {
            Ok(analyzer) => analyzer,
            Err(e) => {
                log::warn!("Failed to load face models: {}. Mood detection disabled.", e);
                self.selector.transition(DetectorEvent::Disable);
                self.model_failed.store(true, Ordering::Release);
                return;
            }
        };

        // Shutdown may have been requested while the models were loading
        if self.token.is_cancelled() {
            log::info!("Detector cancelled during model load");
            return;
        }
        log::info!("Face models loaded");

        let ticker = crossbeam_channel::tick(self.config.interval);
        let mut ready = false;

        loop {
            crossbeam_channel::select! {
                recv(ticker) -> _ => {}
                recv(self.token.wake_receiver()) -> _ => {}
            }

            if self.token.is_cancelled() {
                break;
            }

            let frame = self.feed.playable_frame();

            if !ready {
                if self.feed.has_failed() {
                    log::warn!("Camera unavailable. Mood detection disabled.");
                    self.selector.transition(DetectorEvent::Disable);
                    self.source_failed.store(true, Ordering::Release);
                    break;
                }
                if frame.is_none() {
                    continue;
                }
                ready = true;
                self.selector.transition(DetectorEvent::Ready);
            }

            self.ticks.fetch_add(1, Ordering::Relaxed);

            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| {
                run_tick(
                    &mut analyzer,
                    frame.as_ref(),
                    &self.masks,
                    &self.selector,
                    &self.tracker,
                    &self.config,
                )
            }));

            match outcome {
                Ok(Ok(outcome)) => log::trace!("Detector tick: {:?}", outcome),
                Ok(Err(e)) => log::warn!("Detection tick failed: {}", e),
                Err(_) => log::error!("Detection tick panicked"),
            }
        }

        log::info!("Detector thread stopped");
    }
}

/// Owns the detector worker thread
pub struct Detector {
    selector: ExpressionSelector,
    token: CancellationToken,
    thread_handle: Option<std::thread::JoinHandle<()>>,
    ticks: Arc<AtomicU64>,
    model_failed: Arc<AtomicBool>,
    source_failed: Arc<AtomicBool>,
}

impl Detector {
    /// Start the worker. `load` builds the analyzer on the worker thread.
    pub fn spawn<F, A>(
        load: F,
        feed: Arc<dyn FrameFeed>,
        masks: MaskTable,
        selector: ExpressionSelector,
        tracker: FaceTracker,
        config: DetectorConfig,
    ) -> Result<Self>
    where
        F: FnOnce() -> Result<A> + Send + 'static,
        A: FaceAnalyzer + 'static,
    {
        let token = CancellationToken::new();
        let ticks = Arc::new(AtomicU64::new(0));
        let model_failed = Arc::new(AtomicBool::new(false));
        let source_failed = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            feed,
            masks,
            selector: selector.clone(),
            tracker,
            config,
            token: token.clone(),
            ticks: ticks.clone(),
            model_failed: model_failed.clone(),
            source_failed: source_failed.clone(),
        };

        let thread_handle = std::thread::Builder::new()
            .name("mood-detector".to_string())
            .spawn(move || worker.run(load))?;

        Ok(Self {
            selector,
            token,
            thread_handle: Some(thread_handle),
            ticks,
            model_failed,
            source_failed,
        })
    }

    /// Turn automatic mask switching on or off. Turning it on is refused
    /// once the detector can no longer run.
    pub fn set_mood_detection(&self, enabled: bool) -> DetectorState {
        if enabled && !self.is_available() {
            return self.state();
        }
        let event = if enabled {
            DetectorEvent::Enable
        } else {
            DetectorEvent::Disable
        };
        self.selector.transition(event)
    }

    pub fn state(&self) -> DetectorState {
        self.selector.detector_state()
    }

    /// Ticks executed so far
    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    /// Models failed to load; detection is off for the session
    pub fn models_failed(&self) -> bool {
        self.model_failed.load(Ordering::Acquire)
    }

    /// The camera failed before the detector became ready
    pub fn source_failed(&self) -> bool {
        self.source_failed.load(Ordering::Acquire)
    }

    /// Models loading or loaded, camera not failed, not shut down
    pub fn is_available(&self) -> bool {
        !self.is_stopped() && !self.models_failed() && !self.source_failed()
    }

    pub fn is_stopped(&self) -> bool {
        self.thread_handle.is_none()
    }

    /// Cancel the worker and wait for it. Safe to call more than once.
    /// A model load in progress is waited for; no tick runs after it.
    pub fn shutdown(&mut self) {
        let Some(handle) = self.thread_handle.take() else {
            return;
        };

        self.selector.transition(DetectorEvent::Teardown);
        self.token.cancel();
        if handle.join().is_err() {
            log::error!("Detector thread panicked");
        }
    }
}

impl Drop for Detector {
    fn drop(&mut self) {
        self.shutdown();
    }
}
