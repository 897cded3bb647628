//! Application settings
//!
//! Read once at startup from JSON. Every field has a default, so a missing or
//! partial file is fine. Nothing is ever written back.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::compositor::OverlayMode;
use crate::error::Result;
use crate::expression::ExpressionLabel;

/// Environment variable naming an explicit settings file
pub const CONFIG_ENV: &str = "MOOD_MASK_CONFIG";

/// Settings file looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "mood-mask.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    /// Camera to open (0 = system default / user-facing)
    pub camera_index: u32,
    pub capture_width: u32,
    pub capture_height: u32,
    /// Frames older than this are not fed to the detector
    pub stale_frame_ms: u64,

    /// Directory holding `{label}.png` mask images
    pub mask_dir: PathBuf,
    /// Directory holding `{sound}.mp3` clips
    pub sound_dir: PathBuf,
    /// Directory holding the ONNX models. Searched for when unset.
    pub model_dir: Option<PathBuf>,

    /// Detector tick period
    pub detection_interval_ms: u64,
    /// Top emotion must score strictly above this to change the mask
    pub confidence_threshold: f32,
    /// Minimum face detector score
    pub face_score_threshold: f32,
    pub nms_threshold: f32,

    pub overlay_mode: OverlayMode,
    /// Mask size relative to the face box
    pub mask_scale: f32,
    /// Mask offset up/left, as a fraction of the mask size
    pub mask_offset: f32,

    pub initial_expression: ExpressionLabel,
    pub mood_detection_on_start: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            camera_index: 0,
            capture_width: 1280,
            capture_height: 720,
            stale_frame_ms: 1000,
            mask_dir: PathBuf::from("assets/nina-faces"),
            sound_dir: PathBuf::from("assets/sounds"),
            model_dir: None,
            detection_interval_ms: 200,
            confidence_threshold: 0.5,
            face_score_threshold: 0.7,
            nms_threshold: 0.3,
            overlay_mode: OverlayMode::Positioned,
            mask_scale: 1.8,
            mask_offset: 0.4,
            initial_expression: ExpressionLabel::NEUTRAL,
            mood_detection_on_start: false,
        }
    }
}

impl Settings {
    /// Parse settings from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_json(&contents)
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let settings: Settings = serde_json::from_str(contents)?;
        Ok(settings.validated())
    }

    /// Settings for this run: `$MOOD_MASK_CONFIG`, then `./mood-mask.json`,
    /// then defaults. A broken file is logged and ignored.
    pub fn load_or_default() -> Self {
        let path = std::env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .or_else(|| {
                let local = PathBuf::from(DEFAULT_CONFIG_FILE);
                local.exists().then_some(local)
            });

        let Some(path) = path else {
            log::info!("No settings file, using defaults");
            return Self::default();
        };

        match Self::load(&path) {
            Ok(settings) => {
                log::info!("Loaded settings from {:?}", path);
                settings
            }
            Err(e) => {
                log::warn!("Failed to load settings from {:?}: {}. Using defaults.", path, e);
                Self::default()
            }
        }
    }

    /// Clamp out-of-range values instead of rejecting the file
    #[must_use]
    pub fn validated(mut self) -> Self {
        self.capture_width = self.capture_width.max(1);
        self.capture_height = self.capture_height.max(1);
        self.stale_frame_ms = self.stale_frame_ms.max(1);
        self.detection_interval_ms = self.detection_interval_ms.clamp(10, 10_000);
        self.confidence_threshold = self.confidence_threshold.clamp(0.0, 1.0);
        self.face_score_threshold = self.face_score_threshold.clamp(0.0, 1.0);
        self.nms_threshold = self.nms_threshold.clamp(0.0, 1.0);
        if !self.mask_scale.is_finite() || self.mask_scale <= 0.0 {
            self.mask_scale = 1.8;
        }
        if !self.mask_offset.is_finite() {
            self.mask_offset = 0.4;
        }
        self
    }

    pub fn detection_interval(&self) -> Duration {
        Duration::from_millis(self.detection_interval_ms)
    }

    pub fn stale_frame_limit(&self) -> Duration {
        Duration::from_millis(self.stale_frame_ms)
    }
}
