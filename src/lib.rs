//! Mood Mask - a camera booth that draws a character mask over live video
//!
//! The mask follows the soundboard or, with mood detection on, the facial
//! expression of the person in front of the camera. Capture, mask loading
//! and mood detection each run on their own thread; the render loop composites
//! whatever is current.

pub mod app;
pub mod assets;
pub mod camera;
pub mod compositor;
pub mod detector;
pub mod error;
pub mod expression;
pub mod ml;
pub mod settings;
pub mod soundboard;

pub use app::App;
pub use error::{MoodMaskError, Result};
pub use expression::{Emotion, ExpressionLabel, ExpressionSelector};
pub use settings::Settings;
pub use soundboard::{SoundButton, Soundboard, SOUND_BUTTONS};
