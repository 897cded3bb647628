//! Soundboard: each button plays a clip and switches to its mask
//!
//! Playback is fire-and-forget. A clip that is missing or fails to decode is
//! logged and the mask still changes.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use rodio::{Decoder, OutputStream, OutputStreamHandle, Sink};

use crate::error::{MoodMaskError, Result};
use crate::expression::{Emotion, ExpressionLabel, ExpressionSelector};

/// One soundboard button
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct SoundButton {
    /// Clip name, played from `{sound_dir}/{sound}.mp3`
    pub sound: &'static str,
    pub mood: Emotion,
    /// Mask shown when pressed; also the button image
    pub label: ExpressionLabel,
    pub alt: &'static str,
}

impl SoundButton {
    /// Tooltip text, e.g. "Angry face (angry)"
    pub fn hover_text(&self) -> String {
        format!("{} ({})", self.alt, self.mood)
    }
}

pub const SOUND_BUTTONS: [SoundButton; 9] = [
    SoundButton {
        sound: "cheeseplate",
        mood: Emotion::Angry,
        label: ExpressionLabel::Angry0,
        alt: "Angry face",
    },
    SoundButton {
        sound: "melons",
        mood: Emotion::Angry,
        label: ExpressionLabel::Angry1,
        alt: "Angry face in sailor hat",
    },
    SoundButton {
        sound: "testify",
        mood: Emotion::Happy,
        label: ExpressionLabel::Happy0,
        alt: "Happy face with grey wig",
    },
    SoundButton {
        sound: "kmart",
        mood: Emotion::Disgusted,
        label: ExpressionLabel::Disgusted0,
        alt: "Disgusted face",
    },
    SoundButton {
        sound: "gowest",
        mood: Emotion::Neutral,
        label: ExpressionLabel::Neutral0,
        alt: "Neutral face",
    },
    SoundButton {
        sound: "elevengendary",
        mood: Emotion::Happy,
        label: ExpressionLabel::Happy2,
        alt: "Happy face with entrance look",
    },
    SoundButton {
        sound: "seemymom",
        mood: Emotion::Sad,
        label: ExpressionLabel::Sad0,
        alt: "Sad face",
    },
    SoundButton {
        sound: "gloryholes",
        mood: Emotion::Surprised,
        label: ExpressionLabel::Surprised1,
        alt: "Surprised face",
    },
    SoundButton {
        sound: "tryingmary",
        mood: Emotion::Surprised,
        label: ExpressionLabel::Surprised0,
        alt: "Shocked face",
    },
];

/// Something that can start playing a named clip without blocking
pub trait SoundPlayer {
    fn play(&self, sound: &str) -> Result<()>;
}

/// rodio output on the default audio device
pub struct AudioPlayer {
    // Dropping the stream silences every sink
    _stream: OutputStream,
    handle: OutputStreamHandle,
    sound_dir: PathBuf,
}

impl AudioPlayer {
    pub fn new(sound_dir: impl Into<PathBuf>) -> Result<Self> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| MoodMaskError::audio(format!("no audio output: {}", e)))?;

        Ok(Self {
            _stream: stream,
            handle,
            sound_dir: sound_dir.into(),
        })
    }

    pub fn clip_path(sound_dir: &Path, sound: &str) -> PathBuf {
        sound_dir.join(format!("{}.mp3", sound))
    }
}

impl SoundPlayer for AudioPlayer {
    fn play(&self, sound: &str) -> Result<()> {
        let path = Self::clip_path(&self.sound_dir, sound);
        let file = File::open(&path)?;
        let source = Decoder::new(BufReader::new(file))
            .map_err(|e| MoodMaskError::audio(format!("failed to decode {:?}: {}", path, e)))?;
        let sink = Sink::try_new(&self.handle)
            .map_err(|e| MoodMaskError::audio(format!("failed to create sink: {}", e)))?;

        sink.append(source);
        // Keep playing after the handle goes away; clips may overlap
        sink.detach();
        Ok(())
    }
}

/// The button grid and the player behind it
pub struct Soundboard {
    buttons: &'static [SoundButton],
    player: Option<Box<dyn SoundPlayer>>,
}

impl Soundboard {
    pub fn new(player: Option<Box<dyn SoundPlayer>>) -> Self {
        Self {
            buttons: &SOUND_BUTTONS,
            player,
        }
    }

    pub fn buttons(&self) -> &'static [SoundButton] {
        self.buttons
    }

    pub fn has_audio(&self) -> bool {
        self.player.is_some()
    }

    /// Press button `index`: play its clip and select its mask
    pub fn trigger(&self, index: usize, selector: &ExpressionSelector) -> Option<ExpressionLabel> {
        let button = self.buttons.get(index)?;

        match &self.player {
            Some(player) => {
                if let Err(e) = player.play(button.sound) {
                    log::warn!("Error playing sound {}: {}", button.sound, e);
                }
            }
            None => log::debug!("No audio output, skipping {}", button.sound),
        }

        selector.select_explicit(button.label);
        Some(button.label)
    }

    /// Release the audio device
    pub fn release_audio(&mut self) {
        if self.player.take().is_some() {
            log::info!("Audio output released");
        }
    }
}
