//! Error type shared by the capture, inference, asset and audio layers.
//!
//! Nothing here is ever shown to the user: the app boundary logs these and
//! carries on with the affected feature switched off.

use std::path::PathBuf;

/// Result alias carrying [`MoodMaskError`].
pub type Result<T> = std::result::Result<T, MoodMaskError>;

#[derive(Debug, thiserror::Error)]
pub enum MoodMaskError {
    /// Camera unavailable, permission denied, or the stream broke.
    #[error("camera: {0}")]
    Camera(String),

    /// Model file missing or ONNX Runtime refused to load it.
    #[error("model: {0}")]
    Model(String),

    /// A single inference pass failed.
    #[error("inference: {0}")]
    Inference(String),

    /// A mask image could not be decoded.
    #[error("mask `{label}` at {path:?}: {source}")]
    Asset {
        label: String,
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },

    #[error("audio: {0}")]
    Audio(String),

    /// Window surface or GPU device setup failed.
    #[error("graphics: {0}")]
    Graphics(String),

    #[error("config: {0}")]
    Config(#[from] serde_json::Error),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl MoodMaskError {
    pub fn camera<T: Into<String>>(msg: T) -> Self {
        Self::Camera(msg.into())
    }

    pub fn model<T: Into<String>>(msg: T) -> Self {
        Self::Model(msg.into())
    }

    pub fn inference<T: Into<String>>(msg: T) -> Self {
        Self::Inference(msg.into())
    }

    pub fn audio<T: Into<String>>(msg: T) -> Self {
        Self::Audio(msg.into())
    }

    pub fn graphics<T: Into<String>>(msg: T) -> Self {
        Self::Graphics(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages_name_the_subsystem() {
        let err = MoodMaskError::camera("permission denied");
        assert_eq!(err.to_string(), "camera: permission denied");

        let err = MoodMaskError::inference("bad tensor");
        assert!(err.to_string().starts_with("inference:"));
    }

    #[test]
    fn test_config_errors_convert() {
        let parse = serde_json::from_str::<u32>("not json").unwrap_err();
        let err: MoodMaskError = parse.into();
        assert!(matches!(err, MoodMaskError::Config(_)));
    }
}
