//! ML inference module
//!
//! Face localisation and expression classification using ONNX Runtime. Two
//! models are loaded from the models directory:
//!
//! - `face_detector.onnx`: UltraFace RFB-320 layout, 1x3x240x320 input
//! - `expression_classifier.onnx`: FER+ layout, 1x1x64x64 grayscale input
//!
//! The detector runs at a reduced 320x240 input. One face is enough for a
//! mask booth and a coarse box is all the overlay needs.

pub mod postprocess;

use std::path::{Path, PathBuf};

use image::imageops::FilterType;
use ndarray::Array4;

use crate::camera::CameraFrame;
use crate::error::{MoodMaskError, Result};
use crate::expression::ExpressionScores;

pub use postprocess::{Candidate, FaceBox};

pub const FACE_MODEL_FILE: &str = "face_detector.onnx";
pub const EXPRESSION_MODEL_FILE: &str = "expression_classifier.onnx";

const DETECTOR_WIDTH: u32 = 320;
const DETECTOR_HEIGHT: u32 = 240;
const CLASSIFIER_SIZE: u32 = 64;

/// One detected face
#[derive(Clone, Debug, PartialEq)]
pub struct FaceDetection {
    /// Normalised face box
    pub bbox: FaceBox,
    /// Detector confidence
    pub score: f32,
    pub expressions: ExpressionScores,
}

/// Runs face localisation plus expression classification over a frame
pub trait FaceAnalyzer: Send {
    /// Faces in the frame, best first. An empty list means no face.
    fn analyze(&mut self, frame: &CameraFrame) -> Result<Vec<FaceDetection>>;
}

/// Detection thresholds for [`OrtAnalyzer`]
#[derive(Clone, Copy, Debug)]
pub struct AnalyzerConfig {
    pub score_threshold: f32,
    pub nms_threshold: f32,
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            score_threshold: 0.7,
            nms_threshold: 0.3,
        }
    }
}

/// ONNX Runtime backed analyzer
pub struct OrtAnalyzer {
    face_session: ort::session::Session,
    expression_session: ort::session::Session,
    config: AnalyzerConfig,
}

impl OrtAnalyzer {
    /// Initialize ONNX Runtime and load both models
    pub fn load(model_dir: &Path, config: AnalyzerConfig) -> Result<Self> {
        log::info!("Model directory: {:?}", model_dir);

        let face_path = model_dir.join(FACE_MODEL_FILE);
        if !face_path.exists() {
            return Err(MoodMaskError::model(format!("face model not found: {:?}", face_path)));
        }
        let expression_path = model_dir.join(EXPRESSION_MODEL_FILE);
        if !expression_path.exists() {
            return Err(MoodMaskError::model(format!(
                "expression model not found: {:?}",
                expression_path
            )));
        }

        ort::init()
            .with_name("MoodMask")
            .commit()
            .map_err(|e| MoodMaskError::model(format!("failed to initialize ORT: {}", e)))?;

        let face_session = Self::load_session(&face_path)?;
        log::info!("Loaded face model from {:?}", face_path);

        let expression_session = Self::load_session(&expression_path)?;
        log::info!("Loaded expression model from {:?}", expression_path);

        Ok(Self {
            face_session,
            expression_session,
            config,
        })
    }

    fn load_session(path: &Path) -> Result<ort::session::Session> {
        ort::session::Session::builder()
            .map_err(|e| MoodMaskError::model(format!("failed to create session builder: {}", e)))?
            .with_intra_threads(2)
            .map_err(|e| MoodMaskError::model(format!("failed to set threads: {}", e)))?
            .commit_from_file(path)
            .map_err(|e| MoodMaskError::model(format!("failed to load {:?}: {}", path, e)))
    }

    /// Find the models directory
    ///
    /// Uses `configured` when given, otherwise looks for `models/` next to
    /// the executable and its ancestors, then in the working directory.
    pub fn find_model_dir(configured: Option<&Path>) -> Result<PathBuf> {
        if let Some(dir) = configured {
            return if dir.exists() {
                Ok(dir.to_path_buf())
            } else {
                Err(MoodMaskError::model(format!("configured model directory {:?} does not exist", dir)))
            };
        }

        if let Ok(exe_path) = std::env::current_exe() {
            // exe dir, then target/<profile>/.., then the crate root
            for ancestor in exe_path.ancestors().skip(1).take(3) {
                let model_dir = ancestor.join("models");
                if model_dir.exists() {
                    return Ok(model_dir);
                }
            }
        }

        let model_dir = std::env::current_dir()?.join("models");
        if model_dir.exists() {
            return Ok(model_dir);
        }

        Err(MoodMaskError::model(
            "models directory not found. Create a 'models' directory with the ONNX models.",
        ))
    }

    fn detect_faces(&mut self, frame: &CameraFrame) -> Result<Vec<Candidate>> {
        let input = preprocess_detector(frame);
        let input_array = Array4::from_shape_vec(
            (1, 3, DETECTOR_HEIGHT as usize, DETECTOR_WIDTH as usize),
            input,
        )
        .map_err(|e| MoodMaskError::inference(format!("failed to create input array: {}", e)))?;

        let input_tensor = ort::value::Tensor::from_array(input_array)
            .map_err(|e| MoodMaskError::inference(format!("failed to create tensor: {}", e)))?;

        let outputs = self
            .face_session
            .run(ort::inputs![input_tensor])
            .map_err(|e| MoodMaskError::inference(format!("face detection failed: {}", e)))?;

        let mut tensors = Vec::with_capacity(2);
        for (_name, value) in outputs.iter() {
            let (_shape, data) = value
                .try_extract_tensor::<f32>()
                .map_err(|e| MoodMaskError::inference(format!("failed to extract output: {}", e)))?;
            tensors.push(data.to_vec());
        }

        let [first, second]: [Vec<f32>; 2] = tensors
            .try_into()
            .map_err(|_| MoodMaskError::inference("face model must have two outputs"))?;

        // scores are N×2 and boxes N×4, so the shorter tensor holds the scores
        let (scores, boxes) = if first.len() <= second.len() {
            (first, second)
        } else {
            (second, first)
        };

        Ok(postprocess::decode_faces(
            &scores,
            &boxes,
            self.config.score_threshold,
            self.config.nms_threshold,
        ))
    }

    fn classify(&mut self, frame: &CameraFrame, bbox: &FaceBox) -> Result<ExpressionScores> {
        let input = preprocess_classifier(frame, bbox)
            .ok_or_else(|| MoodMaskError::inference("face crop is empty"))?;
        let input_array = Array4::from_shape_vec(
            (1, 1, CLASSIFIER_SIZE as usize, CLASSIFIER_SIZE as usize),
            input,
        )
        .map_err(|e| MoodMaskError::inference(format!("failed to create input array: {}", e)))?;

        let input_tensor = ort::value::Tensor::from_array(input_array)
            .map_err(|e| MoodMaskError::inference(format!("failed to create tensor: {}", e)))?;

        let outputs = self
            .expression_session
            .run(ort::inputs![input_tensor])
            .map_err(|e| MoodMaskError::inference(format!("expression classification failed: {}", e)))?;

        let output = outputs
            .iter()
            .next()
            .ok_or_else(|| MoodMaskError::inference("no output from expression model"))?;

        let (_shape, logits) = output
            .1
            .try_extract_tensor::<f32>()
            .map_err(|e| MoodMaskError::inference(format!("failed to extract output: {}", e)))?;

        Ok(postprocess::expression_scores(logits))
    }
}

impl FaceAnalyzer for OrtAnalyzer {
    fn analyze(&mut self, frame: &CameraFrame) -> Result<Vec<FaceDetection>> {
        let faces = self.detect_faces(frame)?;

        // Single subject: only the best face is classified
        let Some(best) = faces.first() else {
            return Ok(Vec::new());
        };

        let expressions = self.classify(frame, &best.bbox)?;
        Ok(vec![FaceDetection {
            bbox: best.bbox,
            score: best.score,
            expressions,
        }])
    }
}

/// Resize to the detector input and convert to normalised CHW floats
fn preprocess_detector(frame: &CameraFrame) -> Vec<f32> {
    let resized = frame.downscale(DETECTOR_WIDTH, DETECTOR_HEIGHT);
    let plane = (DETECTOR_WIDTH * DETECTOR_HEIGHT) as usize;
    let mut output = vec![0.0f32; plane * 3];

    for (pixel_idx, rgba) in resized.chunks_exact(4).enumerate() {
        for channel in 0..3 {
            output[channel * plane + pixel_idx] = (rgba[channel] as f32 - 127.0) / 128.0;
        }
    }

    output
}

/// Crop the face, convert to grayscale and resize to the classifier input
fn preprocess_classifier(frame: &CameraFrame, bbox: &FaceBox) -> Option<Vec<f32>> {
    let image = frame.to_rgba_image()?;
    let (x, y, w, h) = bbox.clamped().to_pixels(frame.width, frame.height);
    let x = x.floor() as u32;
    let y = y.floor() as u32;
    let w = (w.ceil() as u32).min(frame.width.saturating_sub(x));
    let h = (h.ceil() as u32).min(frame.height.saturating_sub(y));
    if w == 0 || h == 0 {
        return None;
    }

    let face = image::imageops::crop_imm(&image, x, y, w, h).to_image();
    let gray = image::imageops::grayscale(&face);
    let resized = image::imageops::resize(&gray, CLASSIFIER_SIZE, CLASSIFIER_SIZE, FilterType::Triangle);

    Some(resized.pixels().map(|p| p.0[0] as f32).collect())
}
