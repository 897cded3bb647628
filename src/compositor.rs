//! Mask compositing
//!
//! Draws the live frame and then the current mask on top. Two overlay
//! variants exist: `Positioned` sizes the mask from the tracked face box,
//! `FullFrame` stretches it over the whole frame. Positioned falls back to
//! full-frame until a face has been seen.

use image::imageops::FilterType;
use image::RgbaImage;
use serde::{Deserialize, Serialize};

use crate::assets::MaskTable;
use crate::camera::CameraFrame;
use crate::expression::ExpressionLabel;
use crate::ml::FaceBox;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OverlayMode {
    /// Mask follows the detected face
    #[default]
    Positioned,
    /// Mask covers the whole frame
    FullFrame,
}

impl OverlayMode {
    pub fn display_name(&self) -> &'static str {
        match self {
            OverlayMode::Positioned => "Follow face",
            OverlayMode::FullFrame => "Full frame",
        }
    }
}

/// Where the mask lands, in frame pixels. `x`/`y` may be negative.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Placement {
    pub x: i64,
    pub y: i64,
    pub width: u32,
    pub height: u32,
}

/// Compute the mask rectangle for a frame.
///
/// Positioned: `scale` times the face box, shifted up and left by `offset`
/// of the mask size.
pub fn mask_placement(
    mode: OverlayMode,
    face: Option<FaceBox>,
    frame_width: u32,
    frame_height: u32,
    scale: f32,
    offset: f32,
) -> Placement {
    let full_frame = Placement {
        x: 0,
        y: 0,
        width: frame_width,
        height: frame_height,
    };

    let face = match (mode, face) {
        (OverlayMode::Positioned, Some(face)) => face,
        _ => return full_frame,
    };

    let (box_x, box_y, box_w, box_h) = face.to_pixels(frame_width, frame_height);
    let width = box_w * scale;
    let height = box_h * scale;
    let x = box_x - width * offset;
    let y = box_y - height * offset;

    Placement {
        x: x.round() as i64,
        y: y.round() as i64,
        width: width.round().max(0.0) as u32,
        height: height.round().max(0.0) as u32,
    }
}

/// A composited frame
pub struct Composite {
    pub image: RgbaImage,
    /// Mask actually drawn, after fallback
    pub mask: Option<ExpressionLabel>,
    pub placement: Placement,
}

struct CachedMask {
    label: ExpressionLabel,
    width: u32,
    height: u32,
    image: RgbaImage,
}

pub struct Compositor {
    mode: OverlayMode,
    scale: f32,
    offset: f32,
    /// Last resized mask, reused while label and size stay the same
    cache: Option<CachedMask>,
}

impl Compositor {
    pub fn new(mode: OverlayMode, scale: f32, offset: f32) -> Self {
        Self {
            mode,
            scale,
            offset,
            cache: None,
        }
    }

    pub fn mode(&self) -> OverlayMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: OverlayMode) {
        if self.mode != mode {
            log::info!("Overlay mode: {:?}", mode);
            self.mode = mode;
        }
    }

    /// Composite `label`'s mask (or the neutral fallback) over `frame`.
    /// Returns `None` only when the frame data is malformed.
    pub fn compose(
        &mut self,
        frame: &CameraFrame,
        masks: &MaskTable,
        label: ExpressionLabel,
        face: Option<FaceBox>,
    ) -> Option<Composite> {
        let mut image = frame.to_rgba_image()?;
        let placement = mask_placement(
            self.mode,
            face,
            frame.width,
            frame.height,
            self.scale,
            self.offset,
        );

        let mut drawn = None;
        if placement.width > 0 && placement.height > 0 {
            if let Some((resolved, mask)) = masks.resolve(label) {
                if let Some(scaled) =
                    self.scaled_mask(resolved, &mask, placement.width, placement.height)
                {
                    image::imageops::overlay(&mut image, scaled, placement.x, placement.y);
                    drawn = Some(resolved);
                }
            }
        }

        Some(Composite {
            image,
            mask: drawn,
            placement,
        })
    }

    fn scaled_mask(
        &mut self,
        label: ExpressionLabel,
        mask: &RgbaImage,
        width: u32,
        height: u32,
    ) -> Option<&RgbaImage> {
        let hit = matches!(
            &self.cache,
            Some(cached) if cached.label == label && cached.width == width && cached.height == height
        );

        if !hit {
            let image = if mask.width() == width && mask.height() == height {
                mask.clone()
            } else {
                image::imageops::resize(mask, width, height, FilterType::Triangle)
            };
            self.cache = Some(CachedMask {
                label,
                width,
                height,
                image,
            });
        }

        self.cache.as_ref().map(|cached| &cached.image)
    }
}
