//! Mask image table
//!
//! Decodes the mask PNGs on a background thread. The table can be read at
//! any time; entries show up one by one as each image finishes decoding. A
//! mask that fails to load is logged and simply never appears.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use image::RgbaImage;
use parking_lot::RwLock;

use crate::error::{MoodMaskError, Result};
use crate::expression::ExpressionLabel;

/// Label -> decoded mask image, shared between loader and renderer
#[derive(Clone, Default)]
pub struct MaskTable {
    images: Arc<RwLock<HashMap<ExpressionLabel, Arc<RgbaImage>>>>,
}

impl MaskTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, label: ExpressionLabel, image: RgbaImage) {
        self.images.write().insert(label, Arc::new(image));
    }

    pub fn get(&self, label: ExpressionLabel) -> Option<Arc<RgbaImage>> {
        self.images.read().get(&label).cloned()
    }

    pub fn len(&self) -> usize {
        self.images.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.read().is_empty()
    }

    /// Loaded labels in [`ExpressionLabel::ALL`] order
    pub fn labels(&self) -> Vec<ExpressionLabel> {
        let images = self.images.read();
        ExpressionLabel::ALL
            .iter()
            .copied()
            .filter(|label| images.contains_key(label))
            .collect()
    }

    /// Image to draw for `label`: its own mask, else the neutral mask, else nothing
    pub fn resolve(&self, label: ExpressionLabel) -> Option<(ExpressionLabel, Arc<RgbaImage>)> {
        let images = self.images.read();
        images
            .get(&label)
            .map(|image| (label, image.clone()))
            .or_else(|| {
                images
                    .get(&ExpressionLabel::NEUTRAL)
                    .map(|image| (ExpressionLabel::NEUTRAL, image.clone()))
            })
    }
}

/// Decode a single mask image
pub fn load_mask(dir: &Path, label: ExpressionLabel) -> Result<RgbaImage> {
    let path = dir.join(label.file_name());
    image::open(&path)
        .map(|image| image.to_rgba8())
        .map_err(|source| MoodMaskError::Asset {
            label: label.to_string(),
            path,
            source,
        })
}

/// Load every label into `table`, returning how many succeeded
pub fn load_all(dir: &Path, labels: &[ExpressionLabel], table: &MaskTable) -> usize {
    let mut loaded = 0;
    for &label in labels {
        match load_mask(dir, label) {
            Ok(image) => {
                log::debug!("Loaded mask {} ({}x{})", label, image.width(), image.height());
                table.insert(label, image);
                loaded += 1;
            }
            Err(e) => {
                log::warn!("Failed to load mask: {}", e);
            }
        }
    }
    loaded
}

/// Background mask loading
pub struct MaskLoader {
    table: MaskTable,
    thread_handle: Option<std::thread::JoinHandle<usize>>,
}

impl MaskLoader {
    /// Start decoding `labels` from `dir` into a fresh table
    pub fn spawn(dir: impl Into<PathBuf>, labels: &[ExpressionLabel]) -> Result<Self> {
        let dir = dir.into();
        let labels = labels.to_vec();
        let table = MaskTable::new();
        let table_clone = table.clone();

        let thread_handle = std::thread::Builder::new()
            .name("mask-loader".to_string())
            .spawn(move || {
                log::info!("Loading {} masks from {:?}", labels.len(), dir);
                let loaded = load_all(&dir, &labels, &table_clone);
                log::info!("Loaded {}/{} masks", loaded, labels.len());
                loaded
            })?;

        Ok(Self {
            table,
            thread_handle: Some(thread_handle),
        })
    }

    /// Table being filled by the loader
    pub fn table(&self) -> MaskTable {
        self.table.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.thread_handle
            .as_ref()
            .map(|handle| handle.is_finished())
            .unwrap_or(true)
    }

    /// Wait for loading to finish and return the number of masks loaded
    pub fn join(mut self) -> usize {
        match self.thread_handle.take() {
            Some(handle) => handle.join().unwrap_or_else(|_| {
                log::error!("Mask loader thread panicked");
                self.table.len()
            }),
            None => self.table.len(),
        }
    }
}
