use image::imageops::{self, FilterType};

use crate::capture::Frame;
use crate::config::RecordingConfig;

/// Skip-value decimation followed by scaling.
///
/// Decimation keeps frames whose raw capture index is a multiple of `skip_value`.
/// Scaling uses Lanczos3 resampling, which is deterministic and holds up well when
/// shrinking screen content with text. Target size is `floor(side * scale)`, at least 1.
#[derive(Debug, Clone, Copy)]
pub struct FramePreprocessor {
    skip_value: u32,
    scale_factor: f32,
}

impl FramePreprocessor {
    pub fn new(skip_value: u32, scale_factor: f32) -> Self {
        Self {
            skip_value: skip_value.max(1),
            scale_factor,
        }
    }

    pub fn from_config(config: &RecordingConfig) -> Self {
        Self::new(config.skip_value, config.scale_factor)
    }

    pub fn keeps(&self, seq: u64) -> bool {
        seq % u64::from(self.skip_value) == 0
    }

    pub fn target_size(&self, width: u32, height: u32) -> (u32, u32) {
        if self.scale_factor >= 1.0 {
            return (width, height);
        }
        let scale = f64::from(self.scale_factor);
        let w = (f64::from(width) * scale).floor() as u32;
        let h = (f64::from(height) * scale).floor() as u32;
        (w.max(1), h.max(1))
    }

    /// Returns `None` when the frame is decimated away.
    pub fn process(&self, frame: Frame) -> Option<Frame> {
        if !self.keeps(frame.seq) {
            return None;
        }

        let (width, height) = self.target_size(frame.width(), frame.height());
        if (width, height) == (frame.width(), frame.height()) {
            return Some(frame);
        }

        let image = imageops::resize(&frame.image, width, height, FilterType::Lanczos3);
        Some(Frame { image, ..frame })
    }
}
