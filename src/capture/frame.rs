use image::RgbaImage;
use std::time::Duration;

/// A captured bitmap moving through the pipeline. `seq` is the raw capture tick index
/// and only ever grows within a session.
#[derive(Debug, Clone)]
pub struct Frame {
    pub seq: u64,
    pub captured_at: Duration,
    pub image: RgbaImage,
}

impl Frame {
    pub fn new(seq: u64, captured_at: Duration, image: RgbaImage) -> Self {
        Self {
            seq,
            captured_at,
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}
