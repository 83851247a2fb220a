use std::sync::Arc;
use std::time::Instant;

use crate::error::CaptureError;

use super::{Frame, Rectangle, ScreenGrab, MAX_GIF_DIMENSION};

pub const MAX_CONSECUTIVE_FAILURES: u32 = 3;

/// Pulls frames for one region. Every call to `capture` is one tick and consumes a
/// sequence number, whether or not the grab succeeds.
pub struct FrameSource {
    backend: Arc<dyn ScreenGrab>,
    region: Rectangle,
    started: Instant,
    next_seq: u64,
    failure_streak: u32,
}

impl FrameSource {
    pub fn new(backend: Arc<dyn ScreenGrab>, region: Rectangle) -> Self {
        Self {
            backend,
            region,
            started: Instant::now(),
            next_seq: 0,
            failure_streak: 0,
        }
    }

    pub fn region(&self) -> Rectangle {
        self.region
    }

    /// Sequence number the next capture will carry.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn capture(&mut self) -> Result<Frame, CaptureError> {
        let seq = self.next_seq;
        self.next_seq += 1;

        match self.grab() {
            Ok(image) => {
                self.failure_streak = 0;
                Ok(Frame::new(seq, self.started.elapsed(), image))
            }
            Err(err) => {
                self.failure_streak += 1;
                tracing::warn!(seq, streak = self.failure_streak, "capture failed: {}", err);
                if self.failure_streak >= MAX_CONSECUTIVE_FAILURES {
                    Err(CaptureError::Escalated {
                        failures: self.failure_streak,
                        last: err.to_string(),
                    })
                } else {
                    Err(err)
                }
            }
        }
    }

    fn grab(&self) -> Result<image::RgbaImage, CaptureError> {
        let image = self
            .backend
            .grab(&self.region)
            .map_err(|e| CaptureError::Backend(format!("{:#}", e)))?;

        if image.width() == 0 || image.height() == 0 {
            return Err(CaptureError::Empty);
        }
        if image.width() > MAX_GIF_DIMENSION || image.height() > MAX_GIF_DIMENSION {
            return Err(CaptureError::TooLarge {
                width: image.width(),
                height: image.height(),
                limit: MAX_GIF_DIMENSION,
            });
        }
        Ok(image)
    }
}
