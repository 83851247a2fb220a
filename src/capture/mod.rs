mod frame;
mod screen;
mod source;

pub use frame::Frame;
pub use screen::ScreenCapture;
pub use source::{FrameSource, MAX_CONSECUTIVE_FAILURES};

use anyhow::Result;
use image::RgbaImage;

/// Largest frame edge accepted from a backend.
pub const MAX_GIF_DIMENSION: u32 = 4096;

/// Synchronous screen-grab backend. Implementations return the pixels of `region`
/// in screen coordinates, or an error such as permission denied or out of bounds.
pub trait ScreenGrab: Send + Sync {
    fn grab(&self, region: &Rectangle) -> Result<RgbaImage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rectangle {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Rectangle {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn contains(&self, px: i32, py: i32) -> bool {
        let dx = i64::from(px) - i64::from(self.x);
        let dy = i64::from(py) - i64::from(self.y);
        dx >= 0 && dy >= 0 && dx < i64::from(self.width) && dy < i64::from(self.height)
    }
}

#[derive(Debug, Clone)]
pub struct MonitorInfo {
    pub id: u32,
    pub name: String,
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
    pub is_primary: bool,
}

pub fn list_monitors() -> Result<Vec<MonitorInfo>> {
    let screens = xcap::Monitor::all()?;
    let monitors: Vec<MonitorInfo> = screens
        .into_iter()
        .map(|s| MonitorInfo {
            id: s.id(),
            name: s.name().to_string(),
            x: s.x(),
            y: s.y(),
            width: s.width(),
            height: s.height(),
            is_primary: s.is_primary(),
        })
        .collect();
    Ok(monitors)
}
