use anyhow::{anyhow, Result};
use image::RgbaImage;
use xcap::Monitor;

use super::{Rectangle, ScreenGrab};

const MAX_TOTAL_DIMENSION: i32 = 32768;

/// xcap-backed grab of a region spanning the virtual desktop.
pub struct ScreenCapture;

impl ScreenCapture {
    pub fn new() -> Self {
        Self
    }

    /// Monitors overlapping `region`. Fails when the region leaves the virtual desktop.
    fn monitors_for(region: &Rectangle) -> Result<Vec<Monitor>> {
        let monitors = Monitor::all()?;
        if monitors.is_empty() {
            return Err(anyhow!("No monitors found"));
        }

        let min_x = monitors.iter().map(|m| m.x()).min().unwrap_or(0);
        let min_y = monitors.iter().map(|m| m.y()).min().unwrap_or(0);
        let max_x = monitors
            .iter()
            .map(|m| m.x().saturating_add(m.width() as i32))
            .max()
            .unwrap_or(0);
        let max_y = monitors
            .iter()
            .map(|m| m.y().saturating_add(m.height() as i32))
            .max()
            .unwrap_or(0);

        let width_i32 = max_x.saturating_sub(min_x);
        let height_i32 = max_y.saturating_sub(min_y);
        if width_i32 <= 0 || height_i32 <= 0 {
            return Err(anyhow!("Invalid monitor dimensions"));
        }
        if width_i32 > MAX_TOTAL_DIMENSION || height_i32 > MAX_TOTAL_DIMENSION {
            return Err(anyhow!("Combined monitor area too large"));
        }

        let region_right = i64::from(region.x) + i64::from(region.width);
        let region_bottom = i64::from(region.y) + i64::from(region.height);
        if region.x < min_x
            || region.y < min_y
            || region_right > i64::from(max_x)
            || region_bottom > i64::from(max_y)
        {
            return Err(anyhow!(
                "Region {}x{}+{}+{} is outside the desktop bounds",
                region.width,
                region.height,
                region.x,
                region.y
            ));
        }

        let overlapping = monitors
            .into_iter()
            .filter(|m| {
                let right = i64::from(m.x()) + i64::from(m.width());
                let bottom = i64::from(m.y()) + i64::from(m.height());
                i64::from(m.x()) < region_right
                    && right > i64::from(region.x)
                    && i64::from(m.y()) < region_bottom
                    && bottom > i64::from(region.y)
            })
            .collect();

        Ok(overlapping)
    }
}

impl Default for ScreenCapture {
    fn default() -> Self {
        Self::new()
    }
}

impl ScreenGrab for ScreenCapture {
    fn grab(&self, region: &Rectangle) -> Result<RgbaImage> {
        if region.is_empty() {
            return Err(anyhow!("Invalid region"));
        }
        let monitors = Self::monitors_for(region)?;

        let mut combined = RgbaImage::new(region.width, region.height);

        for monitor in monitors {
            let img = monitor.capture_image()?;
            let offset_x = i64::from(monitor.x()) - i64::from(region.x);
            let offset_y = i64::from(monitor.y()) - i64::from(region.y);

            for (x, y, pixel) in img.enumerate_pixels() {
                let dest_x = offset_x + i64::from(x);
                let dest_y = offset_y + i64::from(y);
                if dest_x >= 0
                    && dest_y >= 0
                    && dest_x < i64::from(region.width)
                    && dest_y < i64::from(region.height)
                {
                    combined.put_pixel(dest_x as u32, dest_y as u32, *pixel);
                }
            }
        }

        Ok(combined)
    }
}
