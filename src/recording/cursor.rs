use std::sync::{Arc, Mutex};

use image::{imageops, Rgba, RgbaImage};

use crate::capture::{Frame, Rectangle};

/// Source of the pointer position in screen coordinates.
pub trait CursorProvider: Send + Sync {
    fn position(&self) -> Option<(i32, i32)>;
}

/// Reads the pointer from the windowing system.
///
/// On X11 one connection is opened up front and reused for every query. A failed query
/// drops it and the next query reconnects.
pub struct SystemCursor {
    #[cfg(target_os = "linux")]
    x11: Reconnecting<X11Pointer>,
}

#[cfg(target_os = "linux")]
impl SystemCursor {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {
            x11: Reconnecting::new(X11Pointer::connect)?,
        })
    }
}

#[cfg(not(target_os = "linux"))]
impl SystemCursor {
    pub fn new() -> anyhow::Result<Self> {
        Ok(Self {})
    }
}

#[cfg(windows)]
impl CursorProvider for SystemCursor {
    fn position(&self) -> Option<(i32, i32)> {
        use windows::Win32::Foundation::POINT;
        use windows::Win32::UI::WindowsAndMessaging::GetCursorPos;

        unsafe {
            let mut pt = POINT::default();
            GetCursorPos(&mut pt).ok()?;
            Some((pt.x, pt.y))
        }
    }
}

#[cfg(target_os = "linux")]
impl CursorProvider for SystemCursor {
    fn position(&self) -> Option<(i32, i32)> {
        self.x11.with(X11Pointer::query)
    }
}

#[cfg(not(any(windows, target_os = "linux")))]
impl CursorProvider for SystemCursor {
    fn position(&self) -> Option<(i32, i32)> {
        None
    }
}

#[cfg(target_os = "linux")]
struct X11Pointer {
    conn: x11rb::rust_connection::RustConnection,
    root: x11rb::protocol::xproto::Window,
}

#[cfg(target_os = "linux")]
impl X11Pointer {
    fn connect() -> anyhow::Result<Self> {
        use anyhow::Context as _;
        use x11rb::connection::Connection;

        let (conn, screen_num) = x11rb::connect(None).context("connecting to the X server")?;
        let root = conn
            .setup()
            .roots
            .get(screen_num)
            .with_context(|| format!("X screen {} not found", screen_num))?
            .root;
        Ok(Self { conn, root })
    }

    fn query(&self) -> anyhow::Result<(i32, i32)> {
        use x11rb::protocol::xproto::ConnectionExt;

        let reply = self.conn.query_pointer(self.root)?.reply()?;
        Ok((i32::from(reply.root_x), i32::from(reply.root_y)))
    }
}

/// A connection that is dropped after a failed use and reopened on the next one.
#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
struct Reconnecting<T> {
    slot: Mutex<Option<T>>,
    connect: fn() -> anyhow::Result<T>,
}

#[cfg_attr(not(target_os = "linux"), allow(dead_code))]
impl<T> Reconnecting<T> {
    fn new(connect: fn() -> anyhow::Result<T>) -> anyhow::Result<Self> {
        Ok(Self {
            slot: Mutex::new(Some(connect()?)),
            connect,
        })
    }

    fn with<R>(&self, f: impl FnOnce(&T) -> anyhow::Result<R>) -> Option<R> {
        let mut slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            match (self.connect)() {
                Ok(conn) => *slot = Some(conn),
                Err(e) => {
                    tracing::debug!("cursor reconnect failed: {:#}", e);
                    return None;
                }
            }
        }
        let conn = slot.as_ref()?;
        match f(conn) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::debug!("cursor query failed, dropping connection: {:#}", e);
                *slot = None;
                None
            }
        }
    }
}

/// Cursor with no position; recordings come out without a pointer.
pub struct NoCursor;

impl CursorProvider for NoCursor {
    fn position(&self) -> Option<(i32, i32)> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct CursorSprite {
    pub image: RgbaImage,
    pub hotspot: (i32, i32),
}

impl CursorSprite {
    /// 32x32 black cross with a white outline, hotspot at the centre.
    pub fn crosshair() -> Self {
        const SIZE: u32 = 32;
        const CENTER: i64 = 16;
        let mut image = RgbaImage::from_pixel(SIZE, SIZE, Rgba([0, 0, 0, 0]));

        for (half_width, color) in [(4i64, Rgba([255, 255, 255, 255])), (2, Rgba([0, 0, 0, 255]))] {
            for (x, y, pixel) in image.enumerate_pixels_mut() {
                let dx = i64::from(x) - CENTER;
                let dy = i64::from(y) - CENTER;
                if dx.abs() < half_width || dy.abs() < half_width {
                    *pixel = color;
                }
            }
        }

        Self {
            image,
            hotspot: (CENTER as i32, CENTER as i32),
        }
    }
}

impl Default for CursorSprite {
    fn default() -> Self {
        Self::crosshair()
    }
}

/// Composites the pointer onto frames, re-reading its position only once every
/// `mouse_skip + 1` frames.
pub struct CursorThrottle {
    provider: Arc<dyn CursorProvider>,
    region: Rectangle,
    sprite: CursorSprite,
    last_position: Option<(i32, i32)>,
}

impl CursorThrottle {
    pub fn new(provider: Arc<dyn CursorProvider>, region: Rectangle) -> Self {
        Self {
            provider,
            region,
            sprite: CursorSprite::default(),
            last_position: None,
        }
    }

    pub fn with_sprite(mut self, sprite: CursorSprite) -> Self {
        self.sprite = sprite;
        self
    }

    /// Region-relative position drawn on the most recent frame.
    pub fn last_position(&self) -> Option<(i32, i32)> {
        self.last_position
    }

    pub fn overlay_cursor(&mut self, mut frame: Frame, frame_index: u64, mouse_skip: u32) -> Frame {
        if frame_index % (u64::from(mouse_skip) + 1) == 0 {
            self.last_position = self
                .provider
                .position()
                .filter(|&(x, y)| self.region.contains(x, y))
                .map(|(x, y)| (x - self.region.x, y - self.region.y));
        }

        if let Some((x, y)) = self.last_position {
            imageops::overlay(
                &mut frame.image,
                &self.sprite.image,
                i64::from(x - self.sprite.hotspot.0),
                i64::from(y - self.sprite.hotspot.1),
            );
        }
        frame
    }
}
