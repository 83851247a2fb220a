pub mod capture;
pub mod config;
pub mod error;
pub mod recording;

pub use capture::{Frame, Rectangle, ScreenCapture, ScreenGrab};
pub use config::{Config, RecordingConfig};
pub use error::{AssemblyError, CaptureError, ConfigError, EncodingError, RecordingError};
pub use recording::{RecordingController, SessionReport, SessionState};
