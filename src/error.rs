//! Error types for recording sessions.
//!
//! Per-frame failures (`CaptureError`, `EncodingError`) are absorbed and counted by the
//! pipeline. Structural failures surface as `RecordingError` and end the session.

use thiserror::Error;

/// An invalid setting, reported before any session state is created.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("{field} must be {expected}, got {value}")]
    OutOfRange {
        field: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("recording region must have a non-zero size")]
    EmptyRegion,

    #[error("{0}")]
    Invalid(String),
}

impl ConfigError {
    pub(crate) fn out_of_range(
        field: &'static str,
        expected: &'static str,
        value: impl ToString,
    ) -> Self {
        ConfigError::OutOfRange {
            field,
            expected,
            value: value.to_string(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CaptureError {
    /// The screen-grab backend failed for this tick.
    #[error("screen grab failed: {0}")]
    Backend(String),

    #[error("captured frame is {width}x{height}, limit is {limit}px per side")]
    TooLarge { width: u32, height: u32, limit: u32 },

    #[error("captured frame is empty")]
    Empty,

    /// Too many consecutive failures; the session cannot continue.
    #[error("{failures} consecutive capture failures, last: {last}")]
    Escalated { failures: u32, last: String },
}

impl CaptureError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, CaptureError::Escalated { .. })
    }
}

#[derive(Error, Debug)]
pub enum EncodingError {
    #[error("cannot encode an empty frame")]
    EmptyFrame,

    #[error("frame of {pixels} pixels exceeds the encoder limit")]
    FrameTooLarge { pixels: usize },

    #[error("gif encoding failed: {0}")]
    Gif(#[from] gif::EncodingError),
}

#[derive(Error, Debug)]
pub enum AssemblyError {
    #[error("gif has already been finalized")]
    AlreadyFinalized,

    #[error("no frames were recorded")]
    NoFrames,

    #[error("frame {got} arrived after frame {last}")]
    OutOfOrder { last: u64, got: u64 },

    #[error("frame is {got_width}x{got_height} but the gif is {width}x{height}")]
    DimensionMismatch {
        width: u16,
        height: u16,
        got_width: u32,
        got_height: u32,
    },

    #[error("image dimensions {width}x{height} are too large for a gif")]
    TooLarge { width: u32, height: u32 },

    #[error("generated gif is {size} bytes, exceeding the {limit} byte limit")]
    OutputTooLarge { size: u64, limit: u64 },

    #[error("gif container write failed: {0}")]
    Gif(#[from] gif::EncodingError),

    #[error("failed to write gif: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("a recording session is already active")]
    AlreadyActive,

    #[error("no recording session is active")]
    NoActiveSession,

    #[error("capture error: {0}")]
    Capture(#[from] CaptureError),

    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    #[error("assembly error: {0}")]
    Assembly(#[from] AssemblyError),

    #[error("recording session failed: {0}")]
    SessionFailed(String),

    #[error("failed to start recording thread: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_message_names_field() {
        let err = ConfigError::out_of_range("fps", "between 1 and 100", 0);
        assert_eq!(err.to_string(), "fps must be between 1 and 100, got 0");
    }

    #[test]
    fn test_only_escalated_capture_errors_are_fatal() {
        assert!(!CaptureError::Backend("denied".into()).is_fatal());
        assert!(!CaptureError::Empty.is_fatal());
        let escalated = CaptureError::Escalated {
            failures: 3,
            last: "denied".into(),
        };
        assert!(escalated.is_fatal());
    }

    #[test]
    fn test_config_error_converts_into_recording_error() {
        let err: RecordingError = ConfigError::EmptyRegion.into();
        assert!(matches!(err, RecordingError::Config(ConfigError::EmptyRegion)));
    }
}
