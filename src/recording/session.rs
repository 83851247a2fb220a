use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use uuid::Uuid;

use crate::error::RecordingError;

/// Hard cap on frames written in one session; reaching it stops the session normally.
pub const MAX_SESSION_FRAMES: u64 = 18000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Recording,
    Paused,
    Stopping,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }

    /// Whether a session in this state blocks a new `start`.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Recording | SessionState::Paused | SessionState::Stopping
        )
    }
}

/// Point-in-time counters for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Timer ticks elapsed, including ones whose capture failed.
    pub ticks: u64,
    pub frames_captured: u64,
    pub capture_errors: u64,
    pub dropped_similar: u64,
    pub skipped: u64,
    pub dropped_queue: u64,
    pub encode_errors: u64,
    pub frames_written: u64,
    /// Recorded time, excluding pauses.
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SessionReport {
    pub id: SessionId,
    pub state: SessionState,
    pub stats: SessionStats,
    /// Set only when the file was written.
    pub output_path: Option<PathBuf>,
    pub bytes_written: u64,
    /// The error that ended the session, or the last per-frame error it absorbed.
    pub last_error: Option<Arc<RecordingError>>,
}

/// State shared by the controller, the capture loop and the encoding worker.
///
/// Counters are written by exactly one side each. The controller only reads them.
pub(crate) struct SharedSession {
    pub(crate) id: SessionId,
    pub(crate) tick_ms: u32,
    state: Mutex<SessionState>,
    last_error: Mutex<Option<Arc<RecordingError>>>,
    output: Mutex<Option<(PathBuf, u64)>>,
    pub(crate) cancel: AtomicBool,
    pub(crate) frame_cap_reached: AtomicBool,
    pub(crate) ticks: AtomicU64,
    pub(crate) frames_captured: AtomicU64,
    pub(crate) capture_errors: AtomicU64,
    pub(crate) dropped_similar: AtomicU64,
    pub(crate) skipped: AtomicU64,
    pub(crate) dropped_queue: Arc<AtomicU64>,
    pub(crate) encode_errors: AtomicU64,
    pub(crate) frames_written: AtomicU64,
}

impl SharedSession {
    pub(crate) fn new(tick_ms: u32, dropped_queue: Arc<AtomicU64>) -> Self {
        Self {
            id: SessionId::new(),
            tick_ms,
            state: Mutex::new(SessionState::Recording),
            last_error: Mutex::new(None),
            output: Mutex::new(None),
            cancel: AtomicBool::new(false),
            frame_cap_reached: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            frames_captured: AtomicU64::new(0),
            capture_errors: AtomicU64::new(0),
            dropped_similar: AtomicU64::new(0),
            skipped: AtomicU64::new(0),
            dropped_queue,
            encode_errors: AtomicU64::new(0),
            frames_written: AtomicU64::new(0),
        }
    }

    pub(crate) fn state(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Moves to `next` unless the session already ended. Returns whether it moved.
    pub(crate) fn set_state(&self, next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.is_terminal() {
            return false;
        }
        *state = next;
        true
    }

    /// Moves from one of `from` to `next`. Returns whether it moved.
    pub(crate) fn transition(&self, from: &[SessionState], next: SessionState) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if !from.contains(&*state) {
            return false;
        }
        *state = next;
        true
    }

    pub(crate) fn record_error(&self, error: impl Into<RecordingError>) {
        let error = Arc::new(error.into());
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(error);
    }

    pub(crate) fn last_error(&self) -> Option<Arc<RecordingError>> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn fail(&self, error: impl Into<RecordingError>) {
        let error = error.into();
        tracing::error!(session = %self.id, "recording failed: {}", error);
        self.record_error(error);
        self.set_state(SessionState::Failed);
    }

    pub(crate) fn set_output(&self, path: PathBuf, bytes: u64) {
        *self.output.lock().unwrap_or_else(|e| e.into_inner()) = Some((path, bytes));
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancel.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> SessionStats {
        let ticks = self.ticks.load(Ordering::Relaxed);
        SessionStats {
            ticks,
            frames_captured: self.frames_captured.load(Ordering::Relaxed),
            capture_errors: self.capture_errors.load(Ordering::Relaxed),
            dropped_similar: self.dropped_similar.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            dropped_queue: self.dropped_queue.load(Ordering::Relaxed),
            encode_errors: self.encode_errors.load(Ordering::Relaxed),
            frames_written: self.frames_written.load(Ordering::Relaxed),
            elapsed_ms: ticks.saturating_mul(u64::from(self.tick_ms)),
        }
    }

    pub(crate) fn report(&self) -> SessionReport {
        let state = self.state();
        let output = self
            .output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        let (output_path, bytes_written) = match (state, output) {
            (SessionState::Completed, Some((path, bytes))) => (Some(path), bytes),
            _ => (None, 0),
        };
        SessionReport {
            id: self.id,
            state,
            stats: self.stats(),
            output_path,
            bytes_written,
            last_error: self.last_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{CaptureError, EncodingError};

    fn shared() -> SharedSession {
        SharedSession::new(100, Arc::new(AtomicU64::new(0)))
    }

    #[test]
    fn test_terminal_state_is_sticky() {
        let session = shared();
        assert!(session.set_state(SessionState::Cancelled));
        assert!(!session.set_state(SessionState::Completed));
        assert_eq!(session.state(), SessionState::Cancelled);
    }

    #[test]
    fn test_transition_requires_expected_source() {
        let session = shared();
        assert!(!session.transition(&[SessionState::Paused], SessionState::Recording));
        assert!(session.transition(&[SessionState::Recording], SessionState::Paused));
        assert_eq!(session.state(), SessionState::Paused);
    }

    #[test]
    fn test_fail_records_last_error() {
        let session = shared();
        session.fail(RecordingError::SessionFailed("disk full".into()));
        let report = session.report();
        assert_eq!(report.state, SessionState::Failed);
        assert!(matches!(
            report.last_error.as_deref(),
            Some(RecordingError::SessionFailed(msg)) if msg == "disk full"
        ));
        assert!(report.output_path.is_none());
    }

    #[test]
    fn test_absorbed_error_keeps_its_kind() {
        let session = shared();
        session.record_error(CaptureError::Empty);
        assert_eq!(session.state(), SessionState::Recording);
        assert!(matches!(
            session.last_error().as_deref(),
            Some(RecordingError::Capture(CaptureError::Empty))
        ));

        session.record_error(EncodingError::EmptyFrame);
        assert!(matches!(
            session.report().last_error.as_deref(),
            Some(RecordingError::Encoding(EncodingError::EmptyFrame))
        ));
    }

    #[test]
    fn test_output_reported_only_when_completed() {
        let session = shared();
        session.set_output(PathBuf::from("out.gif"), 42);
        assert!(session.report().output_path.is_none());
        session.set_state(SessionState::Completed);
        let report = session.report();
        assert_eq!(report.output_path, Some(PathBuf::from("out.gif")));
        assert_eq!(report.bytes_written, 42);
    }

    #[test]
    fn test_elapsed_follows_ticks() {
        let session = shared();
        session.ticks.store(7, Ordering::Relaxed);
        assert_eq!(session.stats().elapsed_ms, 700);
    }

    #[test]
    fn test_state_classification() {
        assert!(SessionState::Paused.is_active());
        assert!(!SessionState::Idle.is_active());
        assert!(SessionState::Failed.is_terminal());
        assert!(!SessionState::Stopping.is_terminal());
    }
}
