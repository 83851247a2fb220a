use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, RecvTimeoutError, Sender};

use crate::capture::{Frame, FrameSource, Rectangle, ScreenGrab, MAX_GIF_DIMENSION};
use crate::config::RecordingConfig;
use crate::error::{ConfigError, RecordingError};

use super::cursor::{CursorProvider, CursorThrottle};
use super::preview::PreviewFeed;
use super::queue::{FrameQueue, MAX_QUEUE_DEPTH};
use super::session::{SessionId, SessionReport, SessionState, SessionStats, SharedSession};
use super::worker::EncodeWorker;

/// How often a paused capture thread checks whether the encoder gave up.
const PAUSED_POLL: Duration = Duration::from_millis(100);

#[derive(Debug)]
enum Command {
    Stop,
    Cancel,
    /// Acknowledged once the capture thread is parked.
    Pause(Sender<()>),
    Resume,
}

struct ActiveSession {
    shared: Arc<SharedSession>,
    commands: Sender<Command>,
    capture: Option<JoinHandle<()>>,
    worker: Option<JoinHandle<()>>,
}

impl ActiveSession {
    fn send(&self, command: Command) {
        // The capture thread may already have exited on its own.
        let _ = self.commands.send(command);
    }

    fn join(&mut self) {
        for handle in [self.capture.take(), self.worker.take()].into_iter().flatten() {
            if handle.join().is_err() {
                self.shared.fail(RecordingError::SessionFailed(
                    "recording thread panicked".into(),
                ));
            }
        }
    }
}

/// Owns at most one recording session at a time.
///
/// Each session runs a capture thread driven by the fps timer and an encoding thread fed
/// through a bounded drop-oldest queue. The controller only signals the threads and reads
/// their shared counters.
pub struct RecordingController {
    backend: Arc<dyn ScreenGrab>,
    cursor: Arc<dyn CursorProvider>,
    preview: PreviewFeed,
    session: Option<ActiveSession>,
}

impl RecordingController {
    pub fn new(backend: Arc<dyn ScreenGrab>, cursor: Arc<dyn CursorProvider>) -> Self {
        Self {
            backend,
            cursor,
            preview: PreviewFeed::new(),
            session: None,
        }
    }

    pub fn state(&self) -> SessionState {
        self.session
            .as_ref()
            .map_or(SessionState::Idle, |s| s.shared.state())
    }

    /// Counters of the current or most recent session.
    pub fn status(&self) -> Option<SessionStats> {
        self.session.as_ref().map(|s| s.shared.stats())
    }

    pub fn subscribe_preview(&self) -> Receiver<Frame> {
        self.preview.subscribe()
    }

    pub fn start(
        &mut self,
        config: RecordingConfig,
        region: Rectangle,
        output_path: impl Into<PathBuf>,
    ) -> Result<SessionId, RecordingError> {
        if self.state().is_active() {
            return Err(RecordingError::AlreadyActive);
        }
        config.validate()?;
        if region.is_empty() {
            return Err(ConfigError::EmptyRegion.into());
        }
        if region.width > MAX_GIF_DIMENSION || region.height > MAX_GIF_DIMENSION {
            return Err(ConfigError::out_of_range(
                "region",
                "at most 4096px per side",
                format!("{}x{}", region.width, region.height),
            )
            .into());
        }

        if let Some(mut previous) = self.session.take() {
            // After a worker failure the capture thread may still be ticking.
            previous.send(Command::Cancel);
            previous.join();
        }

        let output_path = output_path.into();
        let (queue, rx) = FrameQueue::new(MAX_QUEUE_DEPTH);
        let shared = Arc::new(SharedSession::new(config.tick_ms(), queue.dropped_counter()));
        let (commands, command_rx) = unbounded();

        let worker = EncodeWorker::new(&config, rx, Arc::clone(&shared), output_path.clone());
        let worker = thread::Builder::new()
            .name("gifrec-encode".into())
            .spawn(move || worker.run())?;

        let capture = CaptureLoop {
            source: FrameSource::new(Arc::clone(&self.backend), region),
            cursor: config
                .show_cursor
                .then(|| CursorThrottle::new(Arc::clone(&self.cursor), region)),
            mouse_skip: config.mouse_skip,
            captured: 0,
            queue,
            preview: self.preview.clone(),
            commands: command_rx,
            shared: Arc::clone(&shared),
            interval: config.frame_interval(),
            max_ticks: config.max_ticks(),
        };
        let capture = thread::Builder::new()
            .name("gifrec-capture".into())
            .spawn(move || capture.run())?;

        let id = shared.id;
        tracing::info!(
            session = %id,
            x = region.x,
            y = region.y,
            width = region.width,
            height = region.height,
            fps = config.fps,
            path = %output_path.display(),
            "recording started"
        );

        self.session = Some(ActiveSession {
            shared,
            commands,
            capture: Some(capture),
            worker: Some(worker),
        });
        Ok(id)
    }

    /// Suspends capture. Returns once the capture thread has parked, so no grab starts
    /// after this call; one already in progress is finished and kept.
    pub fn pause(&mut self) -> Result<(), RecordingError> {
        let session = self.active()?;
        if session
            .shared
            .transition(&[SessionState::Recording], SessionState::Paused)
        {
            let (ack, parked) = bounded(1);
            session.send(Command::Pause(ack));
            // Disconnects instead if the capture thread has already exited.
            let _ = parked.recv();
            tracing::info!(session = %session.shared.id, "recording paused");
        }
        Ok(())
    }

    pub fn resume(&mut self) -> Result<(), RecordingError> {
        let session = self.active()?;
        if session
            .shared
            .transition(&[SessionState::Paused], SessionState::Recording)
        {
            session.send(Command::Resume);
            tracing::info!(session = %session.shared.id, "recording resumed");
        }
        Ok(())
    }

    /// Ends capture, waits for the file to be written and reports the outcome.
    pub fn stop(&mut self) -> Result<SessionReport, RecordingError> {
        let session = self.session.as_ref().ok_or(RecordingError::NoActiveSession)?;
        if session.shared.transition(
            &[SessionState::Recording, SessionState::Paused],
            SessionState::Stopping,
        ) {
            tracing::info!(session = %session.shared.id, "stopping recording");
        }
        session.send(Command::Stop);
        self.wait()
    }

    /// Ends capture and discards everything, including frames still queued.
    pub fn cancel(&mut self) -> Result<SessionReport, RecordingError> {
        let session = self.session.as_ref().ok_or(RecordingError::NoActiveSession)?;
        if !session.shared.state().is_terminal() {
            session.shared.cancel.store(true, Ordering::Release);
        }
        session.send(Command::Cancel);
        self.wait()
    }

    /// Blocks until the session reaches a terminal state.
    pub fn wait(&mut self) -> Result<SessionReport, RecordingError> {
        let session = self.session.as_mut().ok_or(RecordingError::NoActiveSession)?;
        session.join();
        Ok(session.shared.report())
    }

    fn active(&self) -> Result<&ActiveSession, RecordingError> {
        self.session
            .as_ref()
            .filter(|s| s.shared.state().is_active())
            .ok_or(RecordingError::NoActiveSession)
    }
}

impl Drop for RecordingController {
    fn drop(&mut self) {
        if let Some(session) = self.session.as_ref() {
            if !session.shared.state().is_terminal() {
                session.shared.cancel.store(true, Ordering::Release);
            }
            if session.capture.is_some() || session.worker.is_some() {
                session.send(Command::Cancel);
            }
        }
    }
}

/// Timer-driven producer half of a session.
struct CaptureLoop {
    source: FrameSource,
    cursor: Option<CursorThrottle>,
    mouse_skip: u32,
    captured: u64,
    queue: FrameQueue,
    preview: PreviewFeed,
    commands: Receiver<Command>,
    shared: Arc<SharedSession>,
    interval: Duration,
    max_ticks: Option<u64>,
}

impl CaptureLoop {
    fn run(mut self) {
        loop {
            if self.shared.state() == SessionState::Failed {
                return;
            }
            if self.max_ticks.is_some_and(|max| self.source.next_seq() >= max) {
                tracing::info!(session = %self.shared.id, "recording duration reached");
                break;
            }
            if self.shared.frame_cap_reached.load(Ordering::Acquire) {
                break;
            }

            let deadline = Instant::now() + self.interval;
            if !self.tick() {
                return;
            }
            if !self.wait_for_next_tick(deadline) {
                break;
            }
        }

        // A cancelled session goes straight to Cancelled once the worker drains.
        if !self.shared.is_cancelled() {
            self.shared.transition(
                &[SessionState::Recording, SessionState::Paused],
                SessionState::Stopping,
            );
        }
    }

    /// One timer tick. Returns false when the session must end immediately.
    fn tick(&mut self) -> bool {
        let result = self.source.capture();
        self.shared
            .ticks
            .store(self.source.next_seq(), Ordering::Release);

        match result {
            Ok(frame) => {
                self.shared.frames_captured.fetch_add(1, Ordering::Relaxed);
                let index = self.captured;
                self.captured += 1;
                let frame = match self.cursor.as_mut() {
                    Some(cursor) => cursor.overlay_cursor(frame, index, self.mouse_skip),
                    None => frame,
                };
                self.preview.publish(&frame);
                self.queue.push(frame)
            }
            Err(e) => {
                self.shared.capture_errors.fetch_add(1, Ordering::Relaxed);
                if e.is_fatal() {
                    self.shared.fail(e);
                    return false;
                }
                self.shared.record_error(e);
                true
            }
        }
    }

    /// Sleeps until `deadline` while handling commands. A late tick is not made up for.
    fn wait_for_next_tick(&mut self, deadline: Instant) -> bool {
        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match self.commands.recv_timeout(timeout) {
                Err(RecvTimeoutError::Timeout) => return true,
                Err(RecvTimeoutError::Disconnected) => return false,
                Ok(Command::Stop | Command::Cancel) => return false,
                Ok(Command::Resume) => {}
                Ok(Command::Pause(ack)) => {
                    let _ = ack.send(());
                    return self.paused();
                }
            }
        }
    }

    /// Blocks until resumed. Returns false when the session ends while paused.
    fn paused(&mut self) -> bool {
        loop {
            match self.commands.recv_timeout(PAUSED_POLL) {
                Ok(Command::Resume) => return true,
                Ok(Command::Pause(ack)) => {
                    let _ = ack.send(());
                }
                Ok(Command::Stop | Command::Cancel)
                | Err(RecvTimeoutError::Disconnected) => return false,
                Err(RecvTimeoutError::Timeout) => {
                    if self.shared.state() == SessionState::Failed {
                        return false;
                    }
                }
            }
        }
    }
}
