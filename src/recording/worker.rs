use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crossbeam_channel::Receiver;

use crate::capture::Frame;
use crate::config::RecordingConfig;
use crate::error::RecordingError;

use super::gif_encoder::{write_gif, GifAssembler};
use super::palette::PaletteEncoder;
use super::preprocess::FramePreprocessor;
use super::session::{SessionState, SharedSession, MAX_SESSION_FRAMES};
use super::similarity::SimilarityFilter;

/// Consumer side of a session: filter, preprocess, palettize and assemble frames in
/// sequence order, then write the file once capture has ended.
///
/// Any tick that does not become a frame (failed capture, queue drop, similarity drop,
/// decimation, encode failure) lengthens the previous retained frame by one interval.
pub(crate) struct EncodeWorker {
    shared: Arc<SharedSession>,
    rx: Receiver<Frame>,
    filter: SimilarityFilter,
    preprocessor: FramePreprocessor,
    encoder: PaletteEncoder,
    assembler: GifAssembler,
    tick_ms: u32,
    disposal: u8,
    next_seq: u64,
    output_path: PathBuf,
}

impl EncodeWorker {
    pub(crate) fn new(
        config: &RecordingConfig,
        rx: Receiver<Frame>,
        shared: Arc<SharedSession>,
        output_path: PathBuf,
    ) -> Self {
        Self {
            shared,
            rx,
            filter: SimilarityFilter::new(config.similarity_skip, config.similarity_threshold),
            preprocessor: FramePreprocessor::from_config(config),
            encoder: PaletteEncoder::from_config(config),
            assembler: GifAssembler::new(),
            tick_ms: config.tick_ms(),
            disposal: config.disposal_method,
            next_seq: 0,
            output_path,
        }
    }

    pub(crate) fn run(mut self) {
        while let Ok(frame) = self.rx.recv() {
            if self.should_abort() {
                break;
            }
            if !self.process(frame) {
                break;
            }
            if self.assembler.frame_count() as u64 >= MAX_SESSION_FRAMES {
                tracing::info!(session = %self.shared.id, "frame limit reached, stopping");
                self.shared.frame_cap_reached.store(true, Ordering::Release);
                break;
            }
        }

        // Capture may still be winding down; everything left is discarded.
        let leftover = self.rx.iter().count() as u64;
        if leftover > 0 && !self.should_abort() {
            self.shared.skipped.fetch_add(leftover, Ordering::Relaxed);
        }
        self.finish();
    }

    fn should_abort(&self) -> bool {
        self.shared.is_cancelled() || self.shared.state() == SessionState::Failed
    }

    fn extend(&mut self, ticks: u64) {
        let extra = ticks.saturating_mul(u64::from(self.tick_ms));
        self.assembler.extend_last(u32::try_from(extra).unwrap_or(u32::MAX));
    }

    /// Returns false on a fatal assembly error.
    fn process(&mut self, frame: Frame) -> bool {
        let seq = frame.seq;
        if seq > self.next_seq {
            self.extend(seq - self.next_seq);
        }
        self.next_seq = seq + 1;

        if !self.filter.should_keep(&frame) {
            self.shared.dropped_similar.fetch_add(1, Ordering::Relaxed);
            self.extend(1);
            return true;
        }

        let Some(frame) = self.preprocessor.process(frame) else {
            self.shared.skipped.fetch_add(1, Ordering::Relaxed);
            self.extend(1);
            return true;
        };

        let indexed = match self.encoder.encode(&frame) {
            Ok(indexed) => indexed,
            Err(e) => {
                tracing::warn!(seq, "frame encoding failed: {}", e);
                self.shared.encode_errors.fetch_add(1, Ordering::Relaxed);
                self.shared.record_error(e);
                self.extend(1);
                return true;
            }
        };

        if let Err(e) = self.assembler.append(indexed, self.tick_ms, self.disposal) {
            self.shared.fail(e);
            return false;
        }
        self.shared
            .frames_written
            .store(self.assembler.frame_count() as u64, Ordering::Relaxed);
        true
    }

    fn finish(mut self) {
        if self.shared.is_cancelled() {
            self.cancelled();
            return;
        }
        if self.shared.state() == SessionState::Failed {
            return;
        }

        let ticks = self.shared.ticks.load(Ordering::Acquire);
        if ticks > self.next_seq {
            self.extend(ticks - self.next_seq);
        }

        let encode_errors = self.shared.encode_errors.load(Ordering::Relaxed);
        if self.assembler.frame_count() == 0 && encode_errors > 0 {
            self.shared.fail(RecordingError::SessionFailed(format!(
                "all {} frames failed to encode",
                encode_errors
            )));
            return;
        }

        let bytes = match self.assembler.finalize() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.shared.fail(e);
                return;
            }
        };

        if self.shared.is_cancelled() {
            self.cancelled();
            return;
        }
        if let Err(e) = write_gif(&self.output_path, &bytes) {
            tracing::warn!(path = %self.output_path.display(), "gif write failed");
            self.shared.fail(e);
            return;
        }
        if self.shared.is_cancelled() {
            if let Err(e) = std::fs::remove_file(&self.output_path) {
                tracing::warn!("failed to remove cancelled output: {}", e);
            }
            self.cancelled();
            return;
        }

        self.shared.set_output(self.output_path.clone(), bytes.len() as u64);
        self.shared.set_state(SessionState::Completed);
        let stats = self.shared.stats();
        tracing::info!(
            session = %self.shared.id,
            path = %self.output_path.display(),
            bytes = bytes.len(),
            frames = stats.frames_written,
            ticks = stats.ticks,
            dropped_similar = stats.dropped_similar,
            dropped_queue = stats.dropped_queue,
            skipped = stats.skipped,
            capture_errors = stats.capture_errors,
            encode_errors = stats.encode_errors,
            "recording saved"
        );
    }

    fn cancelled(&self) {
        self.shared.set_state(SessionState::Cancelled);
        tracing::info!(session = %self.shared.id, "recording cancelled, output discarded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AssemblyError, EncodingError};
    use crate::recording::gif_encoder::tests::decode;
    use crate::recording::queue::FrameQueue;
    use image::{Rgba, RgbaImage};
    use std::time::Duration;

    fn config() -> RecordingConfig {
        RecordingConfig {
            fps: 10,
            similarity_skip: false,
            dithering: false,
            color_count: 16,
            ..RecordingConfig::default()
        }
    }

    fn frame(seq: u64, value: u8) -> Frame {
        Frame::new(
            seq,
            Duration::ZERO,
            RgbaImage::from_pixel(8, 8, Rgba([value, value, value, 255])),
        )
    }

    fn run_worker(
        config: &RecordingConfig,
        frames: Vec<Frame>,
        ticks: u64,
    ) -> (Arc<SharedSession>, PathBuf, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.gif");
        let (queue, rx) = FrameQueue::new(64);
        let shared = Arc::new(SharedSession::new(config.tick_ms(), queue.dropped_counter()));
        for frame in frames {
            queue.push(frame);
        }
        shared.ticks.store(ticks, Ordering::Relaxed);
        drop(queue);
        EncodeWorker::new(config, rx, Arc::clone(&shared), path.clone()).run();
        (shared, path, dir)
    }

    #[test]
    fn test_sequence_gaps_extend_previous_frame() {
        let frames = vec![frame(0, 10), frame(1, 20), frame(4, 30)];
        let (shared, path, _dir) = run_worker(&config(), frames, 6);
        assert_eq!(shared.state(), SessionState::Completed);

        let decoded = decode(&std::fs::read(path).unwrap());
        let delays: Vec<u16> = decoded.iter().map(|f| f.delay).collect();
        assert_eq!(delays, vec![10, 30, 20]);
    }

    #[test]
    fn test_similar_frames_merge_into_previous() {
        let config = RecordingConfig {
            similarity_skip: true,
            similarity_threshold: 0.9,
            ..config()
        };
        let frames = (0..5).map(|seq| frame(seq, 50)).collect();
        let (shared, path, _dir) = run_worker(&config, frames, 5);
        let stats = shared.stats();
        assert_eq!(stats.dropped_similar, 4);
        assert_eq!(stats.frames_written, 1);

        let decoded = decode(&std::fs::read(path).unwrap());
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].delay, 50);
    }

    #[test]
    fn test_skip_value_decimates_and_keeps_total_time() {
        let config = RecordingConfig {
            skip_value: 2,
            ..config()
        };
        let frames = (0..6).map(|seq| frame(seq, seq as u8 * 40)).collect();
        let (shared, path, _dir) = run_worker(&config, frames, 6);
        assert_eq!(shared.stats().skipped, 3);
        let decoded = decode(&std::fs::read(path).unwrap());
        assert_eq!(decoded.len(), 3);
        let total: u32 = decoded.iter().map(|f| u32::from(f.delay)).sum();
        assert_eq!(total, 60);
    }

    #[test]
    fn test_cancel_discards_output() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.gif");
        let (queue, rx) = FrameQueue::new(8);
        let shared = Arc::new(SharedSession::new(100, queue.dropped_counter()));
        queue.push(frame(0, 1));
        shared.cancel.store(true, Ordering::Release);
        drop(queue);
        EncodeWorker::new(&config(), rx, Arc::clone(&shared), path.clone()).run();
        assert_eq!(shared.state(), SessionState::Cancelled);
        assert!(!path.exists());
    }

    #[test]
    fn test_no_frames_fails_session() {
        let (shared, path, _dir) = run_worker(&config(), Vec::new(), 3);
        assert_eq!(shared.state(), SessionState::Failed);
        assert!(matches!(
            shared.last_error().as_deref(),
            Some(RecordingError::Assembly(AssemblyError::NoFrames))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_size_change_is_fatal() {
        let frames = vec![
            frame(0, 1),
            Frame::new(1, Duration::ZERO, RgbaImage::new(4, 4)),
        ];
        let (shared, path, _dir) = run_worker(&config(), frames, 2);
        assert_eq!(shared.state(), SessionState::Failed);
        assert!(matches!(
            shared.last_error().as_deref(),
            Some(RecordingError::Assembly(AssemblyError::DimensionMismatch { .. }))
        ));
        assert!(!path.exists());
    }

    #[test]
    fn test_unencodable_frame_extends_previous() {
        let frames = vec![
            frame(0, 10),
            Frame::new(1, Duration::ZERO, RgbaImage::new(0, 0)),
            frame(2, 30),
        ];
        let (shared, path, _dir) = run_worker(&config(), frames, 3);
        assert_eq!(shared.state(), SessionState::Completed);
        let stats = shared.stats();
        assert_eq!(stats.encode_errors, 1);
        assert_eq!(stats.frames_written, 2);
        assert!(matches!(
            shared.last_error().as_deref(),
            Some(RecordingError::Encoding(EncodingError::EmptyFrame))
        ));

        let decoded = decode(&std::fs::read(path).unwrap());
        let delays: Vec<u16> = decoded.iter().map(|f| f.delay).collect();
        assert_eq!(delays, vec![20, 10]);
    }

    #[test]
    fn test_every_frame_failing_to_encode_fails_session() {
        let frames = (0..3)
            .map(|seq| Frame::new(seq, Duration::ZERO, RgbaImage::new(0, 0)))
            .collect();
        let (shared, path, _dir) = run_worker(&config(), frames, 3);
        assert_eq!(shared.state(), SessionState::Failed);
        assert_eq!(shared.stats().encode_errors, 3);
        assert_eq!(shared.stats().frames_written, 0);
        let error = shared.last_error().unwrap();
        assert!(matches!(*error, RecordingError::SessionFailed(_)));
        assert!(error.to_string().contains("all 3 frames failed to encode"));
        assert!(!path.exists());
    }
}
