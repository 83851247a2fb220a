use gif::{DisposalMethod, Encoder, Repeat};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use crate::error::AssemblyError;

use super::palette::IndexedFrame;

pub const MAX_GIF_FILE_SIZE: u64 = 500 * 1024 * 1024;
/// Shortest delay most decoders honor; anything faster gets slowed to 100ms.
const MIN_DELAY_CS: u16 = 2;

pub fn disposal_method(code: u8) -> DisposalMethod {
    match code {
        1 => DisposalMethod::Keep,
        2 => DisposalMethod::Background,
        3 => DisposalMethod::Previous,
        _ => DisposalMethod::Any,
    }
}

fn delay_centis(duration_ms: u32) -> u16 {
    let centis = (u64::from(duration_ms) + 5) / 10;
    centis.clamp(u64::from(MIN_DELAY_CS), u64::from(u16::MAX)) as u16
}

struct PendingFrame {
    frame: IndexedFrame,
    duration_ms: u32,
    disposal: u8,
}

/// Streams palettized frames into an in-memory GIF.
///
/// The most recent frame is held back until the next one arrives so dropped ticks can
/// still extend its display time through [`GifAssembler::extend_last`].
pub struct GifAssembler {
    encoder: Option<Encoder<Vec<u8>>>,
    dimensions: Option<(u16, u16)>,
    pending: Option<PendingFrame>,
    last_seq: Option<u64>,
    written: usize,
    finalized: bool,
}

impl GifAssembler {
    pub fn new() -> Self {
        Self {
            encoder: None,
            dimensions: None,
            pending: None,
            last_seq: None,
            written: 0,
            finalized: false,
        }
    }

    /// Frames accepted so far, including the held-back one.
    pub fn frame_count(&self) -> usize {
        self.written + usize::from(self.pending.is_some())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn append(
        &mut self,
        frame: IndexedFrame,
        duration_ms: u32,
        disposal: u8,
    ) -> Result<(), AssemblyError> {
        if self.finalized {
            return Err(AssemblyError::AlreadyFinalized);
        }
        if let Some(last) = self.last_seq {
            if frame.seq <= last {
                return Err(AssemblyError::OutOfOrder {
                    last,
                    got: frame.seq,
                });
            }
        }
        self.check_dimensions(&frame)?;
        if self.dimensions.is_none() {
            self.dimensions = Some((frame.width as u16, frame.height as u16));
        }

        if let Some(previous) = self.pending.take() {
            self.write(previous)?;
        }
        self.last_seq = Some(frame.seq);
        self.pending = Some(PendingFrame {
            frame,
            duration_ms,
            disposal,
        });
        Ok(())
    }

    /// Adds display time to the last appended frame. No-op before the first frame.
    pub fn extend_last(&mut self, extra_ms: u32) {
        if let Some(pending) = self.pending.as_mut() {
            pending.duration_ms = pending.duration_ms.saturating_add(extra_ms);
        }
    }

    /// Flushes everything appended so far and returns the finished GIF.
    /// Callable once; later calls fail with `AlreadyFinalized`.
    pub fn finalize(&mut self) -> Result<Vec<u8>, AssemblyError> {
        if self.finalized {
            return Err(AssemblyError::AlreadyFinalized);
        }
        self.finalized = true;

        if let Some(last) = self.pending.take() {
            self.write(last)?;
        }
        let encoder = self.encoder.take().ok_or(AssemblyError::NoFrames)?;
        let bytes = encoder.into_inner()?;

        if bytes.len() as u64 > MAX_GIF_FILE_SIZE {
            return Err(AssemblyError::OutputTooLarge {
                size: bytes.len() as u64,
                limit: MAX_GIF_FILE_SIZE,
            });
        }
        Ok(bytes)
    }

    fn check_dimensions(&self, frame: &IndexedFrame) -> Result<(), AssemblyError> {
        if frame.width == 0
            || frame.height == 0
            || frame.width > u32::from(u16::MAX)
            || frame.height > u32::from(u16::MAX)
        {
            return Err(AssemblyError::TooLarge {
                width: frame.width,
                height: frame.height,
            });
        }
        if let Some((width, height)) = self.dimensions {
            if frame.width != u32::from(width) || frame.height != u32::from(height) {
                return Err(AssemblyError::DimensionMismatch {
                    width,
                    height,
                    got_width: frame.width,
                    got_height: frame.height,
                });
            }
        }
        Ok(())
    }

    fn write(&mut self, pending: PendingFrame) -> Result<(), AssemblyError> {
        let width = pending.frame.width as u16;
        let height = pending.frame.height as u16;

        if self.encoder.is_none() {
            let mut encoder = Encoder::new(Vec::new(), width, height, &[])?;
            encoder.set_repeat(Repeat::Infinite)?;
            self.encoder = Some(encoder);
        }
        let Some(encoder) = self.encoder.as_mut() else {
            return Err(AssemblyError::NoFrames);
        };

        let mut frame = pending.frame.to_gif_frame();
        frame.delay = delay_centis(pending.duration_ms);
        frame.dispose = disposal_method(pending.disposal);
        encoder.write_frame(&frame)?;
        self.written += 1;
        Ok(())
    }
}

impl Default for GifAssembler {
    fn default() -> Self {
        Self::new()
    }
}

/// Writes finished GIF bytes to `path`, creating parent directories.
pub fn write_gif<P: AsRef<Path>>(path: P, bytes: &[u8]) -> Result<(), AssemblyError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(path)?;
    file.write_all(bytes)?;
    file.flush()?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io::Cursor;

    pub(crate) struct DecodedFrame {
        pub delay: u16,
        pub dispose: DisposalMethod,
        pub width: u16,
        pub height: u16,
        pub colors: usize,
    }

    pub(crate) fn decode(bytes: &[u8]) -> Vec<DecodedFrame> {
        let mut options = gif::DecodeOptions::new();
        options.set_color_output(gif::ColorOutput::Indexed);
        let mut decoder = options.read_info(Cursor::new(bytes)).unwrap();
        let mut frames = Vec::new();
        while let Some(frame) = decoder.read_next_frame().unwrap() {
            frames.push(DecodedFrame {
                delay: frame.delay,
                dispose: frame.dispose,
                width: frame.width,
                height: frame.height,
                colors: frame.palette.as_ref().map_or(0, |p| p.len() / 3),
            });
        }
        frames
    }

    fn indexed(seq: u64, width: u32, height: u32) -> IndexedFrame {
        IndexedFrame {
            seq,
            width,
            height,
            palette: vec![[0, 0, 0], [255, 255, 255]],
            indices: (0..width * height).map(|i| (i % 2) as u8).collect(),
        }
    }

    #[test]
    fn test_frames_and_delays_round_trip() {
        let mut assembler = GifAssembler::new();
        assembler.append(indexed(0, 4, 4), 100, 0).unwrap();
        assembler.append(indexed(1, 4, 4), 250, 0).unwrap();
        let bytes = assembler.finalize().unwrap();

        let frames = decode(&bytes);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].delay, 10);
        assert_eq!(frames[1].delay, 25);
        assert_eq!((frames[0].width, frames[0].height), (4, 4));
        assert!(frames[0].colors >= 2);
    }

    #[test]
    fn test_disposal_is_reproduced_per_frame() {
        let mut assembler = GifAssembler::new();
        for (seq, code) in [0u8, 1, 2, 3].into_iter().enumerate() {
            assembler.append(indexed(seq as u64, 2, 2), 100, code).unwrap();
        }
        let frames = decode(&assembler.finalize().unwrap());
        let disposals: Vec<DisposalMethod> = frames.iter().map(|f| f.dispose).collect();
        assert_eq!(
            disposals,
            vec![
                DisposalMethod::Any,
                DisposalMethod::Keep,
                DisposalMethod::Background,
                DisposalMethod::Previous
            ]
        );
    }

    #[test]
    fn test_extend_last_merges_duration() {
        let mut assembler = GifAssembler::new();
        assembler.extend_last(500);
        assembler.append(indexed(0, 2, 2), 100, 0).unwrap();
        assembler.extend_last(100);
        assembler.extend_last(100);
        assembler.append(indexed(3, 2, 2), 100, 0).unwrap();
        let frames = decode(&assembler.finalize().unwrap());
        assert_eq!(frames[0].delay, 30);
        assert_eq!(frames[1].delay, 10);
    }

    #[test]
    fn test_finalize_twice_fails_and_keeps_first_output() {
        let mut assembler = GifAssembler::new();
        assembler.append(indexed(0, 3, 3), 100, 1).unwrap();
        let first = assembler.finalize().unwrap();
        let copy = first.clone();
        assert!(matches!(assembler.finalize(), Err(AssemblyError::AlreadyFinalized)));
        assert!(matches!(
            assembler.append(indexed(1, 3, 3), 100, 1),
            Err(AssemblyError::AlreadyFinalized)
        ));
        assert_eq!(first, copy);
        assert_eq!(decode(&first).len(), 1);
    }

    #[test]
    fn test_out_of_order_frames_are_rejected() {
        let mut assembler = GifAssembler::new();
        assembler.append(indexed(5, 2, 2), 100, 0).unwrap();
        let err = assembler.append(indexed(5, 2, 2), 100, 0).unwrap_err();
        assert!(matches!(err, AssemblyError::OutOfOrder { last: 5, got: 5 }));
        assert!(assembler.append(indexed(4, 2, 2), 100, 0).is_err());
        assert_eq!(assembler.frame_count(), 1);
    }

    #[test]
    fn test_dimension_change_is_rejected() {
        let mut assembler = GifAssembler::new();
        assembler.append(indexed(0, 4, 4), 100, 0).unwrap();
        assembler.append(indexed(1, 4, 4), 100, 0).unwrap();
        let err = assembler.append(indexed(2, 5, 4), 100, 0).unwrap_err();
        assert!(matches!(err, AssemblyError::DimensionMismatch { .. }));
    }

    #[test]
    fn test_finalize_without_frames_fails() {
        let mut assembler = GifAssembler::new();
        assert!(matches!(assembler.finalize(), Err(AssemblyError::NoFrames)));
        assert!(assembler.is_finalized());
    }

    #[test]
    fn test_short_delays_are_raised_to_minimum() {
        assert_eq!(delay_centis(0), MIN_DELAY_CS);
        assert_eq!(delay_centis(16), MIN_DELAY_CS);
        assert_eq!(delay_centis(67), 7);
        assert_eq!(delay_centis(u32::MAX), u16::MAX);
    }

    #[test]
    fn test_write_gif_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("out.gif");
        write_gif(&path, b"GIF89a").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"GIF89a");
    }
}
