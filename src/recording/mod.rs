//! Recording pipeline: a timed capture loop feeding an encoding worker.
//!
//! Per tick: capture, cursor overlay, preview, queue. On the worker: similarity filter,
//! skip/scale, palette quantization, GIF assembly.

mod controller;
mod cursor;
mod estimate;
mod gif_encoder;
mod palette;
mod preprocess;
mod preview;
mod queue;
mod session;
mod similarity;
mod worker;

pub use controller::RecordingController;
pub use cursor::{CursorProvider, CursorSprite, CursorThrottle, NoCursor, SystemCursor};
pub use estimate::estimate_gif_size;
pub use gif_encoder::{disposal_method, write_gif, GifAssembler, MAX_GIF_FILE_SIZE};
pub use palette::{IndexedFrame, PaletteEncoder};
pub use preprocess::FramePreprocessor;
pub use preview::PreviewFeed;
pub use queue::{FrameQueue, MAX_QUEUE_DEPTH};
pub use session::{SessionId, SessionReport, SessionState, SessionStats, MAX_SESSION_FRAMES};
pub use similarity::{should_keep, similarity_score, SimilarityFilter};
