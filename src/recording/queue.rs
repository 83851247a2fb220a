use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};

use crate::capture::Frame;

/// Frames buffered between capture and encoding before the oldest is dropped.
pub const MAX_QUEUE_DEPTH: usize = 32;

/// Producer half of the capture-to-encoder handoff. Pushing never blocks: on overflow
/// the oldest waiting frame is evicted and counted. Order is preserved.
pub struct FrameQueue {
    tx: Sender<Frame>,
    evict: Receiver<Frame>,
    dropped: Arc<AtomicU64>,
}

impl FrameQueue {
    pub fn new(depth: usize) -> (Self, Receiver<Frame>) {
        let (tx, rx) = bounded(depth.max(1));
        let queue = Self {
            tx,
            evict: rx.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
        };
        (queue, rx)
    }

    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    /// Returns false once the consumer is gone.
    pub fn push(&self, mut frame: Frame) -> bool {
        loop {
            match self.tx.try_send(frame) {
                Ok(()) => return true,
                Err(TrySendError::Disconnected(_)) => return false,
                Err(TrySendError::Full(back)) => {
                    frame = back;
                    if let Ok(oldest) = self.evict.try_recv() {
                        self.dropped.fetch_add(1, Ordering::Relaxed);
                        tracing::debug!(seq = oldest.seq, "encoder behind, dropped oldest frame");
                    }
                }
            }
        }
    }
}
