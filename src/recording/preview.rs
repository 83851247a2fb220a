use std::sync::{Arc, Mutex};

use crossbeam_channel::{bounded, Receiver, Sender};

use crate::capture::Frame;

/// Fan-out of pre-encode frames to preview consumers.
///
/// Each subscriber gets a one-slot channel. A frame is only offered to subscribers whose
/// slot is empty, so a slow viewer sees fewer frames and never holds up capture.
#[derive(Clone, Default)]
pub struct PreviewFeed {
    subscribers: Arc<Mutex<Vec<Sender<Frame>>>>,
}

impl PreviewFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> Receiver<Frame> {
        let (tx, rx) = bounded(1);
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub fn publish(&self, frame: &Frame) {
        let Ok(mut subscribers) = self.subscribers.try_lock() else {
            return;
        };
        subscribers.retain(|tx| {
            if tx.is_full() {
                return true;
            }
            match tx.try_send(frame.clone()) {
                Ok(()) => true,
                Err(crossbeam_channel::TrySendError::Full(_)) => true,
                Err(crossbeam_channel::TrySendError::Disconnected(_)) => false,
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbaImage;
    use std::time::Duration;

    fn frame(seq: u64) -> Frame {
        Frame::new(seq, Duration::ZERO, RgbaImage::new(2, 2))
    }

    #[test]
    fn test_busy_subscriber_keeps_oldest_unread_frame() {
        let feed = PreviewFeed::new();
        let rx = feed.subscribe();
        feed.publish(&frame(0));
        feed.publish(&frame(1));
        feed.publish(&frame(2));
        assert_eq!(rx.try_recv().unwrap().seq, 0);
        assert!(rx.try_recv().is_err());
        feed.publish(&frame(3));
        assert_eq!(rx.try_recv().unwrap().seq, 3);
    }

    #[test]
    fn test_dropped_subscribers_are_pruned() {
        let feed = PreviewFeed::new();
        let rx = feed.subscribe();
        let _kept = feed.subscribe();
        drop(rx);
        feed.publish(&frame(0));
        assert_eq!(feed.subscriber_count(), 1);
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        PreviewFeed::new().publish(&frame(0));
    }
}
