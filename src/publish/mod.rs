//! Fan-out of annotated frames.
//!
//! Every processed frame goes to at most one re-encoder pipe and to each
//! HTTP subscriber queue. The two outputs fail differently: a broken
//! re-encoder pipe is returned to the caller (the pipeline treats it like a
//! capture failure), while a slow or gone subscriber is dropped inside the
//! hub and never surfaces.

use anyhow::{Context, Result};
use std::sync::Arc;

use crate::frame::Frame;

mod hub;
mod reencoder;

pub use hub::{SharedJpeg, SubscriberHub, Subscription, DEFAULT_SUBSCRIBER_QUEUE};
pub use reencoder::{FfmpegReencoder, FfmpegSettings, ReencoderPipe};

pub const DEFAULT_JPEG_QUALITY: u8 = 85;

pub struct StreamPublisher {
    reencoder: Option<Box<dyn ReencoderPipe>>,
    hub: SubscriberHub,
    jpeg_quality: u8,
}

impl StreamPublisher {
    pub fn new(reencoder: Option<Box<dyn ReencoderPipe>>, hub: SubscriberHub, jpeg_quality: u8) -> Self {
        Self {
            reencoder,
            hub,
            jpeg_quality,
        }
    }

    pub fn hub(&self) -> &SubscriberHub {
        &self.hub
    }

    pub fn subscribers(&self) -> usize {
        self.hub.len()
    }

    /// Deliver one frame. Returns the number of subscribers that received it.
    ///
    /// Errors only when the re-encoder pipe fails; subscribers are served
    /// first so a broken pipe never starves them of this frame.
    pub fn publish(&mut self, frame: &Frame) -> Result<usize> {
        let delivered = if self.hub.is_empty() {
            0
        } else {
            match frame.encode_jpeg(self.jpeg_quality) {
                Ok(jpeg) => self.hub.broadcast(&Arc::new(jpeg)),
                Err(e) => {
                    log::warn!("frame {}: JPEG encode failed: {:#}", frame.sequence, e);
                    0
                }
            }
        };

        if let Some(reencoder) = self.reencoder.as_mut() {
            reencoder
                .write_frame(frame)
                .with_context(|| format!("re-encoder pipe failed at frame {}", frame.sequence))?;
        }
        Ok(delivered)
    }

    pub fn restart_reencoder(&mut self) {
        if let Some(reencoder) = self.reencoder.as_mut() {
            reencoder.restart();
        }
    }

    /// Close the re-encoder and disconnect all subscribers.
    pub fn close(&mut self) {
        if let Some(reencoder) = self.reencoder.as_mut() {
            reencoder.close();
        }
        self.hub.close_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Timestamp;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Clone, Default)]
    struct CountingPipe {
        writes: Arc<AtomicUsize>,
        restarts: Arc<AtomicUsize>,
        fail: bool,
    }

    impl ReencoderPipe for CountingPipe {
        fn write_frame(&mut self, _frame: &Frame) -> Result<()> {
            if self.fail {
                bail!("broken pipe");
            }
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn restart(&mut self) {
            self.restarts.fetch_add(1, Ordering::SeqCst);
        }
        fn close(&mut self) {}
    }

    fn frame(seq: u64) -> Frame {
        Frame::blank(16, 16, seq, Timestamp(seq))
    }

    #[test]
    fn frames_reach_reencoder_and_subscribers() -> Result<()> {
        let pipe = CountingPipe::default();
        let hub = SubscriberHub::new(DEFAULT_SUBSCRIBER_QUEUE);
        let sub = hub.subscribe()?;
        let mut publisher = StreamPublisher::new(Some(Box::new(pipe.clone())), hub, DEFAULT_JPEG_QUALITY);

        assert_eq!(publisher.publish(&frame(0))?, 1);
        assert_eq!(pipe.writes.load(Ordering::SeqCst), 1);
        let jpeg = sub.frames.try_recv()?;
        assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
        Ok(())
    }

    #[test]
    fn full_subscriber_dropped_within_one_cycle() -> Result<()> {
        let hub = SubscriberHub::new(1);
        let stalled = hub.subscribe()?;
        let mut publisher = StreamPublisher::new(None, hub.clone(), DEFAULT_JPEG_QUALITY);
        assert_eq!(publisher.publish(&frame(0))?, 1);
        assert_eq!(publisher.publish(&frame(1))?, 0);
        assert_eq!(publisher.subscribers(), 0);
        drop(stalled);
        Ok(())
    }

    #[test]
    fn reencoder_failure_is_returned_after_subscribers_are_served() -> Result<()> {
        let pipe = CountingPipe {
            fail: true,
            ..CountingPipe::default()
        };
        let hub = SubscriberHub::new(2);
        let sub = hub.subscribe()?;
        let mut publisher = StreamPublisher::new(Some(Box::new(pipe.clone())), hub, DEFAULT_JPEG_QUALITY);
        assert!(publisher.publish(&frame(0)).is_err());
        assert!(sub.frames.try_recv().is_ok());

        publisher.restart_reencoder();
        assert_eq!(pipe.restarts.load(Ordering::SeqCst), 1);
        Ok(())
    }

    #[test]
    fn close_disconnects_subscribers() -> Result<()> {
        let hub = SubscriberHub::new(2);
        let sub = hub.subscribe()?;
        let mut publisher = StreamPublisher::new(None, hub, DEFAULT_JPEG_QUALITY);
        publisher.close();
        assert!(sub.frames.recv().is_err());
        Ok(())
    }
}
