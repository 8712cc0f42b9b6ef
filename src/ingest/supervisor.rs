//! Capture supervision: error counting and bounded reconnection.
//!
//! ```text
//! CONNECTING --open ok--> STREAMING --max_frame_errors--> RECONNECTING
//!      |                      ^                              |   |
//!      +---open failed--------|------------------------------+   |
//!                             +-------- reopen ok ---------------+
//!                                                                |
//!                                  attempts exhausted ------> FATAL
//! ```
//!
//! Reconnect attempts are made immediately and then every
//! `reconnect_delay`; the delay is interruptible through the `CancelToken`.

use std::time::Duration;

use super::{FrameSource, IngestState};
use crate::frame::Frame;
use crate::status::{StatusBoard, StreamState};
use crate::CancelToken;

pub const DEFAULT_MAX_FRAME_ERRORS: u32 = 10;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 10;
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Clone, Copy, Debug)]
pub struct SupervisorSettings {
    pub max_frame_errors: u32,
    pub max_reconnect_attempts: u32,
    pub reconnect_delay: Duration,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            max_frame_errors: DEFAULT_MAX_FRAME_ERRORS,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
        }
    }
}

#[derive(Debug)]
pub enum FrameRead {
    Frame(Frame),
    /// No frame this cycle; below the error ceiling.
    Failed,
    /// The source is in RECONNECTING; call `reconnect` before reading again.
    Reconnect,
    /// Reconnection exhausted. No further frames will be read.
    Fatal,
}

pub struct IngestionSupervisor<S: FrameSource> {
    source: S,
    settings: SupervisorSettings,
    stream: StreamState,
    status: Option<StatusBoard>,
}

impl<S: FrameSource> IngestionSupervisor<S> {
    pub fn new(source: S, settings: SupervisorSettings) -> Self {
        Self {
            source,
            settings,
            stream: StreamState::default(),
            status: None,
        }
    }

    /// Publish every state change to `board` as it happens, including the
    /// ones made while blocked in a reconnect loop.
    pub fn with_status(mut self, board: StatusBoard) -> Self {
        self.status = Some(board);
        self
    }

    pub fn stream(&self) -> &StreamState {
        &self.stream
    }

    pub fn state(&self) -> IngestState {
        self.stream.state
    }

    pub fn settings(&self) -> SupervisorSettings {
        self.settings
    }

    pub fn describe(&self) -> String {
        self.source.describe()
    }

    /// First connection. A failure leaves the supervisor in RECONNECTING.
    pub fn start(&mut self) -> IngestState {
        self.stream.state = IngestState::Connecting;
        self.publish();
        match self.source.open() {
            Ok(()) => {
                self.mark_streaming();
                log::info!("ingest: streaming from {}", self.source.describe());
            }
            Err(e) => {
                log::warn!("ingest: initial connect to {} failed: {:#}", self.source.describe(), e);
                self.enter_reconnecting();
            }
        }
        self.stream.state
    }

    /// Read one frame, counting failures against the error ceiling.
    pub fn next_frame(&mut self) -> FrameRead {
        match self.stream.state {
            IngestState::Fatal => return FrameRead::Fatal,
            IngestState::Connecting | IngestState::Reconnecting => return FrameRead::Reconnect,
            IngestState::Streaming => {}
        }

        match self.source.read_frame() {
            Ok(frame) => {
                self.stream.consecutive_frame_errors = 0;
                self.stream.last_frame_at = Some(frame.captured_at);
                FrameRead::Frame(frame)
            }
            Err(e) => {
                self.stream.consecutive_frame_errors += 1;
                log::warn!(
                    "ingest: frame read failed ({}/{}): {:#}",
                    self.stream.consecutive_frame_errors,
                    self.settings.max_frame_errors,
                    e
                );
                if self.stream.consecutive_frame_errors >= self.settings.max_frame_errors {
                    self.enter_reconnecting();
                    FrameRead::Reconnect
                } else {
                    self.publish();
                    FrameRead::Failed
                }
            }
        }
    }

    /// Release and reopen the source, up to `max_reconnect_attempts` times.
    ///
    /// Usable from any non-fatal state, so downstream failures take the
    /// same path as capture failures. A reopened source only counts as
    /// recovered once `confirm_delivery` is called; until then the attempt
    /// counter carries over into the next `reconnect`, so a source that
    /// opens but never yields a usable frame still ends in FATAL. Returns
    /// `Reconnecting` if cancelled before the outcome was known.
    pub fn reconnect(&mut self, cancel: &CancelToken) -> IngestState {
        if self.stream.state == IngestState::Fatal {
            return IngestState::Fatal;
        }
        if self.stream.state != IngestState::Reconnecting {
            self.enter_reconnecting();
        }

        let max = self.settings.max_reconnect_attempts;
        while self.stream.consecutive_reconnect_attempts < max {
            if cancel.is_cancelled() {
                return self.stream.state;
            }
            self.stream.consecutive_reconnect_attempts += 1;
            let attempt = self.stream.consecutive_reconnect_attempts;
            log::info!("ingest: reconnect attempt {}/{}", attempt, max);
            self.publish();

            match self.source.open() {
                Ok(()) => {
                    // attempts stay counted until `confirm_delivery`
                    self.stream.consecutive_frame_errors = 0;
                    self.mark_streaming();
                    log::info!("ingest: reconnected to {}", self.source.describe());
                    return self.stream.state;
                }
                Err(e) => {
                    log::warn!("ingest: reconnect attempt {}/{} failed: {:#}", attempt, max, e);
                    self.source.release();
                }
            }

            if attempt < max && !cancel.sleep(self.settings.reconnect_delay) {
                return self.stream.state;
            }
        }

        self.stream.state = IngestState::Fatal;
        log::error!(
            "ingest: giving up on {} after {} reconnect attempts",
            self.source.describe(),
            max
        );
        self.publish();
        self.stream.state
    }

    /// A frame read since the last reconnect made it through the whole
    /// cycle. Clears the reconnect attempt counter.
    pub fn confirm_delivery(&mut self) {
        if self.stream.state == IngestState::Streaming && self.stream.consecutive_reconnect_attempts > 0 {
            log::info!(
                "ingest: recovered after {} reconnect attempt(s)",
                self.stream.consecutive_reconnect_attempts
            );
            self.stream.consecutive_reconnect_attempts = 0;
            self.publish();
        }
    }

    fn enter_reconnecting(&mut self) {
        self.stream.state = IngestState::Reconnecting;
        self.stream.connected = false;
        self.source.release();
        self.publish();
    }

    pub fn release(&mut self) {
        self.source.release();
        self.stream.connected = false;
        self.publish();
    }

    fn mark_streaming(&mut self) {
        self.stream.state = IngestState::Streaming;
        self.stream.connected = true;
        self.publish();
    }

    fn publish(&self) {
        if let Some(board) = &self.status {
            board.update_stream(&self.stream);
        }
    }
}
