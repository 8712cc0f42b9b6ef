//! Frame ingestion.
//!
//! - `FrameSource`: anything that can be opened, read frame by frame and
//!   released. `RtspSource` is the production implementation.
//! - `IngestionSupervisor`: wraps a source with error counting and bounded
//!   fixed-delay reconnection.
//!
//! Sources never retry on their own; all recovery policy lives in the
//! supervisor so it can be observed through `StreamState`.

use anyhow::Result;
use serde::Serialize;

use crate::frame::Frame;

pub mod rtsp;
pub mod supervisor;

pub use rtsp::{RtspConfig, RtspSource};
pub use supervisor::{FrameRead, IngestionSupervisor, SupervisorSettings};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestState {
    Connecting,
    Streaming,
    Reconnecting,
    Fatal,
}

impl IngestState {
    pub fn as_str(self) -> &'static str {
        match self {
            IngestState::Connecting => "connecting",
            IngestState::Streaming => "streaming",
            IngestState::Reconnecting => "reconnecting",
            IngestState::Fatal => "fatal",
        }
    }
}

pub trait FrameSource: Send {
    /// Human-readable source identifier for logs and alert subjects.
    fn describe(&self) -> String;

    /// Acquire the capture resource. Called again after every `release`.
    fn open(&mut self) -> Result<()>;

    fn read_frame(&mut self) -> Result<Frame>;

    /// Drop the capture resource. Must be safe to call when not open.
    fn release(&mut self);
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
    fn describe(&self) -> String {
        (**self).describe()
    }

    fn open(&mut self) -> Result<()> {
        (**self).open()
    }

    fn read_frame(&mut self) -> Result<Frame> {
        (**self).read_frame()
    }

    fn release(&mut self) {
        (**self).release()
    }
}
