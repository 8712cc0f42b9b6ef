mod backend;
mod backends;
mod result;
pub mod yolo;

pub use backend::{DetectionCapability, DetectorBackend, FallModel};
pub use backends::{
    open_backend, BackendKind, BackendSettings, StubBackend, DEFAULT_MODEL_INPUT, STUB_SCHEME,
};
#[cfg(feature = "backend-tract")]
pub use backends::TractBackend;
pub use result::{BBox, Detection, FallSignal};

/// COCO class id for `person`.
pub const PERSON_CLASS_ID: u32 = 0;
