pub mod stub;

#[cfg(feature = "backend-tract")]
pub mod tract;

use anyhow::{bail, Result};
use serde::Deserialize;
use std::path::PathBuf;

use crate::detect::backend::DetectorBackend;

pub use stub::StubBackend;

#[cfg(feature = "backend-tract")]
pub use tract::TractBackend;

/// URL scheme of the synthetic source the stub backend scripts against.
pub const STUB_SCHEME: &str = "stub://";
pub const DEFAULT_MODEL_INPUT: u32 = 640;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Scripted detections for `stub://` sources.
    Stub,
    /// ONNX model run with tract.
    Tract,
}

impl BackendKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Stub => "stub",
            BackendKind::Tract => "tract",
        }
    }
}

/// Resolved detector choice for one source.
#[derive(Clone, Debug, PartialEq)]
pub struct BackendSettings {
    pub kind: BackendKind,
    pub model_path: Option<PathBuf>,
    /// Side of the square model input, in pixels.
    pub input_size: u32,
    pub min_confidence: f32,
}

impl BackendSettings {
    /// Pick a backend for `source_url`. `requested` of `None` means the stub
    /// for `stub://` sources and tract for everything else.
    pub fn resolve(
        source_url: &str,
        requested: Option<BackendKind>,
        model_path: Option<PathBuf>,
        input_size: u32,
        min_confidence: f32,
    ) -> Result<Self> {
        let synthetic = source_url.starts_with(STUB_SCHEME);
        let kind = requested.unwrap_or(if synthetic {
            BackendKind::Stub
        } else {
            BackendKind::Tract
        });
        match kind {
            BackendKind::Stub if !synthetic => {
                bail!("detection backend `stub` only serves {} sources; configure detection.backend = \"tract\" and detection.model_path", STUB_SCHEME)
            }
            BackendKind::Tract if model_path.is_none() => {
                bail!("detection backend `tract` needs detection.model_path")
            }
            _ => {}
        }
        if input_size == 0 {
            bail!("detection input_size must be greater than zero");
        }
        Ok(Self {
            kind,
            model_path,
            input_size,
            min_confidence,
        })
    }
}

/// Construct the configured backend.
pub fn open_backend(settings: &BackendSettings) -> Result<Box<dyn DetectorBackend>> {
    match settings.kind {
        BackendKind::Stub => Ok(Box::new(StubBackend::new())),
        BackendKind::Tract => open_tract(settings),
    }
}

#[cfg(feature = "backend-tract")]
fn open_tract(settings: &BackendSettings) -> Result<Box<dyn DetectorBackend>> {
    let path = settings
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow::anyhow!("detection backend `tract` needs detection.model_path"))?;
    let backend = TractBackend::new(path, settings.input_size)?.with_threshold(settings.min_confidence);
    Ok(Box::new(backend))
}

#[cfg(not(feature = "backend-tract"))]
fn open_tract(_settings: &BackendSettings) -> Result<Box<dyn DetectorBackend>> {
    bail!("detection backend `tract` requires building with the backend-tract feature")
}
