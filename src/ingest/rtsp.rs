//! RTSP frame source.
//!
//! `stub://` URLs select a synthetic backend that always connects and
//! produces a moving test pattern, so the daemon and the tests run without a
//! camera. Any other URL needs the `rtsp-gstreamer` feature.

#[cfg(feature = "rtsp-gstreamer")]
use anyhow::Context;
use anyhow::Result;
#[cfg(feature = "rtsp-gstreamer")]
use std::time::Duration;

use super::FrameSource;
use crate::frame::Frame;
use crate::Timestamp;

#[derive(Clone, Debug)]
pub struct RtspConfig {
    /// e.g. "rtsp://192.168.1.100:554/stream" or "stub://camera"
    pub url: String,
    pub target_fps: u32,
    /// Frame size for synthetic frames; real streams report their own.
    pub width: u32,
    pub height: u32,
}

impl Default for RtspConfig {
    fn default() -> Self {
        Self {
            url: "stub://camera".to_string(),
            target_fps: 20,
            width: 1280,
            height: 720,
        }
    }
}

pub struct RtspSource {
    backend: RtspBackend,
}

enum RtspBackend {
    Synthetic(SyntheticRtspSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerRtspSource),
}

impl RtspSource {
    pub fn new(config: RtspConfig) -> Result<Self> {
        if config.url.starts_with("stub://") {
            Ok(Self {
                backend: RtspBackend::Synthetic(SyntheticRtspSource::new(config)),
            })
        } else {
            #[cfg(feature = "rtsp-gstreamer")]
            {
                Ok(Self {
                    backend: RtspBackend::Gstreamer(GstreamerRtspSource::new(config)?),
                })
            }
            #[cfg(not(feature = "rtsp-gstreamer"))]
            {
                anyhow::bail!("{} requires the rtsp-gstreamer feature", config.url)
            }
        }
    }

    pub fn frames_captured(&self) -> u64 {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.sequence,
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.sequence,
        }
    }
}

impl FrameSource for RtspSource {
    fn describe(&self) -> String {
        match &self.backend {
            RtspBackend::Synthetic(source) => source.config.url.clone(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.config.url.clone(),
        }
    }

    fn open(&mut self) -> Result<()> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.open(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.open(),
        }
    }

    fn read_frame(&mut self) -> Result<Frame> {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.read_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.read_frame(),
        }
    }

    fn release(&mut self) {
        match &mut self.backend {
            RtspBackend::Synthetic(source) => source.release(),
            #[cfg(feature = "rtsp-gstreamer")]
            RtspBackend::Gstreamer(source) => source.release(),
        }
    }
}

// ----------------------------------------------------------------------------
// Synthetic source (stub://)
// ----------------------------------------------------------------------------

struct SyntheticRtspSource {
    config: RtspConfig,
    open: bool,
    sequence: u64,
}

impl SyntheticRtspSource {
    fn new(config: RtspConfig) -> Self {
        Self {
            config,
            open: false,
            sequence: 0,
        }
    }

    fn open(&mut self) -> Result<()> {
        self.open = true;
        log::info!("RtspSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if !self.open {
            anyhow::bail!("synthetic source {} is not open", self.config.url);
        }
        let pixels = self.generate_pixels();
        let frame = Frame::from_rgb(
            pixels,
            self.config.width,
            self.config.height,
            self.sequence,
            Timestamp::now(),
        )?;
        self.sequence += 1;
        Ok(frame)
    }

    /// Diagonal gradient that drifts one pixel per frame, with a little
    /// per-frame brightness jitter so consecutive JPEGs differ.
    fn generate_pixels(&self) -> Vec<u8> {
        let (w, h) = (self.config.width as usize, self.config.height as usize);
        let shift = self.sequence as usize;
        let jitter: u8 = rand::random::<u8>() % 8;
        let mut pixels = vec![0u8; w * h * 3];
        for (i, px) in pixels.chunks_exact_mut(3).enumerate() {
            let (x, y) = (i % w, i / w);
            let base = ((x + y + shift) % 256) as u8;
            px[0] = base.wrapping_add(jitter);
            px[1] = (y * 255 / h.max(1)) as u8;
            px[2] = 96;
        }
        pixels
    }

    fn release(&mut self) {
        self.open = false;
    }
}

// ----------------------------------------------------------------------------
// Production RTSP source using GStreamer
// ----------------------------------------------------------------------------

#[cfg(feature = "rtsp-gstreamer")]
struct GstreamerRtspSource {
    config: RtspConfig,
    pipeline: gstreamer::Pipeline,
    appsink: gstreamer_app::AppSink,
    sequence: u64,
    last_error: Option<String>,
}

#[cfg(feature = "rtsp-gstreamer")]
impl GstreamerRtspSource {
    fn new(config: RtspConfig) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let pipeline_description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            config.url
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build RTSP pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("RTSP pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        Ok(Self {
            config,
            pipeline,
            appsink,
            sequence: 0,
            last_error: None,
        })
    }

    fn open(&mut self) -> Result<()> {
        self.last_error = None;
        self.pipeline
            .set_state(gstreamer::State::Playing)
            .context("set RTSP pipeline to Playing")?;
        log::info!("RtspSource: connected to {}", self.config.url);
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        self.poll_bus();
        if let Some(err) = &self.last_error {
            anyhow::bail!("{}", err);
        }

        let sample = self
            .appsink
            .try_pull_sample(self.frame_timeout())
            .ok_or_else(|| anyhow::anyhow!("RTSP stream stalled"))?;

        let (pixels, width, height) = sample_to_pixels(&sample)?;
        let frame = Frame::from_rgb(pixels, width, height, self.sequence, Timestamp::now())?;
        self.sequence += 1;
        Ok(frame)
    }

    fn release(&mut self) {
        if let Err(e) = self.pipeline.set_state(gstreamer::State::Null) {
            log::warn!("RtspSource: failed to stop pipeline: {}", e);
        }
    }

    fn frame_timeout(&self) -> gstreamer::ClockTime {
        let base_ms = if self.config.target_fps == 0 {
            500
        } else {
            (1000 / self.config.target_fps).saturating_mul(4)
        };
        let d = Duration::from_millis(base_ms.max(500) as u64);
        gstreamer::ClockTime::from_mseconds(d.as_millis() as u64)
    }

    fn poll_bus(&mut self) {
        let Some(bus) = self.pipeline.bus() else {
            return;
        };
        while let Some(message) = bus.pop() {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    self.last_error = Some(format!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    ));
                }
                MessageView::Eos(..) => {
                    self.last_error = Some("gstreamer reached EOS".to_string());
                }
                _ => {}
            }
        }
    }
}

#[cfg(feature = "rtsp-gstreamer")]
fn sample_to_pixels(sample: &gstreamer::Sample) -> Result<(Vec<u8>, u32, u32)> {
    let buffer = sample.buffer().context("RTSP sample missing buffer")?;
    let caps = sample.caps().context("RTSP sample missing caps")?;
    let info =
        gstreamer_video::VideoInfo::from_caps(caps).context("parse RTSP caps as video info")?;

    let width = info.width();
    let height = info.height();
    let row_bytes = (width as usize) * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer.map_readable().context("map RTSP buffer")?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok((data[..row_bytes * height as usize].to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .context("RTSP buffer row is out of bounds")?,
        );
    }
    Ok((pixels, width, height))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stub_config() -> RtspConfig {
        RtspConfig {
            url: "stub://test".to_string(),
            target_fps: 10,
            width: 64,
            height: 48,
        }
    }

    #[test]
    fn stub_source_produces_sized_frames() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        source.open()?;
        let first = source.read_frame()?;
        let second = source.read_frame()?;
        assert_eq!((first.width(), first.height()), (64, 48));
        assert_eq!(second.sequence, first.sequence + 1);
        assert_eq!(source.frames_captured(), 2);
        Ok(())
    }

    #[test]
    fn released_stub_source_fails_reads_until_reopened() -> Result<()> {
        let mut source = RtspSource::new(stub_config())?;
        assert!(source.read_frame().is_err());
        source.open()?;
        source.read_frame()?;
        source.release();
        assert!(source.read_frame().is_err());
        source.open()?;
        assert!(source.read_frame().is_ok());
        Ok(())
    }

    #[cfg(not(feature = "rtsp-gstreamer"))]
    #[test]
    fn real_rtsp_needs_feature() {
        let config = RtspConfig {
            url: "rtsp://127.0.0.1:554/stream".into(),
            ..stub_config()
        };
        assert!(RtspSource::new(config).is_err());
    }
}
