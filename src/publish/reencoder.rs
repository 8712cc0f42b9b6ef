use anyhow::{anyhow, bail, Context, Result};
use std::io::Write;
use std::process::{Child, ChildStdin, Command, Stdio};

use crate::frame::Frame;

/// Sink for raw annotated frames bound for an external re-encoder.
///
/// Any error from `write_frame` means the pipe is broken; the caller is
/// expected to `restart` it after the capture side has reconnected.
pub trait ReencoderPipe: Send {
    fn write_frame(&mut self, frame: &Frame) -> Result<()>;

    /// Tear down the current pipe; the next write opens a fresh one.
    fn restart(&mut self);

    fn close(&mut self);
}

#[derive(Clone, Debug)]
pub struct FfmpegSettings {
    pub program: String,
    pub output_url: String,
    pub fps: u32,
    pub preset: String,
    pub tune: String,
}

impl FfmpegSettings {
    pub fn new(output_url: &str, fps: u32) -> Self {
        Self {
            program: "ffmpeg".to_string(),
            output_url: output_url.to_string(),
            fps,
            preset: "ultrafast".to_string(),
            tune: "zerolatency".to_string(),
        }
    }

    fn args(&self, width: u32, height: u32) -> Vec<String> {
        let size = format!("{}x{}", width, height);
        let fps = self.fps.to_string();
        [
            "-loglevel", "error",
            "-f", "rawvideo",
            "-pix_fmt", "rgb24",
            "-s", size.as_str(),
            "-r", fps.as_str(),
            "-i", "-",
            "-c:v", "libx264",
            "-preset", self.preset.as_str(),
            "-tune", self.tune.as_str(),
            "-f", "rtsp",
            self.output_url.as_str(),
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }
}

struct Running {
    child: Child,
    stdin: ChildStdin,
    size: (u32, u32),
}

/// Pipes RGB24 frames into an `ffmpeg` child that pushes H.264 over RTSP.
///
/// The child is spawned on the first write so the frame size comes from the
/// stream rather than from configuration.
pub struct FfmpegReencoder {
    settings: FfmpegSettings,
    running: Option<Running>,
}

impl FfmpegReencoder {
    pub fn new(settings: FfmpegSettings) -> Self {
        Self {
            settings,
            running: None,
        }
    }

    fn spawn(&self, width: u32, height: u32) -> Result<Running> {
        let mut child = Command::new(&self.settings.program)
            .args(self.settings.args(width, height))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("spawn {}", self.settings.program))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("{} has no stdin", self.settings.program))?;
        log::info!(
            "re-encoder started: {}x{}@{} -> {}",
            width,
            height,
            self.settings.fps,
            self.settings.output_url
        );
        Ok(Running {
            child,
            stdin,
            size: (width, height),
        })
    }

    fn write(&mut self, frame: &Frame) -> Result<()> {
        let size = (frame.width(), frame.height());
        if self.running.is_none() {
            self.running = Some(self.spawn(size.0, size.1)?);
        }
        let Some(running) = self.running.as_mut() else {
            bail!("re-encoder not running");
        };
        if let Some(status) = running.child.try_wait().context("poll re-encoder")? {
            bail!("re-encoder exited with {}", status);
        }
        if running.size != size {
            bail!(
                "frame size changed from {}x{} to {}x{}",
                running.size.0,
                running.size.1,
                size.0,
                size.1
            );
        }
        running
            .stdin
            .write_all(frame.as_rgb_bytes())
            .context("write frame to re-encoder")?;
        Ok(())
    }
}

impl ReencoderPipe for FfmpegReencoder {
    fn write_frame(&mut self, frame: &Frame) -> Result<()> {
        let result = self.write(frame);
        if result.is_err() {
            self.close();
        }
        result
    }

    fn restart(&mut self) {
        self.close();
    }

    fn close(&mut self) {
        if let Some(Running { mut child, stdin, .. }) = self.running.take() {
            drop(stdin);
            if let Err(e) = child.kill() {
                log::debug!("re-encoder kill: {}", e);
            }
            if let Err(e) = child.wait() {
                log::warn!("re-encoder wait: {}", e);
            }
            log::info!("re-encoder stopped");
        }
    }
}

impl Drop for FfmpegReencoder {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Timestamp;

    #[test]
    fn ffmpeg_args_describe_raw_rgb_input() {
        let args = FfmpegSettings::new("rtsp://127.0.0.1:8554/annotated", 20).args(1280, 720);
        let joined = args.join(" ");
        assert!(joined.contains("-f rawvideo -pix_fmt rgb24 -s 1280x720 -r 20 -i -"));
        assert!(joined.contains("-preset ultrafast -tune zerolatency"));
        assert!(joined.ends_with("-f rtsp rtsp://127.0.0.1:8554/annotated"));
    }

    #[test]
    fn missing_program_is_a_write_failure() {
        let mut settings = FfmpegSettings::new("rtsp://127.0.0.1:1/none", 5);
        settings.program = "/nonexistent/vigil-ffmpeg".to_string();
        let mut enc = FfmpegReencoder::new(settings);
        let frame = Frame::blank(4, 4, 0, Timestamp(0));
        assert!(enc.write_frame(&frame).is_err());
        assert!(enc.running.is_none());
    }
}
