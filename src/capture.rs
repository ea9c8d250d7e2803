use anyhow::{bail, Context, Result};
use opencv::{core::Mat, prelude::*, videoio};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum SourceSpec {
    Camera(i32),
    File(PathBuf),
}

impl fmt::Display for SourceSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceSpec::Camera(index) => write!(f, "camera {}", index),
            SourceSpec::File(path) => write!(f, "{}", path.display()),
        }
    }
}

pub trait FrameSource: Send {
    /// Next frame, or `None` once the stream has ended or the device failed.
    fn read(&mut self) -> Result<Option<Mat>>;
    /// Releases the device. Safe to call more than once.
    fn release(&mut self);
}

pub struct CameraSource {
    capture: videoio::VideoCapture,
    released: bool,
}

impl CameraSource {
    pub fn open(spec: &SourceSpec) -> Result<Self> {
        let mut capture = match spec {
            SourceSpec::Camera(index) => videoio::VideoCapture::new(*index, videoio::CAP_ANY),
            SourceSpec::File(path) => {
                let path = path.to_str().context("Video path is not valid UTF-8")?;
                videoio::VideoCapture::from_file(path, videoio::CAP_ANY)
            }
        }
        .with_context(|| format!("Failed to open input source: {}", spec))?;
        if !capture.is_opened()? {
            bail!("Failed to open input source: {}", spec);
        }
        let _ = capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);
        tracing::info!("Video capture started on {}", spec);
        Ok(Self {
            capture,
            released: false,
        })
    }
}

impl FrameSource for CameraSource {
    fn read(&mut self) -> Result<Option<Mat>> {
        if self.released || !self.capture.is_opened()? {
            return Ok(None);
        }
        let mut frame = Mat::default();
        if !self.capture.read(&mut frame).context("Failed to read frame")? || frame.empty() {
            return Ok(None);
        }
        Ok(Some(frame))
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Err(err) = self.capture.release() {
            tracing::warn!("Failed to release capture device: {}", err);
        }
    }
}

impl Drop for CameraSource {
    fn drop(&mut self) {
        self.release();
    }
}
