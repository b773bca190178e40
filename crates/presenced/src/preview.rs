//! Rendering of annotated frames.

use image::ImageFormat;
use presence_core::RecognitionResult;
use presence_hw::Frame;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PreviewError {
    #[error("frame buffer does not match {width}x{height}")]
    InvalidFrame { width: u32, height: u32 },
    #[error("unsupported preview format: {0}")]
    UnsupportedFormat(PathBuf),
    #[error("image error: {0}")]
    Image(#[from] image::ImageError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Receives every annotated frame together with its results.
pub trait FrameSink {
    fn render(&mut self, frame: &Frame, results: &[RecognitionResult]) -> Result<(), PreviewError>;
}

/// Headless operation.
pub struct NoopSink;

impl FrameSink for NoopSink {
    fn render(&mut self, _frame: &Frame, _results: &[RecognitionResult]) -> Result<(), PreviewError> {
        Ok(())
    }
}

/// Overwrites a single image file with the latest annotated frame.
///
/// The image is written next to the target and renamed over it, so a viewer
/// polling the file never sees a half-written image.
pub struct PreviewWriter {
    path: PathBuf,
    staging: PathBuf,
    format: ImageFormat,
}

impl PreviewWriter {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self, PreviewError> {
        let path = path.into();
        let format = ImageFormat::from_path(&path)
            .map_err(|_| PreviewError::UnsupportedFormat(path.clone()))?;
        let staging = staging_path(&path);
        Ok(Self { path, staging, format })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl FrameSink for PreviewWriter {
    fn render(&mut self, frame: &Frame, results: &[RecognitionResult]) -> Result<(), PreviewError> {
        let img = frame.to_image().ok_or(PreviewError::InvalidFrame {
            width: frame.width,
            height: frame.height,
        })?;
        img.save_with_format(&self.staging, self.format)?;
        std::fs::rename(&self.staging, &self.path)?;
        tracing::trace!(
            path = %self.path.display(),
            sequence = frame.sequence,
            faces = results.len(),
            "preview updated"
        );
        Ok(())
    }
}

fn staging_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".partial");
    path.with_file_name(name)
}
