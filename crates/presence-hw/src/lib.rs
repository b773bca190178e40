//! presence-hw: Camera capture for the presence pipeline.
//!
//! V4L2 color capture behind the [`CaptureSource`] trait, plus the RGB
//! frame type and the pixel helpers used to annotate it.

pub mod camera;
pub mod frame;

pub use camera::{Camera, CameraError, CaptureSource, DeviceInfo, PixelFormat};
pub use frame::Frame;
