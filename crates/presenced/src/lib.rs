//! presenced: Presence daemon library.
//!
//! Configuration, the frame loop, and preview rendering. The binary in
//! `main.rs` wires these to the camera, the ONNX analyzer, and the broker.

pub mod config;
pub mod orchestrator;
pub mod preview;

pub use config::{BrokerConfig, Config, ConfigError};
pub use orchestrator::{LoopStats, PublishSettings};
pub use preview::{FrameSink, NoopSink, PreviewWriter};
