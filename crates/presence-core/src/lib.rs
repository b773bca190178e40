//! presence-core: Face matching against a cached reference identity.
//!
//! SCRFD detection and ArcFace embeddings via ONNX Runtime, cosine scoring
//! against an averaged reference embedding, and the presence payload contract.

pub mod actuator;
pub mod alignment;
pub mod analyzer;
pub mod detector;
pub mod matcher;
pub mod npy;
pub mod pipeline;
pub mod recognizer;
pub mod reference;
pub mod types;

pub use analyzer::{AnalyzerError, FaceAnalyzer, OnnxFaceAnalyzer};
pub use matcher::{MatchScore, DEFAULT_SIMILARITY_THRESHOLD};
pub use pipeline::RecognitionEngine;
pub use reference::{get_reference_embedding, resolve_reference_dir, ReferenceError, DEFAULT_CACHE_FILENAME};
pub use types::{BoundingBox, Detection, Embedding, FaceRect, RecognitionResult, ReferenceEmbedding};

/// Default model directory: `$XDG_DATA_HOME/presence/models`.
pub fn default_model_dir() -> std::path::PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            std::path::PathBuf::from(home).join(".local/share")
        })
        .join("presence/models")
}
