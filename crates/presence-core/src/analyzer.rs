//! Detection + embedding capability used by the pipeline and reference builder.

use crate::detector::{DetectorError, FaceDetector};
use crate::recognizer::{FaceRecognizer, RecognizerError, ARCFACE_EMBEDDING_DIM};
use crate::types::Detection;
use std::path::Path;
use thiserror::Error;

const SCRFD_MODEL_FILE: &str = "det_10g.onnx";
const ARCFACE_MODEL_FILE: &str = "w600k_r50.onnx";

#[derive(Error, Debug)]
pub enum AnalyzerError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer error: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Something that finds faces in an RGB image and embeds each of them.
pub trait FaceAnalyzer {
    /// Detections in the analyzer's native order (highest confidence first
    /// for SCRFD). An image without faces yields an empty vector.
    fn analyze(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<Detection>, AnalyzerError>;

    /// Length of the embeddings this analyzer produces.
    fn embedding_dim(&self) -> usize;
}

impl<A: FaceAnalyzer + ?Sized> FaceAnalyzer for Box<A> {
    fn analyze(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<Detection>, AnalyzerError> {
        (**self).analyze(rgb, width, height)
    }

    fn embedding_dim(&self) -> usize {
        (**self).embedding_dim()
    }
}

/// SCRFD detection followed by ArcFace embedding of every face.
pub struct OnnxFaceAnalyzer {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl OnnxFaceAnalyzer {
    /// Load `det_10g.onnx` and `w600k_r50.onnx` from `model_dir`.
    pub fn load(model_dir: &Path, intra_threads: usize) -> Result<Self, AnalyzerError> {
        let scrfd = model_dir.join(SCRFD_MODEL_FILE);
        let arcface = model_dir.join(ARCFACE_MODEL_FILE);

        let detector = FaceDetector::load(&scrfd.to_string_lossy(), intra_threads)?;
        let recognizer = FaceRecognizer::load(&arcface.to_string_lossy(), intra_threads)?;

        Ok(Self { detector, recognizer })
    }
}

impl FaceAnalyzer for OnnxFaceAnalyzer {
    fn analyze(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<Detection>, AnalyzerError> {
        let faces = self.detector.detect(rgb, width, height)?;
        let mut detections = Vec::with_capacity(faces.len());
        for bbox in faces {
            let embedding = self.recognizer.extract(rgb, width, height, &bbox)?;
            detections.push(Detection { bbox, embedding });
        }
        Ok(detections)
    }

    fn embedding_dim(&self) -> usize {
        ARCFACE_EMBEDDING_DIM
    }
}
