//! Per-frame recognition: detect, score every face against the reference.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::matcher;
use crate::types::{RecognitionResult, ReferenceEmbedding};

/// Runs the analyzer on frames and judges every detected face.
///
/// Holds nothing mutable besides the analyzer; the reference and threshold
/// are fixed for the engine's lifetime.
pub struct RecognitionEngine<A> {
    analyzer: A,
    reference: ReferenceEmbedding,
    threshold: f32,
}

impl<A: FaceAnalyzer> RecognitionEngine<A> {
    pub fn new(analyzer: A, reference: ReferenceEmbedding, threshold: f32) -> Self {
        Self { analyzer, reference, threshold }
    }

    /// One result per detection, in the analyzer's order. No faces → empty.
    pub fn process_frame(&mut self, rgb: &[u8], width: u32, height: u32) -> Result<Vec<RecognitionResult>, AnalyzerError> {
        let detections = self.analyzer.analyze(rgb, width, height)?;

        let results = detections
            .iter()
            .map(|d| {
                let s = matcher::score(&d.embedding, &self.reference, self.threshold);
                RecognitionResult {
                    bbox: d.bbox.to_rect(),
                    similarity: s.similarity,
                    is_target: s.is_target,
                }
            })
            .collect();

        Ok(results)
    }

    pub fn threshold(&self) -> f32 {
        self.threshold
    }

    pub fn reference(&self) -> &ReferenceEmbedding {
        &self.reference
    }
}
