//! Cosine similarity scoring against the reference embedding.

use crate::types::{Embedding, ReferenceEmbedding};

/// Default cosine similarity threshold for a positive match.
pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.35;

/// Similarity of one detection to the reference, and the resulting decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchScore {
    /// Cosine similarity in [-1, 1].
    pub similarity: f32,
    pub is_target: bool,
}

/// L2-normalize a vector. A zero vector is returned as-is.
pub fn normalize(values: &[f32]) -> Vec<f32> {
    let norm: f32 = values.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        values.iter().map(|x| x / norm).collect()
    } else {
        values.to_vec()
    }
}

/// Score a detection embedding against the reference.
///
/// The detection embedding is normalized first; detector output is not
/// guaranteed to be unit length. Each call is independent: no smoothing
/// across frames.
pub fn score(detection: &Embedding, reference: &ReferenceEmbedding, threshold: f32) -> MatchScore {
    let candidate = detection.normalized();
    let similarity = candidate.dot(reference.embedding()).clamp(-1.0, 1.0);
    MatchScore {
        similarity,
        is_target: similarity >= threshold,
    }
}
