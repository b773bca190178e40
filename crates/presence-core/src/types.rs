use serde::{Deserialize, Serialize};

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

impl BoundingBox {
    /// Integer pixel corners, truncated toward zero.
    pub fn to_rect(&self) -> FaceRect {
        FaceRect {
            x1: self.x as i32,
            y1: self.y as i32,
            x2: (self.x + self.width) as i32,
            y2: (self.y + self.height) as i32,
        }
    }
}

/// Face rectangle in pixel coordinates (`x1 < x2`, `y1 < y2` for a real face).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaceRect {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values, model_version: None }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Euclidean norm.
    pub fn norm(&self) -> f32 {
        self.values.iter().map(|v| v * v).sum::<f32>().sqrt()
    }

    /// Unit-length copy. A zero vector is returned unchanged.
    pub fn normalized(&self) -> Embedding {
        Embedding {
            values: crate::matcher::normalize(&self.values),
            model_version: self.model_version.clone(),
        }
    }

    /// Dot product over the shared prefix of both vectors.
    pub fn dot(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| a * b)
            .sum()
    }
}

/// One face found in one frame: location, detector confidence, raw embedding.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

impl Detection {
    pub fn confidence(&self) -> f32 {
        self.bbox.confidence
    }
}

/// Unit-norm averaged embedding of the person to recognize.
///
/// Only constructible from an already-normalized vector, so every
/// similarity against it is a true cosine similarity.
#[derive(Debug, Clone, PartialEq)]
pub struct ReferenceEmbedding(Embedding);

impl ReferenceEmbedding {
    /// Wrap `embedding` after normalizing it. Returns `None` for a zero vector.
    pub fn from_embedding(embedding: Embedding) -> Option<Self> {
        if embedding.values.is_empty() || embedding.norm() == 0.0 {
            return None;
        }
        Some(Self(embedding.normalized()))
    }

    pub fn embedding(&self) -> &Embedding {
        &self.0
    }

    pub fn values(&self) -> &[f32] {
        &self.0.values
    }

    pub fn dim(&self) -> usize {
        self.0.dim()
    }
}

/// Match verdict for one detection against the reference.
#[derive(Debug, Clone, PartialEq)]
pub struct RecognitionResult {
    pub bbox: FaceRect,
    /// Cosine similarity to the reference [-1, 1].
    pub similarity: f32,
    pub is_target: bool,
}

impl RecognitionResult {
    pub fn label(&self) -> &'static str {
        if self.is_target { "target" } else { "unknown" }
    }

    /// Annotation color (RGB): green for the target, red otherwise.
    pub fn color(&self) -> [u8; 3] {
        if self.is_target { [0, 200, 0] } else { [200, 0, 0] }
    }

    /// Presence payload for this result.
    pub fn payload(&self) -> &'static str {
        crate::actuator::presence_payload(self.is_target)
    }

    /// Annotation caption, e.g. `target: 0.42`.
    pub fn caption(&self) -> String {
        format!("{}: {:.2}", self.label(), self.similarity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_to_rect_truncates() {
        let bbox = BoundingBox {
            x: 10.7, y: 20.2, width: 50.5, height: 60.9,
            confidence: 0.9, landmarks: None,
        };
        let rect = bbox.to_rect();
        assert_eq!(rect, FaceRect { x1: 10, y1: 20, x2: 61, y2: 81 });
        assert!(rect.x1 < rect.x2 && rect.y1 < rect.y2);
    }

    #[test]
    fn test_embedding_dot() {
        let a = Embedding::new(vec![1.0, 2.0, 3.0]);
        let b = Embedding::new(vec![4.0, -5.0, 6.0]);
        assert!((a.dot(&b) - 12.0).abs() < 1e-6);
    }

    #[test]
    fn test_reference_rejects_zero_vector() {
        assert!(ReferenceEmbedding::from_embedding(Embedding::new(vec![0.0; 4])).is_none());
        assert!(ReferenceEmbedding::from_embedding(Embedding::new(vec![])).is_none());
    }

    #[test]
    fn test_reference_is_unit_norm() {
        let r = ReferenceEmbedding::from_embedding(Embedding::new(vec![3.0, 4.0])).unwrap();
        assert!((r.embedding().norm() - 1.0).abs() < 1e-6);
        assert!((r.values()[0] - 0.6).abs() < 1e-6);
    }

    #[test]
    fn test_result_presentation() {
        let hit = RecognitionResult {
            bbox: FaceRect { x1: 0, y1: 0, x2: 1, y2: 1 },
            similarity: 0.5,
            is_target: true,
        };
        let miss = RecognitionResult { is_target: false, ..hit.clone() };
        assert_eq!(hit.label(), "target");
        assert_eq!(miss.label(), "unknown");
        assert_eq!(hit.payload(), "1");
        assert_eq!(miss.payload(), "0");
        assert_ne!(hit.color(), miss.color());
        assert_eq!(hit.caption(), "target: 0.50");
        assert_eq!(RecognitionResult { similarity: -0.125, ..miss }.caption(), "unknown: -0.12");
    }
}
