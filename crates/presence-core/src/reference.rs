//! Reference embedding: built once from a directory of photos, then cached.
//!
//! The cache lives inside the reference directory. Its presence alone skips
//! the rebuild; delete it to force one.

use crate::analyzer::{AnalyzerError, FaceAnalyzer};
use crate::npy::{self, NpyError};
use crate::types::{Detection, Embedding, ReferenceEmbedding};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const DEFAULT_CACHE_FILENAME: &str = "reference_embedding.npy";

const IMAGE_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

#[derive(Error, Debug)]
pub enum ReferenceError {
    #[error("reference directory does not exist: {0}")]
    DirectoryNotFound(PathBuf),
    #[error("no reference embedding could be built from {0}: no readable image with a detectable face")]
    NoEmbeddings(PathBuf),
    #[error("cached embedding {path} has {found} dimensions, the model produces {expected}")]
    DimensionMismatch { path: PathBuf, expected: usize, found: usize },
    #[error("cached embedding {path} is unusable: {source}")]
    CacheFormat { path: PathBuf, source: NpyError },
    #[error("cached embedding {0} is a zero vector")]
    ZeroCache(PathBuf),
    #[error("failed to write cache {path}: {source}")]
    CacheWrite { path: PathBuf, source: NpyError },
    #[error("io error walking {path}: {source}")]
    Io { path: PathBuf, source: std::io::Error },
    #[error("analyzer error: {0}")]
    Analyzer(#[from] AnalyzerError),
}

/// Check that the reference directory exists.
pub fn resolve_reference_dir(path: impl Into<PathBuf>) -> Result<PathBuf, ReferenceError> {
    let path = path.into();
    if !path.is_dir() {
        return Err(ReferenceError::DirectoryNotFound(path));
    }
    Ok(path)
}

/// Load the cached reference embedding, or build and cache it.
pub fn get_reference_embedding<A: FaceAnalyzer + ?Sized>(
    analyzer: &mut A,
    reference_dir: &Path,
    cache_filename: &str,
) -> Result<ReferenceEmbedding, ReferenceError> {
    let cache_path = reference_dir.join(cache_filename);

    if cache_path.exists() {
        tracing::info!(path = %cache_path.display(), "using cached reference embedding");
        return load_cache(&cache_path, analyzer.embedding_dim());
    }

    tracing::info!(dir = %reference_dir.display(), "no cache; building reference embedding");
    let reference = build_reference_embedding(analyzer, reference_dir)?;
    save_cache(&cache_path, &reference)?;
    tracing::info!(path = %cache_path.display(), dim = reference.dim(), "reference embedding cached");
    Ok(reference)
}

/// Average the best face of every reference image.
///
/// Each per-image embedding is normalized before averaging and the mean is
/// normalized again. Unreadable images and images without faces are skipped.
pub fn build_reference_embedding<A: FaceAnalyzer + ?Sized>(
    analyzer: &mut A,
    reference_dir: &Path,
) -> Result<ReferenceEmbedding, ReferenceError> {
    let mut embeddings: Vec<Embedding> = Vec::new();

    for path in list_images(reference_dir)? {
        let image = match image::open(&path) {
            Ok(img) => img.to_rgb8(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "could not read reference image; skipping");
                continue;
            }
        };

        let detections = analyzer.analyze(image.as_raw(), image.width(), image.height())?;
        let Some(best) = best_detection(&detections) else {
            tracing::warn!(path = %path.display(), "no face detected in reference image; skipping");
            continue;
        };

        tracing::debug!(path = %path.display(), confidence = best.confidence(), "reference face");
        embeddings.push(best.embedding.normalized());
    }

    let mean = mean_embedding(&embeddings).ok_or_else(|| ReferenceError::NoEmbeddings(reference_dir.to_path_buf()))?;
    tracing::info!(images = embeddings.len(), "averaged reference embeddings");

    ReferenceEmbedding::from_embedding(mean).ok_or_else(|| ReferenceError::NoEmbeddings(reference_dir.to_path_buf()))
}

/// Highest-confidence detection; the first one wins ties.
fn best_detection(detections: &[Detection]) -> Option<&Detection> {
    detections.iter().fold(None, |best: Option<&Detection>, d| match best {
        Some(b) if b.confidence() >= d.confidence() => Some(b),
        _ => Some(d),
    })
}

/// Component-wise mean. `None` for an empty set.
fn mean_embedding(embeddings: &[Embedding]) -> Option<Embedding> {
    let first = embeddings.first()?;
    let mut sum = vec![0.0f64; first.dim()];
    for e in embeddings {
        for (acc, v) in sum.iter_mut().zip(&e.values) {
            *acc += *v as f64;
        }
    }
    let n = embeddings.len() as f64;
    Some(Embedding {
        values: sum.into_iter().map(|s| (s / n) as f32).collect(),
        model_version: first.model_version.clone(),
    })
}

/// Image files under `dir`, recursively, in sorted order.
fn list_images(dir: &Path) -> Result<Vec<PathBuf>, ReferenceError> {
    let mut images = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        let entries = match std::fs::read_dir(&current) {
            Ok(entries) => entries,
            Err(source) if current == dir => {
                return Err(ReferenceError::Io { path: current, source });
            }
            Err(e) => {
                tracing::warn!(dir = %current.display(), error = %e, "skipping unreadable directory");
                continue;
            }
        };
        for entry in entries.flatten() {
            let path = entry.path();
            // file_type() does not follow symlinks, so directory cycles are not walked.
            if entry.file_type().is_ok_and(|t| t.is_dir()) {
                pending.push(path);
            } else if path.is_file() && is_image(&path) {
                images.push(path);
            }
        }
    }

    images.sort();
    Ok(images)
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
}

fn load_cache(path: &Path, expected_dim: usize) -> Result<ReferenceEmbedding, ReferenceError> {
    let cache_err = |source: NpyError| ReferenceError::CacheFormat { path: path.to_path_buf(), source };

    let file = File::open(path).map_err(|e| cache_err(NpyError::Io(e)))?;
    let values = npy::read_f32(BufReader::new(file)).map_err(cache_err)?;

    if values.len() != expected_dim {
        return Err(ReferenceError::DimensionMismatch {
            path: path.to_path_buf(),
            expected: expected_dim,
            found: values.len(),
        });
    }

    ReferenceEmbedding::from_embedding(Embedding::new(values))
        .ok_or_else(|| ReferenceError::ZeroCache(path.to_path_buf()))
}

fn save_cache(path: &Path, reference: &ReferenceEmbedding) -> Result<(), ReferenceError> {
    let write_err = |source: NpyError| ReferenceError::CacheWrite { path: path.to_path_buf(), source };
    let file = File::create(path).map_err(|e| write_err(NpyError::Io(e)))?;
    npy::write_f32(BufWriter::new(file), reference.values()).map_err(write_err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BoundingBox;
    use image::{Rgb, RgbImage};
    use std::collections::HashMap;

    /// Keys detections on the image's top-left pixel color, so each test
    /// image can carry its own fake face.
    struct ColorKeyedAnalyzer {
        faces: HashMap<[u8; 3], Vec<(f32, Vec<f32>)>>,
        dim: usize,
        calls: usize,
    }

    impl ColorKeyedAnalyzer {
        fn new(dim: usize) -> Self {
            Self { faces: HashMap::new(), dim, calls: 0 }
        }

        fn with_face(mut self, key: [u8; 3], confidence: f32, values: Vec<f32>) -> Self {
            self.faces.entry(key).or_default().push((confidence, values));
            self
        }
    }

    impl FaceAnalyzer for ColorKeyedAnalyzer {
        fn analyze(&mut self, rgb: &[u8], _w: u32, _h: u32) -> Result<Vec<Detection>, AnalyzerError> {
            self.calls += 1;
            let key = [rgb[0], rgb[1], rgb[2]];
            Ok(self
                .faces
                .get(&key)
                .map(|faces| {
                    faces
                        .iter()
                        .map(|(confidence, values)| Detection {
                            bbox: BoundingBox {
                                x: 0.0, y: 0.0, width: 4.0, height: 4.0,
                                confidence: *confidence, landmarks: None,
                            },
                            embedding: Embedding::new(values.clone()),
                        })
                        .collect()
                })
                .unwrap_or_default())
        }

        fn embedding_dim(&self) -> usize {
            self.dim
        }
    }

    fn write_image(path: &Path, color: [u8; 3]) {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).unwrap();
        }
        RgbImage::from_pixel(4, 4, Rgb(color)).save(path).unwrap();
    }

    fn assert_close(a: &[f32], b: &[f32]) {
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b) {
            assert!((x - y).abs() < 1e-6, "{a:?} vs {b:?}");
        }
    }

    #[test]
    fn test_resolve_missing_dir() {
        let err = resolve_reference_dir("/definitely/not/here").unwrap_err();
        assert!(matches!(err, ReferenceError::DirectoryNotFound(_)));
    }

    #[test]
    fn test_build_averages_normalized_embeddings() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("a.png"), [10, 0, 0]);
        write_image(&dir.path().join("nested/b.PNG"), [20, 0, 0]);

        // Magnitudes differ; normalization before averaging makes them equal weight.
        let mut analyzer = ColorKeyedAnalyzer::new(2)
            .with_face([10, 0, 0], 0.9, vec![10.0, 0.0])
            .with_face([20, 0, 0], 0.9, vec![0.0, 0.5]);

        let r = build_reference_embedding(&mut analyzer, dir.path()).unwrap();
        let h = std::f32::consts::FRAC_1_SQRT_2;
        assert_close(r.values(), &[h, h]);
        assert_eq!(analyzer.calls, 2);
    }

    #[test]
    fn test_build_picks_highest_confidence_face() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("group.png"), [30, 0, 0]);

        let mut analyzer = ColorKeyedAnalyzer::new(2)
            .with_face([30, 0, 0], 0.6, vec![0.0, 1.0])
            .with_face([30, 0, 0], 0.95, vec![1.0, 0.0])
            .with_face([30, 0, 0], 0.95, vec![-1.0, 0.0]);

        let r = build_reference_embedding(&mut analyzer, dir.path()).unwrap();
        assert_close(r.values(), &[1.0, 0.0]);
    }

    #[test]
    fn test_build_skips_unreadable_and_faceless() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("broken.jpg"), b"not a jpeg").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        write_image(&dir.path().join("empty.png"), [0, 0, 0]);
        write_image(&dir.path().join("face.png"), [40, 0, 0]);

        let mut analyzer = ColorKeyedAnalyzer::new(3).with_face([40, 0, 0], 0.8, vec![0.0, 0.0, 2.0]);

        let r = build_reference_embedding(&mut analyzer, dir.path()).unwrap();
        assert_close(r.values(), &[0.0, 0.0, 1.0]);
        // broken.jpg never reaches the analyzer; notes.txt is not an image.
        assert_eq!(analyzer.calls, 2);
    }

    #[cfg(unix)]
    #[test]
    fn test_build_skips_unreadable_subdirectory() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("face.png"), [50, 0, 0]);
        let locked = dir.path().join("locked");
        write_image(&locked.join("hidden.png"), [60, 0, 0]);
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        // Permission bits do not bind root; then the subdirectory is simply walked.
        let enforced = std::fs::read_dir(&locked).is_err();

        let mut analyzer = ColorKeyedAnalyzer::new(2)
            .with_face([50, 0, 0], 0.9, vec![1.0, 0.0])
            .with_face([60, 0, 0], 0.9, vec![1.0, 0.0]);
        let result = build_reference_embedding(&mut analyzer, dir.path());
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        let r = result.unwrap();
        assert_close(r.values(), &[1.0, 0.0]);
        assert_eq!(analyzer.calls, if enforced { 1 } else { 2 });
    }

    #[test]
    fn test_build_fails_without_faces() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("empty.png"), [0, 0, 0]);

        let mut analyzer = ColorKeyedAnalyzer::new(2);
        let err = build_reference_embedding(&mut analyzer, dir.path()).unwrap_err();
        assert!(matches!(err, ReferenceError::NoEmbeddings(_)));
    }

    #[test]
    fn test_build_fails_on_empty_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut analyzer = ColorKeyedAnalyzer::new(2);
        let err = get_reference_embedding(&mut analyzer, dir.path(), DEFAULT_CACHE_FILENAME).unwrap_err();
        assert!(matches!(err, ReferenceError::NoEmbeddings(_)));
        assert!(!dir.path().join(DEFAULT_CACHE_FILENAME).exists());
    }

    #[test]
    fn test_mean_is_order_independent() {
        let embeddings: Vec<Embedding> = [
            vec![0.3, -0.1, 0.9],
            vec![0.5, 0.5, 0.1],
            vec![-0.2, 0.8, 0.4],
            vec![0.9, 0.0, -0.3],
        ]
        .into_iter()
        .map(|v| Embedding::new(v).normalized())
        .collect();

        let forward = mean_embedding(&embeddings).unwrap().normalized();
        let mut shuffled = embeddings.clone();
        shuffled.swap(0, 3);
        shuffled.swap(1, 2);
        let backward = mean_embedding(&shuffled).unwrap().normalized();
        assert_close(&forward.values, &backward.values);
    }

    #[test]
    fn test_cache_roundtrip_skips_analyzer() {
        let dir = tempfile::tempdir().unwrap();
        write_image(&dir.path().join("a.png"), [10, 0, 0]);
        write_image(&dir.path().join("b.png"), [20, 0, 0]);

        let mut analyzer = ColorKeyedAnalyzer::new(3)
            .with_face([10, 0, 0], 0.9, vec![0.2, 0.4, 0.1])
            .with_face([20, 0, 0], 0.9, vec![0.3, -0.1, 0.5]);

        let built = get_reference_embedding(&mut analyzer, dir.path(), "ref.npy").unwrap();
        assert_eq!(analyzer.calls, 2);
        assert!(dir.path().join("ref.npy").exists());

        let mut fresh = ColorKeyedAnalyzer::new(3);
        let loaded = get_reference_embedding(&mut fresh, dir.path(), "ref.npy").unwrap();
        assert_eq!(fresh.calls, 0);
        assert_close(built.values(), loaded.values());
    }

    #[test]
    fn test_cache_dimension_mismatch() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::create(dir.path().join(DEFAULT_CACHE_FILENAME)).unwrap();
        npy::write_f32(file, &[1.0, 0.0, 0.0]).unwrap();

        let mut analyzer = ColorKeyedAnalyzer::new(512);
        let err = get_reference_embedding(&mut analyzer, dir.path(), DEFAULT_CACHE_FILENAME).unwrap_err();
        assert!(matches!(
            err,
            ReferenceError::DimensionMismatch { expected: 512, found: 3, .. }
        ));
    }

    #[test]
    fn test_cache_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(DEFAULT_CACHE_FILENAME), b"garbage").unwrap();
        let mut analyzer = ColorKeyedAnalyzer::new(2);
        let err = get_reference_embedding(&mut analyzer, dir.path(), DEFAULT_CACHE_FILENAME).unwrap_err();
        assert!(matches!(err, ReferenceError::CacheFormat { .. }));
    }
}
