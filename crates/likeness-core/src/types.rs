use serde::{Deserialize, Serialize};

use crate::cluster::DistanceMetric;

/// Axis-aligned face box in source-image pixel coordinates.
///
/// Serialized as `[x1, y1, x2, y2]`, the layout face detectors emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[i32; 4]", into = "[i32; 4]")]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    pub fn width(&self) -> i64 {
        self.x2 as i64 - self.x1 as i64
    }

    pub fn height(&self) -> i64 {
        self.y2 as i64 - self.y1 as i64
    }

    /// Box area. Inverted boxes report zero rather than a negative area.
    pub fn area(&self) -> i64 {
        self.width().max(0) * self.height().max(0)
    }
}

impl From<[i32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

impl From<BoundingBox> for [i32; 4] {
    fn from(b: BoundingBox) -> Self {
        [b.x1, b.y1, b.x2, b.y2]
    }
}

/// Face embedding vector (typically 512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    pub fn is_finite(&self) -> bool {
        self.values.iter().all(|v| v.is_finite())
    }

    /// Compute cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]. Higher = more similar. A zero vector
    /// on either side yields 0.0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Cosine distance, `1 - similarity`, in [0, 2].
    pub fn cosine_distance(&self, other: &Embedding) -> f32 {
        1.0 - self.similarity(other)
    }

    /// Compute Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Element-wise mean of a set of embeddings (unnormalized).
    ///
    /// Returns `None` for an empty set. Callers are expected to have
    /// checked that all inputs share one dimensionality.
    pub fn mean<'a, I>(embeddings: I) -> Option<Embedding>
    where
        I: IntoIterator<Item = &'a Embedding>,
    {
        let mut iter = embeddings.into_iter();
        let first = iter.next()?;
        let mut sum: Vec<f64> = first.values.iter().map(|&v| v as f64).collect();
        let mut count = 1usize;

        for e in iter {
            for (acc, &v) in sum.iter_mut().zip(e.values.iter()) {
                *acc += v as f64;
            }
            count += 1;
        }

        let n = count as f64;
        Some(Embedding {
            values: sum.into_iter().map(|s| (s / n) as f32).collect(),
        })
    }
}

/// Normalization convention of the embeddings a detector produced.
///
/// Decides the native distance metric used by density clustering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingNorm {
    /// Unit-length vectors (ArcFace `normed_embedding`).
    #[default]
    L2,
    /// Unnormalized model output (e.g. FaceNet raw embeddings).
    Raw,
}

impl EmbeddingNorm {
    pub fn native_metric(self) -> DistanceMetric {
        match self {
            EmbeddingNorm::L2 => DistanceMetric::Cosine,
            EmbeddingNorm::Raw => DistanceMetric::Euclidean,
        }
    }
}

/// One face found in one image by the external detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedFace {
    pub bbox: BoundingBox,
    pub embedding: Embedding,
}

/// Detector output for a single source image.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageDetections {
    /// Stable image identifier, usually the file name.
    pub id: String,
    pub height: u32,
    pub width: u32,
    #[serde(default)]
    pub faces: Vec<DetectedFace>,
}

impl ImageDetections {
    pub fn primary_face(&self) -> Option<&DetectedFace> {
        primary_face(&self.faces)
    }
}

/// Select the face with the largest box area; ties go to the first occurrence.
pub fn primary_face(faces: &[DetectedFace]) -> Option<&DetectedFace> {
    let mut best: Option<&DetectedFace> = None;
    for face in faces {
        match best {
            Some(b) if face.bbox.area() <= b.bbox.area() => {}
            _ => best = Some(face),
        }
    }
    best
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x1: i32, y1: i32, x2: i32, y2: i32, tag: f32) -> DetectedFace {
        DetectedFace {
            bbox: BoundingBox::new(x1, y1, x2, y2),
            embedding: Embedding::new(vec![tag]),
        }
    }

    #[test]
    fn test_cosine_similarity_identical() {
        let a = Embedding::new(vec![1.0, 0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0, 0.0]);
        assert!((a.similarity(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_orthogonal() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        assert!(a.similarity(&b).abs() < 1e-6);
        assert!((a.cosine_distance(&b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_similarity_zero_vector() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![1.0, 0.0]);
        assert_eq!(a.similarity(&b), 0.0);
    }

    #[test]
    fn test_euclidean_distance() {
        let a = Embedding::new(vec![0.0, 0.0]);
        let b = Embedding::new(vec![3.0, 4.0]);
        assert!((a.euclidean_distance(&b) - 5.0).abs() < 1e-6);
    }

    #[test]
    fn test_mean_is_elementwise() {
        let a = Embedding::new(vec![1.0, 0.0]);
        let b = Embedding::new(vec![0.0, 1.0]);
        let m = Embedding::mean([&a, &b]).unwrap();
        assert_eq!(m.values, vec![0.5, 0.5]);
    }

    #[test]
    fn test_mean_empty() {
        assert!(Embedding::mean(std::iter::empty::<&Embedding>()).is_none());
    }

    #[test]
    fn test_primary_face_largest_area() {
        let faces = vec![face(0, 0, 10, 10, 1.0), face(0, 0, 30, 20, 2.0), face(0, 0, 5, 5, 3.0)];
        assert_eq!(primary_face(&faces).unwrap().embedding.values, vec![2.0]);
    }

    #[test]
    fn test_primary_face_tie_keeps_first() {
        let faces = vec![face(0, 0, 10, 20, 1.0), face(50, 50, 70, 60, 2.0)];
        assert_eq!(primary_face(&faces).unwrap().embedding.values, vec![1.0]);
    }

    #[test]
    fn test_primary_face_empty() {
        assert!(primary_face(&[]).is_none());
    }

    #[test]
    fn test_bbox_serde_as_array() {
        let b: BoundingBox = serde_json::from_str("[300, 200, 500, 400]").unwrap();
        assert_eq!(b, BoundingBox::new(300, 200, 500, 400));
        assert_eq!(serde_json::to_string(&b).unwrap(), "[300,200,500,400]");
    }

    #[test]
    fn test_native_metric() {
        assert_eq!(EmbeddingNorm::L2.native_metric(), DistanceMetric::Cosine);
        assert_eq!(EmbeddingNorm::Raw.native_metric(), DistanceMetric::Euclidean);
    }

    #[test]
    fn test_image_detections_defaults_faces() {
        let img: ImageDetections =
            serde_json::from_str(r#"{"id": "a.jpg", "height": 10, "width": 20}"#).unwrap();
        assert!(img.faces.is_empty());
        assert!(img.primary_face().is_none());
    }
}
