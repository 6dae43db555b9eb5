//! Image feature extraction: embeddings plus aesthetic and information scores.

mod remote;

pub use remote::RemoteEmbeddingClient;

use serde::{Deserialize, Serialize};

/// Features extracted once per unique content hash.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeatureSet {
    #[serde(default)]
    pub visual_vector: Vec<f32>,
    #[serde(default)]
    pub semantic_vector: Vec<f32>,
    #[serde(default)]
    pub aesthetic_score: f32,
    #[serde(default)]
    pub information_score: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl FeatureSet {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// Whether this set can take part in similarity clustering.
    pub fn has_visual(&self) -> bool {
        !self.visual_vector.is_empty()
    }

    pub fn composite_score(&self, aesthetic_weight: f32, information_weight: f32) -> f32 {
        aesthetic_weight * self.aesthetic_score + information_weight * self.information_score
    }
}

/// Black-box embedding and scoring service.
///
/// Implementations never fail outright; problems are reported through
/// [`FeatureSet::error`] with whatever partial features were obtained.
pub trait EmbeddingOracle: Send + Sync {
    fn extract(&self, image_bytes: &[u8]) -> FeatureSet;

    fn name(&self) -> &'static str;
}

/// Cosine similarity; zero for mismatched or empty inputs.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let norm_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();

    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }

    dot / (norm_a * norm_b)
}

/// Little-endian f32 encoding used for vector columns.
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &val in vector {
        bytes.extend_from_slice(&val.to_le_bytes());
    }
    bytes
}

pub fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
