//! Local feature extraction with CLIP (Contrastive Language-Image Pre-training).
//!
//! Produces the visual embedding used for near-duplicate clustering, a small
//! semantic vector, and the pixel-statistics quality scores.

mod model;
pub mod scoring;

pub use model::{ClipEmbedder, SEMANTIC_DESCRIPTORS};
