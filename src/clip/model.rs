//! CLIP ViT-B/32 encoders on ONNX Runtime.

use anyhow::{anyhow, Result};
use image::DynamicImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use ort::value::Tensor;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};

use super::scoring::{aesthetic_score, information_score};
use crate::features::{EmbeddingOracle, FeatureSet};

const VISUAL_MODEL: (&str, &str) = (
    "clip-vit-b32-vision.onnx",
    "https://huggingface.co/Qdrant/clip-ViT-B-32-vision/resolve/main/model.onnx",
);

const TEXT_MODEL: (&str, &str) = (
    "clip-vit-b32-text.onnx",
    "https://huggingface.co/Qdrant/clip-ViT-B-32-text/resolve/main/model.onnx",
);

/// Generic descriptors the semantic vector is measured against, in order.
pub const SEMANTIC_DESCRIPTORS: [&str; 5] =
    ["a photo", "a person", "a place", "an object", "a scene"];

const INPUT_SIZE: u32 = 224;
const CONTEXT_LENGTH: usize = 77;
const LOGIT_SCALE: f32 = 100.0;

/// Local CLIP-based [`EmbeddingOracle`].
///
/// Sessions are created on first use and owned by this value, so two
/// embedders never share model state.
pub struct ClipEmbedder {
    models_dir: PathBuf,
    visual: OnceLock<Mutex<Session>>,
    text: OnceLock<Mutex<Session>>,
    descriptors: OnceLock<Vec<Vec<f32>>>,
}

impl ClipEmbedder {
    pub fn new(models_dir: &Path) -> Self {
        Self {
            models_dir: models_dir.to_path_buf(),
            visual: OnceLock::new(),
            text: OnceLock::new(),
            descriptors: OnceLock::new(),
        }
    }

    /// L2-normalized image embedding.
    pub fn embed_image(&self, img: &DynamicImage) -> Result<Vec<f32>> {
        let session = self.session(&self.visual, VISUAL_MODEL)?;
        let mut session = session
            .lock()
            .map_err(|e| anyhow!("Failed to lock model: {}", e))?;

        let input_tensor = Tensor::from_array((
            [1usize, 3, INPUT_SIZE as usize, INPUT_SIZE as usize],
            preprocess(img).into_boxed_slice(),
        ))?;

        let outputs = session.run(ort::inputs!["pixel_values" => input_tensor])?;
        let output = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding output"))?;
        let (_shape, data) = output.1.try_extract_tensor::<f32>()?;

        Ok(l2_normalize(data.to_vec()))
    }

    /// L2-normalized text embedding.
    pub fn embed_text(&self, text: &str) -> Result<Vec<f32>> {
        let session = self.session(&self.text, TEXT_MODEL)?;
        let mut session = session
            .lock()
            .map_err(|e| anyhow!("Failed to lock model: {}", e))?;

        let input_tensor = Tensor::from_array((
            [1usize, CONTEXT_LENGTH],
            tokenize(text).into_boxed_slice(),
        ))?;

        let outputs = session.run(ort::inputs!["input_ids" => input_tensor])?;
        let output = outputs
            .iter()
            .next()
            .ok_or_else(|| anyhow!("No embedding output"))?;
        let (_shape, data) = output.1.try_extract_tensor::<f32>()?;

        Ok(l2_normalize(data.to_vec()))
    }

    /// Softmax over scaled similarity with [`SEMANTIC_DESCRIPTORS`].
    pub fn semantic_vector(&self, visual: &[f32]) -> Result<Vec<f32>> {
        let descriptors = match self.descriptors.get() {
            Some(d) => d,
            None => {
                let computed = SEMANTIC_DESCRIPTORS
                    .iter()
                    .map(|d| self.embed_text(d))
                    .collect::<Result<Vec<_>>>()?;
                self.descriptors.get_or_init(|| computed)
            }
        };

        let logits: Vec<f32> = descriptors
            .iter()
            .map(|d| LOGIT_SCALE * dot(visual, d))
            .collect();
        Ok(softmax(&logits))
    }

    fn session<'a>(
        &self,
        slot: &'a OnceLock<Mutex<Session>>,
        (filename, url): (&str, &str),
    ) -> Result<&'a Mutex<Session>> {
        if let Some(session) = slot.get() {
            return Ok(session);
        }

        let model_path = self.ensure_model(filename, url)?;
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(&model_path)?;

        Ok(slot.get_or_init(|| Mutex::new(session)))
    }

    fn ensure_model(&self, filename: &str, url: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.models_dir)?;
        let model_path = self.models_dir.join(filename);

        if !model_path.exists() {
            tracing::info!(model = %filename, "Downloading CLIP model...");
            let response = ureq::get(url)
                .call()
                .map_err(|e| anyhow!("Failed to download model: {}", e))?;

            let partial = model_path.with_extension("part");
            let mut file = std::fs::File::create(&partial)?;
            std::io::copy(&mut response.into_reader(), &mut file)?;
            std::fs::rename(&partial, &model_path)?;
            tracing::info!(model = %filename, path = ?model_path, "CLIP model downloaded");
        }

        Ok(model_path)
    }
}

impl EmbeddingOracle for ClipEmbedder {
    fn extract(&self, image_bytes: &[u8]) -> FeatureSet {
        let img = match image::load_from_memory(image_bytes) {
            Ok(img) => img,
            Err(e) => return FeatureSet::failed(format!("Failed to decode image: {e}")),
        };

        let mut features = FeatureSet {
            aesthetic_score: aesthetic_score(&img),
            information_score: information_score(&img),
            ..Default::default()
        };

        match self.embed_image(&img) {
            Ok(visual) => {
                match self.semantic_vector(&visual) {
                    Ok(semantic) => features.semantic_vector = semantic,
                    Err(e) => {
                        tracing::warn!(error = %e, "semantic features unavailable");
                        features.error = Some(e.to_string());
                    }
                }
                features.visual_vector = visual;
            }
            Err(e) => {
                tracing::warn!(error = %e, "visual embedding failed");
                features.error = Some(e.to_string());
            }
        }

        features
    }

    fn name(&self) -> &'static str {
        "clip-vit-b32"
    }
}

/// Resize to 224x224 and normalize into NCHW with the CLIP channel statistics.
fn preprocess(img: &DynamicImage) -> Vec<f32> {
    let resized = img.resize_exact(INPUT_SIZE, INPUT_SIZE, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let mean = [0.48145466, 0.4578275, 0.40821073];
    let std = [0.26862954, 0.26130258, 0.27577711];

    let plane = (INPUT_SIZE * INPUT_SIZE) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * INPUT_SIZE as usize + x as usize;
        for channel in 0..3 {
            data[channel * plane + idx] =
                ((pixel[channel] as f32 / 255.0) - mean[channel]) / std[channel];
        }
    }

    data
}

/// Character-level stand-in for CLIP's BPE vocabulary, framed by the
/// start/end tokens and zero-padded to the context length.
// TODO: swap for the real BPE tokenizer once its vocabulary file ships with the models.
fn tokenize(text: &str) -> Vec<i64> {
    let mut ids = vec![49406i64];
    ids.extend(
        text.to_lowercase()
            .chars()
            .filter(|c| c.is_alphanumeric() || c.is_whitespace())
            .take(CONTEXT_LENGTH - 2)
            .map(|c| c as i64),
    );
    ids.push(49407);
    ids.resize(CONTEXT_LENGTH, 0);
    ids
}

fn l2_normalize(v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        v.into_iter().map(|x| x / norm).collect()
    } else {
        v
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}
