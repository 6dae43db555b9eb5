//! Describe the account owner from a reference photo so Phase 1 can pick them out.

use serde_json::Value;
use std::io::Write;
use std::path::PathBuf;

use crate::error::AnalysisError;
use crate::llm::{encode_image_file, extract_json, LlmClient, OracleRequest};

const REFERENCE_MAX_DIMENSION: u32 = 1024;

pub struct ProtagonistExtractor {
    llm: LlmClient,
    temp_dir: PathBuf,
}

impl ProtagonistExtractor {
    pub fn new(llm: LlmClient, temp_dir: PathBuf) -> Self {
        Self { llm, temp_dir }
    }

    /// Blocking. The upload is staged in a temporary file that is removed on
    /// every exit path.
    pub fn extract(&self, image_bytes: &[u8], prompt: &str) -> Result<Value, AnalysisError> {
        let format = image::guess_format(image_bytes)
            .map_err(|e| anyhow::anyhow!("Unrecognised reference photo: {}", e))?;
        let extension = format.extensions_str().first().copied().unwrap_or("img");

        std::fs::create_dir_all(&self.temp_dir)
            .map_err(|e| anyhow::anyhow!("Failed to create {}: {}", self.temp_dir.display(), e))?;
        let mut staged = tempfile::Builder::new()
            .prefix("reference-")
            .suffix(&format!(".{}", extension))
            .tempfile_in(&self.temp_dir)
            .map_err(|e| anyhow::anyhow!("Failed to stage reference photo: {}", e))?;
        staged
            .write_all(image_bytes)
            .and_then(|_| staged.flush())
            .map_err(|e| anyhow::anyhow!("Failed to stage reference photo: {}", e))?;

        let payload = encode_image_file(staged.path(), REFERENCE_MAX_DIMENSION)?;
        let request = OracleRequest::new().text(prompt).image(payload);

        let response = self
            .llm
            .generate(&request)
            .map_err(|e| AnalysisError::OracleCallFailed(e.to_string()))?;

        let json = extract_json(&response.text).unwrap_or_else(|| response.text.trim());
        let features: Value = serde_json::from_str(json)
            .map_err(|e| AnalysisError::ProfileParseFailed(e.to_string()))?;

        tracing::info!(
            keys = features.as_object().map(|o| o.len()).unwrap_or(0),
            "protagonist features extracted"
        );
        Ok(features)
    }
}
