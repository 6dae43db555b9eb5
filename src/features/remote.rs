use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::Serialize;
use std::time::Duration;

use super::{EmbeddingOracle, FeatureSet};

/// Client for an HTTP feature service.
///
/// `POST {endpoint}/extract` with `{"image": "<base64>"}`; the response body is
/// a [`FeatureSet`] document.
pub struct RemoteEmbeddingClient {
    endpoint: String,
    agent: ureq::Agent,
}

#[derive(Serialize)]
struct ExtractRequest {
    image: String,
}

impl RemoteEmbeddingClient {
    pub fn new(endpoint: &str, timeout: Duration) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }

    fn request(&self, image_bytes: &[u8]) -> Result<FeatureSet> {
        let url = format!("{}/extract", self.endpoint);
        let body = ExtractRequest {
            image: BASE64.encode(image_bytes),
        };

        let response = self
            .agent
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(&body)
            .map_err(|e| anyhow!("Feature service request failed: {}", e))?;

        response
            .into_json()
            .map_err(|e| anyhow!("Failed to parse feature service response: {}", e))
    }
}

impl EmbeddingOracle for RemoteEmbeddingClient {
    fn extract(&self, image_bytes: &[u8]) -> FeatureSet {
        match self.request(image_bytes) {
            Ok(features) => features,
            Err(e) => {
                tracing::warn!(error = %e, endpoint = %self.endpoint, "remote feature extraction failed");
                FeatureSet::failed(e.to_string())
            }
        }
    }

    fn name(&self) -> &'static str {
        "remote"
    }
}
