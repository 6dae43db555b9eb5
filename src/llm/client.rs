use anyhow::Result;
use std::sync::Arc;

use super::provider::{create_provider, LlmProvider, OracleRequest, OracleResponse};
use crate::config::LlmConfig;

/// Cheaply clonable handle to the configured vision-language provider.
#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn LlmProvider>,
}

impl LlmClient {
    /// Create a new LlmClient from configuration
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            provider: Arc::from(create_provider(config)),
        }
    }

    pub fn with_provider(provider: Arc<dyn LlmProvider>) -> Self {
        Self { provider }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.provider_name()
    }

    /// Blocking call; run it off the async executor.
    pub fn generate(&self, request: &OracleRequest) -> Result<OracleResponse> {
        tracing::debug!(
            provider = self.provider.provider_name(),
            images = request.image_count(),
            "sending oracle request"
        );
        self.provider.generate(request)
    }
}
