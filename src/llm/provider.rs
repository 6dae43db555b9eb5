use anyhow::{anyhow, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::GenericImageView;
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::ops::AddAssign;
use std::path::Path;
use std::time::Duration;

use crate::config::{LlmConfig, LlmProviderType};

/// Raw image bytes plus their MIME type; providers base64-encode on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct ImagePayload {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// HEIF-family files are ISO-BMFF: an `ftyp` box whose major brand names the codec.
fn heif_mime_type(data: &[u8]) -> Option<&'static str> {
    if data.get(4..8)? != b"ftyp" {
        return None;
    }
    match data.get(8..12)? {
        b"heic" | b"heix" | b"hevc" | b"hevx" | b"heim" | b"heis" => Some("image/heic"),
        b"mif1" | b"msf1" | b"heif" => Some("image/heif"),
        _ => None,
    }
}

impl ImagePayload {
    pub fn jpeg(data: Vec<u8>) -> Self {
        Self {
            mime_type: "image/jpeg".to_string(),
            data,
        }
    }

    /// Sniff the MIME type from the bytes, defaulting to JPEG.
    pub fn from_bytes(data: Vec<u8>) -> Self {
        let mime_type = match heif_mime_type(&data) {
            Some(mime) => mime,
            None => match image::guess_format(&data) {
                Ok(image::ImageFormat::Png) => "image/png",
                Ok(image::ImageFormat::WebP) => "image/webp",
                Ok(image::ImageFormat::Gif) => "image/gif",
                _ => "image/jpeg",
            },
        };
        Self {
            mime_type: mime_type.to_string(),
            data,
        }
    }

    fn base64(&self) -> String {
        BASE64.encode(&self.data)
    }

    fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestPart {
    Text(String),
    Image(ImagePayload),
}

/// Ordered text and image parts sent as one user turn.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OracleRequest {
    pub parts: Vec<RequestPart>,
}

impl OracleRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.parts.push(RequestPart::Text(text.into()));
        self
    }

    pub fn image(mut self, payload: ImagePayload) -> Self {
        self.parts.push(RequestPart::Image(payload));
        self
    }

    pub fn image_count(&self) -> usize {
        self.parts
            .iter()
            .filter(|p| matches!(p, RequestPart::Image(_)))
            .count()
    }

    /// All text parts joined with blank lines, for APIs taking a single prompt.
    fn joined_text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                RequestPart::Text(t) => Some(t.as_str()),
                RequestPart::Image(_) => None,
            })
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Token counters; zero when the provider reports nothing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub total: u64,
    pub prompt: u64,
    pub completion: u64,
}

impl TokenUsage {
    fn from_parts(prompt: Option<u64>, completion: Option<u64>, total: Option<u64>) -> Self {
        let prompt = prompt.unwrap_or(0);
        let completion = completion.unwrap_or(0);
        Self {
            prompt,
            completion,
            total: total.unwrap_or(prompt + completion),
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, other: Self) {
        self.total += other.total;
        self.prompt += other.prompt;
        self.completion += other.completion;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct OracleResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// A vision-language model behind some HTTP API.
pub trait LlmProvider: Send + Sync {
    fn generate(&self, request: &OracleRequest) -> Result<OracleResponse>;

    /// Get the provider name for display
    fn provider_name(&self) -> &'static str;
}

fn agent(timeout: Duration) -> ureq::Agent {
    ureq::AgentBuilder::new().timeout(timeout).build()
}

// ============================================================================
// OpenAI-compatible provider (works with LM Studio, OpenAI, and compatible APIs)
// ============================================================================

pub struct OpenAICompatibleProvider {
    endpoint: String,
    model: String,
    api_key: Option<String>,
    max_tokens: u32,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: Vec<OpenAIContentPart>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum OpenAIContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: ImageUrl },
}

#[derive(Debug, Serialize)]
struct ImageUrl {
    url: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    usage: Option<OpenAIUsage>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenAIUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
    total_tokens: Option<u64>,
}

impl OpenAICompatibleProvider {
    pub fn new(endpoint: &str, model: &str, api_key: Option<&str>) -> Self {
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key: api_key.map(|s| s.to_string()),
            max_tokens: 8192,
            timeout: Duration::from_secs(180),
        }
    }

    pub fn with_limits(mut self, max_tokens: u32, timeout: Duration) -> Self {
        self.max_tokens = max_tokens;
        self.timeout = timeout;
        self
    }
}

impl LlmProvider for OpenAICompatibleProvider {
    fn generate(&self, request: &OracleRequest) -> Result<OracleResponse> {
        let content = request
            .parts
            .iter()
            .map(|part| match part {
                RequestPart::Text(text) => OpenAIContentPart::Text { text: text.clone() },
                RequestPart::Image(img) => OpenAIContentPart::ImageUrl {
                    image_url: ImageUrl { url: img.data_url() },
                },
            })
            .collect();

        let body = OpenAIChatRequest {
            model: self.model.clone(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content,
            }],
            max_tokens: self.max_tokens,
            temperature: 0.7,
        };

        let url = format!("{}/chat/completions", self.endpoint);
        let mut req = agent(self.timeout)
            .post(&url)
            .set("Content-Type", "application/json");

        if let Some(ref api_key) = self.api_key {
            req = req.set("Authorization", &format!("Bearer {}", api_key));
        }

        let response = req
            .send_json(&body)
            .map_err(|e| anyhow!("LLM request failed: {}", e))?;

        let chat_response: OpenAIChatResponse = response
            .into_json()
            .map_err(|e| anyhow!("Failed to parse LLM response: {}", e))?;

        let text = chat_response
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| anyhow!("No response from LLM"))?;

        let usage = chat_response
            .usage
            .map(|u| TokenUsage::from_parts(u.prompt_tokens, u.completion_tokens, u.total_tokens))
            .unwrap_or_default();

        Ok(OracleResponse { text, usage })
    }

    fn provider_name(&self) -> &'static str {
        "OpenAI-compatible"
    }
}

// ============================================================================
// Anthropic Claude provider
// ============================================================================

pub struct AnthropicProvider {
    api_key: String,
    model: String,
    max_tokens: u32,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct AnthropicRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<AnthropicMessage>,
}

#[derive(Debug, Serialize)]
struct AnthropicMessage {
    role: String,
    content: Vec<AnthropicContent>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum AnthropicContent {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image")]
    Image { source: AnthropicImageSource },
}

#[derive(Debug, Serialize)]
struct AnthropicImageSource {
    #[serde(rename = "type")]
    source_type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponse {
    content: Vec<AnthropicResponseContent>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Debug, Deserialize)]
struct AnthropicResponseContent {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnthropicUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl AnthropicProvider {
    pub fn new(api_key: &str, model: Option<&str>) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.unwrap_or("claude-sonnet-4-20250514").to_string(),
            max_tokens: 8192,
            timeout: Duration::from_secs(180),
        }
    }

    pub fn with_limits(mut self, max_tokens: u32, timeout: Duration) -> Self {
        self.max_tokens = max_tokens;
        self.timeout = timeout;
        self
    }
}

impl LlmProvider for AnthropicProvider {
    fn generate(&self, request: &OracleRequest) -> Result<OracleResponse> {
        let content = request
            .parts
            .iter()
            .map(|part| match part {
                RequestPart::Text(text) => AnthropicContent::Text { text: text.clone() },
                RequestPart::Image(img) => AnthropicContent::Image {
                    source: AnthropicImageSource {
                        source_type: "base64".to_string(),
                        media_type: img.mime_type.clone(),
                        data: img.base64(),
                    },
                },
            })
            .collect();

        let body = AnthropicRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            messages: vec![AnthropicMessage {
                role: "user".to_string(),
                content,
            }],
        };

        let response = agent(self.timeout)
            .post("https://api.anthropic.com/v1/messages")
            .set("Content-Type", "application/json")
            .set("x-api-key", &self.api_key)
            .set("anthropic-version", "2023-06-01")
            .send_json(&body)
            .map_err(|e| anyhow!("Anthropic request failed: {}", e))?;

        let anthropic_response: AnthropicResponse = response
            .into_json()
            .map_err(|e| anyhow!("Failed to parse Anthropic response: {}", e))?;

        let text = anthropic_response
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        if text.is_empty() {
            return Err(anyhow!("No response from Anthropic"));
        }

        let usage = anthropic_response
            .usage
            .map(|u| TokenUsage::from_parts(u.input_tokens, u.output_tokens, None))
            .unwrap_or_default();

        Ok(OracleResponse { text, usage })
    }

    fn provider_name(&self) -> &'static str {
        "Anthropic Claude"
    }
}

// ============================================================================
// Ollama provider
// ============================================================================

pub struct OllamaProvider {
    endpoint: String,
    model: String,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    images: Vec<String>,
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    response: String,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

impl OllamaProvider {
    pub fn new(endpoint: Option<&str>, model: &str) -> Self {
        Self {
            endpoint: endpoint
                .unwrap_or("http://localhost:11434")
                .trim_end_matches('/')
                .to_string(),
            model: model.to_string(),
            timeout: Duration::from_secs(180),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl LlmProvider for OllamaProvider {
    fn generate(&self, request: &OracleRequest) -> Result<OracleResponse> {
        let images = request
            .parts
            .iter()
            .filter_map(|p| match p {
                RequestPart::Image(img) => Some(img.base64()),
                RequestPart::Text(_) => None,
            })
            .collect();

        let body = OllamaRequest {
            model: self.model.clone(),
            prompt: request.joined_text(),
            images,
            stream: false,
        };

        let url = format!("{}/api/generate", self.endpoint);

        let response = agent(self.timeout)
            .post(&url)
            .set("Content-Type", "application/json")
            .send_json(&body)
            .map_err(|e| anyhow!("Ollama request failed: {}", e))?;

        let ollama_response: OllamaResponse = response
            .into_json()
            .map_err(|e| anyhow!("Failed to parse Ollama response: {}", e))?;

        Ok(OracleResponse {
            usage: TokenUsage::from_parts(
                ollama_response.prompt_eval_count,
                ollama_response.eval_count,
                None,
            ),
            text: ollama_response.response,
        })
    }

    fn provider_name(&self) -> &'static str {
        "Ollama"
    }
}

// ============================================================================
// Google Gemini provider
// ============================================================================

pub struct GeminiProvider {
    api_key: String,
    model: String,
    max_tokens: u32,
    timeout: Duration,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum GeminiPart {
    Text { text: String },
    Inline { inline_data: GeminiInlineData },
}

#[derive(Debug, Serialize)]
struct GeminiInlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(default)]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiResponseContent>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponseContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GeminiUsage {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
    total_token_count: Option<u64>,
}

impl GeminiProvider {
    pub fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            max_tokens: 8192,
            timeout: Duration::from_secs(180),
        }
    }

    pub fn with_limits(mut self, max_tokens: u32, timeout: Duration) -> Self {
        self.max_tokens = max_tokens;
        self.timeout = timeout;
        self
    }
}

impl LlmProvider for GeminiProvider {
    fn generate(&self, request: &OracleRequest) -> Result<OracleResponse> {
        let parts = request
            .parts
            .iter()
            .map(|part| match part {
                RequestPart::Text(text) => GeminiPart::Text { text: text.clone() },
                RequestPart::Image(img) => GeminiPart::Inline {
                    inline_data: GeminiInlineData {
                        mime_type: img.mime_type.clone(),
                        data: img.base64(),
                    },
                },
            })
            .collect();

        let body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts,
            }],
            generation_config: GeminiGenerationConfig {
                max_output_tokens: self.max_tokens,
            },
        };

        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model.trim_start_matches("models/")
        );

        let response = agent(self.timeout)
            .post(&url)
            .set("Content-Type", "application/json")
            .set("x-goog-api-key", &self.api_key)
            .send_json(&body)
            .map_err(|e| anyhow!("Gemini request failed: {}", e))?;

        let gemini_response: GeminiResponse = response
            .into_json()
            .map_err(|e| anyhow!("Failed to parse Gemini response: {}", e))?;

        let text = gemini_response
            .candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|c| {
                c.parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .filter(|t| !t.is_empty())
            .ok_or_else(|| anyhow!("Gemini response contained no text parts"))?;

        let usage = gemini_response
            .usage_metadata
            .map(|u| {
                TokenUsage::from_parts(
                    u.prompt_token_count,
                    u.candidates_token_count,
                    u.total_token_count,
                )
            })
            .unwrap_or_default();

        Ok(OracleResponse { text, usage })
    }

    fn provider_name(&self) -> &'static str {
        "Google Gemini"
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Load an image file, shrink it to fit `max_dimension` and re-encode as JPEG.
pub fn encode_image_file(image_path: &Path, max_dimension: u32) -> Result<ImagePayload> {
    let img = image::open(image_path)
        .map_err(|e| anyhow!("Failed to open image {}: {}", image_path.display(), e))?;

    let (width, height) = img.dimensions();
    let img = if width > max_dimension || height > max_dimension {
        img.resize(
            max_dimension,
            max_dimension,
            image::imageops::FilterType::Triangle,
        )
    } else {
        img
    };

    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, 85);
    image::DynamicImage::ImageRgb8(img.to_rgb8())
        .write_with_encoder(encoder)
        .map_err(|e| anyhow!("Failed to encode image as JPEG: {}", e))?;

    Ok(ImagePayload::jpeg(buf.into_inner()))
}

/// Pull a JSON document out of model output.
///
/// Prefers the first ```` ```json ```` fence, then any fence, then the trimmed
/// text if it is brace-delimited. Returns `None` when nothing looks like JSON.
pub fn extract_json(content: &str) -> Option<&str> {
    if let Some((_, rest)) = content.split_once("```json") {
        let body = rest.split("```").next().unwrap_or(rest);
        return Some(body.trim());
    }

    let trimmed = content.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        if let Some(newline) = rest.find('\n') {
            let after_first_line = &rest[newline + 1..];
            if let Some(end) = after_first_line.find("```") {
                return Some(after_first_line[..end].trim());
            }
        }
    }

    if trimmed.starts_with('{') && trimmed.ends_with('}') {
        return Some(trimmed);
    }

    None
}

// ============================================================================
// Factory function
// ============================================================================

/// Create an LLM provider based on configuration
pub fn create_provider(config: &LlmConfig) -> Box<dyn LlmProvider> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let max_tokens = config.max_output_tokens;

    match config.provider {
        LlmProviderType::LmStudio => Box::new(
            OpenAICompatibleProvider::new(
                &config.endpoint,
                &config.model,
                config.api_key.as_deref(),
            )
            .with_limits(max_tokens, timeout),
        ),
        LlmProviderType::OpenAI => Box::new(
            OpenAICompatibleProvider::new(
                "https://api.openai.com/v1",
                &config.model,
                config.api_key.as_deref(),
            )
            .with_limits(max_tokens, timeout),
        ),
        LlmProviderType::Anthropic => {
            let api_key = config.api_key.as_deref().unwrap_or("");
            Box::new(
                AnthropicProvider::new(api_key, Some(&config.model))
                    .with_limits(max_tokens, timeout),
            )
        }
        LlmProviderType::Ollama => Box::new(
            OllamaProvider::new(Some(&config.endpoint), &config.model).with_timeout(timeout),
        ),
        LlmProviderType::Gemini => {
            let api_key = config.api_key.as_deref().unwrap_or("");
            Box::new(GeminiProvider::new(api_key, &config.model).with_limits(max_tokens, timeout))
        }
    }
}
