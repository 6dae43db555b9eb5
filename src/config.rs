use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    #[serde(default)]
    pub cloud: CloudConfig,

    #[serde(default)]
    pub llm: LlmConfig,

    #[serde(default)]
    pub embedding: EmbeddingConfig,

    #[serde(default)]
    pub filter: FilterConfig,

    #[serde(default)]
    pub batching: BatchingConfig,

    #[serde(default)]
    pub analysis: AnalysisConfig,

    #[serde(default)]
    pub compression: CompressionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudConfig {
    /// Root of the exported libraries; each account lives in `<root>/<email>`.
    #[serde(default = "default_library_root")]
    pub library_root: PathBuf,

    #[serde(default = "default_max_assets")]
    pub max_assets: usize,

    #[serde(default)]
    pub accounts: Vec<CloudAccount>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudAccount {
    pub email: String,
    pub password: String,

    /// When set, the first login of each process must be verified with this code.
    #[serde(default)]
    pub second_factor_code: Option<String>,
}

fn default_library_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("memoria/libraries")
}

fn default_max_assets() -> usize {
    1000
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            library_root: default_library_root(),
            max_assets: default_max_assets(),
            accounts: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LlmProviderType {
    #[default]
    LmStudio,
    OpenAI,
    Anthropic,
    Ollama,
    Gemini,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: LlmProviderType,

    #[serde(default = "default_llm_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    #[serde(default)]
    pub api_key: Option<String>,

    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
}

fn default_llm_endpoint() -> String {
    "http://127.0.0.1:1234/v1".to_string()
}

fn default_llm_model() -> String {
    "gemma-3-4b".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    180
}

fn default_max_output_tokens() -> u32 {
    8192
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: LlmProviderType::default(),
            endpoint: default_llm_endpoint(),
            model: default_llm_model(),
            api_key: None,
            timeout_secs: default_llm_timeout_secs(),
            max_output_tokens: default_max_output_tokens(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    #[default]
    Clip,
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub backend: EmbeddingBackend,

    /// Base URL of the feature service when `backend = "remote"`.
    #[serde(default = "default_embedding_endpoint")]
    pub endpoint: String,

    #[serde(default = "default_models_dir")]
    pub models_dir: PathBuf,
}

fn default_embedding_endpoint() -> String {
    "http://127.0.0.1:8100".to_string()
}

fn default_models_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from(".local/share"))
        .join("memoria/models")
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            backend: EmbeddingBackend::default(),
            endpoint: default_embedding_endpoint(),
            models_dir: default_models_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Cosine similarity above which two photos count as near-duplicates.
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f32,

    #[serde(default = "default_aesthetic_weight")]
    pub aesthetic_weight: f32,

    #[serde(default = "default_information_weight")]
    pub information_weight: f32,

    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,

    /// Formats the vision model accepts. Everything else is dropped.
    #[serde(default = "default_compatible_extensions")]
    pub compatible_extensions: Vec<String>,

    #[serde(default = "default_screenshot_keywords")]
    pub screenshot_keywords: Vec<String>,

    #[serde(default = "default_screenshot_directories")]
    pub screenshot_directories: Vec<String>,

    #[serde(default = "default_download_keywords")]
    pub download_keywords: Vec<String>,

    #[serde(default = "default_download_directories")]
    pub download_directories: Vec<String>,
}

fn default_similarity_threshold() -> f32 {
    0.8
}

fn default_aesthetic_weight() -> f32 {
    0.4
}

fn default_information_weight() -> f32 {
    0.6
}

fn strings(values: &[&str]) -> Vec<String> {
    values.iter().map(|s| s.to_string()).collect()
}

fn default_video_extensions() -> Vec<String> {
    strings(&["mp4", "mov", "m4v", "avi", "mkv", "webm", "3gp", "mts", "wmv"])
}

fn default_compatible_extensions() -> Vec<String> {
    strings(&["jpg", "jpeg", "png", "webp", "heic", "heif"])
}

fn default_screenshot_keywords() -> Vec<String> {
    strings(&[
        "screenshot",
        "screen shot",
        "screen_shot",
        "screencap",
        "截图",
        "截屏",
        "屏幕快照",
        "スクリーンショット",
        "bildschirmfoto",
        "capture d'écran",
        "captura de pantalla",
    ])
}

fn default_screenshot_directories() -> Vec<String> {
    strings(&["screenshots", "screen shots", "截图", "截屏"])
}

fn default_download_keywords() -> Vec<String> {
    strings(&["download", "下载", "mmexport", "received_", "saved_image", "wx_camera"])
}

fn default_download_directories() -> Vec<String> {
    strings(&["downloads", "download", "desktop", "下载", "桌面"])
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: default_similarity_threshold(),
            aesthetic_weight: default_aesthetic_weight(),
            information_weight: default_information_weight(),
            video_extensions: default_video_extensions(),
            compatible_extensions: default_compatible_extensions(),
            screenshot_keywords: default_screenshot_keywords(),
            screenshot_directories: default_screenshot_directories(),
            download_keywords: default_download_keywords(),
            download_directories: default_download_directories(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchingConfig {
    /// Months holding more photos than this are split by ISO week.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
}

fn default_max_batch_size() -> usize {
    50
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            max_batch_size: default_max_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    #[serde(default = "default_phase1_concurrency")]
    pub phase1_concurrency: usize,

    /// Images attached to a single Phase 1 request.
    #[serde(default = "default_max_images_per_batch")]
    pub max_images_per_batch: usize,

    /// Scratch directory for uploaded reference photos.
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,
}

fn default_phase1_concurrency() -> usize {
    3
}

fn default_max_images_per_batch() -> usize {
    10
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir().join("memoria")
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            phase1_concurrency: default_phase1_concurrency(),
            max_images_per_batch: default_max_images_per_batch(),
            temp_dir: default_temp_dir(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_max_width")]
    pub max_width: u32,

    #[serde(default = "default_max_height")]
    pub max_height: u32,

    #[serde(default = "default_quality")]
    pub quality: u8,
}

fn default_max_width() -> u32 {
    1920
}

fn default_max_height() -> u32 {
    1080
}

fn default_quality() -> u8 {
    85
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_width: default_max_width(),
            max_height: default_max_height(),
            quality: default_quality(),
        }
    }
}

fn default_db_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("memoria")
        .join("memoria.db")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            cloud: CloudConfig::default(),
            llm: LlmConfig::default(),
            embedding: EmbeddingConfig::default(),
            filter: FilterConfig::default(),
            batching: BatchingConfig::default(),
            analysis: AnalysisConfig::default(),
            compression: CompressionConfig::default(),
        }
    }
}

impl Config {
    /// Load from `MEMORIA_CONFIG` or the default location, writing defaults if absent.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Config = toml::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save_to(path)?;
            Ok(config)
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("memoria")
    }

    fn config_path() -> PathBuf {
        if let Ok(path) = std::env::var("MEMORIA_CONFIG") {
            return PathBuf::from(path);
        }

        Self::config_dir().join("config.toml")
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }
}
