pub mod client;
pub mod provider;

pub use client::LlmClient;
pub use provider::{
    create_provider, encode_image_file, extract_json, ImagePayload, LlmProvider, OracleRequest,
    OracleResponse, RequestPart, TokenUsage,
};
