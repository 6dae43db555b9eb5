//! Per-asset helpers used while ingesting a library: file discovery, content
//! hashing, EXIF capture metadata and storage-side recompression.

pub mod compression;
pub mod discovery;
pub mod hashing;
pub mod metadata;

pub use compression::{compress_image, CompressedImage, CompressionInfo};
pub use hashing::content_hash;
pub use metadata::{extract_capture_info, CaptureInfo, GpsPoint};
