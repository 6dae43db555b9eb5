use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, GenericImageView, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use crate::config::CompressionConfig;

/// What happened when a stored photo was recompressed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompressionInfo {
    pub width: u32,
    pub height: u32,
    pub format: String,
    pub original_size: u64,
    pub compressed_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub struct CompressedImage {
    pub info: CompressionInfo,
    pub data: Option<Vec<u8>>,
}

/// Decode, flatten transparency onto white, fit inside the configured box and
/// re-encode as JPEG. Never fails: decode or encode errors land in `info.error`.
pub fn compress_image(bytes: &[u8], config: &CompressionConfig) -> CompressedImage {
    let mut info = CompressionInfo {
        format: "jpeg".to_string(),
        original_size: bytes.len() as u64,
        ..Default::default()
    };

    match encode(bytes, config, &mut info) {
        Ok(data) => {
            info.compressed_size = data.len() as u64;
            CompressedImage {
                info,
                data: Some(data),
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "image compression failed");
            info.error = Some(e.to_string());
            CompressedImage { info, data: None }
        }
    }
}

fn encode(
    bytes: &[u8],
    config: &CompressionConfig,
    info: &mut CompressionInfo,
) -> image::ImageResult<Vec<u8>> {
    let img = image::load_from_memory(bytes)?;
    let (width, height) = img.dimensions();
    info.width = width;
    info.height = height;

    let mut img = DynamicImage::ImageRgb8(flatten_onto_white(&img));

    if width > config.max_width || height > config.max_height {
        img = img.resize(
            config.max_width,
            config.max_height,
            image::imageops::FilterType::Triangle,
        );
    }

    let mut buf = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut buf, config.quality.clamp(1, 100));
    img.write_with_encoder(encoder)?;

    let (width, height) = img.dimensions();
    info.width = width;
    info.height = height;

    Ok(buf.into_inner())
}

fn flatten_onto_white(img: &DynamicImage) -> RgbImage {
    if !img.color().has_alpha() {
        return img.to_rgb8();
    }

    let rgba = img.to_rgba8();
    let (width, height) = rgba.dimensions();
    RgbImage::from_fn(width, height, |x, y| {
        let [r, g, b, a] = rgba.get_pixel(x, y).0;
        let alpha = a as u32;
        let blend = |c: u8| ((c as u32 * alpha + 255 * (255 - alpha)) / 255) as u8;
        image::Rgb([blend(r), blend(g), blend(b)])
    })
}
