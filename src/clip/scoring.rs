//! Pixel-statistics scores used to pick the best shot of a near-duplicate group.

use image::{DynamicImage, GenericImageView, GrayImage};

/// Longest side analysed; larger images are downscaled first.
const ANALYSIS_SIZE: u32 = 1024;
const TEXTURE_SIZE: u32 = 100;
const EDGE_THRESHOLD: f32 = 150.0;

/// 0.3 * contrast + 0.4 * sharpness + 0.3 * saturation, clamped to [0, 1].
pub fn aesthetic_score(img: &DynamicImage) -> f32 {
    let img = analysis_copy(img);
    let gray = img.to_luma8();

    let contrast = std_dev(&gray) / 255.0;
    let sharpness = (laplacian_variance(&gray) / 1000.0).min(1.0);
    let saturation = mean_saturation(&img);

    (0.3 * contrast + 0.4 * sharpness + 0.3 * saturation).clamp(0.0, 1.0)
}

/// 0.5 * edge density + 0.5 * texture, clamped to [0, 1].
pub fn information_score(img: &DynamicImage) -> f32 {
    let img = analysis_copy(img);
    let gray = img.to_luma8();

    let edges = edge_density(&gray);
    let texture = texture_score(&gray);

    (0.5 * edges + 0.5 * texture).clamp(0.0, 1.0)
}

fn analysis_copy(img: &DynamicImage) -> DynamicImage {
    let (w, h) = img.dimensions();
    if w > ANALYSIS_SIZE || h > ANALYSIS_SIZE {
        img.resize(ANALYSIS_SIZE, ANALYSIS_SIZE, image::imageops::FilterType::Triangle)
    } else {
        img.clone()
    }
}

fn std_dev(gray: &GrayImage) -> f32 {
    let n = (gray.width() * gray.height()) as f64;
    if n == 0.0 {
        return 0.0;
    }
    let mean = gray.pixels().map(|p| p[0] as f64).sum::<f64>() / n;
    let var = gray
        .pixels()
        .map(|p| (p[0] as f64 - mean).powi(2))
        .sum::<f64>()
        / n;
    var.sqrt() as f32
}

/// Variance of the 4-neighbour Laplacian over interior pixels.
fn laplacian_variance(gray: &GrayImage) -> f32 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let at = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f64;
    let mut values = Vec::with_capacity(((w - 2) * (h - 2)) as usize);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let lap = at(x - 1, y) + at(x + 1, y) + at(x, y - 1) + at(x, y + 1) - 4.0 * at(x, y);
            values.push(lap);
        }
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n) as f32
}

/// Mean HSV saturation in [0, 1].
fn mean_saturation(img: &DynamicImage) -> f32 {
    let rgb = img.to_rgb8();
    let n = (rgb.width() * rgb.height()) as f64;
    if n == 0.0 {
        return 0.0;
    }

    let total: f64 = rgb
        .pixels()
        .map(|p| {
            let max = p.0.iter().copied().max().unwrap_or(0) as f64;
            let min = p.0.iter().copied().min().unwrap_or(0) as f64;
            if max == 0.0 {
                0.0
            } else {
                (max - min) / max
            }
        })
        .sum();

    (total / n) as f32
}

/// Fraction of interior pixels whose Sobel gradient magnitude exceeds the threshold.
fn edge_density(gray: &GrayImage) -> f32 {
    let (w, h) = gray.dimensions();
    if w < 3 || h < 3 {
        return 0.0;
    }

    let at = |x: u32, y: u32| gray.get_pixel(x, y)[0] as f32;
    let mut edges = 0usize;
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = at(x + 1, y - 1) + 2.0 * at(x + 1, y) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x - 1, y)
                - at(x - 1, y + 1);
            let gy = at(x - 1, y + 1) + 2.0 * at(x, y + 1) + at(x + 1, y + 1)
                - at(x - 1, y - 1)
                - 2.0 * at(x, y - 1)
                - at(x + 1, y - 1);
            if (gx * gx + gy * gy).sqrt() > EDGE_THRESHOLD {
                edges += 1;
            }
        }
    }

    edges as f32 / (w * h) as f32
}

/// Horizontal grey-level co-occurrence contrast and homogeneity on a 100x100
/// thumbnail. Images too small to sample score a neutral 0.5.
fn texture_score(gray: &GrayImage) -> f32 {
    if gray.width() <= TEXTURE_SIZE || gray.height() <= TEXTURE_SIZE {
        return 0.5;
    }

    let small = image::imageops::resize(
        gray,
        TEXTURE_SIZE,
        TEXTURE_SIZE,
        image::imageops::FilterType::Triangle,
    );

    let mut contrast = 0.0f64;
    let mut homogeneity = 0.0f64;
    let mut pairs = 0usize;
    for y in 0..TEXTURE_SIZE {
        for x in 0..TEXTURE_SIZE - 1 {
            let a = small.get_pixel(x, y)[0] as f64;
            let b = small.get_pixel(x + 1, y)[0] as f64;
            let d2 = (a - b).powi(2);
            contrast += d2;
            homogeneity += 1.0 / (1.0 + d2);
            pairs += 1;
        }
    }

    let contrast = contrast / pairs as f64;
    let homogeneity = homogeneity / pairs as f64;
    ((contrast / 1000.0).min(1.0) * 0.5 + homogeneity * 0.5) as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb, RgbImage};

    fn checkerboard(size: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(size, size, |x, y| {
            if (x / 8 + y / 8) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        }))
    }

    #[test]
    fn test_flat_image_scores() {
        let flat = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 200, Rgb([128, 128, 128])));
        assert_eq!(aesthetic_score(&flat), 0.0);
        // No edges; uniform texture has homogeneity 1.
        assert!((information_score(&flat) - 0.25).abs() < 1e-4);
    }

    #[test]
    fn test_busy_image_scores_higher() {
        let flat = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 200, Rgb([128, 128, 128])));
        let busy = checkerboard(200);
        assert!(aesthetic_score(&busy) > aesthetic_score(&flat));
        assert!(information_score(&busy) > information_score(&flat));
    }

    #[test]
    fn test_saturation() {
        let red = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([255, 0, 0])));
        assert!((mean_saturation(&red) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_small_image_texture_is_neutral() {
        let gray = GrayImage::from_pixel(50, 50, Luma([10]));
        assert_eq!(texture_score(&gray), 0.5);
    }
}
