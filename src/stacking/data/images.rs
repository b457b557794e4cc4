//! Image decoding into normalized, channel-first float buffers.

use image::imageops::FilterType;
use std::path::Path;

use super::metadata::Example;
use crate::stacking::error::{Result, StackError};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Produces the pixels of one example as a `[3, size, size]` buffer in
/// channel-major order, normalized per channel.
pub trait ImageSource: Send + Sync {
    fn load(&self, example: &Example, size: usize) -> Result<Vec<f32>>;
}

/// Reads images from disk with the `image` crate.
///
/// Each image is center-cropped to a square, resized to `size` and
/// normalized with the ImageNet statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct FolderImageSource;

impl ImageSource for FolderImageSource {
    fn load(&self, example: &Example, size: usize) -> Result<Vec<f32>> {
        decode_file(&example.image_path, size)
    }
}

pub fn decode_file(path: &Path, size: usize) -> Result<Vec<f32>> {
    if !path.exists() {
        return Err(StackError::MissingInput {
            what: "image",
            path: path.to_path_buf(),
        });
    }
    let img = image::open(path).map_err(|source| StackError::Image {
        path: path.to_path_buf(),
        source,
    })?;

    let side = img.width().min(img.height());
    let x = (img.width() - side) / 2;
    let y = (img.height() - side) / 2;
    let square = img.crop_imm(x, y, side, side);
    let target = size as u32;
    let rgb = square
        .resize_exact(target, target, FilterType::Triangle)
        .to_rgb8();

    Ok(normalize_rgb(rgb.as_raw(), size))
}

/// Interleaved RGB bytes (`H * W * 3`) to a normalized `[3, H, W]` buffer.
pub fn normalize_rgb(pixels: &[u8], size: usize) -> Vec<f32> {
    let plane = size * size;
    let mut out = vec![0.0f32; 3 * plane];
    for (pos, rgb) in pixels.chunks_exact(3).take(plane).enumerate() {
        for channel in 0..3 {
            let value = rgb[channel] as f32 / 255.0;
            out[channel * plane + pos] = (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_rgb_is_channel_major() {
        // trailing pixel lies outside the 1x1 plane and is ignored
        let pixels = [255u8, 0, 0, 0, 0, 0];
        let out = normalize_rgb(&pixels, 1);
        assert_eq!(out.len(), 3);
        let expected_red = (1.0 - IMAGENET_MEAN[0]) / IMAGENET_STD[0];
        assert!((out[0] - expected_red).abs() < 1e-6);
        assert!((out[1] + IMAGENET_MEAN[1] / IMAGENET_STD[1]).abs() < 1e-6);
    }

    #[test]
    fn test_decode_file_crops_and_resizes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        let img = image::RgbImage::from_pixel(12, 8, image::Rgb([10, 200, 30]));
        img.save(&path).unwrap();

        let out = decode_file(&path, 4).unwrap();
        assert_eq!(out.len(), 3 * 4 * 4);
        let green = (200.0 / 255.0 - IMAGENET_MEAN[1]) / IMAGENET_STD[1];
        assert!(out[16..32].iter().all(|v| (v - green).abs() < 1e-2));
    }

    #[test]
    fn test_missing_image_is_reported() {
        let err = decode_file(Path::new("/definitely/not/here.jpg"), 4).unwrap_err();
        assert!(matches!(err, StackError::MissingInput { what: "image", .. }));
    }
}
