use candle_core::{Device, Tensor};
use fast_image_resize::images::Image;
use fast_image_resize::{FilterType, IntoImageView, ResizeAlg, ResizeOptions, Resizer};
use image::{DynamicImage, RgbImage};
use ndarray::Array4;

use crate::error::PipelineError;

/// Per-model input policy: square edge length plus the normalization the
/// model was trained with. The classifier and the detector use different
/// normalizations; they must not be interchanged.
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    pub mean: [f32; 3],
    pub std: [f32; 3],
    pub size: usize,
}

impl PreprocessConfig {
    /// ImageNet standardization, as the classifier was trained.
    pub fn classifier() -> Self {
        Self {
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
            size: 224,
        }
    }

    /// YOLO convention: scale to [0, 1], no standardization.
    pub fn detector() -> Self {
        Self {
            mean: [0.0, 0.0, 0.0],
            std: [1.0, 1.0, 1.0],
            size: 640,
        }
    }
}

pub fn decode_image(bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
    image::load_from_memory(bytes).map_err(|e| PipelineError::UnsupportedImage(e.to_string()))
}

/// Flattens any color mode to 3-channel RGB: drops alpha, expands grayscale.
pub fn flatten_to_rgb(image: &DynamicImage) -> RgbImage {
    image.to_rgb8()
}

fn resize_rgb(rgb: RgbImage, size: usize) -> Result<RgbImage, PipelineError> {
    let src = DynamicImage::ImageRgb8(rgb);
    let pixel_type = src
        .pixel_type()
        .ok_or_else(|| PipelineError::Image("source image has no pixel type".to_string()))?;
    let mut dst = Image::new(size as u32, size as u32, pixel_type);

    let mut resizer = Resizer::new();
    let options = ResizeOptions::new().resize_alg(ResizeAlg::Convolution(FilterType::Bilinear));
    resizer
        .resize(&src, &mut dst, Some(&options))
        .map_err(|e| PipelineError::Image(e.to_string()))?;

    Ok(RgbImage::from_raw(size as u32, size as u32, dst.buffer().to_vec())
        .expect("resize buffer matches target dimensions"))
}

/// Classifier input: `(1, 3, size, size)` tensor, normalized per `config`.
pub fn classifier_tensor(
    image: &DynamicImage,
    config: &PreprocessConfig,
    device: &Device,
) -> Result<Tensor, PipelineError> {
    let resized = resize_rgb(flatten_to_rgb(image), config.size)?;
    let plane = config.size * config.size;
    let mut data = vec![0f32; 3 * plane];

    for (i, rgb) in resized.pixels().enumerate() {
        for c in 0..3 {
            data[c * plane + i] = (rgb[c] as f32 / 255.0 - config.mean[c]) / config.std[c];
        }
    }

    Tensor::from_vec(data, (1, 3, config.size, config.size), device).map_err(Into::into)
}

/// Detector input: `(1, 3, size, size)` ndarray, normalized per `config`.
pub fn detector_array(
    image: &DynamicImage,
    config: &PreprocessConfig,
) -> Result<Array4<f32>, PipelineError> {
    let resized = resize_rgb(flatten_to_rgb(image), config.size)?;
    let mut arr = Array4::zeros((1, 3, config.size, config.size));

    for (i, rgb) in resized.pixels().enumerate() {
        let y = i / config.size;
        let x = i % config.size;
        for c in 0..3 {
            arr[[0, c, y, x]] = (rgb[c] as f32 / 255.0 - config.mean[c]) / config.std[c];
        }
    }

    Ok(arr)
}
