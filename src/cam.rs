use candle_core::backprop::GradStore;
use candle_core::{D, Tensor, Var};
use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, Luma, Rgb, RgbImage};
use rayon::prelude::*;

use crate::classifier::LeafClassifier;
use crate::error::PipelineError;
use crate::preprocess::{self, PreprocessConfig};

const OVERLAY_IMAGE_WEIGHT: f32 = 0.7;
const OVERLAY_HEAT_WEIGHT: f32 = 0.3;

/// Result of a single-image explanation: the predicted class and the
/// original image with the colorized activation map blended on top.
pub struct CamExplanation {
    pub class_id: usize,
    pub overlay: RgbImage,
}

/// Activation snapshot for one CAM invocation.
///
/// Seeded from the designated layer's forward activation; the matching
/// gradient is fetched from the backward pass of the same invocation. The
/// capture is dropped when the invocation ends, so no registration can
/// outlive an early return. Never share one capture across requests.
pub struct ActivationCapture {
    var: Var,
}

impl ActivationCapture {
    pub fn seed(features: &Tensor) -> Result<Self, PipelineError> {
        Ok(Self {
            var: Var::from_tensor(&features.detach())?,
        })
    }

    /// The captured activation, usable as the head's input. Running the head
    /// on this tensor makes it the root of the backward graph.
    pub fn activation(&self) -> &Tensor {
        self.var.as_tensor()
    }

    /// The gradient that flowed into the captured activation. Absence means
    /// the backward pass never reached the designated layer; that is a
    /// capture failure, not a valid all-zero result.
    pub fn gradient(&self, grads: &GradStore) -> Result<Tensor, PipelineError> {
        grads.get(self.var.as_tensor()).cloned().ok_or_else(|| {
            PipelineError::Capture("no gradient recorded for the designated layer".to_string())
        })
    }
}

/// Grad-CAM over the classifier's designated layer.
///
/// Runs the backbone, captures the designated activation, backpropagates the
/// predicted class score (a one-hot seed over the logits), pools the gradient
/// into per-channel weights, and reduces the weighted activation to one
/// rectified, max-normalized map on the feature grid.
pub fn class_activation_map(
    model: &LeafClassifier,
    input: &Tensor,
) -> Result<(usize, Vec<Vec<f32>>), PipelineError> {
    let features = model.forward_features(input)?;
    let capture = ActivationCapture::seed(&features)?;
    let logits = model.forward_head(capture.activation())?;

    let num_classes = logits.dim(D::Minus1)?;
    let class_id = logits.argmax(D::Minus1)?.squeeze(0)?.to_scalar::<u32>()? as usize;

    let mut seed = vec![0f32; num_classes];
    *seed
        .get_mut(class_id)
        .ok_or(PipelineError::UnknownClass(class_id))? = 1.0;
    let one_hot = Tensor::from_vec(seed, (1, num_classes), model.device())?;

    // Backpropagating sum(logits * one_hot) seeds the output gradient with
    // the one-hot vector.
    let score = logits.broadcast_mul(&one_hot)?.sum_all()?;
    let grads = score.backward()?;
    let gradient = capture.gradient(&grads)?;

    // Global average pooling of the gradient: one weight per channel.
    let weights = gradient.mean_keepdim((2, 3))?;
    let cam = capture
        .activation()
        .broadcast_mul(&weights)?
        .sum(1)?
        .squeeze(0)?
        .relu()?;

    // Max-normalize; an all-zero map stays all-zero rather than dividing by
    // zero.
    let max = cam.flatten_all()?.max(0)?.to_scalar::<f32>()?;
    let cam = if max > 0.0 {
        cam.affine(1.0 / max as f64, 0.0)?
    } else {
        cam
    };

    Ok((class_id, cam.to_vec2::<f32>()?))
}

/// CAM resized to the image's own pixel grid as a u8 heatmap.
pub fn activation_heatmap(
    model: &LeafClassifier,
    image: &DynamicImage,
) -> Result<(usize, GrayImage), PipelineError> {
    let input = preprocess::classifier_tensor(image, &PreprocessConfig::classifier(), model.device())?;
    let (class_id, map) = class_activation_map(model, &input)?;
    let gray = map_to_gray(&map);
    let resized = image::imageops::resize(&gray, image.width(), image.height(), FilterType::CatmullRom);
    Ok((class_id, resized))
}

/// Full single-image explanation: heatmap, jet colormap, 0.7/0.3 blend.
pub fn explain(model: &LeafClassifier, image: &DynamicImage) -> Result<CamExplanation, PipelineError> {
    let (class_id, heat) = activation_heatmap(model, image)?;
    let overlay = overlay_jet(&preprocess::flatten_to_rgb(image), &heat);
    Ok(CamExplanation { class_id, overlay })
}

fn map_to_gray(map: &[Vec<f32>]) -> GrayImage {
    let height = map.len() as u32;
    let width = map.first().map(|row| row.len()).unwrap_or(0) as u32;
    GrayImage::from_fn(width, height, |x, y| {
        Luma([(map[y as usize][x as usize].clamp(0.0, 1.0) * 255.0).round() as u8])
    })
}

/// Blue-to-red "jet" style color table over [0, 1].
pub(crate) fn jet(value: f32) -> Rgb<u8> {
    let x = value.clamp(0.0, 1.0);
    let channel = |c: f32| ((1.5 - c.abs()).clamp(0.0, 1.0) * 255.0).round() as u8;
    Rgb([
        channel(4.0 * x - 3.0),
        channel(4.0 * x - 2.0),
        channel(4.0 * x - 1.0),
    ])
}

fn blend_channel(base: u8, heat: u8, base_weight: f32, heat_weight: f32) -> u8 {
    (base_weight * base as f32 + heat_weight * heat as f32)
        .round()
        .clamp(0.0, 255.0) as u8
}

fn overlay_jet(base: &RgbImage, heat: &GrayImage) -> RgbImage {
    let (width, height) = base.dimensions();
    let base_buf = base.as_raw();
    let heat_buf = heat.as_raw();
    let row_len = width as usize * 3;

    let mut out = vec![0u8; row_len * height as usize];
    out.par_chunks_mut(row_len).enumerate().for_each(|(y, row)| {
        for x in 0..width as usize {
            let v = heat_buf[y * width as usize + x] as f32 / 255.0;
            let Rgb(heat_rgb) = jet(v);
            let i = x * 3;
            for c in 0..3 {
                row[i + c] = blend_channel(
                    base_buf[y * row_len + i + c],
                    heat_rgb[c],
                    OVERLAY_IMAGE_WEIGHT,
                    OVERLAY_HEAT_WEIGHT,
                );
            }
        }
    });

    RgbImage::from_raw(width, height, out).expect("overlay buffer matches base dimensions")
}
