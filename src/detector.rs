use std::path::Path;

use anyhow::Context;
use image::DynamicImage;
use ndarray::{ArrayD, CowArray, Ix3};
use ort::execution_providers::{
    CPUExecutionProvider, CUDAExecutionProvider, ExecutionProviderDispatch,
};
use ort::session::Session;
use ort::session::builder::{GraphOptimizationLevel, SessionBuilder};

use crate::error::PipelineError;
use crate::mapping;
use crate::preprocess::{self, PreprocessConfig};

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    pub input_size: usize,
    pub max_detections: usize,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.25,
            iou_threshold: 0.45,
            input_size: 640,
            max_detections: 300,
        }
    }
}

/// One diseased region found by the detector, in source-image pixel
/// coordinates with `x1 < x2` and `y1 < y2`.
#[derive(Debug, Clone)]
pub struct Detection {
    pub bbox: [f32; 4],
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
}

impl Detection {
    /// Integer rect `(x, y, width, height)` for cropping and drawing.
    pub fn pixel_rect(&self) -> (u32, u32, u32, u32) {
        let [x1, y1, x2, y2] = self.bbox;
        let x = x1.floor().max(0.0) as u32;
        let y = y1.floor().max(0.0) as u32;
        let w = ((x2 - x1).round() as u32).max(1);
        let h = ((y2 - y1).round() as u32).max(1);
        (x, y, w, h)
    }
}

fn providers(cuda: bool) -> [ExecutionProviderDispatch; 1] {
    if cuda {
        [CUDAExecutionProvider::default().build().error_on_failure()]
    } else {
        [CPUExecutionProvider::default().build()]
    }
}

/// YOLO detector over an ONNX session.
#[derive(Debug)]
pub struct Detector {
    session: Session,
    config: DetectorConfig,
}

impl Detector {
    pub fn load(path: &Path, cuda: bool) -> anyhow::Result<Self> {
        anyhow::ensure!(path.exists(), "detector weights not found at {}", path.display());

        let session = SessionBuilder::new()?
            .with_execution_providers(providers(cuda))?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(path)
            .with_context(|| format!("reading detector weights from {}", path.display()))?;

        Ok(Self {
            session,
            config: DetectorConfig::default(),
        })
    }

    pub fn detect(&self, image: &DynamicImage) -> Result<Vec<Detection>, PipelineError> {
        let (orig_w, orig_h) = (image.width() as f32, image.height() as f32);

        let input = preprocess::detector_array(image, &PreprocessConfig::detector())?;
        let input = CowArray::from(input.into_dyn());
        let outputs = self.session.run(ort::inputs![input.view()]?)?;

        let tensors = outputs
            .iter()
            .map(|(_name, value)| value.try_extract_tensor::<f32>().map(|t| t.into_owned()))
            .collect::<Result<Vec<ArrayD<f32>>, ort::Error>>()?;
        let output = tensors
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Inference("detector produced no outputs".to_string()))?;

        let raw = decode_predictions(&output, orig_w, orig_h, &self.config)?;
        Ok(non_maximum_suppression(raw, &self.config))
    }
}

/// Decodes the YOLO output layout `(1, 4 + num_classes, anchors)`: center
/// boxes in input-size space plus one score per class, per anchor.
pub(crate) fn decode_predictions(
    output: &ArrayD<f32>,
    orig_w: f32,
    orig_h: f32,
    config: &DetectorConfig,
) -> Result<Vec<Detection>, PipelineError> {
    let view = output
        .view()
        .into_dimensionality::<Ix3>()
        .map_err(|e| PipelineError::Inference(format!("unexpected detector output shape: {e}")))?;

    let num_features = view.shape()[1];
    let num_anchors = view.shape()[2];
    let num_classes = num_features.saturating_sub(4);
    if num_classes != mapping::LABELS.len() {
        return Err(PipelineError::Inference(format!(
            "detector predicts {} classes but the label table has {}",
            num_classes,
            mapping::LABELS.len()
        )));
    }

    let scale_x = orig_w / config.input_size as f32;
    let scale_y = orig_h / config.input_size as f32;

    let mut detections = Vec::new();
    for anchor in 0..num_anchors {
        let mut confidence = 0f32;
        let mut class_id = 0usize;
        for class in 0..num_classes {
            let score = view[[0, 4 + class, anchor]];
            if score > confidence {
                confidence = score;
                class_id = class;
            }
        }
        if confidence < config.confidence_threshold {
            continue;
        }

        let xc = view[[0, 0, anchor]];
        let yc = view[[0, 1, anchor]];
        let w = view[[0, 2, anchor]];
        let h = view[[0, 3, anchor]];

        let x1 = ((xc - w / 2.0) * scale_x).clamp(0.0, orig_w);
        let y1 = ((yc - h / 2.0) * scale_y).clamp(0.0, orig_h);
        let x2 = ((xc + w / 2.0) * scale_x).clamp(0.0, orig_w);
        let y2 = ((yc + h / 2.0) * scale_y).clamp(0.0, orig_h);
        if x2 - x1 < 1.0 || y2 - y1 < 1.0 {
            continue;
        }

        detections.push(Detection {
            bbox: [x1, y1, x2, y2],
            class_id,
            class_name: mapping::class_name(class_id)?.to_string(),
            confidence,
        });
    }

    Ok(detections)
}

pub(crate) fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
    let inter_x1 = a[0].max(b[0]);
    let inter_y1 = a[1].max(b[1]);
    let inter_x2 = a[2].min(b[2]);
    let inter_y2 = a[3].min(b[3]);

    let inter_area = (inter_x2 - inter_x1).max(0.0) * (inter_y2 - inter_y1).max(0.0);
    let area_a = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area_b = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union_area = area_a + area_b - inter_area;

    if union_area <= 0.0 { 0.0 } else { inter_area / union_area }
}

/// Class-wise NMS: keep the most confident box, drop same-class boxes that
/// overlap it beyond the threshold.
pub(crate) fn non_maximum_suppression(
    mut detections: Vec<Detection>,
    config: &DetectorConfig,
) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::with_capacity(detections.len());
    while let Some(best) = detections.first().cloned() {
        detections.remove(0);
        detections.retain(|other| {
            other.class_id != best.class_id || iou(&other.bbox, &best.bbox) < config.iou_threshold
        });
        keep.push(best);
        if keep.len() == config.max_detections {
            break;
        }
    }
    keep
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array3;

    // One anchor column per entry: (xc, yc, w, h, scores[5]) in 640-space.
    fn synthetic_output(anchors: &[(f32, f32, f32, f32, [f32; 5])]) -> ArrayD<f32> {
        let mut arr = Array3::<f32>::zeros((1, 9, anchors.len()));
        for (i, &(xc, yc, w, h, scores)) in anchors.iter().enumerate() {
            arr[[0, 0, i]] = xc;
            arr[[0, 1, i]] = yc;
            arr[[0, 2, i]] = w;
            arr[[0, 3, i]] = h;
            for (c, &score) in scores.iter().enumerate() {
                arr[[0, 4 + c, i]] = score;
            }
        }
        arr.into_dyn()
    }

    #[test]
    fn decodes_a_confident_anchor_into_pixel_space() {
        let output = synthetic_output(&[(320.0, 320.0, 160.0, 80.0, [0.0, 0.9, 0.0, 0.0, 0.0])]);
        let config = DetectorConfig::default();

        let detections = decode_predictions(&output, 1280.0, 640.0, &config).unwrap();
        assert_eq!(detections.len(), 1);

        let det = &detections[0];
        assert_eq!(det.class_id, 1);
        assert_eq!(det.class_name, "Bacterial_Blight");
        assert!((det.confidence - 0.9).abs() < 1e-6);
        // 640-space box (240..400, 280..360) scaled by (2.0, 1.0).
        assert_eq!(det.bbox, [480.0, 280.0, 800.0, 360.0]);
    }

    #[test]
    fn low_confidence_anchors_are_dropped() {
        let output = synthetic_output(&[(320.0, 320.0, 100.0, 100.0, [0.1, 0.0, 0.0, 0.0, 0.0])]);
        let detections =
            decode_predictions(&output, 640.0, 640.0, &DetectorConfig::default()).unwrap();
        assert!(detections.is_empty());
    }

    #[test]
    fn boxes_are_clamped_to_image_bounds() {
        let output = synthetic_output(&[(630.0, 10.0, 100.0, 100.0, [0.0, 0.0, 0.8, 0.0, 0.0])]);
        let detections =
            decode_predictions(&output, 640.0, 640.0, &DetectorConfig::default()).unwrap();
        let [x1, y1, x2, y2] = detections[0].bbox;
        assert!(x1 >= 0.0 && y1 >= 0.0);
        assert!(x2 <= 640.0 && y2 <= 640.0);
        assert!(x1 < x2 && y1 < y2);
    }

    #[test]
    fn class_count_mismatch_is_an_inference_error() {
        let arr = Array3::<f32>::zeros((1, 12, 4)).into_dyn();
        let err = decode_predictions(&arr, 640.0, 640.0, &DetectorConfig::default()).unwrap_err();
        assert!(matches!(err, PipelineError::Inference(_)));
    }

    #[test]
    fn nms_keeps_the_most_confident_of_overlapping_boxes() {
        let output = synthetic_output(&[
            (320.0, 320.0, 200.0, 200.0, [0.9, 0.0, 0.0, 0.0, 0.0]),
            (330.0, 330.0, 200.0, 200.0, [0.7, 0.0, 0.0, 0.0, 0.0]),
            (100.0, 100.0, 50.0, 50.0, [0.6, 0.0, 0.0, 0.0, 0.0]),
        ]);
        let config = DetectorConfig::default();
        let raw = decode_predictions(&output, 640.0, 640.0, &config).unwrap();
        let kept = non_maximum_suppression(raw, &config);

        assert_eq!(kept.len(), 2);
        assert!((kept[0].confidence - 0.9).abs() < 1e-6);
        assert!((kept[1].confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_overlapping_boxes_of_different_classes() {
        let output = synthetic_output(&[
            (320.0, 320.0, 200.0, 200.0, [0.9, 0.0, 0.0, 0.0, 0.0]),
            (322.0, 322.0, 200.0, 200.0, [0.0, 0.0, 0.0, 0.8, 0.0]),
        ]);
        let config = DetectorConfig::default();
        let raw = decode_predictions(&output, 640.0, 640.0, &config).unwrap();
        let kept = non_maximum_suppression(raw, &config);
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn missing_weights_fail_to_load() {
        assert!(Detector::load(Path::new("does/not/exist.onnx"), false).is_err());
    }
}
