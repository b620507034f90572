use std::path::Path;

use anyhow::Context;
use candle_core::{D, DType, Device, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, Linear, Module, VarBuilder, conv2d, linear, ops::softmax};

use crate::error::PipelineError;
use crate::mapping;

/// Compact convolutional classifier over 224x224 leaf images.
///
/// Four stride-2 conv+ReLU blocks form the backbone; the last block's output
/// is the designated layer the CAM engine captures. The head is global
/// average pooling plus a linear projection to the label table.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    pub input_size: usize,
    pub channels: [usize; 4],
    pub num_classes: usize,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            input_size: 224,
            channels: [32, 64, 128, 256],
            num_classes: mapping::LABELS.len(),
        }
    }
}

/// One whole-image diagnosis.
#[derive(Debug, Clone, PartialEq)]
pub struct Classification {
    pub class_id: usize,
    pub class_name: String,
    pub confidence: f32,
}

#[derive(Debug)]
pub struct LeafClassifier {
    blocks: Vec<Conv2d>,
    head: Linear,
    device: Device,
    input_size: usize,
}

impl LeafClassifier {
    pub fn new(config: &ClassifierConfig, vb: VarBuilder) -> candle_core::Result<Self> {
        let mut blocks = Vec::with_capacity(config.channels.len());
        let mut c_in = 3;
        for (i, &c_out) in config.channels.iter().enumerate() {
            let conv_cfg = Conv2dConfig {
                padding: 1,
                stride: 2,
                ..Default::default()
            };
            blocks.push(conv2d(c_in, c_out, 3, conv_cfg, vb.pp(format!("features.{i}")))?);
            c_in = c_out;
        }
        let head = linear(c_in, config.num_classes, vb.pp("head"))?;

        Ok(Self {
            blocks,
            head,
            device: vb.device().clone(),
            input_size: config.input_size,
        })
    }

    /// Reads weights from a safetensors artifact.
    pub fn load(path: &Path, config: &ClassifierConfig, device: &Device) -> anyhow::Result<Self> {
        let tensors = candle_core::safetensors::load(path, device)
            .with_context(|| format!("reading classifier weights from {}", path.display()))?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        Self::new(config, vb).context("building classifier from weights")
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Backbone only: `(1, 3, s, s)` -> `(1, C, s/16, s/16)`, the designated
    /// layer's activation.
    pub fn forward_features(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        if h != self.input_size || w != self.input_size {
            candle_core::bail!(
                "classifier expects {s}x{s} input, got {h}x{w}",
                s = self.input_size
            );
        }

        let mut xs = xs.clone();
        for block in &self.blocks {
            xs = block.forward(&xs)?.relu()?;
        }
        Ok(xs)
    }

    /// Head only: global average pool over the spatial dims, then project to
    /// class logits.
    pub fn forward_head(&self, features: &Tensor) -> candle_core::Result<Tensor> {
        let pooled = features.mean(D::Minus1)?.mean(D::Minus1)?;
        self.head.forward(&pooled)
    }

    pub fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.forward_head(&self.forward_features(xs)?)
    }

    pub fn classify(&self, input: &Tensor) -> Result<Classification, PipelineError> {
        let logits = self.forward(input)?;
        let probs = softmax(&logits, D::Minus1)?.squeeze(0)?.to_vec1::<f32>()?;

        let (class_id, confidence) = probs.iter().enumerate().fold(
            (0, f32::NEG_INFINITY),
            |(max_idx, max_val), (i, &val)| {
                if val > max_val { (i, val) } else { (max_idx, max_val) }
            },
        );

        Ok(Classification {
            class_id,
            class_name: mapping::class_name(class_id)?.to_string(),
            confidence,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::random_classifier as test_classifier;
    use super::*;

    fn unit_input() -> Tensor {
        Tensor::ones((1, 3, 224, 224), DType::F32, &Device::Cpu).unwrap()
    }

    #[test]
    fn forward_produces_one_logit_per_label() {
        let model = test_classifier();
        let logits = model.forward(&unit_input()).unwrap();
        assert_eq!(logits.dims(), &[1, mapping::LABELS.len()]);
    }

    #[test]
    fn designated_layer_has_expected_grid() {
        let model = test_classifier();
        let features = model.forward_features(&unit_input()).unwrap();
        assert_eq!(features.dims(), &[1, 256, 14, 14]);
    }

    #[test]
    fn split_forward_matches_full_forward() {
        let model = test_classifier();
        let input = unit_input();
        let full = model.forward(&input).unwrap().to_vec2::<f32>().unwrap();
        let features = model.forward_features(&input).unwrap();
        let split = model
            .forward_head(&features)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();
        assert_eq!(full, split);
    }

    #[test]
    fn classification_confidence_is_a_probability() {
        let model = test_classifier();
        let result = model.classify(&unit_input()).unwrap();
        assert!(result.class_id < mapping::LABELS.len());
        assert!(result.confidence >= 0.0 && result.confidence <= 1.0);
    }

    #[test]
    fn classification_is_deterministic() {
        let model = test_classifier();
        let a = model.classify(&unit_input()).unwrap();
        let b = model.classify(&unit_input()).unwrap();
        assert_eq!(a, b);
    }
}
