//! MobileFaceNet embedding network.
//!
//! A MobileNet-V2 backbone followed by a learned pooling head:
//! BN -> dropout -> 1x1 conv to `emb_size` -> BN -> per-channel conv over the
//! whole remaining feature map -> flatten -> BN1d. Output embeddings are not
//! L2-normalized; the margin head normalizes them during training.

use crate::backbone::{feature_map_size, MobileNetV2, BACKBONE_OUT_CHANNELS};
use crate::config::ModelConfig;
use crate::error::ModelError;
use crate::summary::{LayerStats, ModelSummary};
use candle_core::{bail, DType, Device, Module, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, conv2d, BatchNorm, Conv2d, Conv2dConfig, Dropout, VarBuilder};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone)]
pub struct MobileFaceNet {
    backbone: MobileNetV2,
    bn1: BatchNorm,
    dropout: Dropout,
    conv1: Conv2d,
    bn2: BatchNorm,
    conv2: Conv2d,
    bn3: BatchNorm,
    emb_size: usize,
    input_size: usize,
    dropout_p: f32,
}

impl MobileFaceNet {
    /// Build the network under `vb`. Backbone parameters live under
    /// `backbone.features.*`, head parameters under `bn1`, `conv1`, ...
    pub fn new(vb: VarBuilder, config: &ModelConfig) -> Result<Self> {
        let emb_size = config.emb_size;
        let pool_kernel = feature_map_size(config.input_size);

        let backbone = MobileNetV2::new(vb.pp("backbone").pp("features"))?;
        let bn1 = batch_norm(BACKBONE_OUT_CHANNELS, 1e-5, vb.pp("bn1"))?;
        let conv1 = conv2d(BACKBONE_OUT_CHANNELS, emb_size, 1, Conv2dConfig::default(), vb.pp("conv1"))?;
        let bn2 = batch_norm(emb_size, 1e-5, vb.pp("bn2"))?;
        let conv2 = conv2d(
            emb_size,
            emb_size,
            pool_kernel,
            Conv2dConfig {
                groups: emb_size,
                ..Default::default()
            },
            vb.pp("conv2"),
        )?;
        let bn3 = batch_norm(emb_size, 1e-5, vb.pp("bn3"))?;

        tracing::debug!(emb_size, pool_kernel, input_size = config.input_size, "built MobileFaceNet");

        Ok(Self {
            backbone,
            bn1,
            dropout: Dropout::new(config.dropout),
            conv1,
            bn2,
            conv2,
            bn3,
            emb_size,
            input_size: config.input_size,
            dropout_p: config.dropout,
        })
    }

    /// Load a trained network from a safetensors checkpoint for inference.
    pub fn load(weights: &Path, config: &ModelConfig, device: &Device) -> std::result::Result<Self, ModelError> {
        if !weights.exists() {
            return Err(ModelError::WeightsNotFound(weights.display().to_string()));
        }
        let tensors = candle_core::safetensors::load(weights, device)?;
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let net = Self::new(vb, config)?;
        tracing::info!(path = %weights.display(), params = net.params(), "loaded MobileFaceNet checkpoint");
        Ok(net)
    }

    pub fn emb_size(&self) -> usize {
        self.emb_size
    }

    pub fn input_size(&self) -> usize {
        self.input_size
    }

    pub fn backbone(&self) -> &MobileNetV2 {
        &self.backbone
    }

    /// Inference-mode forward pass: dropout off, BN on running statistics.
    pub fn embed(&self, images: &Tensor) -> Result<Tensor> {
        self.forward_t(images, false)
    }

    fn check_input(&self, images: &Tensor) -> Result<()> {
        let (_, c, h, w) = images.dims4()?;
        if c != 3 || h != self.input_size || w != self.input_size {
            bail!(
                "expected input (N, 3, {0}, {0}), got {1:?}",
                self.input_size,
                images.dims()
            );
        }
        Ok(())
    }

    /// Run one inference-mode pass over `input` and record every layer.
    pub fn summarize(&self, input: &Tensor) -> Result<ModelSummary> {
        self.check_input(input)?;
        let mut summary = ModelSummary::new(input.dims());

        let mut xs = input.clone();
        for (i, feature) in self.backbone.features().iter().enumerate() {
            let ys = feature.forward_t(&xs, false)?;
            summary.record(format!("backbone.features.{i}"), feature.kind(), feature, &xs, &ys);
            xs = ys;
        }

        let ys = xs.apply_t(&self.bn1, false)?;
        summary.record("bn1", "BatchNorm2d", &self.bn1, &xs, &ys);
        let xs = ys;

        let ys = xs.apply_t(&self.dropout, false)?;
        summary.record("dropout", "Dropout", &self.dropout, &xs, &ys);
        let xs = ys;

        let ys = self.conv1.forward(&xs)?;
        summary.record("conv1", "Conv2d", &self.conv1, &xs, &ys);
        let xs = ys;

        let ys = xs.apply_t(&self.bn2, false)?;
        summary.record("bn2", "BatchNorm2d", &self.bn2, &xs, &ys);
        let xs = ys;

        let ys = self.conv2.forward(&xs)?;
        summary.record("conv2", "Conv2d", &self.conv2, &xs, &ys);
        let xs = ys;

        let ys = xs.flatten_from(1)?;
        summary.push("flatten", "Flatten", ys.dims(), 0, 0);
        let xs = ys;

        let ys = xs.apply_t(&self.bn3, false)?;
        summary.record("bn3", "BatchNorm1d", &self.bn3, &xs, &ys);

        Ok(summary)
    }
}

impl ModuleT for MobileFaceNet {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        self.check_input(xs)?;
        let xs = self.backbone.forward_t(xs, train)?;
        let xs = xs.apply_t(&self.bn1, train)?;
        let xs = xs.apply_t(&self.dropout, train)?;
        let xs = self.conv1.forward(&xs)?;
        let xs = xs.apply_t(&self.bn2, train)?;
        let xs = self.conv2.forward(&xs)?;
        let xs = xs.flatten_from(1)?;
        xs.apply_t(&self.bn3, train)
    }
}

impl LayerStats for MobileFaceNet {
    fn params(&self) -> usize {
        self.backbone.params()
            + self.bn1.params()
            + self.conv1.params()
            + self.bn2.params()
            + self.conv2.params()
            + self.bn3.params()
    }
}

fn describe_conv(conv: &Conv2d) -> String {
    let (out_c, in_per_group, kh, _) = conv.weight().dims4().unwrap_or((0, 0, 0, 0));
    let groups = conv.config().groups;
    let mut s = format!("Conv2d({}, {out_c}, kernel={kh}", in_per_group * groups);
    if groups > 1 {
        s.push_str(&format!(", groups={groups}"));
    }
    s.push(')');
    s
}

impl fmt::Display for MobileFaceNet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MobileFaceNet(")?;
        writeln!(f, "  (backbone): {}", self.backbone)?;
        writeln!(f, "  (bn1): BatchNorm2d({BACKBONE_OUT_CHANNELS})")?;
        writeln!(f, "  (dropout): Dropout(p={})", self.dropout_p)?;
        writeln!(f, "  (conv1): {}", describe_conv(&self.conv1))?;
        writeln!(f, "  (bn2): BatchNorm2d({})", self.emb_size)?;
        writeln!(f, "  (conv2): {}", describe_conv(&self.conv2))?;
        writeln!(f, "  (bn3): BatchNorm1d({})", self.emb_size)?;
        write!(f, ")")
    }
}
