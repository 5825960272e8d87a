//! MobileNet-V2 feature extractor.
//!
//! Mirrors torchvision's `mobilenet_v2().features`, so ImageNet weights
//! exported to safetensors load under torchvision names:
//!
//! ```text
//! features.0.{0,1}                  stem conv + BN
//! features.{1..=17}.conv.{i}...     inverted residual blocks
//! features.18.{0,1}                 1x1 conv + BN to 1280 channels
//! ```

use crate::summary::LayerStats;
use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{batch_norm, conv2d_no_bias, BatchNorm, BatchNormConfig, Conv2d, Conv2dConfig, VarBuilder};
use std::fmt;

/// Channels produced by the last feature layer.
pub const BACKBONE_OUT_CHANNELS: usize = 1280;

const STEM_CHANNELS: usize = 32;
const BN_EPS: f64 = 1e-5;
const BN_MOMENTUM: f64 = 0.1;

/// Inverted residual settings `(t, c, n, s)`: expansion, output channels,
/// repeats, stride of the first repeat.
const INVERTED_RESIDUAL_SETTING: [(usize, usize, usize, usize); 7] = [
    (1, 16, 1, 1),
    (6, 24, 2, 2),
    (6, 32, 3, 2),
    (6, 64, 4, 2),
    (6, 96, 3, 1),
    (6, 160, 3, 2),
    (6, 320, 1, 1),
];

/// Spatial size of the backbone output for a square input of `input_size`.
///
/// Five stride-2 3x3 convolutions with padding 1: 112 -> 56 -> 28 -> 14 -> 7 -> 4.
pub fn feature_map_size(input_size: usize) -> usize {
    (0..5).fold(input_size, |s, _| (s + 2 - 3) / 2 + 1)
}

fn bn_config() -> BatchNormConfig {
    BatchNormConfig {
        eps: BN_EPS,
        momentum: BN_MOMENTUM,
        ..Default::default()
    }
}

#[derive(Debug, Clone, Copy)]
struct ConvSpec {
    in_channels: usize,
    out_channels: usize,
    kernel: usize,
    stride: usize,
    groups: usize,
}

/// Bias-free convolution followed by BatchNorm and an optional ReLU6.
#[derive(Debug, Clone)]
pub struct ConvNorm {
    conv: Conv2d,
    bn: BatchNorm,
    relu6: bool,
    spec: ConvSpec,
}

impl ConvNorm {
    fn load(spec: ConvSpec, relu6: bool, conv_vb: VarBuilder, bn_vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: (spec.kernel - 1) / 2,
            stride: spec.stride,
            groups: spec.groups,
            ..Default::default()
        };
        let conv = conv2d_no_bias(spec.in_channels, spec.out_channels, spec.kernel, config, conv_vb)?;
        let bn = batch_norm(spec.out_channels, bn_config(), bn_vb)?;
        Ok(Self { conv, bn, relu6, spec })
    }

    /// Sequential `ConvBNReLU` block: children `0` (conv) and `1` (BN).
    fn conv_bn_relu(spec: ConvSpec, vb: VarBuilder) -> Result<Self> {
        Self::load(spec, true, vb.pp(0), vb.pp(1))
    }

    fn output_hw(&self, (h, w): (usize, usize)) -> (usize, usize) {
        let pad = (self.spec.kernel - 1) / 2;
        let out = |s: usize| (s + 2 * pad - self.spec.kernel) / self.spec.stride + 1;
        (out(h), out(w))
    }
}

impl ModuleT for ConvNorm {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.conv.forward(xs)?.apply_t(&self.bn, train)?;
        if self.relu6 {
            xs.clamp(0f32, 6f32)
        } else {
            Ok(xs)
        }
    }
}

impl LayerStats for ConvNorm {
    fn params(&self) -> usize {
        self.conv.params() + self.bn.params()
    }

    fn madds(&self, input: &[usize], output: &[usize]) -> usize {
        self.conv.madds(input, output)
    }
}

impl fmt::Display for ConvNorm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = &self.spec;
        write!(
            f,
            "{}({}, {}, kernel={}, stride={}",
            if self.relu6 { "ConvBNReLU6" } else { "ConvBN" },
            s.in_channels,
            s.out_channels,
            s.kernel,
            s.stride
        )?;
        if s.groups > 1 {
            write!(f, ", groups={}", s.groups)?;
        }
        write!(f, ")")
    }
}

/// Expand (1x1) -> depthwise (3x3) -> linear project (1x1), with a skip
/// connection when the block keeps both resolution and width.
#[derive(Debug, Clone)]
pub struct InvertedResidual {
    layers: Vec<ConvNorm>,
    use_residual: bool,
    in_channels: usize,
    out_channels: usize,
    stride: usize,
    expand_ratio: usize,
}

impl InvertedResidual {
    fn load(
        vb: VarBuilder,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        expand_ratio: usize,
    ) -> Result<Self> {
        let hidden = in_channels * expand_ratio;
        let vb = vb.pp("conv");
        let mut layers = Vec::with_capacity(3);
        let mut idx = 0;

        if expand_ratio != 1 {
            let spec = ConvSpec { in_channels, out_channels: hidden, kernel: 1, stride: 1, groups: 1 };
            layers.push(ConvNorm::conv_bn_relu(spec, vb.pp(idx))?);
            idx += 1;
        }

        let dw = ConvSpec { in_channels: hidden, out_channels: hidden, kernel: 3, stride, groups: hidden };
        layers.push(ConvNorm::conv_bn_relu(dw, vb.pp(idx))?);
        idx += 1;

        // pw-linear: conv and BN are siblings in the block's Sequential
        let pw = ConvSpec { in_channels: hidden, out_channels, kernel: 1, stride: 1, groups: 1 };
        layers.push(ConvNorm::load(pw, false, vb.pp(idx), vb.pp(idx + 1))?);

        Ok(Self {
            layers,
            use_residual: stride == 1 && in_channels == out_channels,
            in_channels,
            out_channels,
            stride,
            expand_ratio,
        })
    }
}

impl ModuleT for InvertedResidual {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut ys = xs.clone();
        for layer in &self.layers {
            ys = layer.forward_t(&ys, train)?;
        }
        if self.use_residual {
            xs + ys
        } else {
            Ok(ys)
        }
    }
}

impl LayerStats for InvertedResidual {
    fn params(&self) -> usize {
        self.layers.iter().map(LayerStats::params).sum()
    }

    fn madds(&self, input: &[usize], _output: &[usize]) -> usize {
        let mut hw = (input[1], input[2]);
        let mut total = 0;
        for layer in &self.layers {
            let out_hw = layer.output_hw(hw);
            total += layer.madds(&[], &[layer.spec.out_channels, out_hw.0, out_hw.1]);
            hw = out_hw;
        }
        total
    }
}

impl fmt::Display for InvertedResidual {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "InvertedResidual({} -> {}, stride={}, expand={}{})",
            self.in_channels,
            self.out_channels,
            self.stride,
            self.expand_ratio,
            if self.use_residual { ", residual" } else { "" }
        )
    }
}

/// One entry of the `features` Sequential.
#[derive(Debug, Clone)]
pub enum Feature {
    Conv(ConvNorm),
    Block(InvertedResidual),
}

impl Feature {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Conv(_) => "ConvBNReLU6",
            Self::Block(_) => "InvertedResidual",
        }
    }
}

impl ModuleT for Feature {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        match self {
            Self::Conv(c) => c.forward_t(xs, train),
            Self::Block(b) => b.forward_t(xs, train),
        }
    }
}

impl LayerStats for Feature {
    fn params(&self) -> usize {
        match self {
            Self::Conv(c) => c.params(),
            Self::Block(b) => b.params(),
        }
    }

    fn madds(&self, input: &[usize], output: &[usize]) -> usize {
        match self {
            Self::Conv(c) => c.madds(input, output),
            Self::Block(b) => b.madds(input, output),
        }
    }
}

impl fmt::Display for Feature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Conv(c) => fmt::Display::fmt(c, f),
            Self::Block(b) => fmt::Display::fmt(b, f),
        }
    }
}

/// MobileNet-V2 without its classifier: `(N, 3, H, W)` -> `(N, 1280, H/32, W/32)`
/// (rounded up).
#[derive(Debug, Clone)]
pub struct MobileNetV2 {
    features: Vec<Feature>,
}

impl MobileNetV2 {
    /// Build the feature stack. `vb` must point at the `features` prefix.
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let mut features = Vec::with_capacity(19);

        let stem = ConvSpec { in_channels: 3, out_channels: STEM_CHANNELS, kernel: 3, stride: 2, groups: 1 };
        features.push(Feature::Conv(ConvNorm::conv_bn_relu(stem, vb.pp(0))?));

        let mut in_channels = STEM_CHANNELS;
        for (t, c, n, s) in INVERTED_RESIDUAL_SETTING {
            for i in 0..n {
                let stride = if i == 0 { s } else { 1 };
                let block = InvertedResidual::load(vb.pp(features.len()), in_channels, c, stride, t)?;
                features.push(Feature::Block(block));
                in_channels = c;
            }
        }

        let last = ConvSpec {
            in_channels,
            out_channels: BACKBONE_OUT_CHANNELS,
            kernel: 1,
            stride: 1,
            groups: 1,
        };
        features.push(Feature::Conv(ConvNorm::conv_bn_relu(last, vb.pp(features.len()))?));

        Ok(Self { features })
    }

    pub fn features(&self) -> &[Feature] {
        &self.features
    }
}

impl ModuleT for MobileNetV2 {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Result<Tensor> {
        let mut xs = xs.clone();
        for feature in &self.features {
            xs = feature.forward_t(&xs, train)?;
        }
        Ok(xs)
    }
}

impl LayerStats for MobileNetV2 {
    fn params(&self) -> usize {
        self.features.iter().map(LayerStats::params).sum()
    }
}

impl fmt::Display for MobileNetV2 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "MobileNetV2(")?;
        for (i, feature) in self.features.iter().enumerate() {
            writeln!(f, "    (features.{i}): {feature}")?;
        }
        write!(f, "  )")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    fn build() -> (VarMap, MobileNetV2) {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let net = MobileNetV2::new(vb.pp("features")).unwrap();
        (varmap, net)
    }

    #[test]
    fn test_feature_map_size() {
        assert_eq!(feature_map_size(112), 4);
        assert_eq!(feature_map_size(224), 7);
        assert_eq!(feature_map_size(96), 3);
    }

    #[test]
    fn test_layer_layout() {
        let (_, net) = build();
        assert_eq!(net.features().len(), 19);
        assert!(matches!(net.features()[0], Feature::Conv(_)));
        assert!(matches!(net.features()[18], Feature::Conv(_)));
        assert!(net.features()[1..18].iter().all(|f| matches!(f, Feature::Block(_))));
    }

    #[test]
    fn test_torchvision_parameter_names() {
        let (varmap, _) = build();
        let names: Vec<String> = varmap.data().lock().unwrap().keys().cloned().collect();
        for expected in [
            "features.0.0.weight",
            "features.0.1.running_var",
            // t == 1: dw conv is child 0, pw-linear conv/BN are 1 and 2
            "features.1.conv.0.0.weight",
            "features.1.conv.1.weight",
            "features.1.conv.2.bias",
            // t == 6: expansion, dw, then pw-linear at 2 and 3
            "features.2.conv.0.0.weight",
            "features.2.conv.1.0.weight",
            "features.2.conv.2.weight",
            "features.2.conv.3.running_mean",
            "features.18.0.weight",
            "features.18.1.weight",
        ] {
            assert!(names.iter().any(|n| n == expected), "missing {expected}");
        }
        assert!(!names.iter().any(|n| n == "features.1.conv.3.weight"));
    }

    #[test]
    fn test_parameter_count_matches_torchvision() {
        // torchvision mobilenet_v2 has 3,504,872 params; the classifier is
        // 1280 * 1000 + 1000 of them.
        let (_, net) = build();
        assert_eq!(net.params(), 3_504_872 - 1_281_000);
    }

    #[test]
    fn test_output_shape_112() {
        let (_, net) = build();
        let xs = Tensor::randn(0f32, 1f32, (1, 3, 112, 112), &Device::Cpu).unwrap();
        let ys = net.forward_t(&xs, false).unwrap();
        assert_eq!(ys.dims(), &[1, BACKBONE_OUT_CHANNELS, 4, 4]);
    }

    #[test]
    fn test_relu6_bounds_output() {
        let (_, net) = build();
        let xs = Tensor::randn(0f32, 10f32, (1, 3, 64, 64), &Device::Cpu).unwrap();
        let ys = net.forward_t(&xs, false).unwrap();
        let values = ys.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|&v| (0.0..=6.0).contains(&v)));
    }

    #[test]
    fn test_block_madds_follow_stride() {
        let (_, net) = build();
        // features.2: 16 -> 24, stride 2, expand 6 on a 56x56 map
        let block = &net.features()[2];
        let expected = 56 * 56 * (96 * 16) + 28 * 28 * (96 * 9) + 28 * 28 * (24 * 96);
        assert_eq!(block.madds(&[16, 56, 56], &[24, 28, 28]), expected);
    }
}
