//! ArcFace additive angular margin head.
//!
//! Produces `s * cos(theta + m)` for each sample's true class and
//! `s * cos(theta)` for every other class, where `theta` is the angle between
//! the L2-normalized embedding and the class direction.

use crate::config::MarginConfig;
use crate::error::ModelError;
use candle_core::{DType, Tensor};
use candle_nn::{Init, VarBuilder};
use std::f64::consts::PI;

/// Floor for vector norms during L2 normalization.
const NORM_EPS: f64 = 1e-12;

/// Row-wise L2 normalization of a `(rows, dim)` matrix.
pub fn l2_normalize(xs: &Tensor) -> candle_core::Result<Tensor> {
    let norm = xs.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(NORM_EPS)?;
    xs.broadcast_div(&norm)
}

/// Build a `(batch, num_classes)` indicator matrix with a single 1 per row at
/// the label's column. The mask lives on the labels' device.
pub fn one_hot(labels: &Tensor, num_classes: usize, dtype: DType) -> Result<Tensor, ModelError> {
    if !labels.dtype().is_int() {
        return Err(ModelError::InvalidInput(format!(
            "labels must be integer class indices, got {:?}",
            labels.dtype()
        )));
    }
    let labels = labels.to_dtype(DType::U32)?;
    let batch = labels.dims1()?;
    if batch > 0 {
        let max = labels.max(0)?.to_scalar::<u32>()? as usize;
        if max >= num_classes {
            return Err(ModelError::LabelOutOfRange { label: max, num_classes });
        }
    }
    let classes = Tensor::arange(0u32, num_classes as u32, labels.device())?;
    let mask = labels.unsqueeze(1)?.broadcast_eq(&classes.unsqueeze(0)?)?;
    Ok(mask.to_dtype(dtype)?)
}

#[derive(Debug, Clone)]
pub struct ArcMarginHead {
    /// `(num_classes, emb_size)` class directions.
    weight: Tensor,
    num_classes: usize,
    emb_size: usize,
    easy_margin: bool,
    clamp_cosine: bool,
    s: f64,
    cos_m: f64,
    sin_m: f64,
    /// cos(pi - m): below it, theta + m leaves [0, pi].
    th: f64,
    /// sin(pi - m) * m: linear penalty used past the threshold.
    mm: f64,
}

impl ArcMarginHead {
    /// Create the head; the weight matrix is Xavier-uniform initialized when
    /// `vb` does not already hold it.
    pub fn new(
        vb: VarBuilder,
        num_classes: usize,
        emb_size: usize,
        margin: &MarginConfig,
    ) -> candle_core::Result<Self> {
        let bound = (6.0 / (num_classes + emb_size) as f64).sqrt();
        let weight = vb.get_with_hints(
            (num_classes, emb_size),
            "weight",
            Init::Uniform { lo: -bound, up: bound },
        )?;
        Self::from_weight(weight, margin)
    }

    /// Wrap an existing `(num_classes, emb_size)` weight matrix.
    pub fn from_weight(weight: Tensor, margin: &MarginConfig) -> candle_core::Result<Self> {
        let (num_classes, emb_size) = weight.dims2()?;
        let m = margin.margin_m;
        Ok(Self {
            weight,
            num_classes,
            emb_size,
            easy_margin: margin.easy_margin,
            clamp_cosine: margin.clamp_cosine,
            s: margin.margin_s,
            cos_m: m.cos(),
            sin_m: m.sin(),
            th: (PI - m).cos(),
            mm: (PI - m).sin() * m,
        })
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// Cosine similarity between every embedding and every class direction.
    pub fn cosine(&self, embeddings: &Tensor) -> Result<Tensor, ModelError> {
        let (_, width) = embeddings.dims2()?;
        if width != self.emb_size {
            return Err(ModelError::DimensionMismatch {
                expected: self.emb_size,
                actual: width,
            });
        }
        let x = l2_normalize(embeddings)?;
        let w = l2_normalize(&self.weight)?;
        Ok(x.matmul(&w.t()?)?)
    }

    /// Margin-adjusted logits, before scaling by `s`.
    pub fn margin_cosine(&self, embeddings: &Tensor, labels: &Tensor) -> Result<Tensor, ModelError> {
        let cosine = self.cosine(embeddings)?;

        let sine_input = if self.clamp_cosine {
            cosine.clamp(-1f32, 1f32)?
        } else {
            cosine.clone()
        };
        let sine = sine_input.sqr()?.affine(-1.0, 1.0)?.sqrt()?;

        // cos(theta + m) = cos(theta)cos(m) - sin(theta)sin(m)
        let phi = (cosine.affine(self.cos_m, 0.0)? - sine.affine(self.sin_m, 0.0)?)?;
        let phi = if self.easy_margin {
            cosine.gt(0.0)?.where_cond(&phi, &cosine)?
        } else {
            let fallback = cosine.affine(1.0, -self.mm)?;
            cosine.gt(self.th)?.where_cond(&phi, &fallback)?
        };

        let labels = labels.to_device(cosine.device())?;
        let one_hot = one_hot(&labels, self.num_classes, cosine.dtype())?;
        let rest = one_hot.affine(-1.0, 1.0)?;
        Ok(one_hot.mul(&phi)?.add(&rest.mul(&cosine)?)?)
    }

    /// Scaled margin logits `(batch, num_classes)`, ready for softmax cross-entropy.
    pub fn forward(&self, embeddings: &Tensor, labels: &Tensor) -> Result<Tensor, ModelError> {
        let (batch, _) = embeddings.dims2()?;
        if labels.dims1()? != batch {
            return Err(ModelError::InvalidInput(format!(
                "{} labels for {batch} embeddings",
                labels.dims1()?
            )));
        }
        Ok(self.margin_cosine(embeddings, labels)?.affine(self.s, 0.0)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn margin(m: f64, s: f64, easy: bool) -> MarginConfig {
        MarginConfig {
            easy_margin: easy,
            margin_m: m,
            margin_s: s,
            clamp_cosine: false,
        }
    }

    /// Identity-like class directions in 4 dimensions.
    fn head(m: f64, s: f64, easy: bool) -> ArcMarginHead {
        let weight = Tensor::new(
            &[
                [1f32, 0., 0., 0.],
                [0., 1., 0., 0.],
                [0., 0., 1., 0.],
                [0., 0., 0., 1.],
            ],
            &Device::Cpu,
        )
        .unwrap();
        ArcMarginHead::from_weight(weight, &margin(m, s, easy)).unwrap()
    }

    fn labels(values: &[u32]) -> Tensor {
        Tensor::new(values, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_one_hot_rows() {
        let mask = one_hot(&labels(&[2, 0, 1]), 4, DType::F32).unwrap();
        let rows = mask.to_vec2::<f32>().unwrap();
        assert_eq!(
            rows,
            vec![
                vec![0., 0., 1., 0.],
                vec![1., 0., 0., 0.],
                vec![0., 1., 0., 0.],
            ]
        );
    }

    #[test]
    fn test_one_hot_accepts_i64_labels() {
        let labels = Tensor::new(&[3i64, 1], &Device::Cpu).unwrap();
        let rows = one_hot(&labels, 4, DType::F32).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(rows[0], vec![0., 0., 0., 1.]);
        assert_eq!(rows[1], vec![0., 1., 0., 0.]);
    }

    #[test]
    fn test_one_hot_rejects_float_labels() {
        let labels = Tensor::new(&[-1f32, 2.], &Device::Cpu).unwrap();
        let err = one_hot(&labels, 4, DType::F32).unwrap_err();
        assert!(matches!(err, ModelError::InvalidInput(_)));
    }

    #[test]
    fn test_one_hot_rejects_negative_integer_labels() {
        let labels = Tensor::new(&[-1i64, 2], &Device::Cpu).unwrap();
        let err = one_hot(&labels, 4, DType::F32).unwrap_err();
        assert!(matches!(err, ModelError::LabelOutOfRange { .. }));
    }

    #[test]
    fn test_one_hot_rejects_out_of_range() {
        let err = one_hot(&labels(&[0, 4]), 4, DType::F32).unwrap_err();
        assert!(matches!(err, ModelError::LabelOutOfRange { label: 4, num_classes: 4 }));
    }

    #[test]
    fn test_l2_normalize_rows() {
        let xs = Tensor::new(&[[3f32, 4.], [0., 0.]], &Device::Cpu).unwrap();
        let rows = l2_normalize(&xs).unwrap().to_vec2::<f32>().unwrap();
        assert!((rows[0][0] - 0.6).abs() < 1e-6);
        assert!((rows[0][1] - 0.8).abs() < 1e-6);
        // zero rows stay zero instead of dividing by zero
        assert_eq!(rows[1], vec![0., 0.]);
    }

    #[test]
    fn test_zero_margin_is_scaled_cosine() {
        let head = head(0.0, 64.0, false);
        // each embedding points exactly at its label's class
        let emb = Tensor::new(&[[0f32, 0., 2., 0.], [5., 0., 0., 0.]], &Device::Cpu).unwrap();
        let out = head.forward(&emb, &labels(&[2, 0])).unwrap().to_vec2::<f32>().unwrap();
        let cosine = head.cosine(&emb).unwrap().to_vec2::<f32>().unwrap();
        for (row_out, row_cos) in out.iter().zip(cosine.iter()) {
            for (o, c) in row_out.iter().zip(row_cos.iter()) {
                assert!((o - 64.0 * c).abs() < 1e-3, "{o} vs {c}");
            }
        }
        assert!((out[0][2] - 64.0).abs() < 1e-3);
    }

    #[test]
    fn test_margin_applies_only_to_true_class() {
        let head = head(0.5, 1.0, false);
        let emb = Tensor::new(&[[1f32, 1., 0., 0.]], &Device::Cpu).unwrap();
        let out = head.forward(&emb, &labels(&[0])).unwrap().to_vec2::<f32>().unwrap();
        let c = std::f32::consts::FRAC_1_SQRT_2;
        let expected_phi = (std::f32::consts::FRAC_PI_4 + 0.5).cos();
        assert!((out[0][0] - expected_phi).abs() < 1e-5);
        assert!((out[0][1] - c).abs() < 1e-5);
        assert!(out[0][2].abs() < 1e-6);
    }

    #[test]
    fn test_larger_margin_lowers_true_logit() {
        let emb = Tensor::new(&[[0.9f32, 0.3, 0.1, 0.0]], &Device::Cpu).unwrap();
        let mut previous = f32::INFINITY;
        for m in [0.0, 0.1, 0.2, 0.3, 0.4, 0.5] {
            let v = head(m, 1.0, false)
                .margin_cosine(&emb, &labels(&[0]))
                .unwrap()
                .to_vec2::<f32>()
                .unwrap()[0][0];
            assert!(v < previous, "m={m}: {v} !< {previous}");
            previous = v;
        }
    }

    #[test]
    fn test_easy_margin_keeps_negative_cosine() {
        let head = head(0.5, 1.0, true);
        // cosine with class 0 is negative
        let emb = Tensor::new(&[[-1f32, 1., 0., 0.]], &Device::Cpu).unwrap();
        let out = head.forward(&emb, &labels(&[0])).unwrap().to_vec2::<f32>().unwrap();
        assert!((out[0][0] + std::f32::consts::FRAC_1_SQRT_2).abs() < 1e-5);
    }

    #[test]
    fn test_standard_margin_fallback_below_threshold() {
        let m = 0.5f64;
        let head = head(m, 1.0, false);
        // cosine = -1 < cos(pi - m)
        let emb = Tensor::new(&[[-1f32, 0., 0., 0.]], &Device::Cpu).unwrap();
        let out = head.forward(&emb, &labels(&[0])).unwrap().to_vec2::<f32>().unwrap();
        let expected = (-1.0 - (PI - m).sin() * m) as f32;
        assert!((out[0][0] - expected).abs() < 1e-5, "{} vs {expected}", out[0][0]);
    }

    #[test]
    fn test_fallback_stays_close_to_phi_at_threshold() {
        let m = 0.5f64;
        let th = (PI - m).cos();
        let phi_at_th = th * m.cos() - (1.0 - th * th).sqrt() * m.sin();
        let fallback_at_th = th - (PI - m).sin() * m;
        // phi = cos(pi) = -1 at the threshold; the linear fallback is close
        assert!((phi_at_th + 1.0).abs() < 1e-9);
        assert!((phi_at_th - fallback_at_th).abs() < 0.2);
    }

    #[test]
    fn test_dimension_mismatch() {
        let head = head(0.5, 64.0, false);
        let emb = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        let err = head.forward(&emb, &labels(&[0, 1])).unwrap_err();
        assert!(matches!(err, ModelError::DimensionMismatch { expected: 4, actual: 3 }));
    }

    #[test]
    fn test_label_count_mismatch() {
        let head = head(0.5, 64.0, false);
        let emb = Tensor::ones((2, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            head.forward(&emb, &labels(&[0])),
            Err(ModelError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_clamp_cosine_leaves_in_range_logits_unchanged() {
        let emb = Tensor::new(&[[0.4f32, -0.7, 0.2, 0.5], [1., 0., 0., 0.]], &Device::Cpu).unwrap();
        let plain = head(0.5, 64.0, false);
        let mut config = margin(0.5, 64.0, false);
        config.clamp_cosine = true;
        let clamped = ArcMarginHead::from_weight(plain.weight().clone(), &config).unwrap();

        let a = plain.forward(&emb, &labels(&[3, 0])).unwrap().to_vec2::<f32>().unwrap();
        let b = clamped.forward(&emb, &labels(&[3, 0])).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(a, b);
        assert!(b.iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn test_self_cosine_past_one_is_nan_unless_clamped() {
        let n = 64;
        let w = Tensor::randn(0f32, 1f32, (n, 512), &Device::Cpu).unwrap();
        let targets: Vec<u32> = (0..n as u32).collect();
        let targets = labels(&targets);

        let plain = ArcMarginHead::from_weight(w.clone(), &margin(0.5, 64.0, false)).unwrap();
        let mut config = margin(0.5, 64.0, false);
        config.clamp_cosine = true;
        let clamped = ArcMarginHead::from_weight(w.clone(), &config).unwrap();

        let cosine = plain.cosine(&w).unwrap().to_vec2::<f32>().unwrap();
        let a = plain.forward(&w, &targets).unwrap().to_vec2::<f32>().unwrap();
        let b = clamped.forward(&w, &targets).unwrap().to_vec2::<f32>().unwrap();

        let mut past_one = 0;
        for i in 0..n {
            if cosine[i][i] > 1.0 {
                past_one += 1;
                assert!(a[i][i].is_nan(), "row {i}: cosine {} gave {}", cosine[i][i], a[i][i]);
            }
        }
        // f32 rounding pushes some self-cosines above 1
        assert!(past_one > 0);
        assert!(b.iter().flatten().all(|v| v.is_finite()));
    }

    #[test]
    fn test_from_weight_rejects_non_matrix() {
        let weight = Tensor::zeros((2, 3, 4), DType::F32, &Device::Cpu).unwrap();
        assert!(ArcMarginHead::from_weight(weight, &MarginConfig::default()).is_err());
    }

    #[test]
    fn test_new_initializes_within_xavier_bound() {
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = ArcMarginHead::new(vb, 10, 512, &MarginConfig::default()).unwrap();
        assert_eq!(head.weight().dims(), &[10, 512]);
        let bound = (6.0f32 / 522.0).sqrt();
        let values = head.weight().flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| v.abs() <= bound));
    }

    #[test]
    fn test_gradients_reach_class_weights() {
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let head = ArcMarginHead::new(vb, 3, 4, &margin(0.5, 64.0, false)).unwrap();
        let emb = Tensor::new(&[[0.2f32, 0.5, -0.1, 0.3], [0.9, -0.2, 0.4, 0.1]], &Device::Cpu).unwrap();
        let logits = head.forward(&emb, &labels(&[1, 2])).unwrap();
        let loss = candle_nn::loss::cross_entropy(&logits, &labels(&[1, 2])).unwrap();
        let grads = loss.backward().unwrap();
        let vars = varmap.all_vars();
        let grad = grads.get(vars[0].as_tensor()).expect("class weight gradient");
        assert_eq!(grad.dims(), &[3, 4]);
    }
}
