//! Per-layer architecture summary: output shapes, parameter counts and
//! convolution multiply-adds for a single forward pass.

use candle_core::Tensor;
use candle_nn::{BatchNorm, Conv2d, Dropout};
use std::fmt;

/// Static cost of a layer, independent of the batch it runs on.
pub trait LayerStats {
    /// Number of learnable parameters (running statistics excluded).
    fn params(&self) -> usize;

    /// Multiply-adds for one sample, given per-sample input/output dims `[C, H, W]`.
    fn madds(&self, _input: &[usize], _output: &[usize]) -> usize {
        0
    }
}

impl LayerStats for Conv2d {
    fn params(&self) -> usize {
        self.weight().elem_count() + self.bias().map_or(0, |b| b.elem_count())
    }

    fn madds(&self, _input: &[usize], output: &[usize]) -> usize {
        let spatial: usize = output.iter().skip(1).product();
        // weight is (out, in / groups, k, k): one MAC per weight per output position
        spatial * self.weight().elem_count()
    }
}

impl LayerStats for BatchNorm {
    fn params(&self) -> usize {
        self.weight_and_bias()
            .map_or(0, |(w, b)| w.elem_count() + b.elem_count())
    }
}

impl LayerStats for Dropout {
    fn params(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone)]
pub struct LayerSummary {
    pub name: String,
    pub kind: &'static str,
    /// Output shape including the batch dimension.
    pub output_shape: Vec<usize>,
    pub params: usize,
    pub madds: usize,
}

#[derive(Debug, Clone)]
pub struct ModelSummary {
    pub input_shape: Vec<usize>,
    pub layers: Vec<LayerSummary>,
}

impl ModelSummary {
    pub fn new(input_shape: &[usize]) -> Self {
        Self {
            input_shape: input_shape.to_vec(),
            layers: Vec::new(),
        }
    }

    /// Record a layer that mapped `input` to `output`.
    pub fn record<L: LayerStats + ?Sized>(
        &mut self,
        name: impl Into<String>,
        kind: &'static str,
        layer: &L,
        input: &Tensor,
        output: &Tensor,
    ) {
        let madds = layer.madds(&input.dims()[1..], &output.dims()[1..]);
        self.push(name, kind, output.dims(), layer.params(), madds);
    }

    /// Record a parameter-free reshaping step or any precomputed row.
    pub fn push(
        &mut self,
        name: impl Into<String>,
        kind: &'static str,
        output_shape: &[usize],
        params: usize,
        madds: usize,
    ) {
        self.layers.push(LayerSummary {
            name: name.into(),
            kind,
            output_shape: output_shape.to_vec(),
            params,
            madds,
        });
    }

    pub fn total_params(&self) -> usize {
        self.layers.iter().map(|l| l.params).sum()
    }

    pub fn total_madds(&self) -> usize {
        self.layers.iter().map(|l| l.madds).sum()
    }

    pub fn output_shape(&self) -> Option<&[usize]> {
        self.layers.last().map(|l| l.output_shape.as_slice())
    }
}

impl fmt::Display for ModelSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let rule = "-".repeat(92);
        writeln!(f, "{rule}")?;
        writeln!(
            f,
            "{:<28} {:<18} {:<20} {:>12} {:>12}",
            "Layer", "Type", "Output Shape", "Params", "MAdds"
        )?;
        writeln!(f, "{}", "=".repeat(92))?;
        for layer in &self.layers {
            writeln!(
                f,
                "{:<28} {:<18} {:<20} {:>12} {:>12}",
                layer.name,
                layer.kind,
                format!("{:?}", layer.output_shape),
                with_commas(layer.params),
                with_commas(layer.madds),
            )?;
        }
        writeln!(f, "{}", "=".repeat(92))?;
        writeln!(f, "Input shape: {:?}", self.input_shape)?;
        writeln!(f, "Total params: {}", with_commas(self.total_params()))?;
        writeln!(f, "Total MAdds: {}", with_commas(self.total_madds()))?;
        write!(f, "{rule}")
    }
}

fn with_commas(n: usize) -> String {
    let digits = n.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, ch) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(ch);
    }
    out
}
