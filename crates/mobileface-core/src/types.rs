use candle_core::Tensor;
use serde::{Deserialize, Serialize};

/// Face embedding vector (512-dimensional for the default MobileFaceNet).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Checkpoint that produced this embedding (e.g., "mobileface.safetensors").
    pub model_version: Option<String>,
}

impl Embedding {
    /// Split a `(batch, emb_size)` tensor into one embedding per row.
    pub fn from_tensor(
        embeddings: &Tensor,
        model_version: Option<&str>,
    ) -> candle_core::Result<Vec<Embedding>> {
        let rows = embeddings.to_dtype(candle_core::DType::F32)?.to_vec2::<f32>()?;
        Ok(rows
            .into_iter()
            .map(|values| Embedding {
                values,
                model_version: model_version.map(str::to_string),
            })
            .collect())
    }

    /// Unit-length copy. Zero vectors are returned unchanged.
    pub fn normalized(&self) -> Embedding {
        let norm: f32 = self.values.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            self.values.iter().map(|x| x / norm).collect()
        } else {
            self.values.clone()
        };
        Embedding {
            values,
            model_version: self.model_version.clone(),
        }
    }

    /// Cosine similarity between two embeddings, in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 { dot / denom } else { 0.0 }
    }

    /// Euclidean distance between two embeddings.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }
}
