//! mobileface-core — Face embedding network and ArcFace training head.
//!
//! A MobileNet-V2 backbone with a learned pooling head maps 112x112 face
//! crops to 512-dimensional embeddings; an additive angular margin head turns
//! those embeddings into scaled logits for softmax training. Built on candle.

pub mod backbone;
pub mod config;
pub mod embedder;
pub mod error;
pub mod margin;
pub mod preprocess;
pub mod summary;
pub mod trainer;
pub mod types;

pub use config::{DeviceChoice, MarginConfig, ModelConfig, TrainConfig};
pub use embedder::MobileFaceNet;
pub use error::ModelError;
pub use margin::{one_hot, ArcMarginHead};
pub use summary::{LayerStats, ModelSummary};
pub use trainer::FaceTrainer;
pub use types::Embedding;
