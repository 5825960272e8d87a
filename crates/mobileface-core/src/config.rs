//! Training configuration: model shape, margin hyperparameters, device.
//!
//! Loaded either from `MOBILEFACE_*` environment variables or from a TOML
//! file. Missing keys fall back to the defaults below.

use crate::error::ModelError;
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use std::path::Path;
use std::str::FromStr;

/// Identity count of the MS-Celeb-1M refined training set.
pub const DEFAULT_NUM_CLASSES: usize = 93431;
pub const DEFAULT_EMB_SIZE: usize = 512;
pub const DEFAULT_INPUT_SIZE: usize = 112;
pub const DEFAULT_DROPOUT: f32 = 0.5;
pub const DEFAULT_MARGIN_M: f64 = 0.5;
pub const DEFAULT_MARGIN_S: f64 = 64.0;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrainConfig {
    pub model: ModelConfig,
    pub margin: MarginConfig,
    pub device: DeviceChoice,
}

/// Shape of the embedding network and of the class weight matrix.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ModelConfig {
    pub num_classes: usize,
    pub emb_size: usize,
    /// Square input resolution in pixels.
    pub input_size: usize,
    /// Dropout probability applied to the backbone feature map while training.
    pub dropout: f32,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            num_classes: DEFAULT_NUM_CLASSES,
            emb_size: DEFAULT_EMB_SIZE,
            input_size: DEFAULT_INPUT_SIZE,
            dropout: DEFAULT_DROPOUT,
        }
    }
}

/// ArcFace margin hyperparameters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct MarginConfig {
    /// Apply the margin only where cosine > 0.
    pub easy_margin: bool,
    /// Additive angular margin in radians.
    pub margin_m: f64,
    /// Logit scale.
    pub margin_s: f64,
    /// Clamp cosine into [-1, 1] before computing the sine. Off by default:
    /// rounding past |cos| = 1 then yields NaN logits.
    pub clamp_cosine: bool,
}

impl Default for MarginConfig {
    fn default() -> Self {
        Self {
            easy_margin: false,
            margin_m: DEFAULT_MARGIN_M,
            margin_s: DEFAULT_MARGIN_S,
            clamp_cosine: false,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceChoice {
    #[default]
    Cpu,
    Cuda,
}

impl FromStr for DeviceChoice {
    type Err = ModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            other => Err(ModelError::InvalidConfig(format!("unknown device '{other}'"))),
        }
    }
}

impl DeviceChoice {
    /// Resolve to a candle device. CUDA falls back to CPU when unavailable.
    pub fn device(self) -> Result<Device, ModelError> {
        match self {
            Self::Cpu => Ok(Device::Cpu),
            Self::Cuda => {
                let device = Device::cuda_if_available(0)?;
                if device.is_cpu() {
                    tracing::warn!("CUDA requested but unavailable, using CPU");
                }
                Ok(device)
            }
        }
    }
}

impl TrainConfig {
    /// Load configuration from `MOBILEFACE_*` environment variables with defaults.
    pub fn from_env() -> Result<Self, ModelError> {
        let device = match std::env::var("MOBILEFACE_DEVICE") {
            Ok(v) => v.parse()?,
            Err(_) => DeviceChoice::default(),
        };

        let config = Self {
            model: ModelConfig {
                num_classes: env_parse("MOBILEFACE_NUM_CLASSES", DEFAULT_NUM_CLASSES),
                emb_size: env_parse("MOBILEFACE_EMB_SIZE", DEFAULT_EMB_SIZE),
                input_size: env_parse("MOBILEFACE_INPUT_SIZE", DEFAULT_INPUT_SIZE),
                dropout: env_parse("MOBILEFACE_DROPOUT", DEFAULT_DROPOUT),
            },
            margin: MarginConfig {
                easy_margin: env_flag("MOBILEFACE_EASY_MARGIN", false),
                margin_m: env_parse("MOBILEFACE_MARGIN_M", DEFAULT_MARGIN_M),
                margin_s: env_parse("MOBILEFACE_MARGIN_S", DEFAULT_MARGIN_S),
                clamp_cosine: env_flag("MOBILEFACE_CLAMP_COSINE", false),
            },
            device,
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML configuration file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        config.validate()?;
        tracing::debug!(path = %path.display(), ?config, "loaded config");
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ModelError> {
        let model = &self.model;
        let margin = &self.margin;
        if model.num_classes == 0 {
            return Err(ModelError::InvalidConfig("num_classes must be > 0".into()));
        }
        if model.emb_size == 0 {
            return Err(ModelError::InvalidConfig("emb_size must be > 0".into()));
        }
        if model.input_size < 32 {
            return Err(ModelError::InvalidConfig(format!(
                "input_size {} is below the backbone's 32-pixel stride",
                model.input_size
            )));
        }
        if !(0.0..1.0).contains(&model.dropout) {
            return Err(ModelError::InvalidConfig(format!(
                "dropout {} not in [0, 1)",
                model.dropout
            )));
        }
        if !(0.0..PI).contains(&margin.margin_m) {
            return Err(ModelError::InvalidConfig(format!(
                "margin_m {} not in [0, pi)",
                margin.margin_m
            )));
        }
        if margin.margin_s <= 0.0 {
            return Err(ModelError::InvalidConfig(format!(
                "margin_s {} must be positive",
                margin.margin_s
            )));
        }
        Ok(())
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(default)
}
