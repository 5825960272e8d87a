use thiserror::Error;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("weights file not found: {0} — export the torchvision checkpoint to safetensors first")]
    WeightsNotFound(String),
    #[error("weights file has no tensor named {0}")]
    MissingWeight(String),
    #[error("embedding width {actual} does not match class weight width {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("label {label} out of range for {num_classes} classes")]
    LabelOutOfRange { label: usize, num_classes: usize },
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("parameter store lock poisoned")]
    StatePoisoned,
    #[error("candle: {0}")]
    Candle(#[from] candle_core::Error),
    #[error("image: {0}")]
    Image(#[from] image::ImageError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse: {0}")]
    ConfigParse(#[from] toml::de::Error),
}
