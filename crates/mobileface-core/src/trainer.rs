//! Trainable assembly of the embedding network and the margin head.
//!
//! All parameters live in one [`VarMap`] so an external optimizer can step
//! them and a single safetensors checkpoint captures the whole run:
//!
//! ```text
//! backbone.features.*   MobileNet-V2 (loadable from torchvision `features.*`)
//! bn1, conv1, bn2, conv2, bn3
//! margin.weight         (num_classes, emb_size) class directions
//! ```

use crate::config::TrainConfig;
use crate::embedder::MobileFaceNet;
use crate::error::ModelError;
use crate::margin::ArcMarginHead;
use candle_core::{DType, Device, ModuleT, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;

/// Prefix of backbone parameters inside the checkpoint.
const BACKBONE_PREFIX: &str = "backbone.";

pub struct FaceTrainer {
    varmap: VarMap,
    network: MobileFaceNet,
    head: ArcMarginHead,
    device: Device,
}

impl FaceTrainer {
    /// Build a freshly initialized network and margin head on `device`.
    pub fn new(config: &TrainConfig, device: &Device) -> Result<Self, ModelError> {
        config.validate()?;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);

        let network = MobileFaceNet::new(vb.clone(), &config.model)?;
        let head = ArcMarginHead::new(
            vb.pp("margin"),
            config.model.num_classes,
            config.model.emb_size,
            &config.margin,
        )?;

        tracing::info!(
            num_classes = config.model.num_classes,
            emb_size = config.model.emb_size,
            easy_margin = config.margin.easy_margin,
            margin_m = config.margin.margin_m,
            margin_s = config.margin.margin_s,
            vars = varmap.all_vars().len(),
            "initialized MobileFaceNet training model"
        );

        Ok(Self {
            varmap,
            network,
            head,
            device: device.clone(),
        })
    }

    /// Build the model and overwrite its backbone with pretrained MobileNet-V2
    /// weights (torchvision names, `features.*`).
    pub fn with_pretrained(
        config: &TrainConfig,
        device: &Device,
        weights: &Path,
    ) -> Result<Self, ModelError> {
        let trainer = Self::new(config, device)?;
        trainer.load_pretrained_backbone(weights)?;
        Ok(trainer)
    }

    /// Copy every `backbone.*` parameter from a torchvision-named safetensors
    /// file. Extra tensors in the file (classifier, `num_batches_tracked`) are
    /// ignored; a missing or misshapen one is an error and leaves every
    /// parameter untouched. Returns the number of tensors loaded.
    pub fn load_pretrained_backbone(&self, weights: &Path) -> Result<usize, ModelError> {
        if !weights.exists() {
            return Err(ModelError::WeightsNotFound(weights.display().to_string()));
        }
        let tensors = candle_core::safetensors::load(weights, &self.device)?;
        let vars = self.varmap.data().lock().map_err(|_| ModelError::StatePoisoned)?;

        let mut staged = Vec::new();
        for (name, var) in vars.iter() {
            let Some(key) = name.strip_prefix(BACKBONE_PREFIX) else {
                continue;
            };
            let tensor = tensors
                .get(key)
                .ok_or_else(|| ModelError::MissingWeight(key.to_string()))?;
            if tensor.dims() != var.dims() {
                return Err(ModelError::InvalidInput(format!(
                    "{key}: expected shape {:?}, got {:?}",
                    var.dims(),
                    tensor.dims()
                )));
            }
            staged.push((var, tensor.to_dtype(var.dtype())?));
        }

        let loaded = staged.len();
        for (var, tensor) in staged {
            var.set(&tensor)?;
        }

        tracing::info!(
            path = %weights.display(),
            loaded,
            available = tensors.len(),
            "loaded pretrained backbone"
        );
        Ok(loaded)
    }

    /// Restore every parameter from a checkpoint written by [`save`](Self::save).
    pub fn load_checkpoint(&mut self, path: &Path) -> Result<(), ModelError> {
        if !path.exists() {
            return Err(ModelError::WeightsNotFound(path.display().to_string()));
        }
        self.varmap.load(path)?;
        tracing::info!(path = %path.display(), "restored checkpoint");
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), ModelError> {
        self.varmap.save(path)?;
        tracing::info!(path = %path.display(), "saved checkpoint");
        Ok(())
    }

    /// Trainable variables for an external optimizer.
    pub fn vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn network(&self) -> &MobileFaceNet {
        &self.network
    }

    pub fn head(&self) -> &ArcMarginHead {
        &self.head
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Training-mode forward: embeddings then margin logits.
    pub fn logits(&self, images: &Tensor, labels: &Tensor) -> Result<Tensor, ModelError> {
        let embeddings = self.network.forward_t(images, true)?;
        self.head.forward(&embeddings, labels)
    }

    /// Mean softmax cross-entropy over the margin logits.
    pub fn loss(&self, images: &Tensor, labels: &Tensor) -> Result<Tensor, ModelError> {
        let logits = self.logits(images, labels)?;
        let labels = labels.to_dtype(DType::U32)?.to_device(logits.device())?;
        Ok(candle_nn::loss::cross_entropy(&logits, &labels)?)
    }
}
