//! Image decoding and normalization into the network's NCHW input layout.
//!
//! The backbone was pretrained on ImageNet, so inputs use the ImageNet
//! per-channel mean/std on [0, 1] pixel values.

use crate::error::ModelError;
use candle_core::{Device, Tensor};
use image::imageops::FilterType;
use image::RgbImage;
use ndarray::{Array4, Axis};
use std::path::Path;

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Decode an image file into RGB.
pub fn load_rgb(path: &Path) -> Result<RgbImage, ModelError> {
    let img = image::open(path)?;
    Ok(img.to_rgb8())
}

/// Resize an RGB image to `size`x`size` and normalize into a `(1, 3, size, size)` array.
pub fn preprocess(img: &RgbImage, size: usize) -> Array4<f32> {
    let resized = if img.width() as usize == size && img.height() as usize == size {
        img.clone()
    } else {
        image::imageops::resize(img, size as u32, size as u32, FilterType::Triangle)
    };

    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            let value = pixel.0[c] as f32 / 255.0;
            tensor[[0, c, y as usize, x as usize]] = (value - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    tensor
}

/// Stack preprocessed `(1, 3, H, W)` arrays into one batch tensor on `device`.
pub fn to_batch(arrays: &[Array4<f32>], device: &Device) -> Result<Tensor, ModelError> {
    if arrays.is_empty() {
        return Err(ModelError::InvalidInput("empty image batch".into()));
    }
    let views: Vec<_> = arrays.iter().map(|a| a.view()).collect();
    let stacked = ndarray::concatenate(Axis(0), &views)
        .map_err(|e| ModelError::InvalidInput(format!("mismatched image shapes: {e}")))?;
    let shape = stacked.shape().to_vec();
    let data: Vec<f32> = stacked.iter().copied().collect();
    Ok(Tensor::from_vec(data, shape, device)?)
}

/// Load, resize, normalize and batch a list of image files.
pub fn load_batch(paths: &[&Path], size: usize, device: &Device) -> Result<Tensor, ModelError> {
    let arrays = paths
        .iter()
        .map(|p| load_rgb(p).map(|img| preprocess(&img, size)))
        .collect::<Result<Vec<_>, _>>()?;
    to_batch(&arrays, device)
}
