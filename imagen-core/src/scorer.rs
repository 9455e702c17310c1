use std::sync::Mutex;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, Tensor, D};
use candle_transformers::models::clip::{ClipConfig, ClipModel};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::info;

use crate::config::EngineConfig;
use crate::device::DeviceKind;
use crate::FidelityScorer;

const CLIP_REPO: &str = "openai/clip-vit-base-patch32";

/// Vision-language similarity model grading how well an image matches its
/// prompt. Loaded independently of the generation engine; always runs in
/// full precision, it is cheap next to the diffusion model.
pub struct ScoringEngine {
    device: Device,
    config: ClipConfig,
    model: ClipModel,
    tokenizer: Tokenizer,
    slot: Mutex<()>,
}

impl ScoringEngine {
    pub async fn load(config: &EngineConfig) -> Result<Self> {
        let kind = DeviceKind::resolve(config.device.as_deref());
        let device = kind.to_device().context("failed to set up device")?;
        info!(model = CLIP_REPO, device = %kind, "loading scoring engine");

        let api = Api::new().context("failed to create hub api")?;
        let repo = api.model(CLIP_REPO.to_string());
        let model_file = repo
            .get("model.safetensors")
            .await
            .context("failed to get clip weights")?;
        let tokenizer_file = repo
            .get("tokenizer.json")
            .await
            .context("failed to get clip tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load clip tokenizer")?;

        let clip_config = ClipConfig::vit_base_patch32();
        let vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[model_file], DType::F32, &device)
                .context("failed to build clip var builder")?
        };
        let model = ClipModel::new(vb, &clip_config).context("failed to load clip model")?;

        Ok(Self {
            device,
            config: clip_config,
            model,
            tokenizer,
            slot: Mutex::new(()),
        })
    }

    fn tokenize(&self, prompt: &str) -> Result<Tensor> {
        let max_len = self.config.text_config.max_position_embeddings;
        let eot_id = *self
            .tokenizer
            .get_vocab(true)
            .get("<|endoftext|>")
            .context("tokenizer vocab has no <|endoftext|> token")?;
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        // Clip to the text tower's window, keeping the end-of-text token.
        if tokens.len() > max_len {
            tokens.truncate(max_len);
            tokens[max_len - 1] = eot_id;
        }
        Ok(Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?)
    }
}

impl FidelityScorer for ScoringEngine {
    fn score(&self, image: &DynamicImage, prompt: &str) -> Result<f32> {
        let _slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());

        let pixels = preprocess_image(image, self.config.image_size)?
            .unsqueeze(0)?
            .to_device(&self.device)?;
        let tokens = self.tokenize(prompt)?;

        let text_emb = div_l2_norm(&self.model.get_text_features(&tokens)?)?;
        let image_emb = div_l2_norm(&self.model.get_image_features(&pixels)?)?;

        let cos = (text_emb * image_emb)?.sum_all()?.to_scalar::<f32>()?;
        Ok(normalize_similarity(cos))
    }
}

/// Resize and rescale an image into the vision tower's (3, size, size)
/// layout with pixel values in [-1, 1]. Always converts to RGB first.
pub fn preprocess_image(image: &DynamicImage, image_size: usize) -> Result<Tensor> {
    let img = image.resize_to_fill(
        image_size as u32,
        image_size as u32,
        image::imageops::FilterType::Triangle,
    );
    let pixels = img.to_rgb8().into_raw();
    let tensor = Tensor::from_vec(pixels, (image_size, image_size, 3), &Device::Cpu)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?;
    Ok(tensor)
}

fn div_l2_norm(v: &Tensor) -> Result<Tensor> {
    let l2_norm = v.sqr()?.sum_keepdim(D::Minus1)?.sqrt()?;
    Ok(v.broadcast_div(&l2_norm)?)
}

/// Affine remap of cosine similarity from [-1, 1] into [0, 1], so consumers
/// see a monotonic higher-is-better signal with no sign ambiguity.
pub fn normalize_similarity(cos: f32) -> f32 {
    ((cos + 1.0) / 2.0).clamp(0.0, 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_remap_covers_the_unit_interval() {
        assert_eq!(normalize_similarity(1.0), 1.0);
        assert_eq!(normalize_similarity(-1.0), 0.0);
        assert_eq!(normalize_similarity(0.0), 0.5);
    }

    #[test]
    fn similarity_remap_clamps_numeric_overshoot() {
        assert_eq!(normalize_similarity(1.0 + f32::EPSILON * 4.0), 1.0);
        assert_eq!(normalize_similarity(-1.1), 0.0);
    }

    #[test]
    fn preprocess_produces_chw_floats_in_range() {
        let image = DynamicImage::new_rgb8(64, 48);
        let tensor = preprocess_image(&image, 224).unwrap();
        assert_eq!(tensor.dims(), &[3, 224, 224]);
        let flat = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(flat.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn preprocess_accepts_non_rgb_input() {
        let image = DynamicImage::new_luma8(32, 32);
        let tensor = preprocess_image(&image, 224).unwrap();
        assert_eq!(tensor.dims(), &[3, 224, 224]);
    }

    #[test]
    fn l2_normalized_vectors_have_unit_cosine_with_themselves() {
        let v = Tensor::new(&[[3f32, 4f32]], &Device::Cpu).unwrap();
        let n = div_l2_norm(&v).unwrap();
        let cos = (n.clone() * n).unwrap().sum_all().unwrap().to_scalar::<f32>().unwrap();
        assert!((cos - 1.0).abs() < 1e-6);
    }
}
