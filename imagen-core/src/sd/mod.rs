use std::sync::Mutex;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::clip::ClipTextTransformer;
use candle_transformers::models::stable_diffusion::schedulers::Scheduler;
use candle_transformers::models::stable_diffusion::unet_2d::UNet2DConditionModel;
use candle_transformers::models::stable_diffusion::vae::AutoEncoderKL;
use candle_transformers::models::stable_diffusion::{self, StableDiffusionConfig};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::config::EngineConfig;
use crate::device::DeviceKind;
use crate::util::tensor_to_image;
use crate::{ImageGenerator, ResolvedParams};

/// The v1.5 checkpoints ship vocab/merges only; the tokenizers-compatible
/// JSON lives in the upstream CLIP repo.
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const VAE_SCALE: f64 = 0.18215;

/// The diffusion pipeline: tokenizer, CLIP text encoder, UNet and VAE, all
/// bound to one device for the engine's lifetime.
pub struct GenerationEngine {
    device: Device,
    rng_device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    // One execution slot: the seed/sample sequence must not interleave
    // across requests, and device execution is not assumed reentrant.
    slot: Mutex<()>,
}

fn weight_file(stem: &str, fp16: bool) -> String {
    if fp16 {
        format!("{stem}.fp16.safetensors")
    } else {
        format!("{stem}.safetensors")
    }
}

impl GenerationEngine {
    pub async fn load(config: &EngineConfig) -> Result<Self> {
        let kind = DeviceKind::resolve(config.device.as_deref());
        let device = kind.to_device().context("failed to set up device")?;
        let rng_device = if kind.rng_binding() == kind {
            device.clone()
        } else {
            kind.rng_binding().to_device()?
        };
        // Half precision on accelerators is a throughput trade-off; the CPU
        // backend stays in full precision.
        let dtype = if device.is_cpu() { DType::F32 } else { DType::F16 };
        let use_f16 = dtype == DType::F16;

        info!(model = %config.model_id, device = %kind, "loading generation engine");

        let api = Api::new().context("failed to create hub api")?;

        let tokenizer_file = api
            .model(TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load tokenizer")?;

        let sd_config = StableDiffusionConfig::v1_5(None, None, None);
        let repo = api.model(config.model_id.clone());

        let clip_weights = repo
            .get(&weight_file("text_encoder/model", use_f16))
            .await
            .context("failed to get text encoder weights")?;
        // The text encoder runs in full precision regardless of the UNet
        // dtype; its embeddings are cast afterwards.
        let text_model =
            stable_diffusion::build_clip_transformer(&sd_config.clip, clip_weights, &device, DType::F32)
                .context("failed to load text encoder")?;

        let vae_weights = repo
            .get(&weight_file("vae/diffusion_pytorch_model", use_f16))
            .await
            .context("failed to get vae weights")?;
        let vae = sd_config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to load vae")?;

        let unet_weights = repo
            .get(&weight_file("unet/diffusion_pytorch_model", use_f16))
            .await
            .context("failed to get unet weights")?;
        let unet = sd_config
            .build_unet(unet_weights, &device, 4, cfg!(feature = "flash-attn"), dtype)
            .context("failed to load unet")?;

        Ok(Self {
            device,
            rng_device,
            dtype,
            sd_config,
            tokenizer,
            text_model,
            unet,
            vae,
            slot: Mutex::new(()),
        })
    }

    fn encode_prompt(&self, text: &str) -> Result<Tensor> {
        let max_len = self.sd_config.clip.max_position_embeddings;
        let vocab = self.tokenizer.get_vocab(true);
        let pad_id = match &self.sd_config.clip.pad_with {
            Some(pad) => *vocab
                .get(pad.as_str())
                .with_context(|| format!("tokenizer vocab has no padding token {pad:?}"))?,
            None => *vocab
                .get("<|endoftext|>")
                .context("tokenizer vocab has no <|endoftext|> token")?,
        };
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            anyhow::bail!(
                "prompt is too long: {} tokens exceed the {max_len}-token window",
                tokens.len()
            );
        }
        tokens.resize(max_len, pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }

    /// Conditional embedding, stacked with the unconditional branch when
    /// classifier-free guidance is active.
    fn text_embeddings(&self, params: &ResolvedParams, use_guidance: bool) -> Result<Tensor> {
        let cond = self.encode_prompt(&params.prompt)?;
        let embeddings = if use_guidance {
            let uncond = self.encode_prompt(params.negative_prompt.as_deref().unwrap_or(""))?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        Ok(embeddings.to_dtype(self.dtype)?)
    }

    /// Draw the initial latent on the bound random source, seeded for
    /// reproducibility, then hand it to the model device.
    fn draw_noise(&self, height: usize, width: usize, seed: u64) -> Result<Tensor> {
        let shape = (1, 4, height / 8, width / 8);
        let noise = if self.rng_device.is_cpu() {
            // The CPU backend cannot be reseeded through `Device::set_seed`;
            // sample from a seeded host RNG instead.
            let count = 4 * (height / 8) * (width / 8);
            Tensor::from_vec(seeded_normal(count, seed), shape, &Device::Cpu)?
        } else {
            self.rng_device.set_seed(seed)?;
            Tensor::randn(0f32, 1f32, shape, &self.rng_device)?
        };
        Ok(noise.to_device(&self.device)?)
    }
}

/// Standard-normal samples from a host RNG seeded per request. Identical
/// seeds reproduce identical latents.
fn seeded_normal(count: usize, seed: u64) -> Vec<f32> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..count)
        .map(|_| rng.sample::<f32, _>(StandardNormal))
        .collect()
}

impl ImageGenerator for GenerationEngine {
    fn generate(&self, params: &ResolvedParams) -> Result<DynamicImage> {
        let _slot = self.slot.lock().unwrap_or_else(|e| e.into_inner());

        let (height, width) = (params.height, params.width);
        if height == 0 || width == 0 || height % 8 != 0 || width % 8 != 0 {
            anyhow::bail!("image dimensions must be positive multiples of 8, got {width}x{height}");
        }

        let use_guidance = params.guidance > 1.0;
        let text_embeddings = self.text_embeddings(params, use_guidance)?;
        let mut scheduler = self.sd_config.build_scheduler(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();

        let latents = self.draw_noise(height, width, params.seed)?;
        let latents = (latents * scheduler.init_noise_sigma())?;
        let mut latents = latents.to_dtype(self.dtype)?;

        for &timestep in &timesteps {
            let latent_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_input = scheduler.scale_model_input(latent_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&latent_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * params.guidance)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(timestep, "denoising step done");
        }

        let image = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let image = ((image / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?;
        tensor_to_image(&image.i(0)?)
    }
}
