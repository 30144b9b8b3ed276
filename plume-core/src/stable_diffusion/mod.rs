use anyhow::{bail, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, unet_2d::UNet2DConditionModel, vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use image::DynamicImage;
use serde::Deserialize;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    tensor_to_image, truncate_tokens, GenerationRequest, ImagePipeline, Loader, ModelSource,
    PipelineKind,
};

const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const DEFAULT_STEPS: usize = 50;
const DEFAULT_GUIDANCE: f64 = 7.5;
const VAE_SCALE: f64 = 0.18215;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVersion {
    V1_5,
    V2_1,
}

impl StableDiffusionVersion {
    fn from_cross_attention_dim(dim: usize) -> Result<Self> {
        match dim {
            768 => Ok(Self::V1_5),
            1024 => Ok(Self::V2_1),
            other => bail!("unsupported unet cross_attention_dim {other}"),
        }
    }

    fn config(self, height: Option<usize>, width: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(None, height, width),
            Self::V2_1 => StableDiffusionConfig::v2_1(None, height, width),
        }
    }
}

#[derive(Deserialize)]
struct UNetConfig {
    cross_attention_dim: usize,
}

pub struct StableDiffusionPipeline {
    version: StableDiffusionVersion,
    device: Device,
    dtype: DType,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
}

impl StableDiffusionPipeline {
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let ids = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let mut tokens = truncate_tokens(ids, self.max_tokens);
        tokens.resize(self.max_tokens, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }
}

impl ImagePipeline for StableDiffusionPipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::StableDiffusionPipeline
    }

    fn generate(&self, request: &GenerationRequest) -> Result<Vec<DynamicImage>> {
        for (name, value) in [("height", request.height), ("width", request.width)] {
            if value.is_some_and(|v| v == 0 || v % 8 != 0) {
                bail!("{name} must be a positive multiple of 8");
            }
        }
        let steps = request.num_inference_steps.unwrap_or(DEFAULT_STEPS);
        if steps == 0 {
            bail!("num_inference_steps must be at least 1");
        }
        let guidance_scale = request.guidance_scale.unwrap_or(DEFAULT_GUIDANCE);
        // Classifier-free guidance only applies above 1; the negative prompt
        // is the unconditional branch.
        let use_guidance = guidance_scale > 1.0;

        let sd_config = self.version.config(request.height, request.width);
        let mut scheduler = sd_config.build_scheduler(steps)?;

        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }

        debug!(
            height = sd_config.height,
            width = sd_config.width,
            steps,
            guidance_scale,
            "running stable diffusion pipeline"
        );

        let cond = self.encode_prompt(&request.prompt)?;
        let text_embeddings = if use_guidance {
            let uncond = self.encode_prompt(request.negative_prompt.as_deref().unwrap_or(""))?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        let text_embeddings = text_embeddings.to_dtype(self.dtype)?;

        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, sd_config.height / 8, sd_config.width / 8),
            &self.device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        let timesteps = scheduler.timesteps().to_vec();
        for timestep in timesteps {
            let latent_model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (noise_pred_uncond, noise_pred_text) = (&noise_pred[0], &noise_pred[1]);
                (noise_pred_uncond + ((noise_pred_text - noise_pred_uncond)? * guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
        }

        let image = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let image = ((image / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?.i(0)?;

        Ok(vec![tensor_to_image(&image)?])
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Pipeline = StableDiffusionPipeline;

    async fn load(source: &ModelSource, device: Device) -> Result<Self::Pipeline> {
        let dtype = if device.is_cpu() {
            DType::F32
        } else {
            DType::F16
        };

        let version = match source.read_json::<UNetConfig>("unet/config.json").await? {
            Some(unet) => {
                StableDiffusionVersion::from_cross_attention_dim(unet.cross_attention_dim)?
            }
            None => StableDiffusionVersion::V1_5,
        };
        info!(?version, ?dtype, "loading stable diffusion pipeline");
        let sd_config = version.config(None, None);

        // --- CLIP text encoder and tokenizer ---
        let tokenizer_file = source
            .get_with_fallback("tokenizer/tokenizer.json", CLIP_TOKENIZER_REPO, "tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = sd_config.clip.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = tokenizer
            .token_to_id(pad_token)
            .with_context(|| format!("CLIP tokenizer has no {pad_token} token"))?;
        let clip_weights = source
            .get("text_encoder/model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let text_model = stable_diffusion::build_clip_transformer(
            &sd_config.clip,
            clip_weights,
            &device,
            DType::F32,
        )
        .context("failed to load CLIP model")?;

        // --- UNet ---
        let unet_weights = source
            .get("unet/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get unet model file")?;
        let unet = sd_config
            .build_unet(unet_weights, &device, 4, cfg!(feature = "flash-attn"), dtype)
            .context("failed to load unet")?;

        // --- VAE ---
        let vae_weights = source
            .get("vae/diffusion_pytorch_model.safetensors")
            .await
            .context("failed to get vae model file")?;
        let vae = sd_config
            .build_vae(vae_weights, &device, dtype)
            .context("failed to load vae")?;

        Ok(StableDiffusionPipeline {
            version,
            device,
            dtype,
            tokenizer,
            pad_id,
            max_tokens: sd_config.clip.max_position_embeddings,
            text_model,
            unet,
            vae,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_follows_cross_attention_dim() {
        assert_eq!(
            StableDiffusionVersion::from_cross_attention_dim(768).unwrap(),
            StableDiffusionVersion::V1_5
        );
        assert_eq!(
            StableDiffusionVersion::from_cross_attention_dim(1024).unwrap(),
            StableDiffusionVersion::V2_1
        );
        assert!(StableDiffusionVersion::from_cross_attention_dim(2048).is_err());
    }

    #[test]
    fn version_config_defaults_size() {
        let config = StableDiffusionVersion::V1_5.config(None, None);
        assert_eq!((config.height, config.width), (512, 512));
        let config = StableDiffusionVersion::V2_1.config(Some(512), Some(640));
        assert_eq!((config.height, config.width), (512, 640));
    }
}
