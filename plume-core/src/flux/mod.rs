use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::{Module, VarBuilder};
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{
        autoencoder::{self, AutoEncoder},
        model::{self, Flux},
        sampling,
    },
    t5::{self, T5EncoderModel},
};
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    tensor_to_image, truncate_tokens, GenerationRequest, ImagePipeline, Loader, ModelSource,
    PipelineKind,
};

const CLIP_TOKENIZER_REPO: &str = "openai/clip-vit-large-patch14";
const DEFAULT_WIDTH: usize = 1360;
const DEFAULT_HEIGHT: usize = 768;
const CLIP_MAX_TOKENS: usize = 77;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    fn default_steps(self) -> usize {
        match self {
            FluxVariant::Schnell => 4,
            FluxVariant::Dev => 28,
        }
    }

    fn default_guidance(self) -> f64 {
        match self {
            FluxVariant::Schnell => 0.0,
            FluxVariant::Dev => 3.5,
        }
    }

    fn t5_length(self) -> usize {
        match self {
            FluxVariant::Schnell => 256,
            FluxVariant::Dev => 512,
        }
    }
}

/// The latent is packed in 2x2 patches of the 8x downsampled image.
fn check_size(width: usize, height: usize) -> Result<()> {
    if width == 0 || height == 0 || width % 16 != 0 || height % 16 != 0 {
        bail!("width and height must be positive multiples of 16, got {width}x{height}");
    }
    Ok(())
}

pub struct FluxPipeline {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    // The T5 encoder needs exclusive access for a forward pass.
    t5_model: Mutex<T5EncoderModel>,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
}

impl ImagePipeline for FluxPipeline {
    fn kind(&self) -> PipelineKind {
        PipelineKind::FluxPipeline
    }

    fn generate(&self, request: &GenerationRequest) -> Result<Vec<DynamicImage>> {
        if request.negative_prompt.is_some() {
            bail!("negative_prompt is not supported by FluxPipeline");
        }

        // Set defaults.
        let width = request.width.unwrap_or(DEFAULT_WIDTH);
        let height = request.height.unwrap_or(DEFAULT_HEIGHT);
        let steps = request
            .num_inference_steps
            .unwrap_or(self.variant.default_steps());
        let guidance = request
            .guidance_scale
            .unwrap_or(self.variant.default_guidance());
        check_size(width, height)?;
        if steps == 0 {
            bail!("num_inference_steps must be at least 1");
        }

        // Optionally set seed for reproducibility.
        if let Some(seed) = request.seed {
            self.device.set_seed(seed)?;
        }

        debug!(width, height, steps, guidance, "running flux pipeline");

        let noise_img =
            sampling::get_noise(1, height, width, &self.device)?.to_dtype(self.dtype)?;

        // --- T5 embedding ---
        let t5_ids = self
            .t5_tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let mut t5_tokens = truncate_tokens(t5_ids, self.variant.t5_length());
        t5_tokens.resize(self.variant.t5_length(), 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self
            .t5_model
            .lock()
            .map_err(|_| anyhow!("T5 encoder lock poisoned"))?
            .forward(&input_token_ids)?;

        // --- CLIP embedding ---
        let clip_ids = self
            .clip_tokenizer
            .encode(request.prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let clip_tokens = truncate_tokens(clip_ids, CLIP_MAX_TOKENS);
        let input_token_ids_clip = Tensor::new(&*clip_tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_token_ids_clip)?;

        // --- Sampling state and schedule ---
        let state = sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = match self.variant {
            FluxVariant::Schnell => sampling::get_schedule(steps, None),
            FluxVariant::Dev => sampling::get_schedule(steps, Some((state.img.dim(1)?, 0.5, 1.15))),
        };

        let latent_img = sampling::denoise(
            &self.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            guidance,
        )?;
        let unpacked = sampling::unpack(&latent_img, height, width)?;
        debug!("generated latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        debug!("decoded image");

        // --- Postprocessing: clamp, scale, convert type ---
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        let img_tensor = img.i(0)?;

        Ok(vec![tensor_to_image(&img_tensor)?])
    }
}

fn mmap_weights(
    files: &[std::path::PathBuf],
    dtype: DType,
    device: &Device,
) -> Result<VarBuilder<'static>> {
    // SAFETY: weight files are not modified while the pipeline is alive.
    let vb = unsafe { VarBuilder::from_mmaped_safetensors(files, dtype, device)? };
    Ok(vb)
}

pub struct FluxLoader;

impl Loader for FluxLoader {
    type Pipeline = FluxPipeline;

    async fn load(source: &ModelSource, device: Device) -> Result<Self::Pipeline> {
        let dtype = device.bf16_default_to_f32();

        // --- Flux transformer, the variant follows its weights ---
        let flux_model_file = match source.try_get("flux1-schnell.safetensors").await? {
            Some(file) => file,
            None => source
                .get("flux1-dev.safetensors")
                .await
                .context("failed to get flux model file")?,
        };
        let flux_vb = mmap_weights(&[flux_model_file], dtype, &device)
            .context("failed to build flux var builder")?;
        let variant = if flux_vb.contains_tensor("guidance_in.in_layer.weight") {
            FluxVariant::Dev
        } else {
            FluxVariant::Schnell
        };
        info!(?variant, ?dtype, "loading flux pipeline");
        let flux_config = match variant {
            FluxVariant::Schnell => model::Config::schnell(),
            FluxVariant::Dev => model::Config::dev(),
        };
        let flux_model = Flux::new(&flux_config, flux_vb).context("failed to load flux model")?;

        // --- Autoencoder ---
        let autoencoder_model_file = source
            .get("ae.safetensors")
            .await
            .context("failed to get autoencoder model file")?;
        let autoencoder_vb = mmap_weights(&[autoencoder_model_file], dtype, &device)
            .context("failed to build autoencoder var builder")?;
        let autoencoder_config = match variant {
            FluxVariant::Schnell => autoencoder::Config::schnell(),
            FluxVariant::Dev => autoencoder::Config::dev(),
        };
        let autoencoder = AutoEncoder::new(&autoencoder_config, autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- T5 model and tokenizer ---
        let t5_files = source
            .get_weights("text_encoder_2", "model")
            .await
            .context("failed to get T5 model files")?;
        let t5_vb =
            mmap_weights(&t5_files, dtype, &device).context("failed to build T5 var builder")?;
        let t5_config: t5::Config = source
            .read_json("text_encoder_2/config.json")
            .await?
            .context("failed to get T5 config")?;
        let t5_model =
            T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer_file = source
            .get("tokenizer_2/tokenizer.json")
            .await
            .context("failed to get T5 tokenizer")?;
        let t5_tokenizer = Tokenizer::from_file(t5_tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        // --- CLIP model and tokenizer ---
        let clip_model_file = source
            .get("text_encoder/model.safetensors")
            .await
            .context("failed to get CLIP model file")?;
        let clip_vb = mmap_weights(&[clip_model_file], dtype, &device)
            .context("failed to build CLIP var builder")?;
        let clip_config = ClipTextConfig {
            vocab_size: 49408,
            projection_dim: 768,
            activation: Activation::QuickGelu,
            intermediate_size: 3072,
            embed_dim: 768,
            max_position_embeddings: CLIP_MAX_TOKENS,
            pad_with: None,
            num_hidden_layers: 12,
            num_attention_heads: 12,
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
            .context("failed to load CLIP model")?;
        let clip_tokenizer_file = source
            .get_with_fallback("tokenizer/tokenizer.json", CLIP_TOKENIZER_REPO, "tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let clip_tokenizer = Tokenizer::from_file(clip_tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        Ok(FluxPipeline {
            variant,
            device,
            dtype,
            t5_model: Mutex::new(t5_model),
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
            autoencoder,
            flux_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_size_must_be_a_positive_multiple_of_16() {
        assert!(check_size(1360, 768).is_ok());
        assert!(check_size(16, 16).is_ok());
        for (width, height) in [(0, 768), (1360, 0), (0, 0), (1000, 768), (1360, 770)] {
            let err = check_size(width, height).unwrap_err();
            assert!(err.to_string().contains("positive multiples of 16"), "{width}x{height}");
        }
    }

    #[test]
    fn variants_carry_their_defaults() {
        assert_eq!(FluxVariant::Schnell.default_steps(), 4);
        assert_eq!(FluxVariant::Dev.default_guidance(), 3.5);
        assert_eq!(FluxVariant::Dev.t5_length(), 512);
    }
}
