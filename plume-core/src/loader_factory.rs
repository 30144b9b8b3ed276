use std::sync::Arc;

use anyhow::{anyhow, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{FluxLoader, ImagePipeline, Loader, ModelSource, StableDiffusionLoader};

/// Supported pipelines, named after the diffusers classes that declare them
/// in `model_index.json`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PipelineKind {
    FluxPipeline,
    StableDiffusionPipeline,
}

serde_plain::derive_fromstr_from_deserialize!(PipelineKind);
serde_plain::derive_display_from_serialize!(PipelineKind);

impl PipelineKind {
    /// Detect pipeline kind from model name
    pub fn from_name(model_name: &str) -> Option<Self> {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            Some(PipelineKind::FluxPipeline)
        } else if name_upper.contains("STABLE-DIFFUSION")
            || name_upper.contains("STABLE_DIFFUSION")
            || name_upper.split(|c: char| !c.is_ascii_alphanumeric()).any(is_sd_token)
        {
            Some(PipelineKind::StableDiffusionPipeline)
        } else {
            None
        }
    }
}

/// `SD`, `SD15`, `SD2`, but not `SDXL` or `ASD`.
fn is_sd_token(token: &str) -> bool {
    token
        .strip_prefix("SD")
        .is_some_and(|rest| rest.chars().all(|c| c.is_ascii_digit()))
}

#[derive(Deserialize)]
struct ModelIndex {
    #[serde(rename = "_class_name")]
    class_name: String,
}

/// Reads the pipeline class from `model_index.json`, falling back to the
/// model name when the artifact has no index.
pub async fn detect_pipeline(source: &ModelSource) -> Result<PipelineKind> {
    if let Some(index) = source.read_json::<ModelIndex>("model_index.json").await? {
        return index
            .class_name
            .parse()
            .map_err(|_| anyhow!("unsupported pipeline class: {}", index.class_name));
    }
    PipelineKind::from_name(&source.to_string())
        .ok_or_else(|| anyhow!("cannot detect the pipeline of {source}: no model_index.json"))
}

/// Load a pipeline from `source`, detecting its kind unless one is given.
pub async fn load_pipeline(
    source: &ModelSource,
    device: Device,
    kind: Option<PipelineKind>,
) -> Result<Arc<dyn ImagePipeline>> {
    let kind = match kind {
        Some(kind) => kind,
        None => detect_pipeline(source).await?,
    };

    info!(%kind, %source, "loading pipeline");

    match kind {
        PipelineKind::FluxPipeline => {
            let pipeline = FluxLoader::load(source, device).await?;
            Ok(Arc::new(pipeline))
        }
        PipelineKind::StableDiffusionPipeline => {
            let pipeline = StableDiffusionLoader::load(source, device).await?;
            Ok(Arc::new(pipeline))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn parses_diffusers_class_names() {
        assert_eq!(
            "FluxPipeline".parse::<PipelineKind>().unwrap(),
            PipelineKind::FluxPipeline
        );
        assert_eq!(
            PipelineKind::StableDiffusionPipeline.to_string(),
            "StableDiffusionPipeline"
        );
        assert!("StableDiffusionXLPipeline".parse::<PipelineKind>().is_err());
    }

    #[test]
    fn detects_kind_from_name() {
        assert_eq!(
            PipelineKind::from_name("black-forest-labs/FLUX.1-schnell"),
            Some(PipelineKind::FluxPipeline)
        );
        assert_eq!(
            PipelineKind::from_name("stabilityai/stable-diffusion-2-1"),
            Some(PipelineKind::StableDiffusionPipeline)
        );
        assert_eq!(PipelineKind::from_name("/mnt/models"), None);
    }

    #[test]
    fn sd_shorthand_matches_whole_name_parts_only() {
        for name in ["runwayml/sd-v1-5", "models/SD2.1", "sd15_base", "my/SD"] {
            assert_eq!(
                PipelineKind::from_name(name),
                Some(PipelineKind::StableDiffusionPipeline),
                "{name}"
            );
        }
        for name in ["stabilityai/sdxl-turbo", "/mnt/models/asdf", "vsd-encoder", "sdv1"] {
            assert_eq!(PipelineKind::from_name(name), None, "{name}");
        }
    }

    #[tokio::test]
    async fn model_index_wins_over_name() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("flux-lookalike");
        fs::create_dir(&dir).unwrap();
        fs::write(
            dir.join("model_index.json"),
            r#"{"_class_name": "StableDiffusionPipeline", "_diffusers_version": "0.6.0"}"#,
        )
        .unwrap();
        let source = ModelSource::resolve(dir.to_str().unwrap()).unwrap();
        assert_eq!(
            detect_pipeline(&source).await.unwrap(),
            PipelineKind::StableDiffusionPipeline
        );
    }

    #[tokio::test]
    async fn falls_back_to_directory_name() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("FLUX.1-dev");
        fs::create_dir(&dir).unwrap();
        let source = ModelSource::resolve(dir.to_str().unwrap()).unwrap();
        assert_eq!(
            detect_pipeline(&source).await.unwrap(),
            PipelineKind::FluxPipeline
        );
    }

    #[tokio::test]
    async fn unsupported_class_is_an_error() {
        let root = tempfile::tempdir().unwrap();
        fs::write(
            root.path().join("model_index.json"),
            r#"{"_class_name": "KandinskyPipeline"}"#,
        )
        .unwrap();
        let source = ModelSource::resolve(root.path().to_str().unwrap()).unwrap();
        let err = detect_pipeline(&source).await.unwrap_err();
        assert!(err.to_string().contains("KandinskyPipeline"));
    }
}
