use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{HeaderMap, HeaderName, HeaderValue};
use plume_core::{
    image_to_base64_png, load_pipeline, select_best_device, Device, DeviceMap,
    GenerationParams, GenerationRequest, ImagePipeline, ModelSource, PipelineKind,
};
use serde_json::Value;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{AdapterError, AdapterResult};
use crate::protocol::{
    EncodedImage, InferenceResponse, Prediction, RequestEnvelope, PNG_FORMAT,
    REQUEST_TYPE_HEADER,
};

pub const DEFAULT_MODEL_ID: &str = "/mnt/models";

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Local directory or hub repository id of the model artifact.
    pub model_id: String,
    pub device_map: DeviceMap,
    /// Overrides pipeline detection.
    pub pipeline: Option<PipelineKind>,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            model_id: DEFAULT_MODEL_ID.to_string(),
            device_map: DeviceMap::default(),
            pipeline: None,
        }
    }
}

/// Serves one diffusion pipeline through the host's
/// load / preprocess / predict lifecycle.
///
/// The adapter is unready until `load` succeeds and ready from then on; the
/// bound pipeline is never replaced. Concurrent loads share one read of the
/// weights.
pub struct DiffusersModel {
    name: String,
    config: AdapterConfig,
    pipeline: OnceCell<Arc<dyn ImagePipeline>>,
}

impl DiffusersModel {
    pub fn new(name: impl Into<String>, config: AdapterConfig) -> Self {
        Self {
            name: name.into(),
            config,
            pipeline: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn model_id(&self) -> &str {
        &self.config.model_id
    }

    /// Polled by readiness checks.
    pub fn ready(&self) -> bool {
        self.pipeline.get().is_some()
    }

    pub async fn load(&self) -> Result<()> {
        let kind = self.config.pipeline;
        self.load_with(|source, device| async move {
            load_pipeline(&source, device, kind).await
        })
        .await
    }

    /// Runs the load lifecycle with a custom pipeline loader.
    pub async fn load_with<F, Fut>(&self, loader: F) -> Result<()>
    where
        F: FnOnce(ModelSource, Device) -> Fut,
        Fut: Future<Output = Result<Arc<dyn ImagePipeline>>>,
    {
        if self.ready() {
            debug!(name = %self.name, "model already loaded");
            return Ok(());
        }
        // Callers racing the first load wait here and share its pipeline.
        self.pipeline
            .get_or_try_init(|| async move {
                let model_id = &self.config.model_id;
                let source = ModelSource::resolve(model_id)?;
                let device = select_best_device(self.config.device_map)
                    .context("failed to set up device")?;
                let pipeline = loader(source, device)
                    .await
                    .with_context(|| format!("failed to load model {model_id}"))?;
                info!(name = %self.name, kind = %pipeline.kind(), %model_id, "model ready");
                Ok::<_, anyhow::Error>(pipeline)
            })
            .await?;
        Ok(())
    }

    /// Validates the request envelope and returns the first instance.
    pub fn preprocess(
        &self,
        payload: Value,
        headers: &mut HeaderMap,
    ) -> AdapterResult<GenerationParams> {
        match RequestEnvelope::parse(payload) {
            RequestEnvelope::V1(params) => {
                headers.insert(
                    HeaderName::from_static(REQUEST_TYPE_HEADER),
                    HeaderValue::from_static("v1"),
                );
                Ok(params)
            }
            RequestEnvelope::UnsupportedV2 => Err(AdapterError::InvalidInput(
                "v2 protocol not implemented".to_string(),
            )),
            RequestEnvelope::Invalid => {
                Err(AdapterError::InvalidInput("invalid payload".to_string()))
            }
        }
    }

    /// Generates one image. Blocks until the pipeline returns.
    pub fn predict(
        &self,
        params: GenerationParams,
        _headers: &HeaderMap,
    ) -> AdapterResult<InferenceResponse> {
        if !params.has_prompt() {
            return Err(AdapterError::MissingField("prompt"));
        }
        let pipeline = self
            .pipeline
            .get()
            .ok_or_else(|| AdapterError::NotReady(self.name.clone()))?;

        let request = GenerationRequest::from_params(&params)?;
        let image = pipeline
            .generate(&request)?
            .into_iter()
            .next()
            .context("pipeline returned no images")?;
        let b64 = image_to_base64_png(&image)?;

        Ok(InferenceResponse {
            predictions: vec![Prediction {
                model_name: self.config.model_id.clone(),
                prompt: request.prompt,
                image: EncodedImage {
                    format: PNG_FORMAT.to_string(),
                    b64,
                },
            }],
        })
    }
}
