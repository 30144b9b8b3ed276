use clap::Parser;
use plume_core::{DeviceMap, PipelineKind};

use crate::adapter::{AdapterConfig, DEFAULT_MODEL_ID};

#[derive(Parser, Debug)]
#[command(author, version, about = "Plume image generation server")]
pub struct Args {
    /// Model artifact: a local directory or a hub repository id
    #[arg(long, env = "MODEL_ID", default_value = DEFAULT_MODEL_ID)]
    pub model_id: String,

    /// Name the model is served under
    #[arg(long, env = "MODEL_NAME", default_value = "model")]
    pub model_name: String,

    /// Pipeline class, read from model_index.json when unset
    #[arg(long, env = "PIPELINE_CLASS")]
    pub pipeline: Option<PipelineKind>,

    /// Use CPU instead of GPU
    #[arg(long)]
    pub cpu: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "0.0.0.0")]
    pub host: String,

    /// Port to bind the server to
    #[arg(long, env = "HTTP_PORT", default_value_t = 8080)]
    pub port: u16,
}

impl Args {
    pub fn adapter_config(&self) -> AdapterConfig {
        AdapterConfig {
            model_id: self.model_id.clone(),
            device_map: if self.cpu {
                DeviceMap::ForceCpu
            } else {
                DeviceMap::default()
            },
            pipeline: self.pipeline,
        }
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_build_the_adapter_config() {
        let args = Args::try_parse_from([
            "plume-server",
            "--model-id",
            "black-forest-labs/FLUX.1-schnell",
            "--model-name",
            "flux",
            "--pipeline",
            "FluxPipeline",
            "--cpu",
            "--host",
            "127.0.0.1",
            "--port",
            "9000",
        ])
        .unwrap();
        let config = args.adapter_config();
        assert_eq!(config.model_id, "black-forest-labs/FLUX.1-schnell");
        assert_eq!(config.device_map, DeviceMap::ForceCpu);
        assert_eq!(config.pipeline, Some(PipelineKind::FluxPipeline));
        assert_eq!(args.model_name, "flux");
        assert_eq!(args.bind_address(), "127.0.0.1:9000");
    }

    #[test]
    fn unknown_pipeline_class_is_rejected() {
        let result = Args::try_parse_from(["plume-server", "--pipeline", "UnCLIPPipeline"]);
        assert!(result.is_err());
    }
}
