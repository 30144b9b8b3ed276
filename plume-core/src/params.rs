use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One generation request as sent by a client, kept verbatim.
///
/// Typing happens when the parameters are bound to a [`GenerationRequest`],
/// so the value always serializes back to the object it was parsed from.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GenerationParams(Map<String, Value>);

impl GenerationParams {
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    /// A `null` prompt counts as absent.
    pub fn has_prompt(&self) -> bool {
        self.get("prompt").is_some_and(|prompt| !prompt.is_null())
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }
}

impl From<Map<String, Value>> for GenerationParams {
    fn from(fields: Map<String, Value>) -> Self {
        Self(fields)
    }
}

/// The call signature every pipeline accepts.
#[derive(Clone, Debug, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub num_inference_steps: Option<usize>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub seed: Option<u64>,
}

// Counts arrive as any JSON number; whole floats such as `10.0` are accepted.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Binding {
    prompt: Option<String>,
    negative_prompt: Option<String>,
    num_inference_steps: Option<f64>,
    width: Option<f64>,
    height: Option<f64>,
    guidance_scale: Option<f64>,
    seed: Option<u64>,
}

fn whole(name: &str, value: Option<f64>) -> Result<Option<usize>> {
    match value {
        None => Ok(None),
        Some(v) if v >= 0.0 && v.fract() == 0.0 && v <= usize::MAX as f64 => Ok(Some(v as usize)),
        Some(v) => bail!("{name} must be a non-negative integer, got {v}"),
    }
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            num_inference_steps: None,
            width: None,
            height: None,
            guidance_scale: None,
            seed: None,
        }
    }

    /// Binds client parameters to the pipeline signature. Keys outside the
    /// signature and values of the wrong type are rejected.
    pub fn from_params(params: &GenerationParams) -> Result<Self> {
        let binding: Binding = serde_json::from_value(Value::Object(params.as_map().clone()))
            .context("unsupported generation parameters")?;
        Ok(Self {
            prompt: binding.prompt.context("generation parameters have no prompt")?,
            negative_prompt: binding.negative_prompt,
            num_inference_steps: whole("num_inference_steps", binding.num_inference_steps)?,
            width: whole("width", binding.width)?,
            height: whole("height", binding.height)?,
            guidance_scale: binding.guidance_scale,
            seed: binding.seed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(value: Value) -> GenerationParams {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn params_serialize_back_unchanged() {
        let instance = json!({
            "prompt": "photo of the beach",
            "negative_prompt": "ugly, deformed",
            "num_inference_steps": 60,
            "guidance_scale": 7.0,
            "style": "watercolor"
        });
        let parsed = params(instance.clone());
        assert_eq!(parsed.get("num_inference_steps"), Some(&json!(60)));
        assert!(parsed.has_prompt());
        assert_eq!(serde_json::to_value(&parsed).unwrap(), instance);
    }

    #[test]
    fn nulls_and_float_counts_survive_parsing() {
        for instance in [
            json!({"prompt": null, "num_inference_steps": 10}),
            json!({"prompt": "a", "num_inference_steps": 10.0}),
            json!({"prompt": "a", "negative_prompt": null, "width": "wide"}),
        ] {
            let parsed = params(instance.clone());
            assert_eq!(serde_json::to_value(&parsed).unwrap(), instance);
        }
        assert!(!params(json!({"prompt": null})).has_prompt());
        assert!(!params(json!({})).has_prompt());
    }

    #[test]
    fn request_picks_up_known_fields() {
        let request = GenerationRequest::from_params(&params(json!({
            "prompt": "a red ball",
            "negative_prompt": null,
            "num_inference_steps": 10.0,
            "width": 512,
            "height": 256,
            "guidance_scale": 3.5,
            "seed": 42
        })))
        .unwrap();
        assert_eq!(request.prompt, "a red ball");
        assert_eq!(request.negative_prompt, None);
        assert_eq!(request.num_inference_steps, Some(10));
        assert_eq!(request.width, Some(512));
        assert_eq!(request.height, Some(256));
        assert_eq!(request.guidance_scale, Some(3.5));
        assert_eq!(request.seed, Some(42));
    }

    #[test]
    fn request_rejects_fractional_counts() {
        let err = GenerationRequest::from_params(&params(json!({
            "prompt": "a red ball",
            "num_inference_steps": 10.5
        })))
        .unwrap_err();
        assert!(err.to_string().contains("num_inference_steps"));
        let negative = params(json!({"prompt": "x", "width": -8}));
        assert!(GenerationRequest::from_params(&negative).is_err());
    }

    #[test]
    fn request_rejects_unknown_keys_and_bad_types() {
        let err = GenerationRequest::from_params(&params(json!({
            "prompt": "a red ball",
            "strength": 0.3
        })))
        .unwrap_err();
        assert!(format!("{err:#}").contains("strength"));
        assert!(GenerationRequest::from_params(&params(json!({"prompt": 5}))).is_err());
    }

    #[test]
    fn request_requires_prompt() {
        assert!(GenerationRequest::from_params(&GenerationParams::default()).is_err());
        assert!(GenerationRequest::from_params(&params(json!({"prompt": null}))).is_err());
    }
}
