//! Request and response envelopes of the v1 prediction protocol.
//!
//! ```json
//! { "instances": [ { "prompt": "photo of the beach", "num_inference_steps": 60 } ] }
//! ```

use plume_core::GenerationParams;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Header `preprocess` records the detected protocol version under.
pub const REQUEST_TYPE_HEADER: &str = "request-type";
pub const PNG_FORMAT: &str = "PNG";

/// Shape of an incoming request body.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestEnvelope {
    /// `{"instances": [...]}`; only the first instance is honored.
    V1(GenerationParams),
    /// A v2 `InferRequest` (`{"inputs": [...]}`).
    UnsupportedV2,
    Invalid,
}

impl RequestEnvelope {
    pub fn parse(payload: Value) -> Self {
        let Value::Object(mut body) = payload else {
            return Self::Invalid;
        };
        if let Some(instances) = body.remove("instances") {
            let first = match instances {
                Value::Array(instances) => instances.into_iter().next(),
                _ => None,
            };
            return match first {
                Some(Value::Object(instance)) => Self::V1(GenerationParams::from(instance)),
                _ => Self::Invalid,
            };
        }
        if body.get("inputs").is_some_and(Value::is_array) {
            return Self::UnsupportedV2;
        }
        Self::Invalid
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResponse {
    pub predictions: Vec<Prediction>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub model_name: String,
    pub prompt: String,
    pub image: EncodedImage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedImage {
    pub format: String,
    pub b64: String,
}
