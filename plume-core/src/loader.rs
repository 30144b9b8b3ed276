use std::future::Future;

use anyhow::Result;
use candle_core::Device;

use crate::{ImagePipeline, ModelSource};

pub trait Loader {
    type Pipeline: ImagePipeline;

    /// Reads the artifact from `source` and binds it to `device`.
    fn load(source: &ModelSource, device: Device) -> impl Future<Output = Result<Self::Pipeline>>
    where
        Self: Sized;
}
