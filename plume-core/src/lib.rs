pub mod device;
pub mod loader;
mod loader_factory;
pub mod params;
pub mod source;
mod util;

mod flux;
mod stable_diffusion;

pub use candle_core::Device;
pub use device::*;
pub use flux::FluxLoader;
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use params::*;
pub use source::ModelSource;
pub use stable_diffusion::StableDiffusionLoader;
pub use util::*;

/// A loaded, device-bound text-to-image pipeline.
pub trait ImagePipeline: Send + Sync {
    fn kind(&self) -> PipelineKind;

    /// Runs one generation and returns the produced images.
    fn generate(&self, request: &GenerationRequest) -> anyhow::Result<Vec<DynamicImage>>;
}
