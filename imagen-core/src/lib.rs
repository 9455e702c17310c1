#[cfg(feature = "accelerate")]
extern crate accelerate_src;
#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

pub mod config;
pub mod device;
pub mod error;
pub mod orchestrator;
pub mod registry;
mod scorer;
mod sd;
mod util;

pub use config::{EngineConfig, GenerationDefaults};
pub use device::DeviceKind;
pub use error::{ConstructionError, GenerateError};
use image::DynamicImage;
pub use orchestrator::{Generated, Orchestrator};
pub use registry::{EngineProvider, EngineRegistry};
pub use scorer::ScoringEngine;
pub use sd::GenerationEngine;
use serde::{Deserialize, Serialize};
pub(crate) use util::*;

// Define the request/parameter types.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub height: Option<usize>,
    pub width: Option<usize>,
    pub num_inference_steps: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub seed: Option<u64>,
}

/// A request with every optional knob replaced by an explicit value, except
/// the negative prompt which stays optional. Built once per invocation and
/// not touched afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedParams {
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub height: usize,
    pub width: usize,
    pub steps: usize,
    pub guidance: f64,
    pub seed: u64,
}

/// Prompt-fidelity score attached to a generation result.
///
/// Scoring is an annotation, never a gate: when the scoring engine cannot
/// produce a value the result degrades to `Unavailable`, which serializes
/// as the 0.0 sentinel.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Score {
    Measured(f32),
    Unavailable,
}

impl Score {
    pub fn value(self) -> f32 {
        match self {
            Score::Measured(v) => v,
            Score::Unavailable => 0.0,
        }
    }
}

pub trait ImageGenerator: Send + Sync {
    fn generate(&self, params: &ResolvedParams) -> anyhow::Result<DynamicImage>;
}

pub trait FidelityScorer: Send + Sync {
    fn score(&self, image: &DynamicImage, prompt: &str) -> anyhow::Result<f32>;
}
