/// Fallback values applied when a request leaves a generation knob unset.
/// Sourced from the environment by the hosting process.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationDefaults {
    pub height: usize,
    pub width: usize,
    pub steps: usize,
    pub guidance: f64,
}

impl Default for GenerationDefaults {
    fn default() -> Self {
        Self {
            height: 512,
            width: 512,
            steps: 20,
            guidance: 7.5,
        }
    }
}

/// Engine construction settings. The hosting process parses these from its
/// CLI/environment and hands them to the registry once at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Hub identifier of the diffusion model.
    pub model_id: String,
    /// Raw device override token (`cpu`/`cuda`/`metal`), if the operator set
    /// one. Unrecognized tokens fall back to hardware probing.
    pub device: Option<String>,
    pub defaults: GenerationDefaults,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model_id: "sd-legacy/stable-diffusion-v1-5".to_string(),
            device: None,
            defaults: GenerationDefaults::default(),
        }
    }
}
