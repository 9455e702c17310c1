use std::sync::Arc;

use thiserror::Error;

/// An engine singleton could not be built (missing model, unsupported
/// device). The registry caches this: every later acquisition observes the
/// same cause without re-running the builder, until operator intervention.
#[derive(Debug, Clone, Error)]
#[error("failed to construct {engine} engine: {cause:#}")]
pub struct ConstructionError {
    pub engine: &'static str,
    pub cause: Arc<anyhow::Error>,
}

/// Fatal outcome of a generation request. Scoring failures never appear
/// here; they degrade the score instead.
#[derive(Debug, Error)]
pub enum GenerateError {
    #[error(transparent)]
    Construction(#[from] ConstructionError),
    #[error("image generation failed: {0:#}")]
    Generation(anyhow::Error),
}
