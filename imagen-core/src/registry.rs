use std::future::Future;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::info;

use crate::config::EngineConfig;
use crate::error::ConstructionError;
use crate::scorer::ScoringEngine;
use crate::sd::GenerationEngine;
use crate::{FidelityScorer, ImageGenerator};

/// One construct-once slot. The first caller runs the builder while any
/// concurrent callers wait; everyone shares the outcome afterwards, a failed
/// one included.
pub struct Lazy<T> {
    engine: &'static str,
    cell: OnceCell<Result<Arc<T>, ConstructionError>>,
}

impl<T> Lazy<T> {
    pub fn new(engine: &'static str) -> Self {
        Self {
            engine,
            cell: OnceCell::new(),
        }
    }

    pub async fn get_or_build<F, Fut>(&self, build: F) -> Result<Arc<T>, ConstructionError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let engine = self.engine;
        self.cell
            .get_or_init(|| async move {
                info!(engine, "constructing engine singleton");
                build().await.map(Arc::new).map_err(|e| ConstructionError {
                    engine,
                    cause: Arc::new(e),
                })
            })
            .await
            .clone()
    }
}

/// Hands out the shared engine singletons. The registry is the production
/// implementation; tests substitute doubles that skip model loading.
pub trait EngineProvider: Send + Sync {
    type Generator: ImageGenerator + 'static;
    type Scorer: FidelityScorer + 'static;

    fn generator(
        &self,
    ) -> impl Future<Output = Result<Arc<Self::Generator>, ConstructionError>> + Send;

    fn scorer(&self) -> impl Future<Output = Result<Arc<Self::Scorer>, ConstructionError>> + Send;
}

/// Process-wide engine singletons, built on first demand. Both engines are
/// too expensive to construct per request; there is intentionally no
/// hot-reload or teardown, the process exit reclaims everything.
pub struct EngineRegistry {
    config: EngineConfig,
    generator: Lazy<GenerationEngine>,
    scorer: Lazy<ScoringEngine>,
}

impl EngineRegistry {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            generator: Lazy::new("generation"),
            scorer: Lazy::new("scoring"),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl EngineProvider for EngineRegistry {
    type Generator = GenerationEngine;
    type Scorer = ScoringEngine;

    async fn generator(&self) -> Result<Arc<GenerationEngine>, ConstructionError> {
        self.generator
            .get_or_build(|| GenerationEngine::load(&self.config))
            .await
    }

    async fn scorer(&self) -> Result<Arc<ScoringEngine>, ConstructionError> {
        self.scorer
            .get_or_build(|| ScoringEngine::load(&self.config))
            .await
    }
}
