use image::DynamicImage;
use rand::Rng;
use tokio::task;
use tracing::warn;

use crate::config::GenerationDefaults;
use crate::error::GenerateError;
use crate::registry::EngineProvider;
use crate::{FidelityScorer, GenerationRequest, ImageGenerator, ResolvedParams, Score};

/// Upper bound (exclusive) for autogenerated seeds.
pub const SEED_BOUND: u64 = 1 << 31;

/// Echo an explicit seed, or draw a fresh one when the request omits it.
pub fn resolve_seed(seed: Option<u64>) -> u64 {
    seed.unwrap_or_else(|| rand::thread_rng().gen_range(0..SEED_BOUND))
}

/// Merge request overrides with the environment-sourced defaults.
pub fn resolve_params(request: &GenerationRequest, defaults: &GenerationDefaults) -> ResolvedParams {
    ResolvedParams {
        prompt: request.prompt.clone(),
        negative_prompt: request.negative_prompt.clone(),
        height: request.height.unwrap_or(defaults.height),
        width: request.width.unwrap_or(defaults.width),
        steps: request.num_inference_steps.unwrap_or(defaults.steps),
        guidance: request.guidance_scale.unwrap_or(defaults.guidance),
        seed: resolve_seed(request.seed),
    }
}

/// A finished request: the image, the seed that produced it, and the
/// possibly-degraded fidelity score.
#[derive(Debug)]
pub struct Generated {
    pub image: DynamicImage,
    pub seed: u64,
    pub score: Score,
}

/// Per-request state machine: resolve, generate, best-effort score.
/// Holds no cross-request state beyond the engine provider itself.
pub struct Orchestrator<P> {
    provider: P,
    defaults: GenerationDefaults,
}

impl<P: EngineProvider> Orchestrator<P> {
    pub fn new(provider: P, defaults: GenerationDefaults) -> Self {
        Self { provider, defaults }
    }

    pub async fn handle(&self, request: GenerationRequest) -> Result<Generated, GenerateError> {
        let params = resolve_params(&request, &self.defaults);

        // Generation is fatal on failure: no fallback image exists.
        let generator = self.provider.generator().await?;
        let gen_params = params.clone();
        let image = task::spawn_blocking(move || generator.generate(&gen_params))
            .await
            .map_err(|e| {
                GenerateError::Generation(anyhow::Error::new(e).context("generation task failed"))
            })?
            .map_err(GenerateError::Generation)?;

        let score = self.score_or_degrade(&image, params.prompt.clone()).await;

        Ok(Generated {
            image,
            seed: params.seed,
            score,
        })
    }

    /// Scoring is a quality annotation, not a correctness gate: every failure
    /// on this path is logged and degraded to `Score::Unavailable`, so a
    /// successful generation is never retracted.
    async fn score_or_degrade(&self, image: &DynamicImage, prompt: String) -> Score {
        let scorer = match self.provider.scorer().await {
            Ok(scorer) => scorer,
            Err(e) => {
                warn!(cause = %e, "scoring engine unavailable, degrading score");
                return Score::Unavailable;
            }
        };
        let image = image.clone();
        match task::spawn_blocking(move || scorer.score(&image, &prompt)).await {
            Ok(Ok(value)) => Score::Measured(value),
            Ok(Err(e)) => {
                warn!(cause = %e, "scoring failed, degrading score");
                Score::Unavailable
            }
            Err(e) => {
                warn!(cause = %e, "scoring task failed, degrading score");
                Score::Unavailable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::Result;

    use super::*;
    use crate::error::ConstructionError;

    struct StubGenerator {
        fail: bool,
    }

    impl ImageGenerator for StubGenerator {
        fn generate(&self, params: &ResolvedParams) -> Result<DynamicImage> {
            if self.fail {
                anyhow::bail!("device out of memory");
            }
            Ok(DynamicImage::new_rgb8(
                params.width as u32,
                params.height as u32,
            ))
        }
    }

    struct StubScorer {
        fail: bool,
        value: f32,
    }

    impl FidelityScorer for StubScorer {
        fn score(&self, _image: &DynamicImage, _prompt: &str) -> Result<f32> {
            if self.fail {
                anyhow::bail!("unsupported image");
            }
            Ok(self.value)
        }
    }

    struct StubProvider {
        generator: Option<Arc<StubGenerator>>,
        scorer: Option<Arc<StubScorer>>,
    }

    fn broken(engine: &'static str) -> ConstructionError {
        ConstructionError {
            engine,
            cause: Arc::new(anyhow::anyhow!("weights missing")),
        }
    }

    impl EngineProvider for StubProvider {
        type Generator = StubGenerator;
        type Scorer = StubScorer;

        async fn generator(&self) -> Result<Arc<StubGenerator>, ConstructionError> {
            self.generator.clone().ok_or_else(|| broken("generation"))
        }

        async fn scorer(&self) -> Result<Arc<StubScorer>, ConstructionError> {
            self.scorer.clone().ok_or_else(|| broken("scoring"))
        }
    }

    fn working_provider() -> StubProvider {
        StubProvider {
            generator: Some(Arc::new(StubGenerator { fail: false })),
            scorer: Some(Arc::new(StubScorer {
                fail: false,
                value: 0.8,
            })),
        }
    }

    fn request(prompt: &str, seed: Option<u64>) -> GenerationRequest {
        GenerationRequest {
            prompt: prompt.to_string(),
            negative_prompt: None,
            height: Some(512),
            width: Some(512),
            num_inference_steps: Some(20),
            guidance_scale: Some(7.5),
            seed,
        }
    }

    #[test]
    fn autogenerated_seeds_stay_in_bound_and_vary() {
        let a = resolve_seed(None);
        let b = resolve_seed(None);
        assert!(a < SEED_BOUND);
        assert!(b < SEED_BOUND);
        assert_ne!(a, b);
        assert_eq!(resolve_seed(Some(42)), 42);
    }

    #[test]
    fn defaults_fill_omitted_fields_and_overrides_win() {
        let defaults = GenerationDefaults::default();
        let bare = GenerationRequest {
            prompt: "a fox".to_string(),
            negative_prompt: None,
            height: None,
            width: None,
            num_inference_steps: None,
            guidance_scale: None,
            seed: Some(7),
        };
        let resolved = resolve_params(&bare, &defaults);
        assert_eq!(resolved.height, defaults.height);
        assert_eq!(resolved.width, defaults.width);
        assert_eq!(resolved.steps, defaults.steps);
        assert_eq!(resolved.guidance, defaults.guidance);
        assert_eq!(resolved.seed, 7);

        let resolved = resolve_params(&request("a fox", Some(7)), &defaults);
        assert_eq!((resolved.height, resolved.width), (512, 512));
        assert_eq!(resolved.steps, 20);
        assert_eq!(resolved.guidance, 7.5);
    }

    #[tokio::test]
    async fn successful_generation_carries_a_measured_score() {
        let orchestrator = Orchestrator::new(working_provider(), GenerationDefaults::default());
        let out = orchestrator
            .handle(request("a red cube", Some(42)))
            .await
            .unwrap();
        assert_eq!(out.seed, 42);
        assert_eq!(out.score, Score::Measured(0.8));
        assert_eq!(out.image.to_rgb8().dimensions(), (512, 512));
    }

    #[tokio::test]
    async fn scoring_failure_degrades_the_score_only() {
        let provider = StubProvider {
            generator: Some(Arc::new(StubGenerator { fail: false })),
            scorer: Some(Arc::new(StubScorer {
                fail: true,
                value: 0.0,
            })),
        };
        let orchestrator = Orchestrator::new(provider, GenerationDefaults::default());
        let out = orchestrator
            .handle(request("a red cube", Some(1)))
            .await
            .unwrap();
        assert_eq!(out.score, Score::Unavailable);
        assert_eq!(out.score.value(), 0.0);
        assert_eq!(out.image.to_rgb8().dimensions(), (512, 512));
    }

    #[tokio::test]
    async fn scoring_construction_failure_degrades_the_score_only() {
        let provider = StubProvider {
            generator: Some(Arc::new(StubGenerator { fail: false })),
            scorer: None,
        };
        let orchestrator = Orchestrator::new(provider, GenerationDefaults::default());
        let out = orchestrator
            .handle(request("a red cube", Some(1)))
            .await
            .unwrap();
        assert_eq!(out.score, Score::Unavailable);
    }

    #[tokio::test]
    async fn generation_failure_is_fatal() {
        let provider = StubProvider {
            generator: Some(Arc::new(StubGenerator { fail: true })),
            scorer: Some(Arc::new(StubScorer {
                fail: false,
                value: 0.5,
            })),
        };
        let orchestrator = Orchestrator::new(provider, GenerationDefaults::default());
        let err = orchestrator
            .handle(request("a red cube", Some(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::Generation(_)));
    }

    #[tokio::test]
    async fn generator_construction_failure_is_fatal() {
        let provider = StubProvider {
            generator: None,
            scorer: Some(Arc::new(StubScorer {
                fail: false,
                value: 0.5,
            })),
        };
        let orchestrator = Orchestrator::new(provider, GenerationDefaults::default());
        let err = orchestrator
            .handle(request("a red cube", Some(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerateError::Construction(_)));
    }

    #[tokio::test]
    async fn omitted_seeds_differ_across_invocations() {
        let orchestrator = Orchestrator::new(working_provider(), GenerationDefaults::default());
        let first = orchestrator.handle(request("a fox", None)).await.unwrap();
        let second = orchestrator.handle(request("a fox", None)).await.unwrap();
        assert_ne!(first.seed, second.seed);
    }
}
