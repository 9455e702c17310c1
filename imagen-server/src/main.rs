use std::io::Cursor;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Json, State};
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use clap::Parser;
use image::DynamicImage;
use imagen_core::{
    EngineConfig, EngineRegistry, Generated, GenerationDefaults, GenerationRequest, Orchestrator,
};
use serde::Serialize;
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod schemas;

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Imagen text2image server")]
struct Args {
    /// Hub identifier of the generation model
    #[arg(long, env = "MODEL_ID", default_value = "sd-legacy/stable-diffusion-v1-5")]
    model: String,

    /// Force an execution device (cpu|cuda|metal) instead of probing
    #[arg(long, env = "DEVICE")]
    device: Option<String>,

    /// Default image height when the request omits one
    #[arg(long, env = "SD_HEIGHT", default_value_t = 512)]
    height: usize,

    /// Default image width when the request omits one
    #[arg(long, env = "SD_WIDTH", default_value_t = 512)]
    width: usize,

    /// Default number of denoising steps
    #[arg(long, env = "SD_STEPS", default_value_t = 20)]
    steps: usize,

    /// Default guidance scale
    #[arg(long, env = "SD_GUIDANCE", default_value_t = 7.5)]
    guidance: f64,

    /// Comma-separated list of allowed CORS origins, `*` for any
    #[arg(long, env = "API_CORS_ORIGINS", default_value = "*")]
    cors_origins: String,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

// Application state holding the per-process orchestrator; the engines behind
// it are built lazily on the first request.
struct AppState {
    orchestrator: Orchestrator<EngineRegistry>,
}

#[derive(Serialize)]
struct ImageResponse {
    image_base64: String,
    seed: u64,
    clip_score: f32,
}

/// Encodes the raster as a base64 PNG for transport.
fn image_to_base64_png(img: &DynamicImage) -> Result<String> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(BASE64_STANDARD.encode(&bytes))
}

fn to_response(generated: &Generated) -> Result<ImageResponse> {
    Ok(ImageResponse {
        image_base64: image_to_base64_png(&generated.image)?,
        seed: generated.seed,
        clip_score: generated.score.value(),
    })
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn generate_handler(
    State(state): State<Arc<AppState>>,
    Json(request): Json<GenerationRequest>,
) -> Response {
    if let Err(e) = schemas::validate(&request) {
        return (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({ "detail": e.to_string() })),
        )
            .into_response();
    }
    match state.orchestrator.handle(request).await {
        Ok(generated) => match to_response(&generated) {
            Ok(response) => Json(response).into_response(),
            Err(e) => {
                error!(cause = %e, "failed to encode generated image");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "detail": format!("failed to encode image: {e:#}") })),
                )
                    .into_response()
            }
        },
        Err(e) => {
            error!(cause = %e, "generation request failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "detail": e.to_string() })),
            )
                .into_response()
        }
    }
}

fn cors_layer(origins: &str) -> Result<CorsLayer> {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.trim() == "*" {
        return Ok(layer.allow_origin(Any));
    }
    let parsed = origins
        .split(',')
        .map(|origin| origin.trim().parse::<HeaderValue>())
        .collect::<Result<Vec<_>, _>>()?;
    Ok(layer.allow_origin(AllowOrigin::list(parsed)))
}

fn router(state: Arc<AppState>, cors: CorsLayer) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/generate", post(generate_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let config = EngineConfig {
        model_id: args.model.clone(),
        device: args.device.clone(),
        defaults: GenerationDefaults {
            height: args.height,
            width: args.width,
            steps: args.steps,
            guidance: args.guidance,
        },
    };
    let defaults = config.defaults.clone();
    let state = Arc::new(AppState {
        orchestrator: Orchestrator::new(EngineRegistry::new(config), defaults),
    });

    let app = router(state, cors_layer(&args.cors_origins)?);

    // --- Start the server ---
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address).await?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
