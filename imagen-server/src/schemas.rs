//! Request validation. Malformed or out-of-range requests are rejected here
//! and never reach the engines.

use imagen_core::GenerationRequest;
use thiserror::Error;

pub const DIM_RANGE: (usize, usize) = (128, 2048);
pub const STEPS_RANGE: (usize, usize) = (1, 150);
pub const GUIDANCE_RANGE: (f64, f64) = (0.0, 30.0);

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("prompt must not be empty")]
    EmptyPrompt,
    #[error("{field} must lie within [{min}, {max}]")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
    },
    #[error("{field} must be a multiple of 8")]
    NotMultipleOfEight { field: &'static str },
}

fn check_dimension(field: &'static str, value: usize) -> Result<(), ValidationError> {
    let (min, max) = DIM_RANGE;
    if value < min || value > max {
        return Err(ValidationError::OutOfRange {
            field,
            min: min as f64,
            max: max as f64,
        });
    }
    // The diffusion model tiles its latent space in 8-pixel units.
    if value % 8 != 0 {
        return Err(ValidationError::NotMultipleOfEight { field });
    }
    Ok(())
}

pub fn validate(request: &GenerationRequest) -> Result<(), ValidationError> {
    if request.prompt.trim().is_empty() {
        return Err(ValidationError::EmptyPrompt);
    }
    if let Some(height) = request.height {
        check_dimension("height", height)?;
    }
    if let Some(width) = request.width {
        check_dimension("width", width)?;
    }
    if let Some(steps) = request.num_inference_steps {
        let (min, max) = STEPS_RANGE;
        if steps < min || steps > max {
            return Err(ValidationError::OutOfRange {
                field: "num_inference_steps",
                min: min as f64,
                max: max as f64,
            });
        }
    }
    if let Some(guidance) = request.guidance_scale {
        let (min, max) = GUIDANCE_RANGE;
        if !(min..=max).contains(&guidance) {
            return Err(ValidationError::OutOfRange {
                field: "guidance_scale",
                min,
                max,
            });
        }
    }
    Ok(())
}
