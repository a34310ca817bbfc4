//! Command parameters and their resolution against a program.

use std::path::PathBuf;

use minijinja::{Environment, context};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{GenerationError, Result};
use crate::ids::ProgramId;
use crate::program::{OverlaySpec, PipelineKind, PreviewPolicy, ProgramSpec};

/// Parameters as sent by a client, before any defaults are applied.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RawParams {
    /// User prompt, substituted into the program's template.
    pub prompt: Option<String>,
    /// Full prompt; bypasses the template entirely.
    pub prompt_override: Option<String>,
    pub strength: Option<f32>,
    pub steps: Option<u32>,
    pub seed: Option<u64>,
    pub preview: Option<PreviewPolicy>,
}

impl RawParams {
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: Some(prompt.into()),
            ..Self::default()
        }
    }

    /// Parses the parameter part of a text command.
    ///
    /// An empty string means "all defaults". A string starting with `{` is
    /// read as a JSON object. Otherwise img2img programs read the text as a
    /// strength (falling back to the program default when it is not a
    /// number) and every other kind reads it as the prompt.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::Serialization` for malformed JSON.
    pub fn parse(kind: PipelineKind, raw: &str) -> Result<Self> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(Self::default());
        }
        if raw.starts_with('{') {
            return Ok(serde_json::from_str(raw)?);
        }
        match kind {
            PipelineKind::Img2Img => {
                let strength = raw.parse::<f32>().ok();
                if strength.is_none() {
                    tracing::warn!(raw, "img2img parameter is not a strength, using default");
                }
                Ok(Self {
                    strength,
                    ..Self::default()
                })
            }
            PipelineKind::Text2Img | PipelineKind::Lora => Ok(Self::with_prompt(raw)),
        }
    }
}

/// Fully resolved inputs for one engine run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationParams {
    pub program_id: ProgramId,
    pub kind: PipelineKind,
    pub prompt: String,
    pub num_inference_steps: u32,
    pub guidance_scale: f32,
    pub width: u32,
    pub height: u32,
    pub strength: Option<f32>,
    pub seed: u64,
    pub preview: PreviewPolicy,
    pub overlay: Option<OverlaySpec>,
    pub source_image: Option<PathBuf>,
}

impl GenerationParams {
    /// Applies `raw` on top of the program defaults.
    ///
    /// The prompt is rendered through the program's template unless
    /// `prompt_override` is set. Programs with `random_sizes` pick their
    /// output size from the seed, so the same seed always yields the same
    /// size.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::Configuration` for a broken template or an
    /// out-of-range override.
    pub fn resolve(spec: &ProgramSpec, raw: RawParams) -> Result<Self> {
        let seed = raw.seed.unwrap_or_else(rand::random);

        let prompt = match raw.prompt_override {
            Some(full) => full,
            None => {
                let user_prompt = raw
                    .prompt
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| spec.default_prompt.clone());
                render_prompt(&spec.prompt_template, &user_prompt)?
            }
        };

        let num_inference_steps = raw.steps.unwrap_or(spec.inference_steps);
        if num_inference_steps == 0 {
            return Err(GenerationError::configuration("steps must be positive"));
        }

        let strength = match spec.kind {
            PipelineKind::Img2Img => {
                let s = raw.strength.or(spec.strength).unwrap_or(0.8);
                if !(s > 0.0 && s <= 1.0) {
                    return Err(GenerationError::configuration(format!(
                        "strength {s} outside (0, 1]"
                    )));
                }
                Some(s)
            }
            _ => None,
        };

        let (width, height) = if spec.random_sizes.is_empty() {
            (spec.width, spec.height)
        } else {
            let mut rng = StdRng::seed_from_u64(seed);
            spec.random_sizes
                .choose(&mut rng)
                .copied()
                .unwrap_or((spec.width, spec.height))
        };

        Ok(Self {
            program_id: spec.id.clone(),
            kind: spec.kind,
            prompt,
            num_inference_steps,
            guidance_scale: spec.guidance_scale,
            width,
            height,
            strength,
            seed,
            preview: raw.preview.unwrap_or(spec.preview),
            overlay: spec.overlay.clone(),
            source_image: spec.source_image.clone(),
        })
    }
}

fn render_prompt(template: &str, prompt: &str) -> Result<String> {
    let env = Environment::new();
    let rendered = env.render_str(template, context! { prompt => prompt })?;
    Ok(rendered.trim().to_string())
}
