//! Generation program model.
//!
//! A program describes a fixed pipeline configuration: which model to load,
//! what kind of pipeline it is, how many denoising steps to run and how to
//! turn a user prompt into the final prompt string.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use strum::{AsRefStr, Display, EnumString};

use crate::error::{GenerationError, Result};
use crate::ids::ProgramId;

/// The pipeline family a program runs on.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString, AsRefStr,
)]
pub enum PipelineKind {
    #[serde(rename = "text2img")]
    #[strum(serialize = "text2img")]
    Text2Img,
    #[serde(rename = "img2img")]
    #[strum(serialize = "img2img")]
    Img2Img,
    #[serde(rename = "lora")]
    #[strum(serialize = "lora")]
    Lora,
}

/// Whether intermediate previews are decoded and streamed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PreviewPolicy {
    /// Decode and stream a preview after every step.
    #[default]
    EveryStep,
    /// Only progress events and the final image.
    FinalOnly,
}

/// A loadable weight overlay (LoRA adapter) applied on top of a pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OverlaySpec {
    /// Overlay identity; two overlays with the same id are interchangeable.
    pub id: String,
    /// Repository or path holding the weights.
    pub weights: String,
    /// Weight file name inside `weights`.
    #[serde(default)]
    pub weight_name: Option<String>,
}

fn default_guidance_scale() -> f32 {
    7.5
}

fn default_prompt_template() -> String {
    "{{ prompt }}".to_string()
}

/// A catalog entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgramSpec {
    pub id: ProgramId,
    pub model_id: String,
    pub kind: PipelineKind,
    pub inference_steps: u32,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f32,
    pub width: u32,
    pub height: u32,
    /// minijinja template; `prompt` is the only variable in scope.
    #[serde(default = "default_prompt_template")]
    pub prompt_template: String,
    /// Prompt used when a command carries none.
    #[serde(default)]
    pub default_prompt: String,
    /// img2img only: how far to move away from the source image.
    #[serde(default)]
    pub strength: Option<f32>,
    #[serde(default)]
    pub overlay: Option<OverlaySpec>,
    /// img2img only: the image denoising starts from.
    #[serde(default)]
    pub source_image: Option<PathBuf>,
    #[serde(default)]
    pub preview: PreviewPolicy,
    /// Candidate output sizes; when non-empty one is picked per job from the seed.
    #[serde(default)]
    pub random_sizes: Vec<(u32, u32)>,
}

impl ProgramSpec {
    /// Checks the entry for values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::Configuration` describing the first offending field.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(GenerationError::configuration(format!("{}: {msg}", self.id)));

        if self.model_id.trim().is_empty() {
            return fail("model_id is empty".into());
        }
        if self.inference_steps == 0 {
            return fail("inference_steps must be positive".into());
        }
        if self.width == 0 || self.height == 0 {
            return fail(format!("invalid size {}x{}", self.width, self.height));
        }
        if self.random_sizes.iter().any(|(w, h)| *w == 0 || *h == 0) {
            return fail("random_sizes contains an empty size".into());
        }
        if !self.guidance_scale.is_finite() || self.guidance_scale < 0.0 {
            return fail(format!("invalid guidance_scale {}", self.guidance_scale));
        }
        match self.kind {
            PipelineKind::Img2Img => match self.strength {
                Some(s) if s > 0.0 && s <= 1.0 => {}
                Some(s) => return fail(format!("strength {s} outside (0, 1]")),
                None => return fail("img2img programs need a strength".into()),
            },
            PipelineKind::Lora => {
                if self.overlay.is_none() {
                    return fail("lora programs need an overlay".into());
                }
            }
            PipelineKind::Text2Img => {}
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text2img() -> ProgramSpec {
        ProgramSpec {
            id: ProgramId::new("T1"),
            model_id: "model".into(),
            kind: PipelineKind::Text2Img,
            inference_steps: 4,
            guidance_scale: 7.5,
            width: 64,
            height: 64,
            prompt_template: default_prompt_template(),
            default_prompt: String::new(),
            strength: None,
            overlay: None,
            source_image: None,
            preview: PreviewPolicy::EveryStep,
            random_sizes: vec![],
        }
    }

    #[test]
    fn kind_strings() {
        assert_eq!(PipelineKind::Text2Img.to_string(), "text2img");
        assert_eq!("lora".parse::<PipelineKind>().unwrap(), PipelineKind::Lora);
        assert_eq!("final_only".parse::<PreviewPolicy>().unwrap(), PreviewPolicy::FinalOnly);
    }

    #[test]
    fn validate_rejects_zero_steps() {
        let mut spec = text2img();
        spec.inference_steps = 0;
        assert!(spec.validate().unwrap_err().is_configuration());
    }

    #[test]
    fn img2img_requires_strength_in_range() {
        let mut spec = text2img();
        spec.kind = PipelineKind::Img2Img;
        assert!(spec.validate().is_err());
        spec.strength = Some(1.5);
        assert!(spec.validate().is_err());
        spec.strength = Some(0.8);
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn toml_entry_uses_defaults() {
        let spec: ProgramSpec = toml::from_str(
            r#"
            id = "p5"
            model_id = "some/model"
            kind = "text2img"
            inference_steps = 10
            width = 512
            height = 512
            "#,
        )
        .unwrap();
        assert_eq!(spec.id.as_str(), "P5");
        assert_eq!(spec.guidance_scale, 7.5);
        assert_eq!(spec.prompt_template, "{{ prompt }}");
        assert_eq!(spec.preview, PreviewPolicy::EveryStep);
    }
}
