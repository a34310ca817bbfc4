//! The program catalog.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::error::{GenerationError, Result};
use crate::ids::ProgramId;
use crate::program::{OverlaySpec, PipelineKind, PreviewPolicy, ProgramSpec};

const LORA_SIZES: [(u32, u32); 4] = [(800, 600), (600, 800), (1024, 576), (576, 1024)];

/// Immutable lookup table from program id to [`ProgramSpec`].
#[derive(Debug, Clone, Default)]
pub struct ProgramCatalog {
    programs: BTreeMap<ProgramId, ProgramSpec>,
}

impl ProgramCatalog {
    /// Builds a catalog from a list of entries, validating each.
    ///
    /// Later entries replace earlier ones with the same id.
    pub fn from_specs(specs: impl IntoIterator<Item = ProgramSpec>) -> Result<Self> {
        let mut catalog = Self::default();
        for spec in specs {
            catalog.insert(spec)?;
        }
        Ok(catalog)
    }

    /// The programs the installation ships with.
    pub fn builtin() -> Self {
        let programs = builtin_specs()
            .into_iter()
            .map(|spec| (spec.id.clone(), spec))
            .collect();
        Self { programs }
    }

    /// Adds or replaces one entry.
    pub fn insert(&mut self, spec: ProgramSpec) -> Result<()> {
        spec.validate()?;
        self.programs.insert(spec.id.clone(), spec);
        Ok(())
    }

    /// Overlays `other` on top of this catalog; entries in `other` win.
    pub fn merge(mut self, other: ProgramCatalog) -> Self {
        self.programs.extend(other.programs);
        self
    }

    /// Looks up a program.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::UnknownProgram` when the id is not registered.
    pub fn get(&self, id: &ProgramId) -> Result<&ProgramSpec> {
        self.programs
            .get(id)
            .ok_or_else(|| GenerationError::unknown_program(id.as_str()))
    }

    pub fn contains(&self, id: &ProgramId) -> bool {
        self.programs.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &ProgramId> {
        self.programs.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProgramSpec> {
        self.programs.values()
    }

    pub fn len(&self) -> usize {
        self.programs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.programs.is_empty()
    }
}

fn chua_mia_tee_overlay() -> OverlaySpec {
    OverlaySpec {
        id: "chuamiatee".to_string(),
        weights: "heypoom/chuamiatee-1".to_string(),
        weight_name: Some("pytorch_lora_weights.safetensors".to_string()),
    }
}

fn spec(
    id: &str,
    model_id: &str,
    kind: PipelineKind,
    inference_steps: u32,
    (width, height): (u32, u32),
    prompt_template: &str,
    default_prompt: &str,
) -> ProgramSpec {
    ProgramSpec {
        id: ProgramId::new(id),
        model_id: model_id.to_string(),
        kind,
        inference_steps,
        guidance_scale: 7.5,
        width,
        height,
        prompt_template: prompt_template.to_string(),
        default_prompt: default_prompt.to_string(),
        strength: None,
        overlay: None,
        source_image: None,
        preview: PreviewPolicy::EveryStep,
        random_sizes: Vec::new(),
    }
}

fn builtin_specs() -> Vec<ProgramSpec> {
    let malaya = |id: &str, template: &str| ProgramSpec {
        strength: Some(0.8),
        source_image: Some(PathBuf::from("./malaya.png")),
        ..spec(
            id,
            "stable-diffusion-v1-5/stable-diffusion-v1-5",
            PipelineKind::Img2Img,
            15,
            (960, 800),
            template,
            "epic poem of malaya",
        )
    };
    let chua_mia_tee = |id: &str, template: &str| ProgramSpec {
        overlay: Some(chua_mia_tee_overlay()),
        random_sizes: LORA_SIZES.to_vec(),
        ..spec(
            id,
            "stabilityai/stable-diffusion-3.5-medium",
            PipelineKind::Lora,
            20,
            (800, 600),
            template,
            "chua mia tee painting",
        )
    };

    vec![
        spec(
            "P0",
            "stabilityai/stable-diffusion-3.5-large-turbo",
            PipelineKind::Text2Img,
            20,
            (1360, 768),
            "{{ prompt }}, photorealistic, high quality, detailed",
            "",
        ),
        malaya("P2", "{{ prompt }}, painting like epic poem of malaya"),
        malaya(
            "P2B",
            "{{ prompt }}, crowd of people in public space, painting like epic poem of malaya",
        ),
        chua_mia_tee("P3", "chua mia tee painting, {{ prompt }}"),
        chua_mia_tee("P3B", "chua mia tee painting, {{ prompt }}, photorealistic"),
        spec(
            "P4",
            "stabilityai/stable-diffusion-3.5-medium",
            PipelineKind::Text2Img,
            20,
            (1360, 768),
            "person, {{ prompt }}, photorealistic",
            "person",
        ),
    ]
}
