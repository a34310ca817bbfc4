//! The engine boundary.
//!
//! An [`Engine`] owns the numerics: building pipelines, applying weight
//! overlays and running the denoising loop. The orchestrator only ever sees
//! opaque pipeline and latent handles.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::params::GenerationParams;
use crate::program::{OverlaySpec, ProgramSpec};

/// Passed to the step callback after every denoising step.
#[derive(Debug)]
pub struct StepUpdate<'a, L> {
    /// 1-based step index.
    pub step: u32,
    pub timestep: u32,
    pub latents: &'a L,
}

/// Returned by the step callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepControl {
    Continue,
    /// Stop after the current step. The engine may still return a partial artifact.
    Stop,
}

/// Output of a finished (or stopped) run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Encoded image bytes.
    pub image: Vec<u8>,
    pub steps_completed: u32,
}

/// A step-wise image generator.
///
/// All methods are blocking and are only ever called from worker threads.
pub trait Engine: Send + Sync + 'static {
    /// A loaded pipeline, exclusively owned by one session at a time.
    type Pipeline: Send + 'static;
    /// Intermediate latent state handed to the step callback.
    type Latents;

    fn load_pipeline(&self, spec: &ProgramSpec) -> Result<Self::Pipeline, EngineError>;

    fn load_overlay(
        &self,
        pipeline: &mut Self::Pipeline,
        overlay: &OverlaySpec,
    ) -> Result<(), EngineError>;

    fn unload_overlay(&self, pipeline: &mut Self::Pipeline) -> Result<(), EngineError>;

    /// Runs the denoising loop, invoking `on_step` after every step.
    ///
    /// When `on_step` returns [`StepControl::Stop`] the engine must not start
    /// another step. It then returns either a partial artifact or
    /// [`EngineError::Interrupted`].
    fn run_steps(
        &self,
        pipeline: &mut Self::Pipeline,
        params: &GenerationParams,
        on_step: &mut dyn FnMut(StepUpdate<'_, Self::Latents>) -> StepControl,
    ) -> Result<Artifact, EngineError>;

    /// Renders intermediate latents to an encoded preview image.
    fn decode_preview(&self, latents: &Self::Latents) -> Result<Vec<u8>, EngineError>;
}
