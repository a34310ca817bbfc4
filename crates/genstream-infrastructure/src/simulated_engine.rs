//! A deterministic stand-in for a diffusion backend.
//!
//! The simulated engine walks a small latent tensor from seeded noise towards
//! a seeded target over `num_inference_steps` steps and renders latents with
//! the usual 4-channel to RGB projection. Images are binary PPM (`P6`).
//! Delays and faults are configurable so the orchestrator can be exercised
//! end to end without a GPU.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use genstream_core::engine::{Artifact, Engine, StepControl, StepUpdate};
use genstream_core::{EngineError, GenerationParams, OverlaySpec, ProgramId, ProgramSpec};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const LATENT_CHANNELS: usize = 4;

const RGB_WEIGHTS: [[f32; LATENT_CHANNELS]; 3] = [
    [60.0, -60.0, 25.0, -70.0],
    [60.0, -5.0, 15.0, -50.0],
    [60.0, 10.0, -5.0, -35.0],
];
const RGB_BIASES: [f32; 3] = [150.0, 140.0, 130.0];

#[derive(Debug, Clone)]
pub struct SimulatedEngineConfig {
    pub step_delay: Duration,
    pub load_delay: Duration,
    /// Edge length of the square latent tensor.
    pub latent_size: usize,
    /// Return a partial image instead of `EngineError::Interrupted` when stopped.
    pub partial_output: bool,
    pub fail_at_step: Option<u32>,
    pub panic_at_step: Option<u32>,
    pub fail_load: Vec<ProgramId>,
    pub fail_overlay: bool,
    pub fail_preview: bool,
}

impl Default for SimulatedEngineConfig {
    fn default() -> Self {
        Self {
            step_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            latent_size: 8,
            partial_output: false,
            fail_at_step: None,
            panic_at_step: None,
            fail_load: Vec::new(),
            fail_overlay: false,
            fail_preview: false,
        }
    }
}

/// A loaded simulated pipeline.
#[derive(Debug)]
pub struct SimulatedPipeline {
    program_id: ProgramId,
    overlay: Option<String>,
}

impl SimulatedPipeline {
    pub fn program_id(&self) -> &ProgramId {
        &self.program_id
    }

    pub fn overlay(&self) -> Option<&str> {
        self.overlay.as_deref()
    }
}

#[derive(Debug, Clone)]
pub struct SimulatedLatents {
    size: usize,
    /// Channel-major: `data[c * size * size + y * size + x]`.
    data: Vec<f32>,
}

/// Counters observed by tests and the CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub pipeline_loads: usize,
    pub overlay_loads: usize,
    pub overlay_unloads: usize,
    pub runs: usize,
    /// Highest number of simultaneous runs observed on any single program.
    pub max_concurrent_per_program: usize,
}

#[derive(Debug, Default)]
pub struct SimulatedEngine {
    config: SimulatedEngineConfig,
    pipeline_loads: AtomicUsize,
    overlay_loads: AtomicUsize,
    overlay_unloads: AtomicUsize,
    runs: AtomicUsize,
    max_concurrent: AtomicUsize,
    running: Mutex<HashMap<ProgramId, usize>>,
}

impl SimulatedEngine {
    pub fn new(config: SimulatedEngineConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn config(&self) -> &SimulatedEngineConfig {
        &self.config
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            pipeline_loads: self.pipeline_loads.load(Ordering::SeqCst),
            overlay_loads: self.overlay_loads.load(Ordering::SeqCst),
            overlay_unloads: self.overlay_unloads.load(Ordering::SeqCst),
            runs: self.runs.load(Ordering::SeqCst),
            max_concurrent_per_program: self.max_concurrent.load(Ordering::SeqCst),
        }
    }

    fn enter(&self, program_id: &ProgramId) -> RunGuard<'_> {
        let mut running = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        let count = running.entry(program_id.clone()).or_insert(0);
        *count += 1;
        self.max_concurrent.fetch_max(*count, Ordering::SeqCst);
        RunGuard {
            engine: self,
            program_id: program_id.clone(),
        }
    }

    fn noise(&self, seed: u64) -> Vec<f32> {
        let len = LATENT_CHANNELS * self.config.latent_size * self.config.latent_size;
        let mut rng = StdRng::seed_from_u64(seed);
        (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
    }
}

struct RunGuard<'a> {
    engine: &'a SimulatedEngine,
    program_id: ProgramId,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        let mut running = self
            .engine
            .running
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = running.get_mut(&self.program_id) {
            *count = count.saturating_sub(1);
        }
    }
}

impl Engine for SimulatedEngine {
    type Pipeline = SimulatedPipeline;
    type Latents = SimulatedLatents;

    fn load_pipeline(&self, spec: &ProgramSpec) -> Result<SimulatedPipeline, EngineError> {
        if !self.config.load_delay.is_zero() {
            std::thread::sleep(self.config.load_delay);
        }
        if self.config.fail_load.contains(&spec.id) {
            return Err(EngineError::Unavailable(format!(
                "cannot load {}",
                spec.model_id
            )));
        }
        self.pipeline_loads.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(program_id = %spec.id, model_id = %spec.model_id, "simulated pipeline loaded");
        Ok(SimulatedPipeline {
            program_id: spec.id.clone(),
            overlay: None,
        })
    }

    fn load_overlay(
        &self,
        pipeline: &mut SimulatedPipeline,
        overlay: &OverlaySpec,
    ) -> Result<(), EngineError> {
        if let Some(current) = &pipeline.overlay {
            return Err(EngineError::Fault(format!(
                "overlay {current} still loaded"
            )));
        }
        if self.config.fail_overlay {
            return Err(EngineError::Unavailable(format!(
                "cannot fetch {}",
                overlay.weights
            )));
        }
        self.overlay_loads.fetch_add(1, Ordering::SeqCst);
        pipeline.overlay = Some(overlay.id.clone());
        Ok(())
    }

    fn unload_overlay(&self, pipeline: &mut SimulatedPipeline) -> Result<(), EngineError> {
        if pipeline.overlay.take().is_some() {
            self.overlay_unloads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn run_steps(
        &self,
        pipeline: &mut SimulatedPipeline,
        params: &GenerationParams,
        on_step: &mut dyn FnMut(StepUpdate<'_, SimulatedLatents>) -> StepControl,
    ) -> Result<Artifact, EngineError> {
        let wanted = params.overlay.as_ref().map(|o| o.id.as_str());
        if pipeline.overlay.as_deref() != wanted {
            return Err(EngineError::Fault(format!(
                "pipeline overlay {:?} does not match requested {:?}",
                pipeline.overlay, wanted
            )));
        }

        let _guard = self.enter(&pipeline.program_id);
        self.runs.fetch_add(1, Ordering::SeqCst);

        let total = params.num_inference_steps;
        let noise = self.noise(params.seed);
        let target = self.noise(params.seed.wrapping_add(1));
        let mut latents = SimulatedLatents {
            size: self.config.latent_size,
            data: noise.clone(),
        };

        for step in 1..=total {
            if !self.config.step_delay.is_zero() {
                std::thread::sleep(self.config.step_delay);
            }
            if self.config.panic_at_step == Some(step) {
                panic!("simulated engine crashed at step {step}");
            }
            if self.config.fail_at_step == Some(step) {
                return Err(EngineError::OutOfMemory(format!(
                    "simulated allocation failure at step {step}"
                )));
            }

            let t = step as f32 / total as f32;
            for (value, (n, g)) in latents.data.iter_mut().zip(noise.iter().zip(&target)) {
                *value = n * (1.0 - t) + g * t;
            }
            let timestep = 1000 * (total - step) / total;

            let control = on_step(StepUpdate {
                step,
                timestep,
                latents: &latents,
            });
            if control == StepControl::Stop {
                if self.config.partial_output {
                    return Ok(Artifact {
                        image: encode_ppm(&latents),
                        steps_completed: step,
                    });
                }
                return Err(EngineError::Interrupted);
            }
        }

        Ok(Artifact {
            image: encode_ppm(&latents),
            steps_completed: total,
        })
    }

    fn decode_preview(&self, latents: &SimulatedLatents) -> Result<Vec<u8>, EngineError> {
        if self.config.fail_preview {
            return Err(EngineError::Fault("preview decoder unavailable".to_string()));
        }
        Ok(encode_ppm(latents))
    }
}

/// Projects latents to RGB and encodes them as a binary PPM image.
pub fn encode_ppm(latents: &SimulatedLatents) -> Vec<u8> {
    let size = latents.size;
    let plane = size * size;
    let mut out = format!("P6\n{size} {size}\n255\n").into_bytes();
    out.reserve(plane * 3);
    for pixel in 0..plane {
        for (weights, bias) in RGB_WEIGHTS.iter().zip(RGB_BIASES) {
            let value = weights
                .iter()
                .enumerate()
                .map(|(c, w)| w * latents.data[c * plane + pixel])
                .sum::<f32>()
                + bias;
            out.push(value.clamp(0.0, 255.0) as u8);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use genstream_core::{ProgramCatalog, RawParams};

    fn params(id: &str, steps: u32) -> (ProgramSpec, GenerationParams) {
        let spec = ProgramCatalog::builtin()
            .get(&ProgramId::new(id))
            .unwrap()
            .clone();
        let raw = RawParams {
            steps: Some(steps),
            seed: Some(1),
            ..RawParams::default()
        };
        let params = GenerationParams::resolve(&spec, raw).unwrap();
        (spec, params)
    }

    #[test]
    fn runs_all_steps_with_decreasing_timesteps() {
        let engine = SimulatedEngine::default();
        let (spec, params) = params("P4", 4);
        let mut pipeline = engine.load_pipeline(&spec).unwrap();

        let mut seen = Vec::new();
        let artifact = engine
            .run_steps(&mut pipeline, &params, &mut |u| {
                seen.push((u.step, u.timestep));
                StepControl::Continue
            })
            .unwrap();

        assert_eq!(seen, vec![(1, 750), (2, 500), (3, 250), (4, 0)]);
        assert_eq!(artifact.steps_completed, 4);
        assert!(artifact.image.starts_with(b"P6\n8 8\n255\n"));
        assert_eq!(engine.stats().runs, 1);
    }

    #[test]
    fn stop_without_partial_output_is_interrupted() {
        let engine = SimulatedEngine::default();
        let (spec, params) = params("P0", 10);
        let mut pipeline = engine.load_pipeline(&spec).unwrap();
        let mut calls = 0;
        let result = engine.run_steps(&mut pipeline, &params, &mut |_| {
            calls += 1;
            StepControl::Stop
        });
        assert_eq!(result, Err(EngineError::Interrupted));
        assert_eq!(calls, 1);
    }

    #[test]
    fn overlay_must_be_applied_before_running() {
        let engine = SimulatedEngine::default();
        let (spec, params) = params("P3", 2);
        let mut pipeline = engine.load_pipeline(&spec).unwrap();
        let result = engine.run_steps(&mut pipeline, &params, &mut |_| StepControl::Continue);
        assert!(matches!(result, Err(EngineError::Fault(_))));

        let overlay = spec.overlay.as_ref().unwrap();
        engine.load_overlay(&mut pipeline, overlay).unwrap();
        assert!(engine.load_overlay(&mut pipeline, overlay).is_err());
        assert_eq!(pipeline.overlay(), Some("chuamiatee"));
        engine
            .run_steps(&mut pipeline, &params, &mut |_| StepControl::Continue)
            .unwrap();
    }

    #[test]
    fn same_seed_same_image() {
        let engine = SimulatedEngine::default();
        let (spec, params) = params("P4", 3);
        let mut pipeline = engine.load_pipeline(&spec).unwrap();
        let a = engine.run_steps(&mut pipeline, &params, &mut |_| StepControl::Continue).unwrap();
        let b = engine.run_steps(&mut pipeline, &params, &mut |_| StepControl::Continue).unwrap();
        assert_eq!(a.image, b.image);
    }

    #[test]
    fn load_failure_is_unavailable() {
        let engine = SimulatedEngine::new(SimulatedEngineConfig {
            fail_load: vec![ProgramId::new("P0")],
            ..SimulatedEngineConfig::default()
        });
        let (spec, _) = params("P0", 1);
        assert!(matches!(engine.load_pipeline(&spec), Err(EngineError::Unavailable(_))));
        assert_eq!(engine.stats().pipeline_loads, 0);
    }
}
