use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::Args;
use genstream_core::{Command, InterruptReason, PreviewPolicy, RawParams, SessionState, StepEvent};
use genstream_infrastructure::ConfigService;

use super::utils;

#[derive(Debug, Args)]
pub struct RunArgs {
    /// Program id, e.g. P3
    pub program: String,

    /// Prompt text (rendered through the program's template)
    #[arg(long)]
    pub prompt: Option<String>,

    /// Number of denoising steps
    #[arg(long)]
    pub steps: Option<u32>,

    /// img2img strength in (0, 1]
    #[arg(long)]
    pub strength: Option<f32>,

    #[arg(long)]
    pub seed: Option<u64>,

    /// Skip intermediate previews
    #[arg(long)]
    pub final_only: bool,

    /// Simulated per-step latency in milliseconds
    #[arg(long, default_value_t = 50)]
    pub step_delay_ms: u64,

    /// Write the final image (PPM) here
    #[arg(long, short)]
    pub output: Option<PathBuf>,
}

impl RunArgs {
    fn command(&self) -> Result<Command> {
        let raw = RawParams {
            prompt: self.prompt.clone(),
            strength: self.strength,
            steps: self.steps,
            seed: self.seed,
            preview: self.final_only.then_some(PreviewPolicy::FinalOnly),
            ..RawParams::default()
        };
        let params = serde_json::to_string(&raw).context("Failed to encode parameters")?;
        Ok(Command::new(self.program.as_str(), params))
    }
}

pub async fn run(config: &ConfigService, args: RunArgs) -> Result<()> {
    let manager = utils::build_manager(config, args.step_delay_ms)?;
    let handle = manager
        .run_headless(args.command()?)
        .with_context(|| format!("Failed to start program {}", args.program))?;

    println!("session {} ({})", handle.session_id(), handle.program_id());

    let flag = handle.interrupt_flag().clone();
    let ctrl_c = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            flag.raise(InterruptReason::Requested);
        }
    });

    let (mut events, completion) = handle.split();
    while let Some(event) = events.next_event().await {
        match event {
            StepEvent::Progress { step, timestep } => println!("step {step:>3}  t={timestep}"),
            StepEvent::Preview { step, image } => {
                println!("step {step:>3}  preview {} bytes", image.len());
            }
            StepEvent::Final { image } => {
                println!("final image {} bytes", image.len());
                if let Some(path) = &args.output {
                    std::fs::write(path, &image)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    println!("saved to {}", path.display());
                }
            }
            StepEvent::Error { cause } => eprintln!("error: {cause}"),
            StepEvent::Done { state } => println!("done ({state})"),
        }
    }
    ctrl_c.abort();

    let summary = completion.wait().await.context("Session task failed")?;
    let mean = summary
        .mean_step_duration()
        .map(|d| format!("{d:.1?}"))
        .unwrap_or_else(|| "-".to_string());
    println!(
        "{} steps in {:.2?} (mean step {mean})",
        summary.steps_completed, summary.total_duration
    );
    manager.evict_idle();

    if summary.state == SessionState::Failed {
        bail!("session {} failed", summary.session_id);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use genstream_core::PipelineKind;

    #[test]
    fn flags_become_json_params() {
        let args = RunArgs {
            program: "p3".into(),
            prompt: Some("harbour: dusk".into()),
            steps: Some(4),
            strength: None,
            seed: Some(9),
            final_only: true,
            step_delay_ms: 0,
            output: None,
        };
        let command = args.command().unwrap();
        assert_eq!(command.program_id.as_str(), "P3");

        let raw = RawParams::parse(PipelineKind::Lora, &command.params).unwrap();
        assert_eq!(raw.prompt.as_deref(), Some("harbour: dusk"));
        assert_eq!(raw.steps, Some(4));
        assert_eq!(raw.seed, Some(9));
        assert_eq!(raw.preview, Some(PreviewPolicy::FinalOnly));
    }
}
