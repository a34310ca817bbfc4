use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use genstream_core::engine::{Engine, StepControl, StepUpdate};
use genstream_core::{
    EngineError, GenerationError, GenerationParams, InterruptCheck, InterruptReason,
    PreviewPolicy, SendError, SessionRecord, SessionState, StepSender, Terminal,
};

/// Runs the step loop of one generation session.
///
/// The executor is blocking: it is meant to be called from a worker thread
/// (`tokio::task::spawn_blocking`) while the caller holds the pipeline
/// context. Whatever happens inside the engine, `run` always finishes the
/// sender, so the consumer sees exactly one terminal event followed by `Done`.
/// The one exception is a step-order violation on the channel, which is a bug
/// in the engine and is re-raised after the sender has been dropped.
pub struct SessionExecutor<E: Engine> {
    engine: Arc<E>,
}

impl<E: Engine> Clone for SessionExecutor<E> {
    fn clone(&self) -> Self {
        Self {
            engine: Arc::clone(&self.engine),
        }
    }
}

impl<E: Engine> SessionExecutor<E> {
    pub fn new(engine: Arc<E>) -> Self {
        Self { engine }
    }

    /// Executes the session to a terminal state.
    ///
    /// # Arguments
    ///
    /// * `pipeline` - The exclusively held pipeline
    /// * `params` - Resolved generation parameters
    /// * `check` - Polled at every step boundary
    /// * `record` - Session bookkeeping, updated in place
    /// * `sender` - The producer half of the session's event channel
    ///
    /// # Returns
    ///
    /// The terminal state that was also sent in `Done`.
    ///
    /// # Panics
    ///
    /// Re-raises a [`GenerationError::ChannelProtocolViolation`] panic from
    /// the step callback.
    pub fn run(
        &self,
        pipeline: &mut E::Pipeline,
        params: &GenerationParams,
        check: &InterruptCheck,
        record: &mut SessionRecord,
        mut sender: StepSender,
    ) -> SessionState {
        let session_id = record.session_id;
        sender.set_interrupt(check.flag().clone());

        if let Some(reason) = check.poll() {
            tracing::info!(target: "session", %session_id, %reason, "interrupted before start");
            return finish(
                record,
                sender,
                Terminal::Error(format!("interrupted before start: {reason}")),
                Outcome::Interrupted(reason),
            );
        }

        if let Err(err) = record.transition(SessionState::Running) {
            return finish(record, sender, Terminal::Error(err.to_string()), Outcome::Failed);
        }
        tracing::info!(
            target: "session",
            %session_id,
            program_id = %params.program_id,
            steps = params.num_inference_steps,
            "session running"
        );

        let mut observed: Option<InterruptReason> = None;
        let result = {
            let engine = &*self.engine;
            let on_step: &mut dyn FnMut(StepUpdate<'_, E::Latents>) -> StepControl = &mut |update| {
                record.record_step(update.step);
                tracing::trace!(target: "session", %session_id, step = update.step, "step");

                if let Err(err) = sender.progress(update.step, update.timestep) {
                    observed = rejected(check, err);
                    return StepControl::Stop;
                }
                if let Some(reason) = check.poll() {
                    observed = Some(reason);
                    return StepControl::Stop;
                }
                if params.preview == PreviewPolicy::EveryStep {
                    match engine.decode_preview(update.latents) {
                        Ok(image) => {
                            if let Err(err) = sender.preview(update.step, image) {
                                observed = rejected(check, err);
                                return StepControl::Stop;
                            }
                        }
                        Err(err) => {
                            tracing::warn!(
                                target: "session",
                                %session_id,
                                step = update.step,
                                error = %err,
                                "preview decoding failed, skipping"
                            );
                        }
                    }
                }
                StepControl::Continue
            };
            panic::catch_unwind(AssertUnwindSafe(|| {
                engine.run_steps(pipeline, params, on_step)
            }))
        };

        let (terminal, outcome) = match result {
            Ok(Ok(artifact)) => match observed {
                None => (Terminal::Final(artifact.image), Outcome::Completed),
                Some(reason) => (Terminal::Final(artifact.image), Outcome::Interrupted(reason)),
            },
            Ok(Err(err)) => match observed.or_else(|| check.flag().reason()) {
                Some(reason) => (
                    Terminal::Error(GenerationError::interrupted(reason).to_string()),
                    Outcome::Interrupted(reason),
                ),
                None if err == EngineError::Interrupted => (
                    Terminal::Error(GenerationError::from(err).to_string()),
                    Outcome::Interrupted(InterruptReason::Requested),
                ),
                None => {
                    tracing::error!(target: "session", %session_id, error = %err, "engine failed");
                    (
                        Terminal::Error(GenerationError::from(err).to_string()),
                        Outcome::Failed,
                    )
                }
            },
            Err(payload) if payload.is::<GenerationError>() => {
                tracing::error!(target: "session", %session_id, "step-event protocol violated, aborting worker");
                drop(sender);
                panic::resume_unwind(payload);
            }
            Err(payload) => {
                let message = format!("engine panicked: {}", panic_message(payload.as_ref()));
                tracing::error!(target: "session", %session_id, "{message}");
                (Terminal::Error(message), Outcome::Failed)
            }
        };

        finish(record, sender, terminal, outcome)
    }

    /// Ends a session that never reached the step loop, e.g. because its
    /// context or overlay could not be prepared.
    pub fn fail_before_start(
        &self,
        record: &mut SessionRecord,
        sender: StepSender,
        cause: impl std::fmt::Display,
    ) -> SessionState {
        tracing::warn!(
            target: "session",
            session_id = %record.session_id,
            %cause,
            "session failed before start"
        );
        finish(record, sender, Terminal::Error(cause.to_string()), Outcome::Failed)
    }
}

/// Maps a rejected put to the reason the session stops.
fn rejected(check: &InterruptCheck, err: SendError) -> Option<InterruptReason> {
    if err == SendError::Closed {
        check.flag().raise(InterruptReason::ConsumerGone);
    }
    check.flag().reason()
}

enum Outcome {
    Completed,
    Interrupted(InterruptReason),
    Failed,
}

fn finish(
    record: &mut SessionRecord,
    sender: StepSender,
    terminal: Terminal,
    outcome: Outcome,
) -> SessionState {
    let applied = match outcome {
        Outcome::Completed => record.transition(SessionState::Completed),
        Outcome::Interrupted(reason) => record.interrupt(reason),
        Outcome::Failed => record.transition(SessionState::Failed),
    };
    if let Err(err) = applied {
        tracing::error!(target: "session", session_id = %record.session_id, error = %err, "bad terminal transition");
    }
    let state = record.state();
    sender.finish(terminal, state);
    tracing::info!(
        target: "session",
        session_id = %record.session_id,
        %state,
        steps = record.current_step(),
        "session finished"
    );
    state
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
