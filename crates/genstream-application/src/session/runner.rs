use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use genstream_core::{
    Engine, GenerationParams, InterruptCheck, InterruptFlag, InterruptReason, ProgramSpec,
    SessionId, SessionRecord, SessionState, SessionSummary, StepSender,
};
use genstream_execution::SessionExecutor;

use crate::connection::ConnectionRegistry;
use crate::pipeline::PipelineCache;

/// Interrupt flags of every session that has not finished yet.
#[derive(Debug, Default)]
pub(crate) struct LiveSessions {
    flags: Mutex<HashMap<SessionId, InterruptFlag>>,
}

impl LiveSessions {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, InterruptFlag>> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn insert(&self, session_id: SessionId, flag: InterruptFlag) {
        self.lock().insert(session_id, flag);
    }

    pub(crate) fn remove(&self, session_id: SessionId) {
        self.lock().remove(&session_id);
    }

    pub(crate) fn interrupt(&self, session_id: SessionId, reason: InterruptReason) -> bool {
        self.lock()
            .get(&session_id)
            .is_some_and(|flag| flag.raise(reason))
    }

    pub(crate) fn interrupt_all(&self, reason: InterruptReason) -> usize {
        self.lock()
            .values()
            .filter(|flag| flag.raise(reason))
            .count()
    }

    pub(crate) fn len(&self) -> usize {
        self.lock().len()
    }
}

/// Everything one session needs, moved onto its own task.
pub(crate) struct SessionTask<E: Engine> {
    pub(crate) cache: Arc<PipelineCache<E>>,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) live: Arc<LiveSessions>,
    pub(crate) executor: SessionExecutor<E>,
    pub(crate) spec: ProgramSpec,
    pub(crate) params: GenerationParams,
    pub(crate) check: InterruptCheck,
    pub(crate) record: SessionRecord,
    pub(crate) sender: StepSender,
}

impl<E: Engine> SessionTask<E> {
    /// Acquires the context, runs the worker and cleans up.
    ///
    /// The lease is released before the connection's active pointer is
    /// cleared, so a follow-up command never observes a finished session
    /// still holding its context.
    pub(crate) async fn run(self) -> SessionSummary {
        let SessionTask {
            cache,
            registry,
            live,
            executor,
            spec,
            params,
            check,
            mut record,
            sender,
        } = self;
        let session_id = record.session_id;
        let connection_id = record.connection_id;

        let record = 'run: {
            if let Some(reason) = check.poll() {
                abort_interrupted(&mut record, sender, reason);
                break 'run record;
            }

            let lease = match cache.acquire_unless(&spec, check.flag()).await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    let reason = check.flag().reason().unwrap_or(InterruptReason::Requested);
                    abort_interrupted(&mut record, sender, reason);
                    break 'run record;
                }
                Err(err) => {
                    tracing::warn!(target: "session", %session_id, error = %err, "could not acquire pipeline");
                    if let Err(err) = record.transition(SessionState::Failed) {
                        tracing::error!(target: "session", %session_id, error = %err, "bad transition");
                    }
                    sender.abort(err.to_string(), SessionState::Failed);
                    break 'run record;
                }
            };
            tracing::debug!(target: "session", %session_id, program_id = %spec.id, "pipeline acquired");

            let fallback = record.clone();
            let worker = tokio::task::spawn_blocking(move || {
                let mut lease = lease;
                let prepared = match lease.ensure_overlay(params.overlay.as_ref()) {
                    Ok(()) => lease.pipeline_mut(),
                    Err(err) => Err(err),
                };
                match prepared {
                    Ok(pipeline) => {
                        executor.run(pipeline, &params, &check, &mut record, sender);
                    }
                    Err(err) => {
                        executor.fail_before_start(&mut record, sender, err);
                    }
                }
                lease.release();
                record
            });

            match worker.await {
                Ok(record) => record,
                Err(err) => {
                    tracing::error!(target: "session", %session_id, error = %err, "session worker crashed");
                    let mut record = fallback;
                    if !record.state().is_terminal() {
                        let _ = record.transition(SessionState::Failed);
                    }
                    record
                }
            }
        };

        if let Some(connection_id) = connection_id {
            registry.clear_active(connection_id, session_id);
        }
        live.remove(session_id);
        record.summary()
    }
}

fn abort_interrupted(record: &mut SessionRecord, sender: StepSender, reason: InterruptReason) {
    tracing::info!(
        target: "session",
        session_id = %record.session_id,
        %reason,
        "interrupted before acquiring pipeline"
    );
    if let Err(err) = record.interrupt(reason) {
        tracing::error!(target: "session", session_id = %record.session_id, error = %err, "bad transition");
    }
    sender.abort(
        format!("interrupted before start: {reason}"),
        SessionState::Interrupted,
    );
}
