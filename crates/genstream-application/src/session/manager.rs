use std::sync::Arc;

use genstream_core::{
    Command, ConnectionId, Engine, GenerationError, GenerationParams, InterruptCheck,
    InterruptFlag, InterruptReason, ProgramCatalog, ProgramSpec, RawParams, Result, SessionId,
    SessionRecord, SessionSettings, step_channel,
};
use genstream_execution::SessionExecutor;
use tracing::Instrument;

use super::handle::SessionHandle;
use super::runner::{LiveSessions, SessionTask};
use crate::connection::{ActiveSession, ConnectionRegistry};
use crate::pipeline::PipelineCache;

/// Routes commands to generation sessions.
///
/// `SessionManager` is responsible for:
/// - Resolving a command against the program catalog
/// - Superseding the connection's previous session
/// - Spawning the session task that acquires a context and runs the worker
/// - Explicit interrupts, eviction and shutdown
///
/// Sessions on the same program are serialized by the [`PipelineCache`];
/// sessions on different programs run concurrently.
pub struct SessionManager<E: Engine> {
    /// Live connections and the session each one owns
    registry: Arc<ConnectionRegistry>,
    /// Shared pipeline contexts
    cache: Arc<PipelineCache<E>>,
    executor: SessionExecutor<E>,
    catalog: ProgramCatalog,
    settings: SessionSettings,
    /// Flags of sessions that have not finished yet, for explicit interrupts
    live: Arc<LiveSessions>,
}

impl<E: Engine> SessionManager<E> {
    /// Creates a new `SessionManager`.
    ///
    /// # Arguments
    ///
    /// * `registry` - The connection registry shared with the transport
    /// * `cache` - The pipeline cache; its engine runs the sessions
    /// * `catalog` - Programs that commands may name
    /// * `settings` - Channel sizing and other session knobs
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        cache: Arc<PipelineCache<E>>,
        catalog: ProgramCatalog,
        settings: SessionSettings,
    ) -> Self {
        let executor = SessionExecutor::new(Arc::clone(cache.engine()));
        Self {
            registry,
            cache,
            executor,
            catalog,
            settings,
            live: Arc::new(LiveSessions::default()),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn cache(&self) -> &Arc<PipelineCache<E>> {
        &self.cache
    }

    pub fn catalog(&self) -> &ProgramCatalog {
        &self.catalog
    }

    /// Starts a session for `command` on behalf of a connection.
    ///
    /// Returns as soon as the session is registered; acquiring the context
    /// and running the steps happen on a spawned task. By the time this
    /// returns, the connection's previous session has been interrupted.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// * `UnknownProgram` / `Configuration` / `Serialization` if the command
    ///   cannot be resolved; nothing is interrupted and no context is touched
    /// * `ConnectionClosed` if the connection is not alive
    pub fn handle_command(&self, connection_id: ConnectionId, command: Command) -> Result<SessionHandle> {
        let (spec, params) = self.resolve(&command)?;
        if !self.registry.is_alive(connection_id) {
            return Err(GenerationError::connection_closed(connection_id));
        }
        self.start(Some(connection_id), spec, params)
    }

    /// Parses a text command (`P0:<prompt>`, `P2:<strength>`, `P3`, ...) and
    /// starts it.
    pub fn handle_text(&self, connection_id: ConnectionId, text: &str) -> Result<SessionHandle> {
        let command = Command::parse(text)?;
        self.handle_command(connection_id, command)
    }

    /// Starts a session that no connection owns.
    ///
    /// Only [`interrupt_session`](Self::interrupt_session), the handle's own
    /// interrupt or dropping its event stream can stop it.
    pub fn run_headless(&self, command: Command) -> Result<SessionHandle> {
        let (spec, params) = self.resolve(&command)?;
        self.start(None, spec, params)
    }

    fn resolve(&self, command: &Command) -> Result<(ProgramSpec, GenerationParams)> {
        let spec = self.catalog.get(&command.program_id)?.clone();
        let raw = RawParams::parse(spec.kind, &command.params)?;
        let params = GenerationParams::resolve(&spec, raw)?;
        Ok((spec, params))
    }

    fn start(
        &self,
        connection_id: Option<ConnectionId>,
        spec: ProgramSpec,
        params: GenerationParams,
    ) -> Result<SessionHandle> {
        let session_id = SessionId::new();
        let flag = InterruptFlag::new();

        let check = match connection_id {
            Some(connection_id) => {
                let superseded = self.registry.set_active(
                    connection_id,
                    ActiveSession {
                        session_id,
                        flag: flag.clone(),
                    },
                )?;
                if let Some(prior) = superseded {
                    tracing::info!(target: "router", %connection_id, %prior, %session_id, "prior session superseded");
                }
                let watch = self.registry.watch(connection_id, session_id);
                InterruptCheck::with_probe(flag.clone(), Arc::new(watch))
            }
            None => InterruptCheck::new(flag.clone()),
        };
        self.live.insert(session_id, flag.clone());

        let (sender, events) = step_channel(session_id, self.settings.channel_capacity);
        let record = SessionRecord::new(session_id, spec.id.clone(), connection_id);
        let program_id = spec.id.clone();

        tracing::info!(
            target: "router",
            %session_id,
            %program_id,
            connection_id = ?connection_id,
            prompt = %params.prompt,
            "session started"
        );

        let task = SessionTask {
            cache: Arc::clone(&self.cache),
            registry: Arc::clone(&self.registry),
            live: Arc::clone(&self.live),
            executor: self.executor.clone(),
            spec,
            params,
            check,
            record,
            sender,
        };
        let span = tracing::info_span!("session", %session_id, %program_id);
        let completion = tokio::spawn(task.run().instrument(span));

        Ok(SessionHandle::new(
            session_id,
            program_id,
            connection_id,
            flag,
            events,
            completion,
        ))
    }

    /// Explicitly interrupts a session, whichever connection owns it.
    ///
    /// Returns `false` if the session is unknown, finished, or already interrupted.
    pub fn interrupt_session(&self, session_id: SessionId) -> bool {
        let raised = self.live.interrupt(session_id, InterruptReason::Requested);
        if raised {
            tracing::info!(target: "router", %session_id, "session interrupted on request");
        }
        raised
    }

    /// Whether `session_id` is the connection's most recent session.
    ///
    /// Stays true after the session finishes, until the next command.
    /// Transports use this to drop events of superseded sessions.
    pub fn is_current(&self, connection_id: ConnectionId, session_id: SessionId) -> bool {
        self.registry.latest_session(connection_id) == Some(session_id)
    }

    /// Evicts all idle pipeline contexts.
    pub fn evict_idle(&self) -> usize {
        self.cache.evict_all()
    }

    /// Number of sessions not yet finished.
    pub fn live_sessions(&self) -> usize {
        self.live.len()
    }

    /// Interrupts every live session.
    pub fn shutdown(&self) -> usize {
        let interrupted = self.live.interrupt_all(InterruptReason::Shutdown);
        tracing::info!(target: "router", interrupted, "shutting down");
        interrupted
    }
}

#[cfg(test)]
#[path = "manager_test.rs"]
mod tests;
