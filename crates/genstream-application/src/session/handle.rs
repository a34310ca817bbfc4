use genstream_core::{
    ConnectionId, EventStream, GenerationError, InterruptFlag, InterruptReason, ProgramId, Result,
    SessionId, SessionSummary, StepEvent,
};
use tokio::task::JoinHandle;

/// Caller-side view of a running generation session.
///
/// Dropping the handle (and with it the event stream) interrupts the session
/// at its next step boundary.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: SessionId,
    program_id: ProgramId,
    connection_id: Option<ConnectionId>,
    flag: InterruptFlag,
    events: EventStream,
    completion: JoinHandle<SessionSummary>,
}

impl SessionHandle {
    pub(crate) fn new(
        session_id: SessionId,
        program_id: ProgramId,
        connection_id: Option<ConnectionId>,
        flag: InterruptFlag,
        events: EventStream,
        completion: JoinHandle<SessionSummary>,
    ) -> Self {
        Self {
            session_id,
            program_id,
            connection_id,
            flag,
            events,
            completion,
        }
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn program_id(&self) -> &ProgramId {
        &self.program_id
    }

    pub fn connection_id(&self) -> Option<ConnectionId> {
        self.connection_id
    }

    pub fn interrupt_flag(&self) -> &InterruptFlag {
        &self.flag
    }

    /// Asks the session to stop at its next step boundary.
    pub fn interrupt(&self) -> bool {
        self.flag.raise(InterruptReason::Requested)
    }

    pub fn events(&mut self) -> &mut EventStream {
        &mut self.events
    }

    pub async fn next_event(&mut self) -> Option<StepEvent> {
        self.events.next_event().await
    }

    /// Separates the event stream from the completion future so they can be
    /// driven from different tasks.
    pub fn split(self) -> (EventStream, SessionCompletion) {
        (
            self.events,
            SessionCompletion {
                session_id: self.session_id,
                flag: self.flag,
                join: self.completion,
            },
        )
    }

    /// Drains all remaining events and waits for the session to end.
    pub async fn collect(self) -> Result<(Vec<StepEvent>, SessionSummary)> {
        let (events, completion) = self.split();
        let events = events.collect_events().await;
        let summary = completion.wait().await?;
        Ok((events, summary))
    }

    /// Waits for the session to end, discarding events.
    pub async fn summary(self) -> Result<SessionSummary> {
        self.collect().await.map(|(_, summary)| summary)
    }
}

/// Resolves to the session summary once the session and its cleanup are done.
#[derive(Debug)]
pub struct SessionCompletion {
    session_id: SessionId,
    flag: InterruptFlag,
    join: JoinHandle<SessionSummary>,
}

impl SessionCompletion {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn interrupt(&self) -> bool {
        self.flag.raise(InterruptReason::Requested)
    }

    pub async fn wait(self) -> Result<SessionSummary> {
        self.join.await.map_err(|err| {
            GenerationError::internal(format!("session {} task failed: {err}", self.session_id))
        })
    }
}
