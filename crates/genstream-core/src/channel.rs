//! The step-event channel between a blocking session worker and its async consumer.
//!
//! The channel is bounded: when the consumer falls behind, the worker blocks
//! inside [`StepSender::progress`] / [`StepSender::preview`] until there is
//! room again, or until the session's [`InterruptFlag`] is raised. The
//! terminal pair (`Final`/`Error` then `Done`) is only expressible through
//! [`StepSender::finish`] or [`StepSender::abort`], both of which consume the
//! sender, so nothing can be put after `Done`.

use std::pin::Pin;
use std::task::{Context, Poll};

use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::error::GenerationError;
use crate::event::{StepEvent, Terminal};
use crate::ids::SessionId;
use crate::interrupt::{InterruptFlag, InterruptReason};
use crate::session::SessionState;

/// Smallest usable capacity: room for the terminal pair without blocking.
pub const MIN_CAPACITY: usize = 2;

/// Why a step event was not delivered.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendError {
    /// The consumer dropped its [`EventStream`].
    #[error("step-event consumer is gone")]
    Closed,

    /// The channel was full and the session got interrupted while waiting.
    #[error("interrupted ({0}) while waiting for channel capacity")]
    Interrupted(InterruptReason),
}

/// Creates a bounded step-event channel for one session.
///
/// `capacity` is raised to [`MIN_CAPACITY`] if smaller.
pub fn step_channel(session_id: SessionId, capacity: usize) -> (StepSender, EventStream) {
    let (tx, rx) = mpsc::channel(capacity.max(MIN_CAPACITY));
    (
        StepSender {
            session_id,
            tx: Some(tx),
            interrupt: None,
            last_step: 0,
            stepped: false,
        },
        EventStream {
            session_id,
            rx,
            done: false,
        },
    )
}

/// Producer half, owned by the session worker.
#[derive(Debug)]
pub struct StepSender {
    session_id: SessionId,
    tx: Option<mpsc::Sender<StepEvent>>,
    interrupt: Option<InterruptFlag>,
    last_step: u32,
    stepped: bool,
}

impl StepSender {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    /// Stops waiting for channel capacity once `flag` is raised.
    ///
    /// Without a flag a full channel blocks until the consumer reads or goes
    /// away. With one, a blocked put gives up with [`SendError::Interrupted`]
    /// and [`finish`](Self::finish) drops whatever does not fit.
    pub fn set_interrupt(&mut self, flag: InterruptFlag) {
        self.interrupt = Some(flag);
    }

    /// Emits a progress event, blocking while the channel is full.
    ///
    /// Must not be called from within an async context.
    ///
    /// # Panics
    ///
    /// Panics with a [`GenerationError::ChannelProtocolViolation`] payload if
    /// `step` is lower than a previously emitted step.
    pub fn progress(&mut self, step: u32, timestep: u32) -> Result<(), SendError> {
        self.put_step(StepEvent::Progress { step, timestep })
    }

    /// Emits a preview image, blocking while the channel is full.
    ///
    /// # Panics
    ///
    /// Panics like [`progress`](Self::progress) on a step regression.
    pub fn preview(&mut self, step: u32, image: Vec<u8>) -> Result<(), SendError> {
        self.put_step(StepEvent::Preview { step, image })
    }

    fn put_step(&mut self, event: StepEvent) -> Result<(), SendError> {
        let step = event.step().unwrap_or(self.last_step);
        if step < self.last_step {
            let violation = GenerationError::ChannelProtocolViolation(format!(
                "session {}: step {step} emitted after step {}",
                self.session_id, self.last_step
            ));
            tracing::error!(target: "session", session_id = %self.session_id, "{violation}");
            std::panic::panic_any(violation);
        }
        self.last_step = step;
        self.stepped = true;
        let tx = self.tx.as_ref().ok_or(SendError::Closed)?;
        send_or_interrupt(tx, event, self.interrupt.as_ref())
    }

    /// Emits the terminal event followed by `Done`.
    ///
    /// Returns `false` if the pair was not delivered: the consumer was already
    /// gone, or the session was interrupted while the channel stayed full. The
    /// session still counts as finished either way.
    pub fn finish(mut self, terminal: Terminal, state: SessionState) -> bool {
        let Some(tx) = self.tx.take() else {
            return false;
        };
        let interrupt = self.interrupt.as_ref();
        let delivered = send_or_interrupt(&tx, terminal.into(), interrupt).is_ok()
            && send_or_interrupt(&tx, StepEvent::Done { state }, interrupt).is_ok();
        if !delivered {
            tracing::debug!(
                target: "session",
                session_id = %self.session_id,
                "terminal events not delivered"
            );
        }
        delivered
    }

    /// Emits `Error` then `Done` without blocking.
    ///
    /// Usable from async code, but only before any step event was emitted:
    /// the channel is then guaranteed to have room for both.
    ///
    /// # Panics
    ///
    /// Panics if a step event was already emitted.
    pub fn abort(mut self, cause: impl Into<String>, state: SessionState) -> bool {
        assert!(
            !self.stepped,
            "abort after step events; use finish from the worker"
        );
        let Some(tx) = self.tx.take() else {
            return false;
        };
        tx.try_send(StepEvent::Error {
            cause: cause.into(),
        })
        .is_ok()
            && tx.try_send(StepEvent::Done { state }).is_ok()
    }
}

impl Drop for StepSender {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            tracing::error!(
                target: "session",
                session_id = %self.session_id,
                "step sender dropped without a terminal event"
            );
            let _ = tx.try_send(StepEvent::Error {
                cause: "session ended without a result".to_string(),
            });
            let _ = tx.try_send(StepEvent::Done {
                state: SessionState::Failed,
            });
        }
    }
}

/// Blocking send that also returns once `interrupt` is raised.
///
/// Capacity wins over the flag, so an interrupted session still delivers
/// events while the consumer keeps up.
fn send_or_interrupt(
    tx: &mpsc::Sender<StepEvent>,
    event: StepEvent,
    interrupt: Option<&InterruptFlag>,
) -> Result<(), SendError> {
    let Some(flag) = interrupt else {
        return tx.blocking_send(event).map_err(|_| SendError::Closed);
    };
    futures::executor::block_on(async {
        tokio::select! {
            biased;
            sent = tx.send(event) => sent.map_err(|_| SendError::Closed),
            () = flag.raised() => Err(SendError::Interrupted(
                flag.reason().unwrap_or(InterruptReason::Requested),
            )),
        }
    })
}

/// Consumer half: an ordered, lazy stream of step events.
///
/// Yields `None` after `Done`, and also if the producer vanished without one.
#[derive(Debug)]
pub struct EventStream {
    session_id: SessionId,
    rx: mpsc::Receiver<StepEvent>,
    done: bool,
}

impl EventStream {
    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn is_done(&self) -> bool {
        self.done
    }

    pub async fn next_event(&mut self) -> Option<StepEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.recv().await;
        self.observe(event)
    }

    /// Blocking variant of [`next_event`](Self::next_event) for non-async callers.
    pub fn blocking_next(&mut self) -> Option<StepEvent> {
        if self.done {
            return None;
        }
        let event = self.rx.blocking_recv();
        self.observe(event)
    }

    /// Drains the stream to its end.
    pub async fn collect_events(mut self) -> Vec<StepEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next_event().await {
            events.push(event);
        }
        events
    }

    fn observe(&mut self, event: Option<StepEvent>) -> Option<StepEvent> {
        match &event {
            Some(StepEvent::Done { .. }) | None => self.done = true,
            Some(_) => {}
        }
        event
    }
}

impl Stream for EventStream {
    type Item = StepEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match this.rx.poll_recv(cx) {
            Poll::Ready(event) => Poll::Ready(this.observe(event)),
            Poll::Pending => Poll::Pending,
        }
    }
}
