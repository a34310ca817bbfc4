//! Session lifecycle state.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error::{GenerationError, Result};
use crate::ids::{ConnectionId, ProgramId, SessionId};
use crate::interrupt::InterruptReason;

/// Lifecycle of a generation session.
///
/// ```text
/// Created ──> Running ──> Completed
///    │           ├──────> Interrupted
///    │           └──────> Failed
///    ├──────────────────> Interrupted   (cancelled before start)
///    └──────────────────> Failed        (context could not be built)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SessionState {
    Created,
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Interrupted | Self::Failed)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Created, Running) | (Created, Interrupted) | (Created, Failed)
                | (Running, Completed) | (Running, Interrupted) | (Running, Failed)
        )
    }
}

/// Mutable bookkeeping for one session, owned by its worker.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub session_id: SessionId,
    pub program_id: ProgramId,
    /// `None` for headless sessions.
    pub connection_id: Option<ConnectionId>,
    pub started_at: DateTime<Utc>,
    current_step: u32,
    step_durations: BTreeMap<u32, Duration>,
    state: SessionState,
    interrupt_reason: Option<InterruptReason>,
    last_tick: Option<Instant>,
    finished_after: Option<Duration>,
    created: Instant,
}

impl SessionRecord {
    pub fn new(
        session_id: SessionId,
        program_id: ProgramId,
        connection_id: Option<ConnectionId>,
    ) -> Self {
        Self {
            session_id,
            program_id,
            connection_id,
            started_at: Utc::now(),
            current_step: 0,
            step_durations: BTreeMap::new(),
            state: SessionState::Created,
            interrupt_reason: None,
            last_tick: None,
            finished_after: None,
            created: Instant::now(),
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn current_step(&self) -> u32 {
        self.current_step
    }

    pub fn interrupt_reason(&self) -> Option<InterruptReason> {
        self.interrupt_reason
    }

    /// Moves the state machine forward.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::InvalidTransition` when `next` is not
    /// reachable from the current state.
    pub fn transition(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(GenerationError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        match next {
            SessionState::Running => self.last_tick = Some(Instant::now()),
            s if s.is_terminal() => self.finished_after = Some(self.created.elapsed()),
            _ => {}
        }
        self.state = next;
        Ok(())
    }

    /// Marks the session interrupted, recording why.
    pub fn interrupt(&mut self, reason: InterruptReason) -> Result<()> {
        self.transition(SessionState::Interrupted)?;
        self.interrupt_reason = Some(reason);
        Ok(())
    }

    /// Records that the engine finished `step`.
    ///
    /// The time since the previous step (or since the session started
    /// running) is stored against `step`. A step lower than the current one
    /// is ignored; step order is enforced by the event channel.
    pub fn record_step(&mut self, step: u32) {
        if step < self.current_step {
            return;
        }
        let now = Instant::now();
        if let Some(prev) = self.last_tick.replace(now) {
            self.step_durations.insert(step, now.duration_since(prev));
        }
        self.current_step = step;
    }

    pub fn step_durations(&self) -> &BTreeMap<u32, Duration> {
        &self.step_durations
    }

    pub fn summary(&self) -> SessionSummary {
        SessionSummary {
            session_id: self.session_id,
            program_id: self.program_id.clone(),
            connection_id: self.connection_id,
            started_at: self.started_at,
            state: self.state,
            steps_completed: self.current_step,
            step_durations: self.step_durations.clone(),
            total_duration: self.finished_after.unwrap_or_else(|| self.created.elapsed()),
            interrupt_reason: self.interrupt_reason,
        }
    }
}

/// Snapshot of a session, taken once it has ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: SessionId,
    pub program_id: ProgramId,
    pub connection_id: Option<ConnectionId>,
    pub started_at: DateTime<Utc>,
    pub state: SessionState,
    pub steps_completed: u32,
    pub step_durations: BTreeMap<u32, Duration>,
    pub total_duration: Duration,
    pub interrupt_reason: Option<InterruptReason>,
}

impl SessionSummary {
    pub fn mean_step_duration(&self) -> Option<Duration> {
        let n = u32::try_from(self.step_durations.len()).ok().filter(|n| *n > 0)?;
        Some(self.step_durations.values().sum::<Duration>() / n)
    }
}
