use serde::{Deserialize, Serialize};

use crate::session::SessionState;

/// One event produced by a generation session.
///
/// A well-formed stream is `(Progress | Preview)* (Final | Error) Done` with
/// non-decreasing step numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepEvent {
    Progress { step: u32, timestep: u32 },
    Preview { step: u32, image: Vec<u8> },
    Final { image: Vec<u8> },
    Error { cause: String },
    Done { state: SessionState },
}

impl StepEvent {
    pub fn step(&self) -> Option<u32> {
        match self {
            Self::Progress { step, .. } | Self::Preview { step, .. } => Some(*step),
            _ => None,
        }
    }

    /// `Final` or `Error`.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Final { .. } | Self::Error { .. })
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Done { .. })
    }
}

/// How a session ended, as handed to [`StepSender::finish`](crate::channel::StepSender::finish).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Terminal {
    Final(Vec<u8>),
    Error(String),
}

impl From<Terminal> for StepEvent {
    fn from(terminal: Terminal) -> Self {
        match terminal {
            Terminal::Final(image) => StepEvent::Final { image },
            Terminal::Error(cause) => StepEvent::Error { cause },
        }
    }
}

/// Checks that `events` follows the step-event grammar.
///
/// Returns a description of the first violation.
pub fn check_grammar(events: &[StepEvent]) -> std::result::Result<(), String> {
    let mut last_step = 0;
    let mut terminal_seen = false;
    for (i, event) in events.iter().enumerate() {
        match event {
            StepEvent::Progress { step, .. } | StepEvent::Preview { step, .. } => {
                if terminal_seen {
                    return Err(format!("step event at {i} after terminal"));
                }
                if *step < last_step {
                    return Err(format!("step {step} at {i} after step {last_step}"));
                }
                last_step = *step;
            }
            StepEvent::Final { .. } | StepEvent::Error { .. } => {
                if terminal_seen {
                    return Err(format!("second terminal event at {i}"));
                }
                terminal_seen = true;
            }
            StepEvent::Done { .. } => {
                if !terminal_seen {
                    return Err(format!("done at {i} without terminal"));
                }
                if i + 1 != events.len() {
                    return Err(format!("events after done at {i}"));
                }
                return Ok(());
            }
        }
    }
    Err("stream ended without done".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grammar_accepts_well_formed_stream() {
        let events = vec![
            StepEvent::Progress { step: 1, timestep: 950 },
            StepEvent::Preview { step: 1, image: vec![1] },
            StepEvent::Progress { step: 2, timestep: 900 },
            StepEvent::Final { image: vec![2] },
            StepEvent::Done { state: SessionState::Completed },
        ];
        assert_eq!(check_grammar(&events), Ok(()));
    }

    #[test]
    fn grammar_rejects_violations() {
        let done = StepEvent::Done { state: SessionState::Failed };
        let err = StepEvent::Error { cause: "x".into() };
        assert!(check_grammar(&[done.clone()]).is_err());
        assert!(check_grammar(&[err.clone(), err.clone(), done.clone()]).is_err());
        assert!(check_grammar(&[err.clone()]).is_err());
        assert!(check_grammar(&[
            StepEvent::Progress { step: 3, timestep: 0 },
            StepEvent::Progress { step: 2, timestep: 0 },
            err,
            done,
        ])
        .is_err());
    }

    #[test]
    fn serializes_tagged() {
        let json = serde_json::to_value(StepEvent::Progress { step: 4, timestep: 800 }).unwrap();
        assert_eq!(json["type"], "progress");
        assert_eq!(json["step"], 4);
    }
}
