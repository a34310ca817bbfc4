//! Mapping between step events and the client wire vocabulary.
//!
//! | message | meaning |
//! |---------|---------|
//! | `ready` | command accepted, session started |
//! | `p:s=<step>:t=<timestep>` | progress |
//! | binary | preview or final image |
//! | `error:<cause>` | session failed or was interrupted |
//! | `done` | session over |
//! | `unknown command: <text>` | command rejected |

use crate::event::StepEvent;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Text(String),
    Binary(Vec<u8>),
}

impl WireMessage {
    pub fn ready() -> Self {
        Self::Text("ready".to_string())
    }

    pub fn unknown_command(command: &str) -> Self {
        Self::Text(format!("unknown command: {command}"))
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(text) => Some(text),
            Self::Binary(_) => None,
        }
    }
}

impl From<StepEvent> for WireMessage {
    fn from(event: StepEvent) -> Self {
        match event {
            StepEvent::Progress { step, timestep } => Self::Text(format!("p:s={step}:t={timestep}")),
            StepEvent::Preview { image, .. } | StepEvent::Final { image } => Self::Binary(image),
            StepEvent::Error { cause } => Self::Text(format!("error:{cause}")),
            StepEvent::Done { .. } => Self::Text("done".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionState;

    #[test]
    fn event_vocabulary() {
        let msg = WireMessage::from(StepEvent::Progress { step: 3, timestep: 861 });
        assert_eq!(msg.as_text(), Some("p:s=3:t=861"));

        let msg = WireMessage::from(StepEvent::Error { cause: "oom".into() });
        assert_eq!(msg.as_text(), Some("error:oom"));

        let msg = WireMessage::from(StepEvent::Done { state: SessionState::Interrupted });
        assert_eq!(msg.as_text(), Some("done"));

        let msg = WireMessage::from(StepEvent::Final { image: vec![1, 2] });
        assert_eq!(msg, WireMessage::Binary(vec![1, 2]));
    }

    #[test]
    fn control_messages() {
        assert_eq!(WireMessage::ready().as_text(), Some("ready"));
        assert_eq!(
            WireMessage::unknown_command("P9:x").as_text(),
            Some("unknown command: P9:x")
        );
    }
}
