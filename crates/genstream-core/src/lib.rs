pub mod catalog;
pub mod channel;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod ids;
pub mod interrupt;
pub mod params;
pub mod program;
pub mod session;
pub mod wire;

// Re-export common types
pub use catalog::ProgramCatalog;
pub use channel::{EventStream, SendError, StepSender, step_channel};
pub use command::Command;
pub use config::{RootConfig, SessionSettings};
pub use engine::{Artifact, Engine, StepControl, StepUpdate};
pub use error::{EngineError, GenerationError, Result};
pub use event::{StepEvent, Terminal};
pub use ids::{ConnectionId, ProgramId, SessionId};
pub use interrupt::{InterruptCheck, InterruptFlag, InterruptReason, LivenessProbe};
pub use params::{GenerationParams, RawParams};
pub use program::{OverlaySpec, PipelineKind, PreviewPolicy, ProgramSpec};
pub use session::{SessionRecord, SessionState, SessionSummary};
pub use wire::WireMessage;
