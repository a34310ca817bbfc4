pub mod connection;
pub mod pipeline;
pub mod session;

pub use connection::{ActiveSession, ConnectionRegistry, ConnectionWatch};
pub use pipeline::{CacheStats, ContextState, PipelineCache, PipelineLease};
pub use session::{SessionCompletion, SessionHandle, SessionManager};
