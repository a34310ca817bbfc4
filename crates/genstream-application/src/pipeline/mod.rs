//! Pipeline contexts.
//!
//! A context is a loaded pipeline plus at most one weight overlay. Contexts
//! are expensive to build and mutable while in use, so they live in a
//! [`PipelineCache`] and are lent out one holder at a time.

mod cache;

pub use cache::{CacheStats, ContextState, PipelineCache, PipelineLease};
