//! Generation sessions.
//!
//! A session is started by the [`SessionManager`], runs on its own task and
//! blocking worker, and is observed through a [`SessionHandle`].

mod handle;
mod manager;
mod runner;

pub use handle::{SessionCompletion, SessionHandle};
pub use manager::SessionManager;
