//! Transport commands.

use serde::{Deserialize, Serialize};

use crate::error::{GenerationError, Result};
use crate::ids::ProgramId;

/// A request to start a generation session.
///
/// The text form is `<PROGRAM>` or `<PROGRAM>:<params>`; everything after the
/// first `:` is kept verbatim so prompts may contain colons.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub program_id: ProgramId,
    pub params: String,
}

impl Command {
    pub fn new(program_id: impl Into<ProgramId>, params: impl Into<String>) -> Self {
        Self {
            program_id: program_id.into(),
            params: params.into(),
        }
    }

    /// Parses a text command.
    ///
    /// # Errors
    ///
    /// Returns `GenerationError::InvalidCommand` for an empty command or an
    /// empty program id.
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        let (program, params) = match text.split_once(':') {
            Some((program, params)) => (program, params),
            None => (text, ""),
        };
        if program.trim().is_empty() {
            return Err(GenerationError::invalid_command(text));
        }
        if program.chars().any(char::is_whitespace) {
            return Err(GenerationError::invalid_command(text));
        }
        Ok(Self::new(program, params))
    }
}
