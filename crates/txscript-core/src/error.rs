//! Diagnostics shared by every stage of the pipeline.
//!
//! Lexing, parsing, and execution never fail fast. Each stage records
//! [`ScriptError`]s and keeps going, so a user sees every problem in one
//! editing cycle. Host-API misuse (starting twice, pausing an idle executor)
//! is reported separately through [`ExecutorError`].

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline stage that produced a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Phase {
    Lex,
    Parse,
    Runtime,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Lex => write!(f, "LEX"),
            Phase::Parse => write!(f, "PARSE"),
            Phase::Runtime => write!(f, "RUNTIME"),
        }
    }
}

/// Machine-readable category of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    // Lexer
    UnterminatedString,
    UnterminatedComment,
    UnexpectedCharacter,
    InvalidNumber,
    InvalidEscape,
    // Parser
    UnexpectedToken,
    MissingTerminator,
    UnbalancedBlock,
    MisplacedDeclaration,
    MisplacedJump,
    // Runtime
    UndefinedIdentifier,
    TypeMismatch,
    ArityMismatch,
    NotCallable,
    DivisionByZero,
    Overflow,
    IndexOutOfRange,
    InvalidFrame,
    CallDepthExceeded,
    Timeout,
    WriteFailed,
}

/// A positioned diagnostic from any stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{phase} error at {line}:{column}: {message}")]
pub struct ScriptError {
    pub line: usize,
    pub column: usize,
    pub message: String,
    pub phase: Phase,
    pub kind: ErrorKind,
}

impl ScriptError {
    pub fn lex(kind: ErrorKind, message: impl Into<String>, line: usize, column: usize) -> Self {
        Self { line, column, message: message.into(), phase: Phase::Lex, kind }
    }

    pub fn parse(kind: ErrorKind, message: impl Into<String>, line: usize, column: usize) -> Self {
        Self { line, column, message: message.into(), phase: Phase::Parse, kind }
    }

    pub fn runtime(kind: ErrorKind, message: impl Into<String>, line: usize, column: usize) -> Self {
        Self { line, column, message: message.into(), phase: Phase::Runtime, kind }
    }

    /// Whether this diagnostic prevents a script from being started.
    pub fn is_blocking(&self) -> bool {
        matches!(self.phase, Phase::Lex | Phase::Parse)
    }
}

/// Errors returned by the host control surface of [`ScriptExecutor`](crate::executor::ScriptExecutor).
///
/// These describe misuse of the executor itself, never problems inside the
/// script. Script problems always land in the error log.
#[derive(Error, Debug)]
pub enum ExecutorError {
    /// `start()` was called while a run is `RUNNING` or `PAUSED`.
    #[error("A script is already running")]
    AlreadyRunning,

    /// The source had lexer or parser diagnostics; they are in the error log.
    #[error("Script has {0} error(s) and cannot be started")]
    InvalidScript(usize),

    /// A transition was requested from a state that does not allow it.
    #[error("Cannot {action} while {state}")]
    InvalidTransition {
        action: &'static str,
        state: crate::executor::ExecutionState,
    },

    /// No target ports were given.
    #[error("At least one target port is required")]
    NoPorts,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_phase_and_position() {
        let err = ScriptError::lex(ErrorKind::UnterminatedString, "Unterminated string", 3, 7);
        assert_eq!(err.to_string(), "LEX error at 3:7: Unterminated string");
    }

    #[test]
    fn lex_and_parse_errors_block_start() {
        assert!(ScriptError::lex(ErrorKind::UnexpectedCharacter, "x", 1, 1).is_blocking());
        assert!(ScriptError::parse(ErrorKind::UnexpectedToken, "x", 1, 1).is_blocking());
        assert!(!ScriptError::runtime(ErrorKind::Timeout, "x", 1, 1).is_blocking());
    }

    #[test]
    fn serializes_phase_in_upper_case() {
        let err = ScriptError::runtime(ErrorKind::Timeout, "timed out", 1, 1);
        let json = serde_json::to_string(&err).unwrap();
        assert!(json.contains("\"phase\":\"RUNTIME\""));
        let back: ScriptError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, err);
    }
}
