use std::fmt;

use txscript_core::trace::TraceError;
use txscript_core::ExecutorError;

#[derive(Debug)]
pub enum CliError {
    /// The script had LEX/PARSE errors and was not run.
    Script { count: usize },
    /// The script ran but recorded RUNTIME errors.
    Runtime { count: usize },
    Trace(TraceError),
    Executor(ExecutorError),
    Io(std::io::Error),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Executor(_) => 1,
            CliError::Script { .. } | CliError::Trace(_) => 2,
            CliError::Runtime { .. } => 3,
            CliError::Io(_) => 4,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Script { count } => write!(f, "Script has {} error(s)", count),
            CliError::Runtime { count } => write!(f, "Run recorded {} runtime error(s)", count),
            CliError::Trace(e) => write!(f, "Invalid trace at {}", e),
            CliError::Executor(e) => write!(f, "Executor error: {}", e),
            CliError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for CliError {}

impl From<std::io::Error> for CliError {
    fn from(e: std::io::Error) -> Self {
        CliError::Io(e)
    }
}

impl From<TraceError> for CliError {
    fn from(e: TraceError) -> Self {
        CliError::Trace(e)
    }
}

impl From<ExecutorError> for CliError {
    fn from(e: ExecutorError) -> Self {
        match e {
            ExecutorError::InvalidScript(count) => CliError::Script { count },
            other => CliError::Executor(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(CliError::Script { count: 1 }.exit_code(), 2);
        assert_eq!(CliError::Runtime { count: 1 }.exit_code(), 3);
        assert_eq!(CliError::from(ExecutorError::NoPorts).exit_code(), 1);
        assert_eq!(CliError::from(std::io::Error::other("x")).exit_code(), 4);
    }

    #[test]
    fn test_invalid_script_maps_to_script_error() {
        let err = CliError::from(ExecutorError::InvalidScript(3));
        assert!(matches!(err, CliError::Script { count: 3 }));
        assert_eq!(err.to_string(), "Script has 3 error(s)");
    }
}
