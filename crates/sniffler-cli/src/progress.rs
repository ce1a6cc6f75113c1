//! Exit codes and structured CLI errors.
//!
//! The admin commands are one-shot file operations, not long-running
//! generators, so this module keeps only what the teacher's CLI used for
//! its error presentation layer and drops the progress-bar machinery.

use console::style;

/// Exit codes for CLI operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    GeneralError = 1,
    InvalidArguments = 2,
    ConfigurationError = 6,
    NetworkError = 5,
    ServerError = 8,
}

impl ExitCode {
    /// Exit the process with this code.
    pub fn exit(self) -> ! {
        std::process::exit(self as i32);
    }
}

/// A CLI-facing error: a message, the exit code to use, and an optional
/// actionable suggestion.
#[derive(Debug)]
pub struct CliError {
    pub message: String,
    pub exit_code: ExitCode,
    pub suggestion: Option<String>,
}

impl CliError {
    /// Create a new CLI error.
    pub fn new(message: impl Into<String>, exit_code: ExitCode) -> Self {
        Self {
            message: message.into(),
            exit_code,
            suggestion: None,
        }
    }

    /// Attach a suggestion to help the user resolve the error.
    pub fn with_suggestion(mut self, suggestion: impl Into<String>) -> Self {
        self.suggestion = Some(suggestion.into());
        self
    }

    /// Print the error with styling and exit the process.
    pub fn display_and_exit(self) -> ! {
        eprintln!("{} {}", style("error:").red().bold(), style(&self.message).red());
        if let Some(suggestion) = &self.suggestion {
            eprintln!("{} {}", style("suggestion:").yellow(), style(suggestion).yellow());
        }
        self.exit_code.exit();
    }
}

impl std::error::Error for CliError {}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)?;
        if let Some(ref suggestion) = self.suggestion {
            write!(f, " ({suggestion})")?;
        }
        Ok(())
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        Self::new(err.to_string(), ExitCode::GeneralError)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_their_discriminants() {
        assert_eq!(ExitCode::Success as i32, 0);
        assert_eq!(ExitCode::GeneralError as i32, 1);
        assert_eq!(ExitCode::ConfigurationError as i32, 6);
    }

    #[test]
    fn display_includes_suggestion() {
        let err = CliError::new("bad port", ExitCode::InvalidArguments).with_suggestion("use 1-65535");
        assert_eq!(err.to_string(), "bad port (use 1-65535)");
    }
}
