//! Domain-specific [`CliError`] constructors for the listener/mock/settings
//! command surface, following the teacher's "message + actionable
//! suggestion" error-builder pattern.

use crate::progress::{CliError, ExitCode};

/// A listener already exists on this port.
pub fn listener_exists_error(port: u16) -> CliError {
    CliError::new(format!("a listener already exists on port {port}"), ExitCode::ConfigurationError)
        .with_suggestion(format!("remove it first: sniffler listener remove --port {port}"))
}

/// No listener is registered on this port.
pub fn no_listener_error(port: u16) -> CliError {
    CliError::new(format!("no listener on port {port}"), ExitCode::ConfigurationError)
        .with_suggestion("list registered listeners: sniffler listener list".to_string())
}

/// A listener would proxy to itself.
pub fn self_loop_error(port: u16) -> CliError {
    CliError::new(format!("listener on port {port} cannot proxy to itself"), ExitCode::ConfigurationError)
        .with_suggestion("point upstream_host/upstream_port at the real service, not this listener".to_string())
}

/// No mock is registered for this fingerprint.
pub fn no_mock_error(port: u16, fingerprint: &str) -> CliError {
    CliError::new(format!("no mock for fingerprint {fingerprint:?} on port {port}"), ExitCode::ConfigurationError)
        .with_suggestion(format!("list registered mocks: sniffler mock list --port {port}"))
}

/// An import bundle carries an unsupported version.
pub fn unsupported_bundle_version_error(version: &str) -> CliError {
    CliError::new(format!("unsupported bundle version {version:?}"), ExitCode::InvalidArguments)
        .with_suggestion("export a fresh bundle with the current CLI version".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_listener_error_names_the_port() {
        let err = no_listener_error(5432);
        assert!(err.message.contains("5432"));
    }
}
