//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings. Tool-calling logic is
//! expected to turn the recoverable kinds (see [`SandboxError::is_tool_error`])
//! into failures shown to the model instead of aborting the run.

use std::path::{Path, PathBuf};
use std::time::Duration;

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Unknown backend, unknown environment name, or an invalid config.
    #[error("Sandbox configuration error: {message}")]
    Configuration { message: String },

    /// The backend failed to initialise a config or provision a sample.
    #[error("Sandbox provisioning failed: {message}")]
    Provisioning { message: String },

    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// The command could not be run, or its output could not be decoded.
    #[error("Command could not be executed: {message}")]
    Execution { message: String },

    /// A file requested from the sandbox does not exist.
    #[error("File not found in sandbox: {}", path.display())]
    NotFound { path: PathBuf },

    /// A write or read was rejected by the sandbox.
    #[error("Permission denied in sandbox: {}", path.display())]
    PermissionDenied { path: PathBuf },

    /// A file operation targeted a directory.
    #[error("Path is a directory: {}", path.display())]
    IsADirectory { path: PathBuf },

    /// Output or file content exceeded the configured limit.
    #[error("Output limit exceeded: {size} bytes (limit {limit} bytes)")]
    OutputLimitExceeded { size: usize, limit: usize },

    /// Command execution exceeded the per-call timeout.
    #[error("Command timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// The run was cancelled while the operation was pending.
    #[error("Sandbox operation interrupted")]
    Interrupted,

    /// Best-effort teardown did not complete; resources were left behind.
    #[error("Sandbox cleanup did not complete for set {set_id}: {message}")]
    InterruptedCleanup { set_id: String, message: String },
}

impl SandboxError {
    /// Creates a `Configuration` error.
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Creates a `Provisioning` error.
    pub fn provisioning(message: impl Into<String>) -> Self {
        Self::Provisioning {
            message: message.into(),
        }
    }

    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates an `Execution` error.
    pub fn execution(message: impl Into<String>) -> Self {
        Self::Execution {
            message: message.into(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(path: impl AsRef<Path>) -> Self {
        Self::NotFound {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Creates a `PermissionDenied` error.
    pub fn permission_denied(path: impl AsRef<Path>) -> Self {
        Self::PermissionDenied {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Creates an `IsADirectory` error.
    pub fn is_a_directory(path: impl AsRef<Path>) -> Self {
        Self::IsADirectory {
            path: path.as_ref().to_path_buf(),
        }
    }

    /// Creates an `OutputLimitExceeded` error.
    pub fn output_limit_exceeded(size: usize, limit: usize) -> Self {
        Self::OutputLimitExceeded { size, limit }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates an `InterruptedCleanup` error.
    pub fn interrupted_cleanup(set_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InterruptedCleanup {
            set_id: set_id.into(),
            message: message.into(),
        }
    }

    /// Maps an I/O error on `path` onto the sandbox taxonomy.
    pub fn from_io(err: &std::io::Error, path: impl AsRef<Path>) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::not_found(path),
            std::io::ErrorKind::PermissionDenied => Self::permission_denied(path),
            _ if is_directory_error(err) => Self::is_a_directory(path),
            _ => Self::execution(format!("{}: {err}", path.as_ref().display())),
        }
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if this is a missing-file error.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if this is a configuration error.
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::Configuration { .. })
    }

    /// Returns true if this is a provisioning error.
    pub fn is_provisioning(&self) -> bool {
        matches!(
            self,
            Self::Provisioning { .. } | Self::DockerUnavailable { .. }
        )
    }

    /// Returns true if the run was cancelled.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Returns true for failures tool logic should report back to the
    /// model rather than propagate as a crash.
    pub fn is_tool_error(&self) -> bool {
        matches!(
            self,
            Self::Execution { .. }
                | Self::NotFound { .. }
                | Self::PermissionDenied { .. }
                | Self::IsADirectory { .. }
                | Self::OutputLimitExceeded { .. }
                | Self::Timeout { .. }
        )
    }
}

fn is_directory_error(err: &std::io::Error) -> bool {
    // EISDIR has no stable ErrorKind on the MSRV we target.
    err.raw_os_error() == Some(21) || err.to_string().contains("Is a directory")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error() {
        let err = SandboxError::configuration("unknown backend 'podman'");
        assert!(err.is_configuration());
        assert!(!err.is_tool_error());
        assert_eq!(
            err.to_string(),
            "Sandbox configuration error: unknown backend 'podman'"
        );
    }

    #[test]
    fn test_docker_unavailable_is_provisioning() {
        let err = SandboxError::docker_unavailable("daemon not running");
        assert!(err.is_provisioning());
        assert_eq!(
            err.to_string(),
            "Docker is not available: daemon not running"
        );
    }

    #[test]
    fn test_timeout_error() {
        let err = SandboxError::timeout(Duration::from_secs(30));
        assert!(err.is_timeout());
        assert!(err.is_tool_error());
        assert_eq!(err.to_string(), "Command timed out after 30 seconds");
    }

    #[test]
    fn test_not_found_error() {
        let err = SandboxError::not_found("/tmp/missing.txt");
        assert!(err.is_not_found());
        assert!(err.is_tool_error());
        assert_eq!(
            err.to_string(),
            "File not found in sandbox: /tmp/missing.txt"
        );
    }

    #[test]
    fn test_from_io_maps_kinds() {
        let missing = std::io::Error::from(std::io::ErrorKind::NotFound);
        assert!(SandboxError::from_io(&missing, "a").is_not_found());

        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(matches!(
            SandboxError::from_io(&denied, "b"),
            SandboxError::PermissionDenied { .. }
        ));

        let other = std::io::Error::other("boom");
        assert!(matches!(
            SandboxError::from_io(&other, "c"),
            SandboxError::Execution { .. }
        ));
    }

    #[test]
    fn test_interrupted_cleanup_error() {
        let err = SandboxError::interrupted_cleanup("abc123", "grace period elapsed");
        assert!(!err.is_tool_error());
        assert_eq!(
            err.to_string(),
            "Sandbox cleanup did not complete for set abc123: grace period elapsed"
        );
    }

    #[test]
    fn test_error_variants_are_distinct() {
        let timeout = SandboxError::timeout(Duration::from_secs(60));
        let config = SandboxError::configuration("test");
        let interrupted = SandboxError::Interrupted;

        assert!(timeout.is_timeout());
        assert!(!timeout.is_configuration());
        assert!(!timeout.is_interrupted());

        assert!(!config.is_timeout());
        assert!(config.is_configuration());

        assert!(interrupted.is_interrupted());
        assert!(!interrupted.is_tool_error());
    }
}
