//! Execution backends for isolated sample environments.
//!
//! A backend knows how to turn an [`EnvironmentConfigIdentity`] into live
//! environments: `local` runs against a scratch directory on the host,
//! `docker` provisions containers through the Docker API. Further
//! backends are contributed by name through the [`BackendRegistry`].

mod compose;
mod docker;
mod error;
mod interpolate;
mod local;
#[cfg(test)]
pub(crate) mod mock;
mod registry;
mod set;

pub(crate) use compose::Command;
pub(crate) use docker::DockerBackend;
pub(crate) use error::SandboxError;
pub(crate) use local::LocalBackend;
pub(crate) use registry::{BackendContext, BackendRegistry};
pub(crate) use set::EnvironmentSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::identity::EnvironmentConfigIdentity;

/// Result alias for sandbox operations.
pub(crate) type SandboxResult<T> = Result<T, SandboxError>;

/// Sample metadata available for config interpolation.
pub(crate) type SampleMetadata = BTreeMap<String, String>;

/// Name of the environment targeted by unqualified lookups.
pub(crate) const DEFAULT_ENVIRONMENT: &str = "default";

/// Data piped to a command's stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ExecInput {
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl ExecInput {
    /// Borrows the input as bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            Self::Text(text) => text.as_bytes(),
            Self::Bytes(bytes) => bytes,
        }
    }
}

/// A single command invocation.
#[derive(Debug, Clone, Default)]
pub(crate) struct ExecRequest {
    /// Program and arguments. Never interpreted by a shell.
    pub cmd: Vec<String>,
    /// Optional stdin payload.
    pub input: Option<ExecInput>,
    /// Working directory, relative paths resolve against the environment root.
    pub cwd: Option<String>,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
    /// User to run as (container backends only).
    pub user: Option<String>,
    /// Per-call timeout.
    pub timeout: Option<Duration>,
}

impl ExecRequest {
    /// Creates a request for `cmd` with no input, env, or timeout.
    pub fn new<I, S>(cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            cmd: cmd.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_input(mut self, input: ExecInput) -> Self {
        self.input = Some(input);
        self
    }

    #[must_use]
    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self
    }
}

/// Outcome of a command that ran to completion.
///
/// A non-zero exit is a normal result, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExecResult {
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    /// Builds a result from raw process output, decoding both streams as UTF-8.
    pub fn from_output(
        exit_code: i32,
        stdout: Vec<u8>,
        stderr: Vec<u8>,
        limit: usize,
    ) -> SandboxResult<Self> {
        let size = stdout.len() + stderr.len();
        if size > limit {
            return Err(SandboxError::output_limit_exceeded(size, limit));
        }
        let stdout = String::from_utf8(stdout)
            .map_err(|_| SandboxError::execution("unable to decode command output as UTF-8"))?;
        let stderr = String::from_utf8(stderr)
            .map_err(|_| SandboxError::execution("unable to decode command stderr as UTF-8"))?;
        Ok(Self {
            success: exit_code == 0,
            exit_code,
            stdout,
            stderr,
        })
    }
}

/// Human-actionable reference to one live isolation unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HandleDescriptor {
    /// Logical environment name within the set.
    pub name: String,
    /// Backend resource identifier (container name, directory, ...).
    pub resource: String,
}

impl fmt::Display for HandleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name, self.resource)
    }
}

/// One running isolation unit.
#[async_trait]
pub(crate) trait SandboxEnvironment: Send + Sync {
    /// Runs a command. Non-zero exit is reported in the result.
    async fn exec(&self, request: ExecRequest) -> SandboxResult<ExecResult>;

    /// Writes `contents` to `path`, creating parent directories.
    async fn write_file(&self, path: &str, contents: &[u8]) -> SandboxResult<()>;

    /// Reads `path` as raw bytes.
    async fn read_file(&self, path: &str) -> SandboxResult<Vec<u8>>;

    /// Identifies the underlying resource for cleanup reporting.
    fn descriptor(&self) -> HandleDescriptor;
}

/// Lifecycle hooks a backend variant implements.
///
/// The orchestrator guarantees `config_init` runs at most once per
/// identity and `config_cleanup` once after every sample sharing the
/// identity is done. Implementations must tolerate concurrent calls for
/// distinct sets.
#[async_trait]
pub(crate) trait SandboxBackend: Send + Sync {
    /// Registry name of this backend.
    fn name(&self) -> &str;

    /// File names probed in the task directory when a task names no config.
    fn config_candidates(&self) -> &'static [&'static str] {
        &[]
    }

    /// Checks the identity's configuration without provisioning anything.
    ///
    /// Called while tasks are resolved so malformed configs fail before
    /// the first sample runs.
    async fn validate_config(&self, _identity: &EnvironmentConfigIdentity) -> SandboxResult<()> {
        Ok(())
    }

    /// Expensive one-time setup (image build/pull).
    async fn config_init(&self, identity: &EnvironmentConfigIdentity) -> SandboxResult<()>;

    /// Provisions the environment set for one sample.
    ///
    /// Every resource created must be tagged with `set_id` so that it can
    /// be found again by [`SandboxBackend::cli_cleanup`].
    async fn sample_setup(
        &self,
        identity: &EnvironmentConfigIdentity,
        set_id: &str,
        metadata: &SampleMetadata,
    ) -> SandboxResult<EnvironmentSet>;

    /// Releases a sample's environments.
    ///
    /// `set` is `None` when provisioning failed part-way; implementations
    /// must then clean up by `set_id` alone.
    async fn sample_teardown(
        &self,
        identity: &EnvironmentConfigIdentity,
        set_id: &str,
        set: Option<&EnvironmentSet>,
        interrupted: bool,
    ) -> SandboxResult<()>;

    /// Final pass once every sample sharing `identity` has finished.
    ///
    /// With `perform_cleanup == false` nothing is removed; the identifiers
    /// of still-live resources are returned instead.
    async fn config_cleanup(
        &self,
        identity: &EnvironmentConfigIdentity,
        perform_cleanup: bool,
    ) -> SandboxResult<Vec<String>>;

    /// Operator-driven removal of everything this backend created, or of
    /// one set when `target` is given. Returns the number of resources
    /// removed.
    async fn cli_cleanup(&self, target: Option<&str>) -> SandboxResult<usize>;
}

/// Expands a leading `~/` to the home directory.
pub(crate) fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_request_builder() {
        let request = ExecRequest::new(["echo", "hi"])
            .with_cwd("sub")
            .with_env("A", "1")
            .with_timeout(Duration::from_secs(5));
        assert_eq!(request.cmd, vec!["echo", "hi"]);
        assert_eq!(request.cwd.as_deref(), Some("sub"));
        assert_eq!(request.env.get("A").map(String::as_str), Some("1"));
        assert_eq!(request.timeout, Some(Duration::from_secs(5)));
        assert!(request.input.is_none());
    }

    #[test]
    fn test_exec_result_from_output() {
        let result = ExecResult::from_output(0, b"hi\n".to_vec(), Vec::new(), 1024).unwrap();
        assert!(result.success);
        assert_eq!(result.stdout, "hi\n");

        let failed = ExecResult::from_output(1, Vec::new(), b"nope".to_vec(), 1024).unwrap();
        assert!(!failed.success);
        assert_eq!(failed.exit_code, 1);
    }

    #[test]
    fn test_exec_result_rejects_binary_output() {
        let err = ExecResult::from_output(0, vec![0xff, 0xfe], Vec::new(), 1024).unwrap_err();
        assert!(matches!(err, SandboxError::Execution { .. }));
    }

    #[test]
    fn test_exec_result_enforces_limit() {
        let err = ExecResult::from_output(0, vec![b'a'; 10], vec![b'b'; 10], 15).unwrap_err();
        assert!(matches!(
            err,
            SandboxError::OutputLimitExceeded {
                size: 20,
                limit: 15
            }
        ));
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/usr/bin"), PathBuf::from("/usr/bin"));
        if dirs::home_dir().is_some() {
            let expanded = expand_home("~/.ssh");
            assert!(!expanded.starts_with("~"));
            assert!(expanded.ends_with(".ssh"));
        }
    }
}
