//! Environment configuration identity.
//!
//! An identity is the `(backend, config reference)` pair tasks are
//! deduplicated on: tasks with equal identities share one `config_init`
//! and one `config_cleanup`. Resolving an identity never reads config file
//! contents, only the path.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

use crate::sandbox::expand_home;

/// Deduplication key for a backend + config pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub(crate) struct EnvironmentConfigIdentity {
    /// Registered backend name.
    pub backend: String,
    /// Absolute config path when the reference names a file, the raw
    /// reference otherwise.
    pub config: Option<String>,
}

impl EnvironmentConfigIdentity {
    pub fn new(backend: impl Into<String>, config: Option<String>) -> Self {
        Self {
            backend: backend.into(),
            config,
        }
    }

    /// The config reference as a filesystem path, when it is one.
    pub fn config_path(&self) -> Option<PathBuf> {
        self.config
            .as_deref()
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
    }
}

impl fmt::Display for EnvironmentConfigIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.config {
            Some(config) => write!(f, "{}:{}", self.backend, config),
            None => write!(f, "{}", self.backend),
        }
    }
}

/// Computes the identity for a task's declared sandbox.
///
/// Relative references are joined onto `task_dir`; references that name
/// an existing file become absolute so the same file reached from
/// different working directories deduplicates.
pub(crate) fn resolve(
    backend_name: &str,
    config_reference: Option<&str>,
    task_dir: &Path,
) -> EnvironmentConfigIdentity {
    let config = config_reference.map(|reference| {
        let path = expand_home(reference);
        let path = if path.is_absolute() {
            path
        } else {
            task_dir.join(path)
        };
        if path.is_file() {
            absolutize(&path).display().to_string()
        } else {
            reference.to_string()
        }
    });
    EnvironmentConfigIdentity::new(backend_name, config)
}

/// Like [`resolve`], but when no reference is given looks for the first of
/// `candidates` present in `task_dir`.
pub(crate) fn resolve_with_discovery(
    backend_name: &str,
    config_reference: Option<&str>,
    task_dir: &Path,
    candidates: &[&str],
) -> EnvironmentConfigIdentity {
    if config_reference.is_some() {
        return resolve(backend_name, config_reference, task_dir);
    }
    let discovered = candidates
        .iter()
        .map(|name| task_dir.join(name))
        .find(|path| path.is_file())
        .map(|path| absolutize(&path).display().to_string());
    EnvironmentConfigIdentity::new(backend_name, discovered)
}

fn absolutize(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

/// A sandbox declaration: backend name plus optional config reference.
///
/// Written as `"docker"`, `"docker:compose.yaml"`, or as a table with
/// `backend` and `config` keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SandboxSpecRepr")]
pub(crate) struct SandboxSpec {
    pub backend: String,
    pub config: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SandboxSpecRepr {
    Short(String),
    Full {
        backend: String,
        #[serde(default)]
        config: Option<String>,
    },
}

impl From<SandboxSpecRepr> for SandboxSpec {
    fn from(repr: SandboxSpecRepr) -> Self {
        match repr {
            SandboxSpecRepr::Short(s) => Self::parse(&s),
            SandboxSpecRepr::Full { backend, config } => Self { backend, config },
        }
    }
}

impl SandboxSpec {
    /// Parses `backend[:config]`.
    pub fn parse(s: &str) -> Self {
        match s.split_once(':') {
            Some((backend, config)) if !config.is_empty() => Self {
                backend: backend.to_string(),
                config: Some(config.to_string()),
            },
            Some((backend, _)) => Self {
                backend: backend.to_string(),
                config: None,
            },
            None => Self {
                backend: s.to_string(),
                config: None,
            },
        }
    }

    /// Run-level overrides win over the task's own declaration.
    pub fn effective(run_level: Option<&Self>, task_level: Option<&Self>) -> Option<Self> {
        run_level.or(task_level).cloned()
    }
}

impl std::str::FromStr for SandboxSpec {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}
