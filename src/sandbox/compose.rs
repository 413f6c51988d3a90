//! Compose-style service definitions for the container backend.
//!
//! A config reference may name a compose YAML file, a Dockerfile, or an
//! image; with no reference the configured default image is used. The
//! raw template is kept per identity and rendered per sample after
//! metadata interpolation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::interpolate::interpolate;
use super::set::default_environment_name;
use super::{SampleMetadata, SandboxError, SandboxResult, DEFAULT_ENVIRONMENT};
use crate::identity::EnvironmentConfigIdentity;

/// Config files the resolver looks for when a task names none.
pub(crate) const CONFIG_CANDIDATES: &[&str] = &[
    "compose.yaml",
    "compose.yml",
    "docker-compose.yaml",
    "docker-compose.yml",
    "Dockerfile",
];

/// Parsed service definitions.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ComposeConfig {
    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,
}

/// One service. Unknown compose keys are ignored.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub(crate) struct ServiceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build: Option<BuildConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Environment::is_empty")]
    pub environment: Environment,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Command>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mem_limit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

/// `build: ./dir` or `build: { context, dockerfile }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum BuildConfig {
    Context(String),
    Full {
        context: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dockerfile: Option<String>,
    },
}

impl BuildConfig {
    pub fn context(&self) -> &str {
        match self {
            Self::Context(context) | Self::Full { context, .. } => context,
        }
    }

    pub fn dockerfile(&self) -> &str {
        match self {
            Self::Full {
                dockerfile: Some(dockerfile),
                ..
            } => dockerfile,
            _ => "Dockerfile",
        }
    }
}

/// Environment as a map or a `KEY=VALUE` list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum Environment {
    Map(BTreeMap<String, String>),
    List(Vec<String>),
}

impl Default for Environment {
    fn default() -> Self {
        Self::Map(BTreeMap::new())
    }
}

impl Environment {
    fn is_empty(&self) -> bool {
        match self {
            Self::Map(map) => map.is_empty(),
            Self::List(list) => list.is_empty(),
        }
    }

    /// `KEY=VALUE` pairs as Docker expects them.
    pub fn to_pairs(&self) -> Vec<String> {
        match self {
            Self::Map(map) => map.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            Self::List(list) => list.clone(),
        }
    }
}

/// `command: "sleep infinity"` or `command: ["sleep", "infinity"]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub(crate) enum Command {
    Shell(String),
    Exec(Vec<String>),
}

impl Command {
    pub fn to_argv(&self) -> SandboxResult<Vec<String>> {
        match self {
            Self::Shell(line) => shell_words::split(line).map_err(|e| {
                SandboxError::configuration(format!("invalid service command '{line}': {e}"))
            }),
            Self::Exec(argv) => Ok(argv.clone()),
        }
    }
}

impl ComposeConfig {
    /// Name of the service unqualified lookups resolve to.
    pub fn default_service(&self) -> SandboxResult<String> {
        let names: Vec<String> = self.services.keys().cloned().collect();
        default_environment_name(&names)
    }

    fn validate(&self) -> SandboxResult<()> {
        self.default_service()?;
        for (name, service) in &self.services {
            if service.image.is_none() && service.build.is_none() {
                return Err(SandboxError::configuration(format!(
                    "service '{name}' needs an 'image' or a 'build' section"
                )));
            }
            if let Some(limit) = &service.mem_limit {
                parse_memory_limit(limit)?;
            }
        }
        Ok(())
    }
}

/// Unrendered service definitions for one identity.
#[derive(Debug, Clone)]
pub(crate) struct ComposeTemplate {
    raw: String,
    base_dir: PathBuf,
    project: String,
}

impl ComposeTemplate {
    /// Builds the template for `identity`, reading the compose file if the
    /// reference names one.
    pub fn load(identity: &EnvironmentConfigIdentity, default_image: &str) -> SandboxResult<Self> {
        let project = project_name(identity);
        match (identity.config.as_deref(), identity.config_path()) {
            (None, _) => Self::single_image(default_image, project),
            (Some(_), Some(path)) if is_dockerfile(&path) => Self::dockerfile(&path, project),
            (Some(_), Some(path)) => {
                let raw = std::fs::read_to_string(&path).map_err(|e| {
                    SandboxError::configuration(format!(
                        "failed to read config {}: {e}",
                        path.display()
                    ))
                })?;
                let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
                Ok(Self {
                    raw,
                    base_dir,
                    project,
                })
            }
            (Some(image), None) => Self::single_image(image, project),
        }
    }

    fn single_image(image: &str, project: String) -> SandboxResult<Self> {
        Self::from_service(
            ServiceConfig {
                image: Some(image.to_string()),
                ..Default::default()
            },
            PathBuf::new(),
            project,
        )
    }

    fn dockerfile(path: &Path, project: String) -> SandboxResult<Self> {
        let base_dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
        let dockerfile = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "Dockerfile".to_string());
        Self::from_service(
            ServiceConfig {
                build: Some(BuildConfig::Full {
                    context: ".".to_string(),
                    dockerfile: Some(dockerfile),
                }),
                ..Default::default()
            },
            base_dir,
            project,
        )
    }

    fn from_service(service: ServiceConfig, base_dir: PathBuf, project: String) -> SandboxResult<Self> {
        let config = ComposeConfig {
            services: BTreeMap::from([(DEFAULT_ENVIRONMENT.to_string(), service)]),
        };
        let raw = serde_yaml::to_string(&config)
            .map_err(|e| SandboxError::configuration(format!("failed to encode config: {e}")))?;
        Ok(Self {
            raw,
            base_dir,
            project,
        })
    }

    /// Interpolates `metadata` and parses the result.
    pub fn render(&self, metadata: &SampleMetadata) -> SandboxResult<ComposeConfig> {
        let text = interpolate(&self.raw, metadata)?;
        let config: ComposeConfig = serde_yaml::from_str(&text)
            .map_err(|e| SandboxError::configuration(format!("invalid compose config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Directory build contexts are relative to.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Short stable name derived from the identity, used for image tags
    /// and container labels.
    pub fn project(&self) -> &str {
        &self.project
    }

    /// Image a service runs: its `image`, or the tag its build produces.
    pub fn image_for(&self, name: &str, service: &ServiceConfig) -> String {
        match (&service.image, &service.build) {
            (Some(image), _) => image.clone(),
            (None, _) => format!("sandkit-{}-{}:latest", self.project, name.to_lowercase()),
        }
    }
}

fn is_dockerfile(path: &Path) -> bool {
    path.file_name()
        .is_some_and(|n| n.to_string_lossy().contains("Dockerfile"))
}

/// Short content-free hash of an identity.
pub(crate) fn project_name(identity: &EnvironmentConfigIdentity) -> String {
    let digest = Sha256::digest(identity.to_string().as_bytes());
    format!("{digest:x}")[..12].to_string()
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
pub(crate) fn parse_memory_limit(limit: &str) -> SandboxResult<i64> {
    let lower = limit.to_lowercase();
    let invalid = |_| SandboxError::configuration(format!("invalid memory limit '{limit}'"));

    if let Some(num) = lower.strip_suffix('g') {
        let gigs: i64 = num.parse().map_err(invalid)?;
        Ok(gigs * 1024 * 1024 * 1024)
    } else if let Some(num) = lower.strip_suffix('m') {
        let megs: i64 = num.parse().map_err(invalid)?;
        Ok(megs * 1024 * 1024)
    } else {
        lower.parse().map_err(invalid)
    }
}
