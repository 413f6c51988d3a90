use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_FILE: &str = "sandkit.toml";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub run: RunConfig,
    #[serde(default)]
    pub exec: ExecConfig,
    #[serde(default)]
    pub docker: DockerConfig,
}

/// Run-level concurrency and cleanup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Concurrent model connections; also the default sandbox bound
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,

    /// Maximum concurrently live sample environment sets
    #[serde(default)]
    pub max_sandboxes: Option<usize>,

    /// Maximum concurrently running commands (default: logical cores)
    #[serde(default)]
    pub max_exec_slots: Option<usize>,

    /// Tear down environments when samples and tasks finish
    #[serde(default = "default_true")]
    pub cleanup: bool,

    /// How long interrupted teardown may take before resources are
    /// recorded as orphaned
    #[serde(default = "default_teardown_grace")]
    pub teardown_grace_secs: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_connections: default_max_connections(),
            max_sandboxes: None,
            max_exec_slots: None,
            cleanup: true,
            teardown_grace_secs: default_teardown_grace(),
        }
    }
}

impl RunConfig {
    pub fn sandbox_slots(&self) -> usize {
        self.max_sandboxes.unwrap_or(self.max_connections).max(1)
    }

    pub fn exec_slots(&self) -> usize {
        self.max_exec_slots.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn teardown_grace(&self) -> Duration {
        Duration::from_secs(self.teardown_grace_secs)
    }
}

/// Limits applied to every backend's exec and file reads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecConfig {
    /// Combined stdout + stderr limit
    #[serde(default = "default_max_output")]
    pub max_output_bytes: usize,

    /// Largest file `read_file` will return
    #[serde(default = "default_max_read")]
    pub max_read_bytes: usize,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            max_output_bytes: default_max_output(),
            max_read_bytes: default_max_read(),
        }
    }
}

/// Container backend settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DockerConfig {
    /// Image used when a task names no config
    #[serde(default = "default_image")]
    pub default_image: String,

    /// Working directory for services that set none
    #[serde(default = "default_working_dir")]
    pub working_dir: String,

    /// Pull images that are not present locally
    #[serde(default = "default_true")]
    pub pull_missing: bool,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            default_image: default_image(),
            working_dir: default_working_dir(),
            pull_missing: true,
        }
    }
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_max_connections() -> usize {
    10
}

fn default_teardown_grace() -> u64 {
    30
}

fn default_max_output() -> usize {
    10 * 1024 * 1024
}

fn default_max_read() -> usize {
    100 * 1024 * 1024
}

fn default_image() -> String {
    "python:3.12-bookworm".to_string()
}

fn default_working_dir() -> String {
    "/workspace".to_string()
}

impl Config {
    /// Load configuration from file, using defaults if not found
    pub fn load(project_dir: &Path) -> Result<Self> {
        let config_path = project_dir.join(CONFIG_FILE);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&config_path)
            .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", config_path.display()))?;

        Ok(config)
    }
}

/// Directory holding the cleanup ledger and local workspaces.
pub fn default_state_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("sandkit")
}
