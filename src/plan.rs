//! Run plans: tasks, their samples, and scripted sample steps.
//!
//! ```toml
//! sandbox = "local"
//!
//! [[tasks]]
//! name = "hello"
//!
//! [[tasks.samples]]
//! id = "1"
//! files = { "notes.txt" = "hello" }
//! setup = "echo ready > ready.txt"
//!
//! [[tasks.samples.steps]]
//! exec = ["cat", "notes.txt"]
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::assets::SampleAssets;
use crate::identity::SandboxSpec;
use crate::orchestrator::{SampleSpec, TaskSpec};
use crate::sandbox::{Command, ExecInput, ExecRequest, SampleMetadata};

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct Plan {
    /// Sandbox for tasks that declare none.
    #[serde(default)]
    pub sandbox: Option<SandboxSpec>,
    #[serde(default)]
    pub tasks: Vec<PlanTask>,
    #[serde(skip)]
    pub base_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PlanTask {
    pub name: String,
    #[serde(default)]
    pub sandbox: Option<SandboxSpec>,
    /// Task directory, relative to the plan file.
    #[serde(default)]
    pub dir: Option<PathBuf>,
    #[serde(default)]
    pub samples: Vec<PlanSample>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PlanSample {
    pub id: String,
    #[serde(default)]
    pub metadata: SampleMetadata,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub setup: Option<String>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

/// One scripted tool call.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum Step {
    Exec {
        exec: Command,
        #[serde(default)]
        input: Option<String>,
        #[serde(default)]
        cwd: Option<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        user: Option<String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
        #[serde(default)]
        environment: Option<String>,
    },
    Read {
        read: String,
        #[serde(default)]
        environment: Option<String>,
    },
    Write {
        write: String,
        content: String,
        #[serde(default)]
        environment: Option<String>,
    },
}

impl Step {
    /// Environment the step targets, `None` for the default.
    pub fn environment(&self) -> Option<&str> {
        match self {
            Self::Exec { environment, .. }
            | Self::Read { environment, .. }
            | Self::Write { environment, .. } => environment.as_deref(),
        }
    }

    /// Short human description, e.g. `exec: echo hi`.
    pub fn describe(&self) -> String {
        let target = self
            .environment()
            .map(|env| format!("[{env}] "))
            .unwrap_or_default();
        match self {
            Self::Exec { exec, .. } => match exec {
                Command::Shell(line) => format!("{target}exec: {line}"),
                Command::Exec(argv) => format!("{target}exec: {}", shell_words::join(argv)),
            },
            Self::Read { read, .. } => format!("{target}read: {read}"),
            Self::Write { write, .. } => format!("{target}write: {write}"),
        }
    }

    /// The exec request for an `exec` step.
    pub fn exec_request(&self) -> Option<crate::sandbox::SandboxResult<ExecRequest>> {
        let Self::Exec {
            exec,
            input,
            cwd,
            env,
            user,
            timeout_secs,
            ..
        } = self
        else {
            return None;
        };
        Some(exec.to_argv().map(|argv| ExecRequest {
            cmd: argv,
            input: input.clone().map(ExecInput::Text),
            cwd: cwd.clone(),
            env: env.clone(),
            user: user.clone(),
            timeout: timeout_secs.map(Duration::from_secs),
        }))
    }
}

impl Plan {
    /// Loads a plan file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read plan: {}", path.display()))?;
        let mut plan: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse plan: {}", path.display()))?;
        plan.base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| PathBuf::from("."));
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<()> {
        if self.tasks.is_empty() {
            bail!("Plan defines no tasks");
        }
        let mut names = std::collections::HashSet::new();
        for task in &self.tasks {
            if !names.insert(task.name.as_str()) {
                bail!("Duplicate task name '{}'", task.name);
            }
            let mut ids = std::collections::HashSet::new();
            for sample in &task.samples {
                if !ids.insert(sample.id.as_str()) {
                    bail!("Duplicate sample id '{}' in task '{}'", sample.id, task.name);
                }
            }
        }
        Ok(())
    }

    /// Orchestrator task declarations, plan-level sandbox as fallback.
    pub fn task_specs(&self) -> Vec<TaskSpec> {
        self.tasks
            .iter()
            .map(|task| TaskSpec {
                name: task.name.clone(),
                sandbox: task.sandbox.clone().or_else(|| self.sandbox.clone()),
                dir: task
                    .dir
                    .as_ref()
                    .map_or_else(|| self.base_dir.clone(), |dir| self.base_dir.join(dir)),
            })
            .collect()
    }
}

impl PlanSample {
    pub fn spec(&self) -> SampleSpec {
        SampleSpec {
            id: self.id.clone(),
            metadata: self.metadata.clone(),
            assets: SampleAssets {
                files: self.files.clone(),
                setup: self.setup.clone(),
            },
        }
    }
}
