//! Execute a run plan through the orchestrator.
//!
//! Each sample's scripted steps stand in for a tool-calling loop: tool
//! errors (missing files, timeouts, undecodable output) fail the step and
//! the sample carries on, as a model would see them. Provisioning and
//! configuration errors fail the sample.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use futures_util::future::join_all;
use std::fmt::Write;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::cleanup::CleanupRegistry;
use crate::config::Config;
use crate::governor::Governor;
use crate::identity::SandboxSpec;
use crate::orchestrator::{
    Orchestrator, OrchestratorOptions, PreparedTask, RetainedSet, SampleContext,
};
use crate::plan::{Plan, PlanTask, Step};
use crate::sandbox::{BackendContext, BackendRegistry, SandboxResult};

/// Flags for `sandkit run`.
#[derive(Debug, Clone, Default)]
pub struct RunArgs {
    pub plan: PathBuf,
    pub sandbox: Option<String>,
    pub no_cleanup: bool,
    pub max_sandboxes: Option<usize>,
    pub max_exec_slots: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    pub description: String,
    pub ok: bool,
    pub detail: String,
}

#[derive(Debug, Clone)]
pub struct SampleReport {
    pub task: String,
    pub sample: String,
    /// Step outcomes, or why the sample could not run.
    pub outcome: Result<Vec<StepOutcome>, String>,
}

impl SampleReport {
    pub fn passed(&self) -> bool {
        self.outcome
            .as_ref()
            .is_ok_and(|steps| steps.iter().all(|s| s.ok))
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub samples: Vec<SampleReport>,
    pub retained: Vec<RetainedSet>,
    /// Resources `config_cleanup` reported as still running, per identity.
    pub live: Vec<(String, Vec<String>)>,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn failed(&self) -> usize {
        self.samples.iter().filter(|s| !s.passed()).count()
    }
}

/// Applies command-line overrides on top of `sandkit.toml`.
pub fn apply_overrides(config: &mut Config, args: &RunArgs) {
    if args.no_cleanup {
        config.run.cleanup = false;
    }
    if let Some(n) = args.max_sandboxes {
        config.run.max_sandboxes = Some(n);
    }
    if let Some(n) = args.max_exec_slots {
        config.run.max_exec_slots = Some(n);
    }
}

/// Runs one sample's steps in order.
pub async fn run_steps(context: SampleContext, steps: Vec<Step>) -> SandboxResult<Vec<StepOutcome>> {
    let mut outcomes = Vec::with_capacity(steps.len());
    for step in steps {
        let sandbox = context.environment(step.environment())?;
        let description = step.describe();
        let result = match &step {
            Step::Exec { .. } => match step.exec_request() {
                Some(request) => match sandbox.exec(request?).await {
                    Ok(result) if result.success => Ok(result.stdout),
                    Ok(result) => Err(format!(
                        "exit code {}: {}",
                        result.exit_code,
                        result.stderr.trim()
                    )),
                    Err(e) => Err(tool_error(e)?),
                },
                None => continue,
            },
            Step::Read { read, .. } => match sandbox.read_text(read).await {
                Ok(text) => Ok(text),
                Err(e) => Err(tool_error(e)?),
            },
            Step::Write { write, content, .. } => match sandbox.write_file(write, content).await {
                Ok(()) => Ok(String::new()),
                Err(e) => Err(tool_error(e)?),
            },
        };
        outcomes.push(match result {
            Ok(detail) => StepOutcome {
                description,
                ok: true,
                detail: detail.trim_end().to_string(),
            },
            Err(detail) => StepOutcome {
                description,
                ok: false,
                detail,
            },
        });
    }
    Ok(outcomes)
}

/// Tool errors become step failures; anything else ends the sample.
fn tool_error(err: crate::sandbox::SandboxError) -> SandboxResult<String> {
    if err.is_tool_error() {
        Ok(err.to_string())
    } else {
        Err(err)
    }
}

async fn run_task(
    orchestrator: &Orchestrator,
    task: &PreparedTask,
    plan_task: &PlanTask,
) -> (Vec<SampleReport>, Option<(String, Vec<String>)>) {
    let reports = join_all(plan_task.samples.iter().map(|sample| async move {
        let spec = sample.spec();
        let outcome = orchestrator
            .run_sample(task, &spec, |ctx| run_steps(ctx, sample.steps.clone()))
            .await
            .map_err(|e| e.to_string());
        SampleReport {
            task: task.name.clone(),
            sample: sample.id.clone(),
            outcome,
        }
    }))
    .await;

    let live = match orchestrator.task_complete(task).await {
        Ok(live) if !live.is_empty() => Some((task.identity.to_string(), live)),
        Ok(_) => None,
        Err(e) => {
            warn!(task = %task.name, "config cleanup failed: {e}");
            None
        }
    };
    (reports, live)
}

/// Runs every task of `plan` concurrently.
pub async fn execute(
    plan: &Plan,
    args: &RunArgs,
    context: BackendContext,
    cancel: CancellationToken,
) -> Result<RunSummary> {
    let ledger = CleanupRegistry::open(&context.state_dir)?;
    let governor = Governor::from_config(&context.config.run);
    let options = OrchestratorOptions {
        cleanup: context.config.run.cleanup,
        teardown_grace: context.config.run.teardown_grace(),
    };
    let backends = Arc::new(BackendRegistry::with_builtins(context));
    let orchestrator = Orchestrator::new(backends, ledger, governor, cancel, options);

    let run_override = args.sandbox.as_deref().map(SandboxSpec::parse);
    let tasks = orchestrator
        .prepare(&plan.task_specs(), run_override.as_ref())
        .await
        .context("Failed to resolve task sandboxes")?;

    let results = join_all(
        tasks
            .iter()
            .zip(&plan.tasks)
            .map(|(task, plan_task)| run_task(&orchestrator, task, plan_task)),
    )
    .await;

    let mut summary = RunSummary {
        retained: orchestrator.retained(),
        interrupted: orchestrator.cancel_token().is_cancelled(),
        ..Default::default()
    };
    for (reports, live) in results {
        summary.samples.extend(reports);
        summary.live.extend(live);
    }
    Ok(summary)
}

/// Format the run summary as a displayable string
pub fn format_summary(summary: &RunSummary) -> String {
    let mut out = String::new();
    writeln!(&mut out, "\n{}", "Results".bold()).unwrap();
    for report in &summary.samples {
        let mark = if report.passed() {
            "✓".green()
        } else {
            "✗".red()
        };
        match &report.outcome {
            Ok(steps) => {
                writeln!(&mut out, "  {} {}/{}", mark, report.task, report.sample).unwrap();
                for step in steps {
                    let step_mark = if step.ok { "✓".green() } else { "✗".red() };
                    writeln!(&mut out, "      {} {}", step_mark, step.description).unwrap();
                    for line in step.detail.lines() {
                        writeln!(&mut out, "          {}", line.dimmed()).unwrap();
                    }
                }
            }
            Err(reason) => {
                writeln!(
                    &mut out,
                    "  {} {}/{}  {}",
                    mark,
                    report.task,
                    report.sample,
                    reason.red()
                )
                .unwrap();
            }
        }
    }

    if !summary.retained.is_empty() {
        writeln!(
            &mut out,
            "\n{} Environments retained (cleanup disabled):",
            "ℹ".blue()
        )
        .unwrap();
        for set in &summary.retained {
            writeln!(&mut out, "  {} {}", set.backend.cyan(), set.set_id).unwrap();
            for handle in &set.handles {
                writeln!(&mut out, "      {}", handle.to_string().dimmed()).unwrap();
            }
            writeln!(
                &mut out,
                "      sandkit cleanup {} {}",
                set.backend, set.set_id
            )
            .unwrap();
        }
    }

    for (identity, resources) in &summary.live {
        writeln!(
            &mut out,
            "\n{} Still running for {}: {}",
            "ℹ".blue(),
            identity,
            resources.join(", ")
        )
        .unwrap();
    }

    let failed = summary.failed();
    writeln!(
        &mut out,
        "\n{} passed, {} failed{}",
        summary.samples.len() - failed,
        failed,
        if summary.interrupted {
            " (interrupted)"
        } else {
            ""
        }
    )
    .unwrap();
    out
}

/// Entry point: runs a plan file
pub async fn run(
    args: RunArgs,
    state_dir: PathBuf,
    mut config: Config,
    cancel: CancellationToken,
) -> Result<()> {
    let plan = Plan::load(&args.plan)?;
    apply_overrides(&mut config, &args);

    let context = BackendContext { state_dir, config };
    let summary = execute(&plan, &args, context, cancel).await?;
    print!("{}", format_summary(&summary));

    if summary.interrupted {
        bail!("Run interrupted");
    }
    let failed = summary.failed();
    if failed > 0 {
        bail!("{failed} of {} samples failed", summary.samples.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::HandleDescriptor;
    use std::fs;
    use tempfile::tempdir;

    const PLAN: &str = r#"
sandbox = "local"

[[tasks]]
name = "hello"

[[tasks.samples]]
id = "1"
files = { "notes.txt" = "hello from assets" }
setup = "echo ready > ready.txt"

[[tasks.samples.steps]]
exec = ["cat", "ready.txt"]

[[tasks.samples.steps]]
read = "notes.txt"

[[tasks.samples.steps]]
write = "out/answer.txt"
content = "42"

[[tasks.samples.steps]]
exec = "cat out/answer.txt"

[[tasks.samples]]
id = "2"

[[tasks.samples.steps]]
read = "missing.txt"

[[tasks.samples.steps]]
exec = ["echo", "still usable"]
"#;

    fn load(dir: &std::path::Path) -> Plan {
        let path = dir.join("plan.toml");
        fs::write(&path, PLAN).unwrap();
        Plan::load(&path).unwrap()
    }

    #[tokio::test]
    async fn test_execute_local_plan() {
        let dir = tempdir().unwrap();
        let state = tempdir().unwrap();
        let plan = load(dir.path());
        let context = BackendContext {
            state_dir: state.path().to_path_buf(),
            config: Config::default(),
        };

        let summary = execute(&plan, &RunArgs::default(), context, CancellationToken::new())
            .await
            .unwrap();

        let first = &summary.samples[0];
        assert!(first.passed(), "{first:?}");
        let steps = first.outcome.as_ref().unwrap();
        assert_eq!(steps[0].detail, "ready");
        assert_eq!(steps[1].detail, "hello from assets");
        assert_eq!(steps[3].detail, "42");

        let second = &summary.samples[1];
        assert!(!second.passed());
        let steps = second.outcome.as_ref().unwrap();
        assert!(!steps[0].ok);
        assert!(steps[0].detail.contains("not found"));
        assert!(steps[1].ok);

        assert!(summary.retained.is_empty());
        let ledger = CleanupRegistry::open(state.path()).unwrap();
        assert!(ledger.list(None).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_execute_without_cleanup_retains_sets() {
        let dir = tempdir().unwrap();
        let state = tempdir().unwrap();
        let plan = load(dir.path());
        let args = RunArgs {
            no_cleanup: true,
            ..Default::default()
        };
        let mut config = Config::default();
        apply_overrides(&mut config, &args);
        let context = BackendContext {
            state_dir: state.path().to_path_buf(),
            config,
        };

        let summary = execute(&plan, &args, context, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.retained.len(), 2);
        let ledger = CleanupRegistry::open(state.path()).unwrap();
        assert_eq!(ledger.list(Some("local")).unwrap().len(), 2);

        let output = format_summary(&summary);
        let set_id = &summary.retained[0].set_id;
        assert!(output.contains(&format!("sandkit cleanup local {set_id}")));
    }

    #[tokio::test]
    async fn test_unknown_backend_is_fatal() {
        let dir = tempdir().unwrap();
        let state = tempdir().unwrap();
        let plan = load(dir.path());
        let args = RunArgs {
            sandbox: Some("podman".into()),
            ..Default::default()
        };
        let context = BackendContext {
            state_dir: state.path().to_path_buf(),
            config: Config::default(),
        };
        let err = execute(&plan, &args, context, CancellationToken::new())
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("podman"));
    }

    #[test]
    fn test_apply_overrides() {
        let mut config = Config::default();
        apply_overrides(
            &mut config,
            &RunArgs {
                no_cleanup: true,
                max_sandboxes: Some(2),
                max_exec_slots: Some(3),
                ..Default::default()
            },
        );
        assert!(!config.run.cleanup);
        assert_eq!(config.run.sandbox_slots(), 2);
        assert_eq!(config.run.exec_slots(), 3);
    }

    #[test]
    fn test_format_summary() {
        let summary = RunSummary {
            samples: vec![
                SampleReport {
                    task: "t".into(),
                    sample: "ok".into(),
                    outcome: Ok(vec![StepOutcome {
                        description: "exec: echo hi".into(),
                        ok: true,
                        detail: "hi".into(),
                    }]),
                },
                SampleReport {
                    task: "t".into(),
                    sample: "bad".into(),
                    outcome: Err("Sandbox provisioning failed: boom".into()),
                },
            ],
            retained: vec![RetainedSet {
                backend: "docker".into(),
                set_id: "abc123".into(),
                handles: vec![HandleDescriptor {
                    name: "default".into(),
                    resource: "sandkit-abc123-default".into(),
                }],
            }],
            live: Vec::new(),
            interrupted: false,
        };

        let output = format_summary(&summary);
        assert!(output.contains("t/ok"));
        assert!(output.contains("provisioning failed: boom"));
        assert!(output.contains("sandkit cleanup docker abc123"));
        assert!(output.contains("sandkit-abc123-default"));
        assert!(output.contains("1 passed, 1 failed"));
    }
}
