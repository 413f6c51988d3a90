//! Remove environments a backend left behind.
//!
//! The backend removes its tagged resources, then the matching ledger
//! records are dropped. Running it twice is harmless.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::path::PathBuf;

use crate::cleanup::CleanupRegistry;
use crate::config::Config;
use crate::sandbox::{BackendContext, BackendRegistry, SandboxBackend};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CleanupSummary {
    pub backend: String,
    pub target: Option<String>,
    /// Resources the backend removed.
    pub removed: usize,
    /// Ledger records dropped.
    pub records: usize,
}

/// Runs the backend's cleanup and purges its ledger records.
///
/// `name` is the name the operator typed, which may be an alias of
/// `backend.name()`. Records under either are purged.
pub async fn cleanup(
    backend: &dyn SandboxBackend,
    ledger: &CleanupRegistry,
    name: &str,
    target: Option<&str>,
) -> Result<CleanupSummary> {
    let removed = backend
        .cli_cleanup(target)
        .await
        .with_context(|| format!("Cleanup failed for backend '{name}'"))?;

    let mut records = ledger.purge(name, target)?;
    if backend.name() != name {
        records += ledger.purge(backend.name(), target)?;
    }

    Ok(CleanupSummary {
        backend: name.to_string(),
        target: target.map(str::to_string),
        removed,
        records,
    })
}

/// Format the cleanup results as a displayable string
pub fn format_results(summary: &CleanupSummary) -> String {
    let mut out = String::new();
    let scope = summary
        .target
        .as_deref()
        .map_or_else(|| "all sets".to_string(), |t| format!("set {t}"));
    if summary.removed == 0 && summary.records == 0 {
        writeln!(
            &mut out,
            "\n{} Nothing to clean up for {} ({}).",
            "ℹ".blue(),
            summary.backend.cyan(),
            scope
        )
        .unwrap();
    } else {
        writeln!(
            &mut out,
            "\n{} Cleaned up {} ({}):",
            "✓".green(),
            summary.backend.cyan(),
            scope
        )
        .unwrap();
        writeln!(&mut out, "  {} resources removed", summary.removed).unwrap();
        writeln!(&mut out, "  {} ledger records dropped", summary.records).unwrap();
    }
    out
}

/// Entry point: cleans up one backend
pub async fn run(
    state_dir: PathBuf,
    config: Config,
    backend_name: &str,
    target: Option<&str>,
) -> Result<()> {
    let ledger = CleanupRegistry::open(&state_dir)?;
    let registry = BackendRegistry::with_builtins(BackendContext { state_dir, config });
    let backend = registry.resolve(backend_name)?;

    let summary = cleanup(backend.as_ref(), &ledger, backend_name, target).await?;
    print!("{}", format_results(&summary));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::EnvironmentConfigIdentity;
    use crate::sandbox::mock::MockBackend;
    use tempfile::tempdir;

    fn seeded(state: &std::path::Path) -> (MockBackend, CleanupRegistry) {
        let backend = MockBackend::new("docker");
        let ledger = CleanupRegistry::open(state).unwrap();
        for set_id in ["aaa", "bbb"] {
            backend.live_sets().lock().unwrap().insert(set_id.to_string());
            ledger
                .register(&EnvironmentConfigIdentity::new("docker", None), set_id)
                .unwrap();
        }
        (backend, ledger)
    }

    #[tokio::test]
    async fn test_cleanup_all_then_again() {
        let state = tempdir().unwrap();
        let (backend, ledger) = seeded(state.path());

        let first = cleanup(&backend, &ledger, "docker", None).await.unwrap();
        assert_eq!(first.removed, 2);
        assert_eq!(first.records, 2);
        assert!(ledger.list(None).unwrap().is_empty());

        let second = cleanup(&backend, &ledger, "docker", None).await.unwrap();
        assert_eq!(second.removed, 0);
        assert_eq!(second.records, 0);
    }

    #[tokio::test]
    async fn test_cleanup_single_target() {
        let state = tempdir().unwrap();
        let (backend, ledger) = seeded(state.path());

        let summary = cleanup(&backend, &ledger, "docker", Some("aaa")).await.unwrap();
        assert_eq!(summary.removed, 1);
        assert_eq!(summary.records, 1);

        let left = ledger.list(None).unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].set_id, "bbb");
        assert!(backend.live_sets().lock().unwrap().contains("bbb"));
    }

    #[tokio::test]
    async fn test_cleanup_through_alias_purges_canonical_records() {
        let state = tempdir().unwrap();
        let (backend, ledger) = seeded(state.path());
        ledger
            .register(&EnvironmentConfigIdentity::new("containerized", None), "ccc")
            .unwrap();

        let summary = cleanup(&backend, &ledger, "containerized", None).await.unwrap();
        assert_eq!(summary.records, 3);
        assert!(ledger.list(None).unwrap().is_empty());
    }

    #[test]
    fn test_format_results() {
        let empty = CleanupSummary {
            backend: "local".into(),
            target: None,
            removed: 0,
            records: 0,
        };
        assert!(format_results(&empty).contains("Nothing to clean up"));

        let cleaned = CleanupSummary {
            backend: "docker".into(),
            target: Some("abc".into()),
            removed: 3,
            records: 1,
        };
        let output = format_results(&cleaned);
        assert!(output.contains("set abc"));
        assert!(output.contains("3 resources removed"));
        assert!(output.contains("1 ledger records dropped"));
    }
}
