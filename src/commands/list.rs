//! Show environment sets recorded in the cleanup ledger.

use anyhow::Result;
use colored::Colorize;
use std::fmt::Write;
use std::path::PathBuf;

use crate::cleanup::{CleanupRecord, CleanupRegistry, RecordStatus};

/// Format ledger records as a displayable string
pub fn format_records(records: &[CleanupRecord]) -> String {
    let mut out = String::new();
    if records.is_empty() {
        writeln!(&mut out, "\n{} No recorded environments.", "ℹ".blue()).unwrap();
        return out;
    }

    writeln!(&mut out, "\n{}", "Recorded environments".bold()).unwrap();
    for record in records {
        let status = match record.status {
            RecordStatus::Pending => "pending".yellow(),
            RecordStatus::Active => "active".green(),
            RecordStatus::Orphaned => "orphaned".red(),
        };
        writeln!(
            &mut out,
            "  {} {}  {}{}  {}",
            record.backend().cyan(),
            record.set_id,
            status,
            if record.interrupted {
                " (interrupted)"
            } else {
                ""
            },
            record
                .created_at
                .format("%Y-%m-%d %H:%M:%S UTC")
                .to_string()
                .dimmed()
        )
        .unwrap();
        for handle in &record.handles {
            writeln!(&mut out, "      {}", handle.to_string().dimmed()).unwrap();
        }
        writeln!(
            &mut out,
            "      sandkit cleanup {} {}",
            record.backend(),
            record.set_id
        )
        .unwrap();
    }
    out
}

/// Entry point: prints the ledger
pub async fn run(state_dir: PathBuf, backend: Option<&str>) -> Result<()> {
    let ledger = CleanupRegistry::open(&state_dir)?;
    let records = ledger.list(backend)?;
    print!("{}", format_records(&records));
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::EnvironmentConfigIdentity;
    use crate::sandbox::HandleDescriptor;
    use tempfile::tempdir;

    #[test]
    fn test_format_empty() {
        assert!(format_records(&[]).contains("No recorded environments"));
    }

    #[test]
    fn test_format_records() {
        let state = tempdir().unwrap();
        let ledger = CleanupRegistry::open(state.path()).unwrap();
        let record = ledger
            .register(&EnvironmentConfigIdentity::new("docker", None), "feedbeef")
            .unwrap();
        ledger
            .activate(
                &record.record_id,
                vec![HandleDescriptor {
                    name: "default".into(),
                    resource: "sandkit-feedbeef-default".into(),
                }],
            )
            .unwrap();
        ledger.mark_orphaned(&record.record_id, true).unwrap();

        let output = format_records(&ledger.list(None).unwrap());
        assert!(output.contains("feedbeef"));
        assert!(output.contains("orphaned"));
        assert!(output.contains("(interrupted)"));
        assert!(output.contains("sandkit-feedbeef-default"));
        assert!(output.contains("sandkit cleanup docker feedbeef"));
    }
}
