//! Durable ledger of provisioned environment sets.
//!
//! One JSON file per set under `<state_dir>/registry/`. A record is
//! written before the backend is asked to provision anything and removed
//! only after teardown succeeds, so a later `sandkit list` or
//! `sandkit cleanup` can find sets a crashed or interrupted run left
//! behind.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::identity::EnvironmentConfigIdentity;
use crate::sandbox::HandleDescriptor;

const REGISTRY_DIR: &str = "registry";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub(crate) enum RecordStatus {
    /// Registered, provisioning not yet confirmed.
    Pending,
    /// Set exists and is in use.
    Active,
    /// Teardown was skipped, failed, or ran out of time.
    Orphaned,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct CleanupRecord {
    pub record_id: String,
    pub identity: EnvironmentConfigIdentity,
    pub set_id: String,
    #[serde(default)]
    pub handles: Vec<HandleDescriptor>,
    pub created_at: DateTime<Utc>,
    pub status: RecordStatus,
    #[serde(default)]
    pub interrupted: bool,
}

impl CleanupRecord {
    pub fn backend(&self) -> &str {
        &self.identity.backend
    }

    /// Whether `target` names this record by set id or record id.
    pub fn matches(&self, target: &str) -> bool {
        self.set_id == target || self.record_id == target
    }
}

/// File-backed registry of live and orphaned sets.
#[derive(Debug, Clone)]
pub(crate) struct CleanupRegistry {
    dir: PathBuf,
}

impl CleanupRegistry {
    /// Opens (creating if needed) the ledger under `state_dir`.
    pub fn open(state_dir: &Path) -> Result<Self> {
        let dir = state_dir.join(REGISTRY_DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create registry directory: {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path(&self, record_id: &str) -> PathBuf {
        self.dir.join(format!("{record_id}.json"))
    }

    fn save(&self, record: &CleanupRecord) -> Result<()> {
        let path = self.path(&record.record_id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(record).context("Failed to serialize record")?;
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write record: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to write record: {}", path.display()))?;
        Ok(())
    }

    /// Records a set that is about to be provisioned.
    pub fn register(&self, identity: &EnvironmentConfigIdentity, set_id: &str) -> Result<CleanupRecord> {
        let record = CleanupRecord {
            record_id: uuid::Uuid::new_v4().simple().to_string(),
            identity: identity.clone(),
            set_id: set_id.to_string(),
            handles: Vec::new(),
            created_at: Utc::now(),
            status: RecordStatus::Pending,
            interrupted: false,
        };
        self.save(&record)?;
        Ok(record)
    }

    pub fn get(&self, record_id: &str) -> Result<Option<CleanupRecord>> {
        let path = self.path(record_id);
        if !path.exists() {
            return Ok(None);
        }
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read record: {}", path.display()))?;
        let record = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse record: {}", path.display()))?;
        Ok(Some(record))
    }

    fn update(&self, record_id: &str, apply: impl FnOnce(&mut CleanupRecord)) -> Result<()> {
        let mut record = self
            .get(record_id)?
            .with_context(|| format!("No cleanup record {record_id}"))?;
        apply(&mut record);
        self.save(&record)
    }

    /// Stores the handles of a provisioned set and marks it active.
    pub fn activate(&self, record_id: &str, handles: Vec<HandleDescriptor>) -> Result<()> {
        self.update(record_id, |record| {
            record.handles = handles;
            record.status = RecordStatus::Active;
        })
    }

    /// Marks a set as left behind.
    pub fn mark_orphaned(&self, record_id: &str, interrupted: bool) -> Result<()> {
        self.update(record_id, |record| {
            record.status = RecordStatus::Orphaned;
            record.interrupted |= interrupted;
        })
    }

    /// Removes a record after successful teardown. Returns false if it
    /// was already gone.
    pub fn unregister(&self, record_id: &str) -> Result<bool> {
        let path = self.path(record_id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                Err(e).with_context(|| format!("Failed to delete record: {}", path.display()))
            }
        }
    }

    /// All records, oldest first, optionally for one backend.
    pub fn list(&self, backend: Option<&str>) -> Result<Vec<CleanupRecord>> {
        let entries = fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read registry: {}", self.dir.display()))?;

        let mut records = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let parsed = fs::read_to_string(&path)
                .map_err(anyhow::Error::from)
                .and_then(|content| Ok(serde_json::from_str::<CleanupRecord>(&content)?));
            match parsed {
                Ok(record) if backend.map_or(true, |b| record.backend() == b) => records.push(record),
                Ok(_) => {}
                Err(e) => warn!(path = %path.display(), "Skipping unreadable cleanup record: {e}"),
            }
        }
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(records)
    }

    /// Drops records for `backend`, all of them or those matching
    /// `target`. Returns the number removed.
    pub fn purge(&self, backend: &str, target: Option<&str>) -> Result<usize> {
        let mut removed = 0;
        for record in self.list(Some(backend))? {
            if target.map_or(true, |t| record.matches(t)) && self.unregister(&record.record_id)? {
                removed += 1;
            }
        }
        Ok(removed)
    }
}
