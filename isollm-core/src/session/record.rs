//! Session Record: the single JSON document describing the currently
//! active orchestration session. Written atomically; removed on successful
//! Down (§3, §5, invariant 4).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SessionRecord {
    pub project: String,
    pub workers: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub pid: u32,
    pub queue_port: u16,
    pub base_branch: String,
    #[serde(default)]
    pub multiplexer_session: Option<String>,
}

pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            path: state_dir.into().join("session.json"),
        }
    }

    pub fn load(&self) -> Result<Option<SessionRecord>> {
        if !self.path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        Ok(Some(serde_json::from_str(&text).with_context(|| {
            format!("failed to parse {}", self.path.display())
        })?))
    }

    pub fn save(&self, record: &SessionRecord) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
        let tmp = dir.join(".session.json.tmp");
        let body = serde_json::to_string_pretty(record)?;
        std::fs::write(&tmp, &body).with_context(|| format!("failed to write {}", tmp.display()))?;
        let file = std::fs::File::open(&tmp)
            .with_context(|| format!("failed to reopen {}", tmp.display()))?;
        file.sync_all()
            .with_context(|| format!("failed to fsync {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path).with_context(|| {
            format!("failed to rename {} to {}", tmp.display(), self.path.display())
        })?;
        Ok(())
    }

    /// Best-effort removal; a missing file is not an error (§4.5
    /// CLEAR_SESSION is itself best-effort).
    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", self.path.display())),
        }
    }
}

/// True iff a process with this pid is alive, checked via `kill -0`. Used
/// to validate invariant 4 (the session record references a live pid).
pub fn is_pid_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
