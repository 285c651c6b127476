//! Per-worker task-assignment file: a single JSON document under the
//! session state directory (`tasks/<worker>.json`), written atomically so
//! readers never observe a half-written file (§5).

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TaskAssignment {
    pub worker: String,
    pub task_id: String,
    pub branch: String,
    pub claimed_at: DateTime<Utc>,
}

/// Reads/writes `<state_dir>/tasks/<worker>.json`. One store per session;
/// each worker only ever has its own file touched, so there is no
/// intra-orchestrator contention to guard against (§4.3, §5).
pub struct AssignmentStore {
    tasks_dir: PathBuf,
}

impl AssignmentStore {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            tasks_dir: state_dir.into().join("tasks"),
        }
    }

    fn path_for(&self, worker: &str) -> PathBuf {
        self.tasks_dir.join(format!("{worker}.json"))
    }

    /// Returns `None` if no assignment file exists for `worker`.
    pub fn get(&self, worker: &str) -> Result<Option<TaskAssignment>> {
        let path = self.path_for(worker);
        if !path.is_file() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(serde_json::from_str(&text).with_context(|| {
            format!("failed to parse {}", path.display())
        })?))
    }

    /// Write `assignment`, replacing any existing file for the same
    /// worker. Temp-file + rename within the same directory.
    pub fn put(&self, assignment: &TaskAssignment) -> Result<()> {
        std::fs::create_dir_all(&self.tasks_dir)
            .with_context(|| format!("failed to create {}", self.tasks_dir.display()))?;
        let path = self.path_for(&assignment.worker);
        let tmp = self.tasks_dir.join(format!(".{}.tmp", assignment.worker));
        let body = serde_json::to_string_pretty(assignment)?;
        write_atomic(&tmp, &path, &body)
    }

    /// Remove the assignment file for `worker`, if present. Clearing is
    /// idempotent — a missing file is not an error.
    pub fn clear(&self, worker: &str) -> Result<()> {
        let path = self.path_for(worker);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("failed to remove {}", path.display())),
        }
    }
}

fn write_atomic(tmp: &Path, dest: &Path, body: &str) -> Result<()> {
    std::fs::write(tmp, body).with_context(|| format!("failed to write {}", tmp.display()))?;
    let file =
        std::fs::File::open(tmp).with_context(|| format!("failed to reopen {}", tmp.display()))?;
    file.sync_all()
        .with_context(|| format!("failed to fsync {}", tmp.display()))?;
    std::fs::rename(tmp, dest)
        .with_context(|| format!("failed to rename {} to {}", tmp.display(), dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(worker: &str, task_id: &str) -> TaskAssignment {
        TaskAssignment {
            worker: worker.to_string(),
            task_id: task_id.to_string(),
            branch: format!("isollm/{task_id}"),
            claimed_at: Utc::now(),
        }
    }

    #[test]
    fn get_returns_none_for_absent_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssignmentStore::new(dir.path());
        assert!(store.get("worker-1").unwrap().is_none());
    }

    #[test]
    fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssignmentStore::new(dir.path());
        let a = sample("worker-1", "t-1");
        store.put(&a).unwrap();
        assert_eq!(store.get("worker-1").unwrap(), Some(a));
    }

    #[test]
    fn clear_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssignmentStore::new(dir.path());
        store.clear("worker-1").unwrap();
        store.put(&sample("worker-1", "t-1")).unwrap();
        store.clear("worker-1").unwrap();
        store.clear("worker-1").unwrap();
        assert!(store.get("worker-1").unwrap().is_none());
    }

    #[test]
    fn put_overwrites_previous_assignment() {
        let dir = tempfile::tempdir().unwrap();
        let store = AssignmentStore::new(dir.path());
        store.put(&sample("worker-1", "t-1")).unwrap();
        store.put(&sample("worker-1", "t-2")).unwrap();
        assert_eq!(store.get("worker-1").unwrap().unwrap().task_id, "t-2");
    }
}
