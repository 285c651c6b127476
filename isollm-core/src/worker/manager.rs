//! Worker Manager: names, creates, starts, stops, resets, and destroys
//! worker containers, and couples each worker to the task queue (§4.3).

use anyhow::{Context, Result};
use chrono::Utc;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::IsollmError;
use crate::queue::claim_retry;
use crate::queue::{QueueBackend, Task};
use crate::worker::assignment::{AssignmentStore, TaskAssignment};
use crate::worker::naming;
use crate::worker::ports::{ContainerRuntime, RunningStatus, WorkerCreateConfig, WorkerInfo};

const NETWORK_READY_TIMEOUT: Duration = Duration::from_secs(60);
const CLEAN_SNAPSHOT: &str = "clean";
const WORKER_USER: &str = "dev";
const WORKER_GIT_NAME: &str = "isollm-worker";
const WORKER_GIT_EMAIL: &str = "worker@isollm.local";

/// A worker as seen by `List`: runtime state joined with its (possibly
/// absent) task assignment.
#[derive(Debug, Clone)]
pub struct WorkerView {
    pub name: String,
    pub status: RunningStatus,
    pub ip: Option<String>,
    pub assignment: Option<TaskAssignment>,
}

pub struct WorkerManager<'a, R: ContainerRuntime> {
    runtime: &'a R,
    assignments: AssignmentStore,
    bare_repo_path: std::path::PathBuf,
    image: String,
    branch_prefix: String,
}

impl<'a, R: ContainerRuntime> WorkerManager<'a, R> {
    pub fn new(
        runtime: &'a R,
        state_dir: impl Into<std::path::PathBuf>,
        bare_repo_path: impl Into<std::path::PathBuf>,
        image: impl Into<String>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        Self {
            runtime,
            assignments: AssignmentStore::new(state_dir),
            bare_repo_path: bare_repo_path.into(),
            image: image.into(),
            branch_prefix: branch_prefix.into(),
        }
    }

    fn worker_prefixed_list(&self) -> Result<Vec<WorkerInfo>> {
        Ok(self
            .runtime
            .list()?
            .into_iter()
            .filter(|w| w.name.starts_with("worker-"))
            .collect())
    }

    pub fn next_name(&self) -> Result<String> {
        let names: Vec<String> = self.worker_prefixed_list()?.into_iter().map(|w| w.name).collect();
        Ok(naming::next_name(&names))
    }

    /// Create a worker and bring it to a clean, cloned, snapshotted state.
    /// Must succeed as a whole: any step failing aborts and surfaces, and
    /// the half-built container is left for the caller to remove via the
    /// runtime (§4.3 — acceptable to leave a stopped container behind if
    /// cleanup also fails).
    pub fn create_worker(&self, requested_name: Option<&str>) -> Result<String> {
        let name = match requested_name {
            Some(n) => naming::normalize(n),
            None => self.next_name()?,
        };

        self.runtime
            .create(WorkerCreateConfig { name: &name, image: &self.image, user: WORKER_USER })
            .with_context(|| format!("failed to create container for {name}"))?;

        self.runtime
            .start(&name)
            .with_context(|| format!("failed to start {name}"))?;
        self.runtime
            .wait_network_ready(&name, NETWORK_READY_TIMEOUT)
            .with_context(|| format!("{name} did not become network-ready"))?;

        self.runtime
            .mount_bare_repo(&name, &self.bare_repo_path, "/repo.git")
            .with_context(|| format!("failed to mount bare repo into {name}"))?;

        self.runtime
            .exec(&name, &["git", "clone", "/repo.git", "/home/dev/project"])
            .with_context(|| format!("failed to clone into {name}"))?;

        self.runtime
            .exec(
                &name,
                &[
                    "git",
                    "-C",
                    "/home/dev/project",
                    "config",
                    "user.name",
                    WORKER_GIT_NAME,
                ],
            )
            .with_context(|| format!("failed to set git identity in {name}"))?;
        self.runtime
            .exec(
                &name,
                &[
                    "git",
                    "-C",
                    "/home/dev/project",
                    "config",
                    "user.email",
                    WORKER_GIT_EMAIL,
                ],
            )
            .with_context(|| format!("failed to set git identity in {name}"))?;

        self.runtime
            .snapshot_create(&name, CLEAN_SNAPSHOT)
            .with_context(|| format!("failed to snapshot {name}"))?;

        info!(worker = %name, "worker created");
        Ok(name)
    }

    pub fn start(&self, name: &str) -> Result<()> {
        let name = naming::normalize(name);
        self.runtime.start(&name)?;
        info!(worker = %name, "worker started");
        Ok(())
    }

    pub fn stop(&self, name: &str) -> Result<()> {
        let name = naming::normalize(name);
        self.runtime.stop(&name)?;
        info!(worker = %name, "worker stopped");
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<()> {
        let name = naming::normalize(name);
        self.runtime.remove(&name)?;
        self.assignments.clear(&name)?;
        info!(worker = %name, "worker removed");
        Ok(())
    }

    pub fn reset(&self, name: &str) -> Result<()> {
        let name = naming::normalize(name);
        self.runtime.reset(&name, CLEAN_SNAPSHOT)?;
        self.assignments.clear(&name)?;
        info!(worker = %name, "worker reset");
        Ok(())
    }

    pub fn shell(&self, name: &str) -> Result<()> {
        self.runtime.shell(&naming::normalize(name))
    }

    /// Snapshot `name`'s current container state under `snapshot` (§4.5
    /// SNAPSHOT_ALL).
    pub fn snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        let name = naming::normalize(name);
        self.runtime
            .snapshot_create(&name, snapshot)
            .with_context(|| format!("failed to snapshot {name}"))?;
        info!(worker = %name, snapshot, "worker snapshotted");
        Ok(())
    }

    pub fn exec(&self, name: &str, argv: &[&str]) -> Result<String> {
        self.runtime.exec(&naming::normalize(name), argv)
    }

    /// Intersection of the runtime's worker-prefixed container list joined
    /// with per-worker task-assignment files, sorted by name.
    pub fn list(&self) -> Result<Vec<WorkerView>> {
        let mut views: Vec<WorkerView> = self
            .worker_prefixed_list()?
            .into_iter()
            .map(|info| {
                let assignment = self.assignments.get(&info.name)?;
                Ok(WorkerView {
                    name: info.name,
                    status: info.status,
                    ip: info.ip,
                    assignment,
                })
            })
            .collect::<Result<_>>()?;
        views.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(views)
    }

    /// Claim the next ready task for `worker` and persist the assignment.
    /// Persistence is best-effort: the queue remains authoritative even
    /// if the local write fails.
    pub fn claim_next_task<Q: QueueBackend + ?Sized>(
        &self,
        queue: &Q,
        worker: &str,
        agent: &str,
    ) -> Result<Option<Task>> {
        let name = naming::normalize(worker);
        let claimed = claim_retry::claim_next(queue, agent)?;
        if let Some(task) = &claimed {
            let assignment = TaskAssignment {
                worker: name.clone(),
                task_id: task.id.clone(),
                branch: format!("{}{}", self.branch_prefix, task.id),
                claimed_at: Utc::now(),
            };
            if let Err(e) = self.assignments.put(&assignment) {
                warn!(worker = %name, task = %task.id, error = %e, "failed to persist task assignment");
            }
            info!(worker = %name, task = %task.id, "task claimed");
        }
        Ok(claimed)
    }

    pub fn release_worker_task<Q: QueueBackend + ?Sized>(
        &self,
        queue: &Q,
        worker: &str,
        agent: &str,
    ) -> Result<()> {
        let name = naming::normalize(worker);
        if let Some(assignment) = self.assignments.get(&name)? {
            match queue.release_task(&assignment.task_id, agent, false) {
                Ok(_) => {}
                Err(e) if IsollmError::is_not_owner(&e) => {
                    warn!(worker = %name, task = %assignment.task_id, "release: queue already reassigned task");
                }
                Err(e) => return Err(e),
            }
            info!(worker = %name, task = %assignment.task_id, "task released");
        }
        self.assignments.clear(&name)
    }

    pub fn complete_worker_task<Q: QueueBackend + ?Sized>(
        &self,
        queue: &Q,
        worker: &str,
        agent: &str,
    ) -> Result<()> {
        let name = naming::normalize(worker);
        if let Some(assignment) = self.assignments.get(&name)? {
            queue.complete_task(&assignment.task_id, agent)?;
            info!(worker = %name, task = %assignment.task_id, "task completed");
        }
        self.assignments.clear(&name)
    }

    /// Block keeps the assignment: the worker is still bound to the task
    /// while it is blocked (§4.3).
    pub fn block_worker_task<Q: QueueBackend + ?Sized>(&self, queue: &Q, worker: &str) -> Result<()> {
        let name = naming::normalize(worker);
        if let Some(assignment) = self.assignments.get(&name)? {
            queue.block_task(&assignment.task_id)?;
            info!(worker = %name, task = %assignment.task_id, "task blocked");
        }
        Ok(())
    }

    pub fn assignment_for(&self, worker: &str) -> Result<Option<TaskAssignment>> {
        self.assignments.get(&naming::normalize(worker))
    }
}
