//! Status Collector: aggregates a consistent snapshot across workers,
//! queue, and hub (§4.6). Runs the four collectors in parallel threads
//! writing into a shared result under a mutex; any one collector's
//! failure degrades to empty/zero rather than failing the whole snapshot.

use std::sync::{Arc, Mutex};
use std::thread;

use crate::git_hub::GitHub;
use crate::multiplexer::Multiplexer;
use crate::process::ProcessRunner;
use crate::queue::launcher::probe;
use crate::queue::{ListTasksQuery, QueueBackend, TaskStatus};
use crate::worker::{ContainerRuntime, WorkerManager, WorkerView};

#[derive(Debug, Clone, Default)]
pub struct TaskTally {
    pub open: u32,
    pub in_progress: u32,
    pub blocked: u32,
    pub done: u32,
}

#[derive(Debug, Clone, Default)]
pub struct SyncStatus {
    pub host_commit: Option<String>,
    pub host_ahead: u32,
    pub task_branches: u32,
}

#[derive(Debug, Clone, Default)]
pub struct ServiceStatus {
    pub queue_reachable: bool,
    pub multiplexer_present: bool,
}

#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    pub workers: Vec<WorkerView>,
    pub tasks: TaskTally,
    pub sync: SyncStatus,
    pub services: ServiceStatus,
}

pub struct StatusCollector<'a, R: ContainerRuntime, PR: ProcessRunner, M: Multiplexer> {
    pub workers: &'a WorkerManager<'a, R>,
    pub git: &'a GitHub<PR>,
    pub multiplexer: &'a M,
    pub project_path: std::path::PathBuf,
    pub base_branch: String,
    pub branch_prefix: String,
    pub queue_host: String,
    pub queue_port: u16,
}

impl<'a, R: ContainerRuntime, PR: ProcessRunner, M: Multiplexer> StatusCollector<'a, R, PR, M> {
    pub fn collect<Q: QueueBackend + Send + Sync>(&self, queue: &Q) -> StatusSnapshot {
        let snapshot = Arc::new(Mutex::new(StatusSnapshot::default()));

        thread::scope(|scope| {
            scope.spawn(|| {
                let workers = self.workers.list().unwrap_or_default();
                snapshot.lock().unwrap().workers = workers;
            });

            scope.spawn(|| {
                let tasks = queue
                    .list_tasks(ListTasksQuery::default())
                    .unwrap_or_default();
                let mut tally = TaskTally::default();
                for t in tasks {
                    match t.status {
                        TaskStatus::Open => tally.open += 1,
                        TaskStatus::InProgress => tally.in_progress += 1,
                        TaskStatus::Blocked => tally.blocked += 1,
                        TaskStatus::Done => tally.done += 1,
                    }
                }
                snapshot.lock().unwrap().tasks = tally;
            });

            scope.spawn(|| {
                let sync = self.collect_sync();
                snapshot.lock().unwrap().sync = sync;
            });

            scope.spawn(|| {
                let services = ServiceStatus {
                    queue_reachable: probe(&self.queue_host, self.queue_port),
                    multiplexer_present: self.multiplexer.is_present(),
                };
                snapshot.lock().unwrap().services = services;
            });
        });

        Arc::try_unwrap(snapshot)
            .map(|m| m.into_inner().unwrap())
            .unwrap_or_default()
    }

    fn collect_sync(&self) -> SyncStatus {
        if !self.git.exists() {
            return SyncStatus::default();
        }
        let task_branches = self
            .git
            .list_task_branches(&self.branch_prefix)
            .map(|b| b.len() as u32)
            .unwrap_or(0);
        let host_ahead = self
            .git
            .is_host_ahead(&self.project_path, &self.base_branch)
            .unwrap_or(0);
        SyncStatus {
            host_commit: Some(self.base_branch.clone()),
            host_ahead,
            task_branches,
        }
    }
}
