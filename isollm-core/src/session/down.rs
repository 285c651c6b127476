//! Shutdown Controller (Down): brings a session down safely (§4.5).

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::git_hub::GitHub;
use crate::process::ProcessRunner;
use crate::queue::QueueBackend;
use crate::session::record::SessionStore;
use crate::worker::{ContainerRuntime, RunningStatus, WorkerManager};

/// Down's flag overlay (§9, §4.5).
#[derive(Debug, Clone, Default)]
pub struct DownOptions {
    pub destroy: bool,
    pub save_snapshots: bool,
    pub skip_confirm: bool,
}

/// One unsaved-work candidate discovered during `DETECT_UNSAVED`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsavedWorker {
    pub name: String,
    pub branch: Option<String>,
    pub uncommitted: bool,
    pub unpushed_commits: u32,
}

impl UnsavedWorker {
    pub fn is_unsaved(&self) -> bool {
        self.uncommitted || self.unpushed_commits > 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownChoice {
    Salvage,
    Discard,
    Cancel,
}

/// Parse a single-character (case-insensitive) prompt response. Returns
/// `None` on invalid input so the caller can reprompt (§4.5 PROMPT).
pub fn parse_choice(input: &str) -> Option<ShutdownChoice> {
    match input.trim().to_ascii_lowercase().as_str() {
        "s" | "salvage" => Some(ShutdownChoice::Salvage),
        "d" | "discard" => Some(ShutdownChoice::Discard),
        "c" | "cancel" => Some(ShutdownChoice::Cancel),
        _ => None,
    }
}

pub struct ShutdownOutcome {
    pub cancelled: bool,
    pub destroyed: bool,
}

pub struct ShutdownController<'a, R: ContainerRuntime, PR: ProcessRunner> {
    pub workers: &'a WorkerManager<'a, R>,
    pub git: &'a GitHub<PR>,
    pub state_dir: std::path::PathBuf,
    pub project_path: std::path::PathBuf,
    pub base_branch: String,
}

impl<'a, R: ContainerRuntime, PR: ProcessRunner> ShutdownController<'a, R, PR> {
    /// LIST + DETECT_UNSAVED: every RUNNING worker's uncommitted/unpushed
    /// state, read via `git status --porcelain` and `git rev-list --count`
    /// against the worker's own clone.
    ///
    /// This orchestration layer does not shell into the worker's
    /// container directly (that is the runtime's `exec` capability); it
    /// delegates the git introspection to `exec`, returning results the
    /// caller combines into `UnsavedWorker` records.
    pub fn detect_unsaved(&self) -> Result<Vec<UnsavedWorker>> {
        let mut unsaved = Vec::new();
        for view in self.workers.list()? {
            if view.status != RunningStatus::Running {
                continue;
            }
            let branch = view.assignment.as_ref().map(|a| a.branch.clone());
            let uncommitted = self.has_uncommitted_changes(&view.name)?;
            let unpushed_commits = self.count_unpushed_commits(&view.name, branch.as_deref())?;
            let worker = UnsavedWorker {
                name: view.name,
                branch,
                uncommitted,
                unpushed_commits,
            };
            if worker.is_unsaved() {
                unsaved.push(worker);
            }
        }
        Ok(unsaved)
    }

    fn has_uncommitted_changes(&self, worker: &str) -> Result<bool> {
        let out = self
            .workers
            .exec(worker, &["git", "-C", "/home/dev/project", "status", "--porcelain"])?;
        Ok(!out.trim().is_empty())
    }

    fn count_unpushed_commits(&self, worker: &str, branch: Option<&str>) -> Result<u32> {
        let Some(branch) = branch else {
            return Ok(0);
        };
        let range = format!("origin/{branch}..{branch}");
        let out = self
            .workers
            .exec(worker, &["git", "-C", "/home/dev/project", "rev-list", "--count", &range])
            .or_else(|_| {
                // no upstream yet — fall back to the total commit count on the branch
                self.workers.exec(
                    worker,
                    &["git", "-C", "/home/dev/project", "rev-list", "--count", branch],
                )
            })?;
        out.trim().parse::<u32>().with_context(|| format!("unexpected rev-list output: {out:?}"))
    }

    /// SALVAGE: per unsaved worker, auto-commit then push. Errors per
    /// worker are logged, not fatal.
    pub fn salvage(&self, unsaved: &[UnsavedWorker]) {
        for worker in unsaved {
            if let Err(e) = self.salvage_one(worker) {
                warn!(worker = %worker.name, error = %e, "salvage failed for worker");
            }
        }
    }

    fn salvage_one(&self, worker: &UnsavedWorker) -> Result<()> {
        if worker.uncommitted {
            self.workers
                .exec(&worker.name, &["git", "-C", "/home/dev/project", "add", "-A"])?;
            self.workers.exec(
                &worker.name,
                &[
                    "git",
                    "-C",
                    "/home/dev/project",
                    "commit",
                    "-m",
                    "isollm salvage: auto-commit before shutdown",
                ],
            )?;
        }
        if let Some(branch) = &worker.branch {
            self.workers.exec(
                &worker.name,
                &["git", "-C", "/home/dev/project", "push", "-u", "origin", branch],
            )?;
        }
        info!(worker = %worker.name, "worker salvaged");
        Ok(())
    }

    /// RELEASE_TASKS: best-effort. `NotOwner` is downgraded to a warning;
    /// the local assignment is always cleared regardless.
    pub fn release_tasks<Q: QueueBackend>(&self, queue: &Q, agent: &str) {
        let views = match self.workers.list() {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "failed to list workers for task release");
                return;
            }
        };
        for view in views {
            if view.assignment.is_none() {
                continue;
            }
            if let Err(e) = self.workers.release_worker_task(queue, &view.name, agent) {
                warn!(worker = %view.name, error = %e, "failed to release worker task");
            }
        }
    }

    /// SNAPSHOT_ALL: warn on per-worker failure, never fatal.
    pub fn snapshot_all(&self, snapshot_name: &str) -> Result<()> {
        for view in self.workers.list()? {
            if let Err(e) = self.workers.snapshot(&view.name, snapshot_name) {
                warn!(worker = %view.name, error = %e, "snapshot failed");
            }
        }
        Ok(())
    }

    /// DESTROY or STOP every worker, then GC_HUB, then CLEAR_SESSION.
    /// `confirm_destroy_input`, when `destroy` is requested and
    /// `skip_confirm` is false, must equal the literal string `"destroy"`
    /// or the destroy phase alone is cancelled (other phases still run).
    pub fn finish(&self, opts: &DownOptions, confirm_destroy_input: Option<&str>) -> Result<ShutdownOutcome> {
        let views = self.workers.list()?;
        let mut destroyed = false;

        let do_destroy = opts.destroy
            && (opts.skip_confirm || confirm_destroy_input.map(|s| s.trim()) == Some("destroy"));

        for view in &views {
            if let Err(e) = self.workers.stop(&view.name) {
                warn!(worker = %view.name, error = %e, "failed to stop worker");
            }
        }

        if do_destroy {
            for view in &views {
                if let Err(e) = self.workers.remove(&view.name) {
                    warn!(worker = %view.name, error = %e, "failed to remove worker");
                }
            }
            destroyed = true;
        }

        if self.git.exists() {
            if let Err(e) = self.git.run_gc() {
                warn!(error = %e, "hub gc failed");
            }
        }

        SessionStore::new(&self.state_dir).clear()?;
        info!("session cleared");

        Ok(ShutdownOutcome { cancelled: false, destroyed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_choice_accepts_letters_and_words_case_insensitively() {
        assert_eq!(parse_choice("s"), Some(ShutdownChoice::Salvage));
        assert_eq!(parse_choice("SALVAGE"), Some(ShutdownChoice::Salvage));
        assert_eq!(parse_choice("d"), Some(ShutdownChoice::Discard));
        assert_eq!(parse_choice("Cancel"), Some(ShutdownChoice::Cancel));
    }

    #[test]
    fn parse_choice_rejects_unknown_input() {
        assert_eq!(parse_choice("maybe"), None);
        assert_eq!(parse_choice(""), None);
    }

    #[test]
    fn unsaved_worker_is_unsaved_iff_uncommitted_or_unpushed() {
        let clean = UnsavedWorker {
            name: "worker-1".into(),
            branch: None,
            uncommitted: false,
            unpushed_commits: 0,
        };
        assert!(!clean.is_unsaved());

        let dirty = UnsavedWorker {
            unpushed_commits: 2,
            ..clean.clone()
        };
        assert!(dirty.is_unsaved());
    }

    mod integration {
        use super::*;
        use crate::process::fake::FakeProcessRunner;
        use crate::queue::memory::InMemoryQueue;
        use crate::queue::NewTask;
        use crate::worker::ports::fake::FakeContainerRuntime;

        fn setup() -> (FakeContainerRuntime, tempfile::TempDir, tempfile::TempDir) {
            (
                FakeContainerRuntime::new(),
                tempfile::tempdir().unwrap(),
                tempfile::tempdir().unwrap(),
            )
        }

        #[test]
        fn release_tasks_downgrades_not_owner_and_clears_assignment() {
            let (runtime, state_dir, hub_dir) = setup();
            let workers = WorkerManager::new(
                &runtime,
                state_dir.path(),
                hub_dir.path().join("demo.git"),
                "ubuntu:24.04",
                "isollm/",
            );
            let name = workers.create_worker(None).unwrap();
            let queue = InMemoryQueue::new();
            let task = queue
                .add_task("a", NewTask { title: "x".into(), ..Default::default() })
                .unwrap();
            workers.claim_next_task(&queue, &name, "agent-1").unwrap();

            // simulate the queue reassigning the task out-of-band
            queue.release_task(&task.id, "agent-1", true).unwrap();
            queue.claim_task(&task.id, "someone-else").unwrap();

            let git_runner = FakeProcessRunner::new(vec![]);
            let git = GitHub::new(git_runner, hub_dir.path().join("demo.git"));
            let controller = ShutdownController {
                workers: &workers,
                git: &git,
                state_dir: state_dir.path().to_path_buf(),
                project_path: hub_dir.path().to_path_buf(),
                base_branch: "main".to_string(),
            };

            controller.release_tasks(&queue, "agent-1");
            assert!(workers.assignment_for(&name).unwrap().is_none());
        }

        #[test]
        fn finish_without_destroy_stops_workers_and_clears_session() {
            let (runtime, state_dir, hub_dir) = setup();
            let workers = WorkerManager::new(
                &runtime,
                state_dir.path(),
                hub_dir.path().join("demo.git"),
                "ubuntu:24.04",
                "isollm/",
            );
            let name = workers.create_worker(None).unwrap();
            workers.start(&name).unwrap();

            let git_runner = FakeProcessRunner::new(vec![]);
            let git = GitHub::new(git_runner, hub_dir.path().join("demo.git"));
            let controller = ShutdownController {
                workers: &workers,
                git: &git,
                state_dir: state_dir.path().to_path_buf(),
                project_path: hub_dir.path().to_path_buf(),
                base_branch: "main".to_string(),
            };

            let outcome = controller.finish(&DownOptions::default(), None).unwrap();
            assert!(!outcome.destroyed);
            assert_eq!(runtime.status(&name).unwrap(), RunningStatus::Stopped);
            assert!(SessionStore::new(state_dir.path()).load().unwrap().is_none());
        }

        #[test]
        fn finish_destroy_without_confirmation_cancels_destroy_phase_only() {
            let (runtime, state_dir, hub_dir) = setup();
            let workers = WorkerManager::new(
                &runtime,
                state_dir.path(),
                hub_dir.path().join("demo.git"),
                "ubuntu:24.04",
                "isollm/",
            );
            let name = workers.create_worker(None).unwrap();
            workers.start(&name).unwrap();

            let git_runner = FakeProcessRunner::new(vec![]);
            let git = GitHub::new(git_runner, hub_dir.path().join("demo.git"));
            let controller = ShutdownController {
                workers: &workers,
                git: &git,
                state_dir: state_dir.path().to_path_buf(),
                project_path: hub_dir.path().to_path_buf(),
                base_branch: "main".to_string(),
            };

            let opts = DownOptions { destroy: true, ..Default::default() };
            let outcome = controller.finish(&opts, Some("no")).unwrap();
            assert!(!outcome.destroyed);
            // stopped, but not removed
            assert_eq!(runtime.status(&name).unwrap(), RunningStatus::Stopped);
        }

        #[test]
        fn finish_destroy_with_confirmation_removes_workers() {
            let (runtime, state_dir, hub_dir) = setup();
            let workers = WorkerManager::new(
                &runtime,
                state_dir.path(),
                hub_dir.path().join("demo.git"),
                "ubuntu:24.04",
                "isollm/",
            );
            let name = workers.create_worker(None).unwrap();
            workers.start(&name).unwrap();

            let git_runner = FakeProcessRunner::new(vec![]);
            let git = GitHub::new(git_runner, hub_dir.path().join("demo.git"));
            let controller = ShutdownController {
                workers: &workers,
                git: &git,
                state_dir: state_dir.path().to_path_buf(),
                project_path: hub_dir.path().to_path_buf(),
                base_branch: "main".to_string(),
            };

            let opts = DownOptions { destroy: true, ..Default::default() };
            let outcome = controller.finish(&opts, Some("destroy")).unwrap();
            assert!(outcome.destroyed);
            assert_eq!(runtime.status(&name).unwrap(), RunningStatus::Unknown);
        }

        #[test]
        fn snapshot_all_creates_a_runtime_snapshot_per_worker() {
            let (runtime, state_dir, hub_dir) = setup();
            let workers = WorkerManager::new(
                &runtime,
                state_dir.path(),
                hub_dir.path().join("demo.git"),
                "ubuntu:24.04",
                "isollm/",
            );
            let name = workers.create_worker(None).unwrap();

            let git_runner = FakeProcessRunner::new(vec![]);
            let git = GitHub::new(git_runner, hub_dir.path().join("demo.git"));
            let controller = ShutdownController {
                workers: &workers,
                git: &git,
                state_dir: state_dir.path().to_path_buf(),
                project_path: hub_dir.path().to_path_buf(),
                base_branch: "main".to_string(),
            };

            controller.snapshot_all("shutdown-snap").unwrap();
            assert!(runtime.snapshot_list(&name).unwrap().contains(&"shutdown-snap".to_string()));
        }
    }
}
