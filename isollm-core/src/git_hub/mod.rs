//! The bare-repo "hub" that acts as the rendezvous point between the host
//! and worker containers.
//!
//! Every operation shells out to `git`, mirroring the rest of the system's
//! reliance on CLI tools rather than a git library. Each invocation is
//! logged at debug with its argv; a non-zero exit is wrapped with the
//! command line and captured stderr so `GitFailed`'s message alone is
//! enough to reconstruct what ran.

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::IsollmError;
use crate::process::ProcessRunner;

const GIT_TIMEOUT: Duration = Duration::from_secs(30);

/// One entry from `ListTaskBranches`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskBranch {
    pub full_name: String,
    pub task_id: String,
    pub short_commit: String,
    pub subject: String,
}

pub struct GitHub<R: ProcessRunner> {
    runner: R,
    bare_path: PathBuf,
}

impl<R: ProcessRunner> GitHub<R> {
    pub fn new(runner: R, bare_path: impl Into<PathBuf>) -> Self {
        Self {
            runner,
            bare_path: bare_path.into(),
        }
    }

    pub fn bare_path(&self) -> &Path {
        &self.bare_path
    }

    /// Bare-clone `project_path` into `self.bare_path` and disable auto-gc.
    /// Fails if the bare path already exists — callers must check
    /// `exists()` first if idempotence is desired.
    pub fn create(&self, project_path: &Path) -> Result<()> {
        if self.exists() {
            return Err(
                IsollmError::HubCreateFailed(format!("{} already exists", self.bare_path.display()))
                    .into(),
            );
        }
        debug!(path = %self.bare_path.display(), "creating bare hub");
        self.git_in(
            project_path,
            &["clone", "--bare", ".", &self.bare_path.to_string_lossy()],
        )
        .map_err(|e| IsollmError::HubCreateFailed(e.to_string()))?;
        self.git_bare(&["config", "gc.auto", "0"])
            .map_err(|e| IsollmError::HubCreateFailed(e.to_string()))?;
        Ok(())
    }

    /// True iff `bare_path` contains a bare repo's HEAD file.
    pub fn exists(&self) -> bool {
        self.bare_path.join("HEAD").is_file()
    }

    /// Push `branch:branch` from the project checkout to the hub.
    pub fn push_to_bare(&self, project_path: &Path, branch: &str) -> Result<()> {
        self.git_in(
            project_path,
            &[
                "push",
                &self.bare_path.to_string_lossy(),
                &format!("{branch}:{branch}"),
            ],
        )
        .map_err(|e| IsollmError::GitFailed(e.to_string()))?;
        Ok(())
    }

    /// Fetch `refs/heads/<prefix>* -> refs/remotes/<prefix>*` from the hub
    /// into the project checkout.
    pub fn pull_from_bare(&self, project_path: &Path, branch_prefix: &str) -> Result<()> {
        let refspec = format!(
            "refs/heads/{prefix}*:refs/remotes/{prefix}*",
            prefix = branch_prefix
        );
        self.git_in(project_path, &["fetch", &self.bare_path.to_string_lossy(), &refspec])
            .map_err(|e| IsollmError::GitFailed(e.to_string()))?;
        Ok(())
    }

    /// Commits the project has on `branch` that the hub does not.
    /// Returns 0 if `branch` does not exist in the hub (first push).
    pub fn is_host_ahead(&self, project_path: &Path, branch: &str) -> Result<u32> {
        let bare_rev = match self.git_bare(&["rev-parse", &format!("refs/heads/{branch}")]) {
            Ok(out) => out.trim().to_string(),
            Err(_) => return Ok(0),
        };
        let out = self
            .git_in(project_path, &["rev-list", "--count", &format!("{bare_rev}..{branch}")])
            .map_err(|e| IsollmError::GitFailed(e.to_string()))?;
        parse_count(&out)
    }

    /// Ordered refs matching `refs/heads/<prefix>*` in the hub.
    pub fn list_task_branches(&self, branch_prefix: &str) -> Result<Vec<TaskBranch>> {
        let pattern = format!("refs/heads/{branch_prefix}*");
        let out = self
            .git_bare(&[
                "for-each-ref",
                &pattern,
                "--format=%(refname)%09%(objectname:short)%09%(subject)",
            ])
            .map_err(|e| IsollmError::GitFailed(e.to_string()))?;

        let mut branches = Vec::new();
        for line in out.lines().filter(|l| !l.is_empty()) {
            let mut fields = line.splitn(3, '\t');
            let (Some(full_name), Some(short_commit), Some(subject)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let name = full_name.strip_prefix("refs/heads/").unwrap_or(full_name);
            let task_id = name.strip_prefix(branch_prefix).unwrap_or(name).to_string();
            branches.push(TaskBranch {
                full_name: full_name.to_string(),
                task_id,
                short_commit: short_commit.to_string(),
                subject: subject.to_string(),
            });
        }
        Ok(branches)
    }

    /// Commits on `branch` not reachable from `base`, evaluated in the hub.
    pub fn get_branch_commit_count(&self, branch: &str, base: &str) -> Result<u32> {
        let out = self
            .git_bare(&["rev-list", "--count", &format!("{base}..{branch}")])
            .map_err(|e| IsollmError::GitFailed(e.to_string()))?;
        parse_count(&out)
    }

    pub fn delete_branch(&self, branch: &str) -> Result<()> {
        self.git_bare(&["branch", "-D", branch])
            .map_err(|e| IsollmError::GitFailed(e.to_string()))?;
        Ok(())
    }

    /// Run `git gc` in the hub. Only safe when no worker is actively
    /// pushing — callers must ensure all workers are stopped first; that
    /// ordering is the fence, not an OS lock (§9).
    pub fn run_gc(&self) -> Result<()> {
        self.git_bare(&["gc"])
            .map_err(|e| IsollmError::GitFailed(e.to_string()))?;
        Ok(())
    }

    /// Whether the project checkout has commits on `branch` past `base`
    /// that have not been reflected in the hub.
    pub fn has_unpushed_commits(&self, project_path: &Path, branch: &str, base: &str) -> Result<bool> {
        let out = self
            .git_in(project_path, &["rev-list", "--count", &format!("{base}..{branch}")])
            .map_err(|e| IsollmError::GitFailed(e.to_string()))?;
        Ok(parse_count(&out)? > 0)
    }

    fn git_bare(&self, args: &[&str]) -> Result<String> {
        let mut full = vec!["--git-dir", self.bare_path.to_str().unwrap_or_default()];
        full.extend_from_slice(args);
        self.run_git(&full, None)
    }

    fn git_in(&self, cwd: &Path, args: &[&str]) -> Result<String> {
        self.run_git(args, Some(cwd))
    }

    fn run_git(&self, args: &[&str], cwd: Option<&Path>) -> Result<String> {
        debug!(?args, cwd = ?cwd, "running git");
        let out = self
            .runner
            .run("git", args, cwd, GIT_TIMEOUT)
            .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;
        if !out.success() {
            warn!(?args, status = out.status, stderr = %out.stderr, "git command failed");
            bail!(
                "git {} failed (status {}): {}",
                args.join(" "),
                out.status,
                out.stderr.trim()
            );
        }
        Ok(out.stdout)
    }
}

fn parse_count(s: &str) -> Result<u32> {
    s.trim()
        .parse::<u32>()
        .with_context(|| format!("unexpected rev-list output: {s:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::fake::FakeProcessRunner;

    #[test]
    fn create_fails_if_bare_path_already_exists() {
        let dir = tempfile::tempdir().unwrap();
        let bare = dir.path().join("existing.git");
        std::fs::create_dir_all(&bare).unwrap();
        std::fs::write(bare.join("HEAD"), "ref: refs/heads/main\n").unwrap();

        let hub = GitHub::new(FakeProcessRunner::new(vec![]), bare);
        let err = hub.create(dir.path()).unwrap_err();
        assert!(is_hub_create_failed(&err));
    }

    fn is_hub_create_failed(err: &anyhow::Error) -> bool {
        matches!(
            err.downcast_ref::<IsollmError>(),
            Some(IsollmError::HubCreateFailed(_))
        )
    }

    #[test]
    fn is_host_ahead_returns_zero_when_branch_missing_in_hub() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeProcessRunner::new(vec![FakeProcessRunner::err("unknown revision")]);
        let hub = GitHub::new(runner, dir.path().join("hub.git"));
        let ahead = hub.is_host_ahead(dir.path(), "main").unwrap();
        assert_eq!(ahead, 0);
    }

    #[test]
    fn is_host_ahead_counts_commits() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeProcessRunner::new(vec![
            FakeProcessRunner::ok("3\n"),
            FakeProcessRunner::ok("abc123\n"),
        ]);
        let hub = GitHub::new(runner, dir.path().join("hub.git"));
        let ahead = hub.is_host_ahead(dir.path(), "main").unwrap();
        assert_eq!(ahead, 3);
    }

    #[test]
    fn list_task_branches_parses_for_each_ref_output() {
        let dir = tempfile::tempdir().unwrap();
        let out = "refs/heads/isollm/ar-1\tabc123\tfix thing\nrefs/heads/isollm/ar-2\tdef456\tadd feature\n";
        let runner = FakeProcessRunner::new(vec![FakeProcessRunner::ok(out)]);
        let hub = GitHub::new(runner, dir.path().join("hub.git"));
        let branches = hub.list_task_branches("isollm/").unwrap();
        assert_eq!(branches.len(), 2);
        assert_eq!(branches[0].task_id, "ar-1");
        assert_eq!(branches[0].short_commit, "abc123");
        assert_eq!(branches[1].subject, "add feature");
    }

    #[test]
    fn run_git_wraps_nonzero_exit_with_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let runner = FakeProcessRunner::new(vec![FakeProcessRunner::err("fatal: bad ref")]);
        let hub = GitHub::new(runner, dir.path().join("hub.git"));
        let err = hub.run_gc().unwrap_err();
        assert!(err.to_string().contains("bad ref"));
    }
}
