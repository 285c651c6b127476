//! Session Controller (Up): brings a session online (§4.4).

use anyhow::{bail, Context, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::config::ProjectConfig;
use crate::git_hub::GitHub;
use crate::multiplexer::Multiplexer;
use crate::process::ProcessRunner;
use crate::queue::launcher::{ensure_running, QueueServerLauncher};
use crate::session::record::{SessionRecord, SessionStore};
use crate::worker::{ContainerRuntime, WorkerManager};

const ENV_FILE: &str = "/home/dev/.isollm_env";
const CONTEXT_FILE: &str = "/home/dev/project/ISOLLM_CONTEXT.md";
const SHELL_INIT: &str = "/home/dev/.bashrc";
const ENV_MARKER: &str = "# isollm-agent-env";

/// The Up flag overlay (§9: "pass as a plain record, not positional args").
#[derive(Debug, Clone, Default)]
pub struct UpOptions {
    pub workers: Option<u32>,
    pub base_branch: Option<String>,
    pub force: bool,
    pub skip_multiplexer: bool,
}

/// Walk up from `start` looking for `isollm.yaml`; the containing
/// directory is the project root.
pub fn find_project_root(start: &Path) -> Result<PathBuf> {
    let mut dir = start.to_path_buf();
    loop {
        if dir.join("isollm.yaml").is_file() {
            return Ok(dir);
        }
        if !dir.pop() {
            bail!("no isollm.yaml found in {} or any ancestor", start.display());
        }
    }
}

pub struct SessionController<'a, R: ContainerRuntime, PR: ProcessRunner> {
    pub runtime: &'a R,
    pub workers: WorkerManager<'a, R>,
    pub git: &'a GitHub<PR>,
    pub launcher: &'a dyn QueueServerLauncher,
    pub multiplexer: &'a dyn Multiplexer,
    pub state_dir: PathBuf,
    pub project_path: PathBuf,
}

impl<'a, R: ContainerRuntime, PR: ProcessRunner> SessionController<'a, R, PR> {
    pub fn new(
        runtime: &'a R,
        git: &'a GitHub<PR>,
        launcher: &'a dyn QueueServerLauncher,
        multiplexer: &'a dyn Multiplexer,
        state_dir: impl Into<PathBuf>,
        project_path: impl Into<PathBuf>,
        image: impl Into<String>,
        branch_prefix: impl Into<String>,
    ) -> Self {
        let state_dir = state_dir.into();
        let project_path = project_path.into();
        let workers = WorkerManager::new(runtime, state_dir.clone(), git.bare_path(), image, branch_prefix);
        Self {
            runtime,
            workers,
            git,
            launcher,
            multiplexer,
            state_dir,
            project_path,
        }
    }

    /// Run the full Up sequence (§4.4 steps 2-8; step 1's load/validate is
    /// the caller's job since the config is handed in already resolved).
    /// Only the TCP health probe is consulted here — queue task operations
    /// are the Worker Manager's concern once workers are up.
    pub fn up(&self, config: &ProjectConfig, opts: UpOptions) -> Result<SessionRecord> {
        let target_workers = opts.workers.unwrap_or(config.workers);
        let base_branch = opts.base_branch.as_deref().unwrap_or(&config.base_branch);

        if self.git.exists() {
            let ahead = self.git.is_host_ahead(&self.project_path, base_branch)?;
            if ahead >= 1 {
                if opts.force {
                    warn!(ahead, branch = base_branch, "host repo ahead of hub, proceeding due to --force");
                } else {
                    bail!("host repo is {ahead} commit(s) ahead of bare repo on {base_branch}");
                }
            }
        }

        ensure_running(self.launcher, &config.queue_host, config.queue_port)
            .context("queue server is not reachable")?;

        if !self.git.exists() {
            self.git.create(&self.project_path)?;
            info!(hub = %self.git.bare_path().display(), "hub created");
        }

        let selected = self.grow_worker_pool(target_workers)?;

        for name in &selected {
            self.prepare_agent_environment(name)
                .with_context(|| format!("failed to prepare agent environment for {name}"))?;
        }

        let multiplexer_session = if opts.skip_multiplexer {
            None
        } else {
            self.launch_multiplexer(&config.project)
        };

        let record = SessionRecord {
            project: config.project.clone(),
            workers: selected,
            started_at: current_time_placeholder(),
            pid: std::process::id(),
            queue_port: config.queue_port,
            base_branch: base_branch.to_string(),
            multiplexer_session,
        };
        SessionStore::new(&self.state_dir).save(&record)?;
        info!(project = %config.project, "session persisted");

        Ok(record)
    }

    /// Start stopped workers up to N, create new ones up to N. Never
    /// stops or destroys existing extras; if workers > N, returns the
    /// first N deterministically by name (§4.4 step 6).
    fn grow_worker_pool(&self, target: u32) -> Result<Vec<String>> {
        let mut existing = self.workers.list()?;
        existing.sort_by(|a, b| a.name.cmp(&b.name));

        for worker in existing.iter().take(target as usize) {
            if worker.status != crate::worker::RunningStatus::Running {
                self.workers.start(&worker.name)?;
            }
        }

        let mut names: Vec<String> = existing.iter().map(|w| w.name.clone()).collect();
        while (names.len() as u32) < target {
            let created = self.workers.create_worker(None)?;
            self.workers.start(&created)?;
            names.push(created);
        }

        names.sort();
        Ok(names.into_iter().take(target as usize).collect())
    }

    /// Optional step 9: launch the multiplexer, honoring `skip_multiplexer`
    /// at the call site. Non-fatal — the session record persists either
    /// way, and the user can re-attach manually on failure (§4.4).
    fn launch_multiplexer(&self, project: &str) -> Option<String> {
        match self.multiplexer.launch(project) {
            Ok(handle) if !handle.is_empty() => Some(handle),
            Ok(_) => None,
            Err(e) => {
                warn!(error = %e, "multiplexer launch failed");
                None
            }
        }
    }

    fn prepare_agent_environment(&self, name: &str) -> Result<()> {
        let script = format!(
            "cat > {ENV_FILE} <<'EOF'\nISOLLM_WORKER={name}\nEOF\n\
             test -f {CONTEXT_FILE} || cat > {CONTEXT_FILE} <<'EOF'\n# isollm agent context\nEOF\n\
             grep -qF '{ENV_MARKER}' {SHELL_INIT} 2>/dev/null || echo 'source {ENV_FILE} {ENV_MARKER}' >> {SHELL_INIT}"
        );
        self.workers.exec(name, &["sh", "-c", &script])?;
        Ok(())
    }
}

fn current_time_placeholder() -> chrono::DateTime<chrono::Utc> {
    chrono::Utc::now()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multiplexer::NoMultiplexer;
    use crate::process::fake::FakeProcessRunner;
    use crate::worker::ports::fake::FakeContainerRuntime;
    use std::net::TcpListener;

    struct AlwaysUpLauncher;
    impl QueueServerLauncher for AlwaysUpLauncher {
        fn spawn(&self, _host: &str, _port: u16) -> Result<()> {
            Ok(())
        }
    }

    fn minimal_config(port: u16) -> ProjectConfig {
        let yaml = format!(
            "project: demo\nworkers: 2\nairyra:\n  port: {port}\n"
        );
        ProjectConfig::parse(&yaml).unwrap()
    }

    #[test]
    fn find_project_root_walks_up_to_config() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("isollm.yaml"), "project: demo\n").unwrap();
        let nested = dir.path().join("a/b/c");
        std::fs::create_dir_all(&nested).unwrap();
        assert_eq!(find_project_root(&nested).unwrap(), dir.path());
    }

    #[test]
    fn find_project_root_fails_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        assert!(find_project_root(dir.path()).is_err());
    }

    #[test]
    fn up_creates_hub_and_grows_pool_to_target() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = minimal_config(port);

        let project_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let hub_dir = tempfile::tempdir().unwrap();

        let runtime = FakeContainerRuntime::new();
        let git_runner =
            FakeProcessRunner::new(vec![FakeProcessRunner::ok(""), FakeProcessRunner::ok("")]);
        let git = GitHub::new(git_runner, hub_dir.path().join("demo.git"));
        let launcher = AlwaysUpLauncher;

        let controller = SessionController::new(
            &runtime,
            &git,
            &launcher,
            &NoMultiplexer,
            state_dir.path(),
            project_dir.path(),
            "ubuntu:24.04",
            "isollm/",
        );
        let record = controller.up(&config, UpOptions::default()).unwrap();
        assert_eq!(record.workers, vec!["worker-1".to_string(), "worker-2".to_string()]);
        assert_eq!(record.project, "demo");

        let saved = SessionStore::new(state_dir.path()).load().unwrap();
        assert_eq!(saved.unwrap().workers, record.workers);
    }

    struct FakeMultiplexer {
        handle: &'static str,
    }
    impl Multiplexer for FakeMultiplexer {
        fn launch(&self, _session_name: &str) -> Result<String> {
            Ok(self.handle.to_string())
        }
        fn stop(&self, _handle: &str) -> Result<()> {
            Ok(())
        }
        fn is_present(&self) -> bool {
            true
        }
    }

    struct FailingMultiplexer;
    impl Multiplexer for FailingMultiplexer {
        fn launch(&self, _session_name: &str) -> Result<String> {
            anyhow::bail!("no multiplexer binary on PATH")
        }
        fn stop(&self, _handle: &str) -> Result<()> {
            Ok(())
        }
        fn is_present(&self) -> bool {
            false
        }
    }

    #[test]
    fn up_persists_the_launched_multiplexer_handle() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = minimal_config(port);

        let project_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let hub_dir = tempfile::tempdir().unwrap();

        let runtime = FakeContainerRuntime::new();
        let git_runner =
            FakeProcessRunner::new(vec![FakeProcessRunner::ok(""), FakeProcessRunner::ok("")]);
        let git = GitHub::new(git_runner, hub_dir.path().join("demo.git"));
        let launcher = AlwaysUpLauncher;
        let multiplexer = FakeMultiplexer { handle: "zellij-session-1" };

        let controller = SessionController::new(
            &runtime,
            &git,
            &launcher,
            &multiplexer,
            state_dir.path(),
            project_dir.path(),
            "ubuntu:24.04",
            "isollm/",
        );
        let record = controller.up(&config, UpOptions::default()).unwrap();
        assert_eq!(record.multiplexer_session.as_deref(), Some("zellij-session-1"));
    }

    #[test]
    fn up_skip_multiplexer_never_launches() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = minimal_config(port);

        let project_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let hub_dir = tempfile::tempdir().unwrap();

        let runtime = FakeContainerRuntime::new();
        let git_runner =
            FakeProcessRunner::new(vec![FakeProcessRunner::ok(""), FakeProcessRunner::ok("")]);
        let git = GitHub::new(git_runner, hub_dir.path().join("demo.git"));
        let launcher = AlwaysUpLauncher;
        // always errors if `launch` is called — proves skip_multiplexer
        // short-circuits before reaching the port.
        let multiplexer = FailingMultiplexer;

        let controller = SessionController::new(
            &runtime,
            &git,
            &launcher,
            &multiplexer,
            state_dir.path(),
            project_dir.path(),
            "ubuntu:24.04",
            "isollm/",
        );
        let opts = UpOptions { skip_multiplexer: true, ..Default::default() };
        let record = controller.up(&config, opts).unwrap();
        assert_eq!(record.multiplexer_session, None);
    }

    #[test]
    fn up_is_idempotent_on_worker_set() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let config = minimal_config(port);

        let project_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let hub_dir = tempfile::tempdir().unwrap();

        let runtime = FakeContainerRuntime::new();
        // Two `up()` calls, each issuing a clone + a gc.auto=0 config call
        // against the fake hub (the fake process runner never writes a
        // real HEAD file, so `exists()` stays false across calls).
        let git_runner = FakeProcessRunner::new(vec![
            FakeProcessRunner::ok(""),
            FakeProcessRunner::ok(""),
            FakeProcessRunner::ok(""),
            FakeProcessRunner::ok(""),
        ]);
        let git = GitHub::new(git_runner, hub_dir.path().join("demo.git"));
        let launcher = AlwaysUpLauncher;

        let controller = SessionController::new(
            &runtime,
            &git,
            &launcher,
            &NoMultiplexer,
            state_dir.path(),
            project_dir.path(),
            "ubuntu:24.04",
            "isollm/",
        );
        let first = controller.up(&config, UpOptions::default()).unwrap();
        let second = controller.up(&config, UpOptions::default()).unwrap();
        assert_eq!(first.workers, second.workers);
    }

    #[test]
    fn up_never_shrinks_extra_workers_below_target() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut config = minimal_config(port);
        config.workers = 1;

        let project_dir = tempfile::tempdir().unwrap();
        let state_dir = tempfile::tempdir().unwrap();
        let hub_dir = tempfile::tempdir().unwrap();

        let runtime = FakeContainerRuntime::new();
        let git_runner =
            FakeProcessRunner::new(vec![FakeProcessRunner::ok(""), FakeProcessRunner::ok("")]);
        let git = GitHub::new(git_runner, hub_dir.path().join("demo.git"));
        let launcher = AlwaysUpLauncher;

        let controller = SessionController::new(
            &runtime,
            &git,
            &launcher,
            &NoMultiplexer,
            state_dir.path(),
            project_dir.path(),
            "ubuntu:24.04",
            "isollm/",
        );
        // pre-create three workers, as if a prior session over-provisioned
        controller.workers.create_worker(None).unwrap();
        controller.workers.create_worker(None).unwrap();
        controller.workers.create_worker(None).unwrap();

        let record = controller.up(&config, UpOptions::default()).unwrap();
        assert_eq!(record.workers, vec!["worker-1".to_string()]);
        // extras remain in the runtime's view, untouched
        assert_eq!(controller.workers.list().unwrap().len(), 3);
    }
}
