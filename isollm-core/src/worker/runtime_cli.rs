//! CLI-shelling `ContainerRuntime` adapter: shells out to a configurable
//! container CLI binary (default `docker`), the same pattern the rest of
//! this codebase uses for git — no container-runtime crate dependency is
//! introduced, the runtime library contract (§6) is satisfied by a thin
//! subprocess wrapper.

use anyhow::{bail, Context, Result};
use std::path::Path;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::process::ProcessRunner;
use crate::worker::ports::{ContainerRuntime, RunningStatus, WorkerCreateConfig, WorkerInfo};

const CMD_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL: Duration = Duration::from_millis(500);

pub struct CliContainerRuntime<R: ProcessRunner> {
    runner: R,
    binary: String,
}

impl<R: ProcessRunner> CliContainerRuntime<R> {
    pub fn new(runner: R, binary: impl Into<String>) -> Self {
        Self {
            runner,
            binary: binary.into(),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        debug!(?args, "running container cli");
        let out = self
            .runner
            .run(&self.binary, args, None, CMD_TIMEOUT)
            .with_context(|| format!("failed to spawn {} {}", self.binary, args.join(" ")))?;
        if !out.success() {
            warn!(?args, status = out.status, stderr = %out.stderr, "container command failed");
            bail!(
                "{} {} failed (status {}): {}",
                self.binary,
                args.join(" "),
                out.status,
                out.stderr.trim()
            );
        }
        Ok(out.stdout)
    }
}

impl<R: ProcessRunner> ContainerRuntime for CliContainerRuntime<R> {
    fn create(&self, cfg: WorkerCreateConfig<'_>) -> Result<()> {
        self.run(&[
            "create",
            "--name",
            cfg.name,
            "--user",
            cfg.user,
            cfg.image,
            "sleep",
            "infinity",
        ])?;
        Ok(())
    }

    fn start(&self, name: &str) -> Result<()> {
        self.run(&["start", name])?;
        Ok(())
    }

    fn stop(&self, name: &str) -> Result<()> {
        self.run(&["stop", name])?;
        Ok(())
    }

    fn remove(&self, name: &str) -> Result<()> {
        self.run(&["rm", "-f", name])?;
        Ok(())
    }

    fn reset(&self, name: &str, snapshot: &str) -> Result<()> {
        self.run(&["container", "restore", name, "--snapshot", snapshot])?;
        Ok(())
    }

    fn wait_network_ready(&self, name: &str, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Ok(Some(_)) = self.ip(name) {
                return Ok(());
            }
            if Instant::now() >= deadline {
                bail!("worker '{name}' did not become network-ready within {timeout:?}");
            }
            std::thread::sleep(POLL_INTERVAL);
        }
    }

    fn mount_bare_repo(&self, name: &str, host_path: &Path, container_path: &str) -> Result<()> {
        self.run(&[
            "cp",
            "--uid-shift",
            &format!("{}:{}", host_path.display(), name),
            container_path,
        ])?;
        Ok(())
    }

    fn exec(&self, name: &str, argv: &[&str]) -> Result<String> {
        let mut args = vec!["exec", name];
        args.extend_from_slice(argv);
        self.run(&args)
    }

    fn shell(&self, name: &str) -> Result<()> {
        self.run(&["exec", "-it", name, "/bin/sh"])?;
        Ok(())
    }

    fn status(&self, name: &str) -> Result<RunningStatus> {
        let out = self.run(&["inspect", "--format", "{{.State.Status}}", name])?;
        Ok(match out.trim() {
            "running" => RunningStatus::Running,
            "exited" | "created" | "stopped" => RunningStatus::Stopped,
            _ => RunningStatus::Unknown,
        })
    }

    fn ip(&self, name: &str) -> Result<Option<String>> {
        let out = self.run(&[
            "inspect",
            "--format",
            "{{.NetworkSettings.IPAddress}}",
            name,
        ])?;
        let ip = out.trim();
        Ok(if ip.is_empty() { None } else { Some(ip.to_string()) })
    }

    fn list(&self) -> Result<Vec<WorkerInfo>> {
        let out = self.run(&["ps", "-a", "--format", "{{.Names}}"])?;
        out.lines()
            .filter(|l| !l.is_empty())
            .map(|name| {
                Ok(WorkerInfo {
                    name: name.to_string(),
                    status: self.status(name)?,
                    ip: self.ip(name)?,
                    ports: Vec::new(),
                })
            })
            .collect()
    }

    fn snapshot_create(&self, name: &str, snapshot: &str) -> Result<()> {
        self.run(&["container", "snapshot", name, "--name", snapshot])?;
        Ok(())
    }

    fn snapshot_list(&self, name: &str) -> Result<Vec<String>> {
        let out = self.run(&["container", "snapshot", "list", name])?;
        Ok(out.lines().filter(|l| !l.is_empty()).map(str::to_string).collect())
    }
}
