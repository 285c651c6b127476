//! The container runtime capability port. Production code injects the
//! library-backed CLI adapter ([`super::runtime_cli::CliContainerRuntime`]);
//! tests inject an in-memory fake that implements the same contract
//! without touching a real container engine.

use anyhow::Result;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunningStatus {
    #[default]
    Unknown,
    Running,
    Stopped,
}

#[derive(Debug, Clone)]
pub struct WorkerCreateConfig<'a> {
    pub name: &'a str,
    pub image: &'a str,
    pub user: &'a str,
}

#[derive(Debug, Clone, Default)]
pub struct WorkerInfo {
    pub name: String,
    pub status: RunningStatus,
    pub ip: Option<String>,
    pub ports: Vec<String>,
}

/// Port exposed by the container runtime library (§6: create/start/stop/
/// remove/reset/mount/exec/shell/status/ip/list/snapshot).
pub trait ContainerRuntime: Send + Sync {
    fn create(&self, cfg: WorkerCreateConfig<'_>) -> Result<()>;
    fn start(&self, name: &str) -> Result<()>;
    fn stop(&self, name: &str) -> Result<()>;
    fn remove(&self, name: &str) -> Result<()>;
    fn reset(&self, name: &str, snapshot: &str) -> Result<()>;

    /// Block until the container reports network-ready, or the timeout
    /// elapses.
    fn wait_network_ready(&self, name: &str, timeout: std::time::Duration) -> Result<()>;

    fn mount_bare_repo(&self, name: &str, host_path: &Path, container_path: &str) -> Result<()>;

    fn exec(&self, name: &str, argv: &[&str]) -> Result<String>;
    fn shell(&self, name: &str) -> Result<()>;

    fn status(&self, name: &str) -> Result<RunningStatus>;
    fn ip(&self, name: &str) -> Result<Option<String>>;

    /// All containers the runtime knows about (not filtered to the worker
    /// prefix — callers filter).
    fn list(&self) -> Result<Vec<WorkerInfo>>;

    fn snapshot_create(&self, name: &str, snapshot: &str) -> Result<()>;
    fn snapshot_list(&self, name: &str) -> Result<Vec<String>>;
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct State {
        containers: HashMap<String, WorkerInfo>,
        snapshots: HashMap<String, Vec<String>>,
    }

    #[derive(Default)]
    pub struct FakeContainerRuntime {
        state: Mutex<State>,
    }

    impl FakeContainerRuntime {
        pub fn new() -> Self {
            Self::default()
        }
    }

    impl ContainerRuntime for FakeContainerRuntime {
        fn create(&self, cfg: WorkerCreateConfig<'_>) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.containers.insert(
                cfg.name.to_string(),
                WorkerInfo {
                    name: cfg.name.to_string(),
                    status: RunningStatus::Stopped,
                    ip: None,
                    ports: Vec::new(),
                },
            );
            Ok(())
        }

        fn start(&self, name: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(c) = state.containers.get_mut(name) {
                c.status = RunningStatus::Running;
                c.ip = Some("10.0.0.1".to_string());
            }
            Ok(())
        }

        fn stop(&self, name: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            if let Some(c) = state.containers.get_mut(name) {
                c.status = RunningStatus::Stopped;
                c.ip = None;
            }
            Ok(())
        }

        fn remove(&self, name: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state.containers.remove(name);
            state.snapshots.remove(name);
            Ok(())
        }

        fn reset(&self, name: &str, snapshot: &str) -> Result<()> {
            let state = self.state.lock().unwrap();
            if !state
                .snapshots
                .get(name)
                .map(|s| s.iter().any(|x| x == snapshot))
                .unwrap_or(false)
            {
                anyhow::bail!("no such snapshot '{snapshot}' for {name}");
            }
            Ok(())
        }

        fn wait_network_ready(&self, _name: &str, _timeout: std::time::Duration) -> Result<()> {
            Ok(())
        }

        fn mount_bare_repo(&self, _name: &str, _host_path: &Path, _container_path: &str) -> Result<()> {
            Ok(())
        }

        fn exec(&self, _name: &str, argv: &[&str]) -> Result<String> {
            Ok(argv.join(" "))
        }

        fn shell(&self, _name: &str) -> Result<()> {
            Ok(())
        }

        fn status(&self, name: &str) -> Result<RunningStatus> {
            let state = self.state.lock().unwrap();
            Ok(state
                .containers
                .get(name)
                .map(|c| c.status)
                .unwrap_or(RunningStatus::Unknown))
        }

        fn ip(&self, name: &str) -> Result<Option<String>> {
            let state = self.state.lock().unwrap();
            Ok(state.containers.get(name).and_then(|c| c.ip.clone()))
        }

        fn list(&self) -> Result<Vec<WorkerInfo>> {
            let state = self.state.lock().unwrap();
            let mut infos: Vec<_> = state.containers.values().cloned().collect();
            infos.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(infos)
        }

        fn snapshot_create(&self, name: &str, snapshot: &str) -> Result<()> {
            let mut state = self.state.lock().unwrap();
            state
                .snapshots
                .entry(name.to_string())
                .or_default()
                .push(snapshot.to_string());
            Ok(())
        }

        fn snapshot_list(&self, name: &str) -> Result<Vec<String>> {
            let state = self.state.lock().unwrap();
            Ok(state.snapshots.get(name).cloned().unwrap_or_default())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn reset_fails_without_a_matching_snapshot() {
            let rt = FakeContainerRuntime::new();
            rt.create(WorkerCreateConfig { name: "worker-1", image: "ubuntu:24.04", user: "dev" })
                .unwrap();
            assert!(rt.reset("worker-1", "clean").is_err());
            rt.snapshot_create("worker-1", "clean").unwrap();
            assert!(rt.reset("worker-1", "clean").is_ok());
        }

        #[test]
        fn start_stop_toggles_status_and_ip() {
            let rt = FakeContainerRuntime::new();
            rt.create(WorkerCreateConfig { name: "worker-1", image: "ubuntu:24.04", user: "dev" })
                .unwrap();
            rt.start("worker-1").unwrap();
            assert_eq!(rt.status("worker-1").unwrap(), RunningStatus::Running);
            assert!(rt.ip("worker-1").unwrap().is_some());
            rt.stop("worker-1").unwrap();
            assert_eq!(rt.status("worker-1").unwrap(), RunningStatus::Stopped);
            assert!(rt.ip("worker-1").unwrap().is_none());
        }

        #[test]
        fn remove_clears_snapshots_too() {
            let rt = FakeContainerRuntime::new();
            rt.create(WorkerCreateConfig { name: "worker-1", image: "ubuntu:24.04", user: "dev" })
                .unwrap();
            rt.snapshot_create("worker-1", "clean").unwrap();
            rt.remove("worker-1").unwrap();
            assert!(rt.snapshot_list("worker-1").unwrap().is_empty());
            assert_eq!(rt.status("worker-1").unwrap(), RunningStatus::Unknown);
        }
    }
}
