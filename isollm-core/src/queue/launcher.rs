//! Ensure-running support: a TCP-dial health probe plus a detached-spawn
//! capability for starting the queue server when it is down (§4.2, §4.4
//! step 4).

use anyhow::{Context, Result};
use std::net::TcpStream;
use std::time::{Duration, Instant};
use tracing::info;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
const START_TIMEOUT: Duration = Duration::from_secs(30);

/// True iff something is listening on `host:port`.
pub fn probe(host: &str, port: u16) -> bool {
    TcpStream::connect((host, port)).is_ok()
}

/// Capability for spawning the queue server as a detached child process.
/// Production code injects [`CliQueueServerLauncher`]; tests inject a fake
/// that just flips a flag the test-local probe can observe.
pub trait QueueServerLauncher: Send + Sync {
    fn spawn(&self, host: &str, port: u16) -> Result<()>;
}

pub struct CliQueueServerLauncher {
    pub binary: String,
}

impl Default for CliQueueServerLauncher {
    fn default() -> Self {
        Self {
            binary: "airyra".to_string(),
        }
    }
}

impl QueueServerLauncher for CliQueueServerLauncher {
    fn spawn(&self, host: &str, port: u16) -> Result<()> {
        std::process::Command::new(&self.binary)
            .args(["server", "start", "--host", host, "--port"])
            .arg(port.to_string())
            .spawn()
            .with_context(|| format!("failed to spawn {} server start", self.binary))?;
        Ok(())
    }
}

/// Ensure the queue server at `host:port` is reachable, spawning it via
/// `launcher` and polling if it is not, up to `START_TIMEOUT`.
pub fn ensure_running(launcher: &dyn QueueServerLauncher, host: &str, port: u16) -> Result<()> {
    if probe(host, port) {
        return Ok(());
    }
    info!(host, port, "queue server not reachable, spawning");
    launcher.spawn(host, port)?;
    let deadline = Instant::now() + START_TIMEOUT;
    loop {
        if probe(host, port) {
            return Ok(());
        }
        if Instant::now() >= deadline {
            return Err(crate::error::IsollmError::ServerNotRunning.into());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn probe_detects_a_listening_port() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(probe("127.0.0.1", port));
    }

    #[test]
    fn probe_false_when_nothing_listens() {
        assert!(!probe("127.0.0.1", 1));
    }

    #[test]
    fn ensure_running_skips_spawn_when_already_reachable() {
        struct PanicLauncher;
        impl QueueServerLauncher for PanicLauncher {
            fn spawn(&self, _host: &str, _port: u16) -> Result<()> {
                panic!("should not spawn when already reachable");
            }
        }
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        ensure_running(&PanicLauncher, "127.0.0.1", port).unwrap();
    }
}
