//! Terminal-multiplexer port. Layout generation and pane-attach mechanics
//! are out of scope (§1) — only the launch/stop boundary the Session and
//! Shutdown controllers call through is in scope.

use anyhow::{Context, Result};

pub trait Multiplexer: Send + Sync {
    /// Launch (or attach to) a multiplexer session named `session_name`.
    /// Returns the session handle to persist in the Session Record.
    fn launch(&self, session_name: &str) -> Result<String>;

    /// Stop a previously launched session. Best-effort: callers downgrade
    /// failures to a warning (§4.5 STOP_MULTIPLEXER).
    fn stop(&self, handle: &str) -> Result<()>;

    fn is_present(&self) -> bool;
}

/// Stub used when `--no-zellij` / `skip_multiplexer` is set, or in tests.
/// Always succeeds and reports itself absent so Status degrades
/// gracefully rather than claiming a multiplexer it never launched.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoMultiplexer;

impl Multiplexer for NoMultiplexer {
    fn launch(&self, _session_name: &str) -> Result<String> {
        Ok(String::new())
    }

    fn stop(&self, _handle: &str) -> Result<()> {
        Ok(())
    }

    fn is_present(&self) -> bool {
        false
    }
}

/// Shells out to `zellij` (or whatever binary `zellij.layout`/`dashboard`
/// config names). Spawned detached, like `CliQueueServerLauncher` spawns
/// the queue server — the CLI returns as soon as the session exists, it
/// does not wait for the user to detach.
pub struct CliMultiplexer {
    pub binary: String,
}

impl Default for CliMultiplexer {
    fn default() -> Self {
        Self {
            binary: "zellij".to_string(),
        }
    }
}

impl Multiplexer for CliMultiplexer {
    fn launch(&self, session_name: &str) -> Result<String> {
        std::process::Command::new(&self.binary)
            .args(["attach", "--create", session_name])
            .spawn()
            .with_context(|| format!("failed to spawn {} attach --create {session_name}", self.binary))?;
        Ok(session_name.to_string())
    }

    fn stop(&self, handle: &str) -> Result<()> {
        let status = std::process::Command::new(&self.binary)
            .args(["kill-session", handle])
            .status()
            .with_context(|| format!("failed to run {} kill-session {handle}", self.binary))?;
        if !status.success() {
            anyhow::bail!("{} kill-session {handle} exited with {status}", self.binary);
        }
        Ok(())
    }

    fn is_present(&self) -> bool {
        std::process::Command::new(&self.binary)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }
}
