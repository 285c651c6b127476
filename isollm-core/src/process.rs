//! Injected process executor.
//!
//! `git_hub` and the container runtime CLI adapter both shell out to an
//! external binary. Neither calls `std::process::Command` directly — they
//! go through this trait so tests can supply a recording/replaying fake
//! instead of a real subprocess (§9, "Global executor").

use anyhow::{Context, Result};
use std::process::Command;
use std::time::Duration;

/// Result of running a process to completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Port for running an external command to completion.
pub trait ProcessRunner: Send + Sync {
    /// Run `program` with `args` in `cwd` (if given), waiting up to `timeout`.
    fn run(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&std::path::Path>,
        timeout: Duration,
    ) -> Result<ProcessOutput>;
}

/// Default `ProcessRunner`: runs the real binary via `std::process::Command`.
///
/// `timeout` is enforced by shelling through the system `timeout` command
/// rather than spawning a watchdog thread — it keeps this adapter a thin,
/// synchronous wrapper with no background state to leak across calls.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemProcessRunner;

impl ProcessRunner for SystemProcessRunner {
    fn run(
        &self,
        program: &str,
        args: &[&str],
        cwd: Option<&std::path::Path>,
        timeout: Duration,
    ) -> Result<ProcessOutput> {
        let timeout_secs = timeout.as_secs().max(1).to_string();
        let mut cmd = Command::new("timeout");
        cmd.arg(&timeout_secs).arg(program).args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        let output = cmd
            .output()
            .with_context(|| format!("failed to spawn `{program}`"))?;
        Ok(ProcessOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
pub mod fake {
    use super::*;
    use std::sync::Mutex;

    /// A scripted recording fake: returns the next queued `ProcessOutput`
    /// for each call, in order, and records the invocation for assertions.
    pub struct FakeProcessRunner {
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
        pub responses: Mutex<Vec<ProcessOutput>>,
    }

    impl FakeProcessRunner {
        pub fn new(responses: Vec<ProcessOutput>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responses: Mutex::new(responses),
            }
        }

        pub fn ok(stdout: &str) -> ProcessOutput {
            ProcessOutput {
                status: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }
        }

        pub fn err(stderr: &str) -> ProcessOutput {
            ProcessOutput {
                status: 1,
                stdout: String::new(),
                stderr: stderr.to_string(),
            }
        }
    }

    impl ProcessRunner for FakeProcessRunner {
        fn run(
            &self,
            program: &str,
            args: &[&str],
            _cwd: Option<&std::path::Path>,
            _timeout: Duration,
        ) -> Result<ProcessOutput> {
            self.calls.lock().unwrap().push((
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));
            self.responses
                .lock()
                .unwrap()
                .pop()
                .ok_or_else(|| anyhow::anyhow!("FakeProcessRunner: no scripted response left"))
        }
    }
}
