//! Project configuration: `<project>/isollm.yaml` plus the agent identity
//! used to tag queue claims.
//!
//! Loading is two-phase: deserialize the raw (mostly-optional) YAML shape,
//! apply defaults, then validate every §3 invariant in one pass so a
//! misconfigured project is diagnosed with every violation at once instead
//! of stopping at the first `?`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

use crate::error::IsollmError;

const DEFAULT_WORKERS: u32 = 3;
const DEFAULT_IMAGE: &str = "ubuntu:24.04";
const DEFAULT_BASE_BRANCH: &str = "main";
const DEFAULT_BRANCH_PREFIX: &str = "isollm/";
const DEFAULT_QUEUE_HOST: &str = "localhost";
const DEFAULT_QUEUE_PORT: u16 = 7432;
const DEFAULT_LAYOUT: &str = "auto";

/// Raw on-disk shape of `isollm.yaml`. Every field beyond `project` is
/// optional so the loader can apply defaults after parsing.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RawConfig {
    pub project: String,
    #[serde(default)]
    pub workers: Option<u32>,
    #[serde(default)]
    pub image: Option<String>,
    #[serde(default)]
    pub setup_script: Option<String>,
    #[serde(default)]
    pub git: Option<RawGitConfig>,
    #[serde(default)]
    pub claude: Option<RawClaudeConfig>,
    #[serde(default)]
    pub airyra: Option<RawAiryraConfig>,
    #[serde(default)]
    pub ports: Vec<String>,
    #[serde(default)]
    pub zellij: Option<RawZellijConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawGitConfig {
    pub base_branch: Option<String>,
    pub branch_prefix: Option<String>,
    pub upstream: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawClaudeConfig {
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawAiryraConfig {
    pub project: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RawZellijConfig {
    pub layout: Option<String>,
    pub dashboard: Option<String>,
}

/// A host-or-mapped exposed port, e.g. `"8080"` or `"8080:80"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// Fully resolved, validated project configuration. Every other component
/// consumes this type, never `RawConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectConfig {
    pub project: String,
    pub workers: u32,
    pub image: String,
    pub setup_script: Option<String>,
    pub base_branch: String,
    pub branch_prefix: String,
    pub upstream: Option<String>,
    pub claude_command: String,
    pub claude_args: Vec<String>,
    pub queue_project: String,
    pub queue_host: String,
    pub queue_port: u16,
    pub ports: Vec<PortMapping>,
    pub zellij_layout: String,
    pub zellij_dashboard: Option<String>,
}

impl ProjectConfig {
    /// Load, default, and validate `<project_root>/isollm.yaml`.
    pub fn load(project_root: &Path) -> Result<Self> {
        let path = project_root.join("isollm.yaml");
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Self::parse(&text)
    }

    /// Parse and validate from YAML text directly (used by tests and by
    /// `load` once the file is read).
    pub fn parse(yaml: &str) -> Result<Self> {
        let raw: RawConfig = serde_yaml::from_str(yaml).context("failed to parse isollm.yaml")?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self> {
        let git = raw.git.unwrap_or_default();
        let claude = raw.claude.unwrap_or_default();
        let airyra = raw.airyra.unwrap_or_default();
        let zellij = raw.zellij.unwrap_or_default();

        let queue_port = airyra.port.unwrap_or(DEFAULT_QUEUE_PORT);
        let mut ports = Vec::with_capacity(raw.ports.len());
        let mut port_parse_errors = Vec::new();
        for spec in &raw.ports {
            match parse_port_mapping(spec) {
                Ok(p) => ports.push(p),
                Err(e) => port_parse_errors.push(e),
            }
        }

        let cfg = ProjectConfig {
            project: raw.project,
            workers: raw.workers.unwrap_or(DEFAULT_WORKERS),
            image: raw.image.unwrap_or_else(|| DEFAULT_IMAGE.to_string()),
            setup_script: raw.setup_script,
            base_branch: git
                .base_branch
                .unwrap_or_else(|| DEFAULT_BASE_BRANCH.to_string()),
            branch_prefix: git
                .branch_prefix
                .unwrap_or_else(|| DEFAULT_BRANCH_PREFIX.to_string()),
            upstream: git.upstream,
            claude_command: claude.command.unwrap_or_else(|| "claude".to_string()),
            claude_args: claude.args,
            queue_project: airyra.project.unwrap_or_default(),
            queue_host: airyra.host.unwrap_or_else(|| DEFAULT_QUEUE_HOST.to_string()),
            queue_port,
            ports,
            zellij_layout: zellij.layout.unwrap_or_else(|| DEFAULT_LAYOUT.to_string()),
            zellij_dashboard: zellij.dashboard,
        };

        let mut violations = port_parse_errors;
        violations.extend(cfg.validate());
        if !violations.is_empty() {
            return Err(IsollmError::ValidationFailed(violations.join("; ")).into());
        }
        Ok(cfg)
    }

    /// Collect every violated §3 invariant; empty iff the config is valid.
    fn validate(&self) -> Vec<String> {
        let mut errs = Vec::new();

        if !is_valid_project_name(&self.project) {
            errs.push(format!(
                "project name '{}' must match [A-Za-z][A-Za-z0-9-]{{1,63}}",
                self.project
            ));
        }

        if self.workers < 1 || self.workers > 20 {
            errs.push(format!(
                "worker count {} out of range 1..=20",
                self.workers
            ));
        }

        if !is_valid_branch_name(&self.base_branch) {
            errs.push(format!(
                "base branch '{}' must match [A-Za-z0-9._/-]+",
                self.base_branch
            ));
        }

        if !self.branch_prefix.is_empty() && !self.branch_prefix.ends_with('/') {
            errs.push(format!(
                "branch prefix '{}' must be empty or end in '/'",
                self.branch_prefix
            ));
        }

        for p in &self.ports {
            if !(1024..=65535).contains(&p.host) {
                errs.push(format!("host port {} out of range 1024..65535", p.host));
            }
            if !(1024..=65535).contains(&p.container) {
                errs.push(format!(
                    "container port {} out of range 1024..65535",
                    p.container
                ));
            }
        }

        let mut seen_hosts = HashSet::new();
        for p in &self.ports {
            if !seen_hosts.insert(p.host) {
                errs.push(format!("duplicate host port {}", p.host));
            }
        }

        if seen_hosts.contains(&self.queue_port) {
            errs.push(format!(
                "host port {} collides with queue port",
                self.queue_port
            ));
        }

        errs
    }
}

fn parse_port_mapping(spec: &str) -> Result<PortMapping, String> {
    match spec.split_once(':') {
        Some((h, c)) => {
            let host: u16 = h
                .parse()
                .map_err(|_| format!("invalid port spec '{spec}': bad host port"))?;
            let container: u16 = c
                .parse()
                .map_err(|_| format!("invalid port spec '{spec}': bad container port"))?;
            Ok(PortMapping { host, container })
        }
        None => {
            let port: u16 = spec
                .parse()
                .map_err(|_| format!("invalid port spec '{spec}': not a number"))?;
            Ok(PortMapping {
                host: port,
                container: port,
            })
        }
    }
}

fn is_valid_project_name(name: &str) -> bool {
    let mut chars = name.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    if !first.is_ascii_alphabetic() {
        return false;
    }
    let rest_len = name.len() - first.len_utf8();
    if !(1..=63).contains(&rest_len) {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '-')
}

fn is_valid_branch_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '/' | '-'))
}

/// The `<user>@<host>:<cwd>` identity recorded with every queue claim.
/// Resolved layered: explicit override > environment variable > on-disk
/// default — mirrors the rest of the system's config resolution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentIdentity(pub String);

impl AgentIdentity {
    pub fn resolve(
        override_value: Option<&str>,
        get_env: impl Fn(&str) -> Option<String>,
        cwd: &Path,
    ) -> Self {
        if let Some(v) = override_value {
            return AgentIdentity(v.to_string());
        }
        if let Some(v) = get_env("ISOLLM_AGENT_ID") {
            return AgentIdentity(v);
        }
        let user = get_env("USER")
            .or_else(|| get_env("USERNAME"))
            .unwrap_or_else(|| "unknown".to_string());
        let host = get_env("HOSTNAME").unwrap_or_else(|| "localhost".to_string());
        AgentIdentity(format!("{user}@{host}:{}", cwd.display()))
    }
}

/// `<project_root>/.isollm`, holding the session record and task
/// assignment files (§6).
pub fn state_dir(project_root: &Path) -> std::path::PathBuf {
    project_root.join(".isollm")
}

/// `<home>/.isollm/<project>.git`, the bare hub location (§6).
pub fn bare_repo_path(project: &str) -> Result<std::path::PathBuf> {
    let home = dirs::home_dir().context("could not determine home directory")?;
    Ok(home.join(".isollm").join(format!("{project}.git")))
}
