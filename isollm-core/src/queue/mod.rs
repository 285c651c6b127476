//! Task queue coupling: a thin client over an external queue service.
//!
//! Production code is generic over [`QueueBackend`] and injects
//! [`http::HttpQueueClient`]; tests inject [`memory::InMemoryQueue`], which
//! implements the same claim/ownership/cycle rules without a network round
//! trip (§4.2, §9).

pub mod claim_retry;
pub mod http;
pub mod launcher;
pub mod memory;

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// critical < high < normal < low < lowest, in claim priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Critical,
    High,
    Normal,
    Low,
    Lowest,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Critical => "critical",
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
            Priority::Lowest => "lowest",
        }
    }

    pub fn from_str_loose(s: &str) -> Result<Self> {
        Ok(match s.to_ascii_lowercase().as_str() {
            "critical" => Priority::Critical,
            "high" => Priority::High,
            "normal" => Priority::Normal,
            "low" => Priority::Low,
            "lowest" => Priority::Lowest,
            other => {
                return Err(crate::error::IsollmError::ValidationFailed(format!(
                    "unknown priority '{other}'"
                ))
                .into())
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Open,
    InProgress,
    Blocked,
    Done,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub priority: Priority,
    pub status: TaskStatus,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub claimer: Option<String>,
    #[serde(default)]
    pub claimed_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(default)]
    pub parents: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub title: String,
    pub priority: Option<Priority>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ListTasksQuery {
    pub status: Option<TaskStatus>,
    pub page: Option<u32>,
    pub per_page: Option<u32>,
}

/// Capability set every queue backend (real HTTP client or in-memory fake)
/// must satisfy. Callers depend on this trait, never on a concrete type
/// (§9 — composition by injection, never a global singleton).
pub trait QueueBackend {
    fn health(&self) -> Result<()>;

    fn add_task(&self, agent: &str, task: NewTask) -> Result<Task>;
    fn get_task(&self, id: &str) -> Result<Task>;
    fn list_tasks(&self, query: ListTasksQuery) -> Result<Vec<Task>>;
    fn list_ready_tasks(&self) -> Result<Vec<Task>>;
    fn delete_task(&self, id: &str) -> Result<()>;
    fn clear_done_tasks(&self) -> Result<()>;
    fn clear_all_tasks(&self) -> Result<()>;

    fn claim_task(&self, id: &str, agent: &str) -> Result<Task>;
    fn complete_task(&self, id: &str, agent: &str) -> Result<Task>;
    fn release_task(&self, id: &str, agent: &str, force: bool) -> Result<Task>;
    fn block_task(&self, id: &str) -> Result<Task>;
    fn unblock_task(&self, id: &str) -> Result<Task>;

    fn add_dependency(&self, child: &str, parent: &str) -> Result<()>;
    fn remove_dependency(&self, child: &str, parent: &str) -> Result<()>;
    fn list_dependencies(&self, task: &str) -> Result<Vec<String>>;
}
