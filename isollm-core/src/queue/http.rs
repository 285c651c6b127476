//! HTTP `QueueBackend` backed by `ureq`. Every request carries the agent
//! identity header; a non-2xx response is parsed as `{"error": {"kind",
//! "message"}}` and mapped 1:1 onto [`IsollmError`] by `kind`, never by
//! matching on `message` text (§4.2).

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;

use crate::error::IsollmError;
use crate::queue::{ListTasksQuery, NewTask, QueueBackend, Task, TaskStatus};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const AGENT_HEADER: &str = "X-Isollm-Agent";

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ErrorDetail {
    kind: String,
    message: String,
}

pub struct HttpQueueClient {
    base_url: String,
    agent: String,
}

impl HttpQueueClient {
    pub fn new(host: &str, port: u16, agent: impl Into<String>) -> Self {
        Self {
            base_url: format!("http://{host}:{port}"),
            agent: agent.into(),
        }
    }

    fn agent_request(&self, method: &str, path: &str) -> ureq::Request {
        ureq::request(method, &format!("{}{}", self.base_url, path))
            .timeout(REQUEST_TIMEOUT)
            .set(AGENT_HEADER, &self.agent)
    }

    fn send<T: for<'de> Deserialize<'de>>(
        &self,
        method: &str,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<T> {
        let req = self.agent_request(method, path);
        let result = match body {
            Some(b) => req.send_json(b),
            None => req.call(),
        };
        match result {
            Ok(resp) => resp
                .into_json::<T>()
                .context("failed to decode queue response body"),
            Err(ureq::Error::Status(_, resp)) => {
                let body: ErrorBody = resp
                    .into_json()
                    .context("failed to decode queue error body")?;
                Err(map_error_kind(&body.error.kind, &body.error.message))
            }
            Err(ureq::Error::Transport(t)) => {
                Err(IsollmError::ServerNotRunning).with_context(|| t.to_string())
            }
        }
    }

    fn send_unit(&self, method: &str, path: &str, body: Option<serde_json::Value>) -> Result<()> {
        self.send::<serde_json::Value>(method, path, body).map(|_| ())
    }
}

fn map_error_kind(kind: &str, message: &str) -> anyhow::Error {
    let err = match kind {
        "task_not_found" => IsollmError::TaskNotFound(message.to_string()),
        "already_claimed" => IsollmError::AlreadyClaimed(message.to_string()),
        "not_owner" => IsollmError::NotOwner(message.to_string()),
        "invalid_transition" => IsollmError::InvalidTransition(message.to_string(), String::new()),
        "cycle_detected" => IsollmError::CycleDetected(message.to_string()),
        "dependency_not_found" => {
            IsollmError::DependencyNotFound(message.to_string(), String::new())
        }
        "server_unhealthy" => IsollmError::ServerUnhealthy(message.to_string()),
        "project_not_found" => IsollmError::ProjectNotFound(message.to_string()),
        _ => IsollmError::ValidationFailed(message.to_string()),
    };
    err.into()
}

impl QueueBackend for HttpQueueClient {
    fn health(&self) -> Result<()> {
        self.send_unit("GET", "/health", None)
    }

    fn add_task(&self, _agent: &str, new_task: NewTask) -> Result<Task> {
        let body = json!({
            "title": new_task.title,
            "priority": new_task.priority.map(|p| p.as_str()),
            "description": new_task.description,
        });
        self.send("POST", "/tasks", Some(body))
    }

    fn get_task(&self, id: &str) -> Result<Task> {
        self.send("GET", &format!("/tasks/{id}"), None)
    }

    fn list_tasks(&self, query: ListTasksQuery) -> Result<Vec<Task>> {
        let mut path = "/tasks".to_string();
        let mut params = Vec::new();
        if let Some(status) = query.status {
            params.push(format!("status={}", status_str(status)));
        }
        if let Some(page) = query.page {
            params.push(format!("page={page}"));
        }
        if let Some(per_page) = query.per_page {
            params.push(format!("per_page={per_page}"));
        }
        if !params.is_empty() {
            path.push('?');
            path.push_str(&params.join("&"));
        }
        self.send("GET", &path, None)
    }

    fn list_ready_tasks(&self) -> Result<Vec<Task>> {
        self.send("GET", "/tasks/ready", None)
    }

    fn delete_task(&self, id: &str) -> Result<()> {
        self.send_unit("DELETE", &format!("/tasks/{id}"), None)
    }

    fn clear_done_tasks(&self) -> Result<()> {
        self.send_unit("POST", "/tasks/clear-done", None)
    }

    fn clear_all_tasks(&self) -> Result<()> {
        self.send_unit("POST", "/tasks/clear-all", None)
    }

    fn claim_task(&self, id: &str, _agent: &str) -> Result<Task> {
        self.send("POST", &format!("/tasks/{id}/claim"), None)
    }

    fn complete_task(&self, id: &str, _agent: &str) -> Result<Task> {
        self.send("POST", &format!("/tasks/{id}/complete"), None)
    }

    fn release_task(&self, id: &str, _agent: &str, force: bool) -> Result<Task> {
        let body = json!({ "force": force });
        self.send("POST", &format!("/tasks/{id}/release"), Some(body))
    }

    fn block_task(&self, id: &str) -> Result<Task> {
        self.send("POST", &format!("/tasks/{id}/block"), None)
    }

    fn unblock_task(&self, id: &str) -> Result<Task> {
        self.send("POST", &format!("/tasks/{id}/unblock"), None)
    }

    fn add_dependency(&self, child: &str, parent: &str) -> Result<()> {
        let body = json!({ "parent": parent });
        self.send_unit("POST", &format!("/tasks/{child}/dependencies"), Some(body))
    }

    fn remove_dependency(&self, child: &str, parent: &str) -> Result<()> {
        self.send_unit(
            "DELETE",
            &format!("/tasks/{child}/dependencies/{parent}"),
            None,
        )
    }

    fn list_dependencies(&self, task: &str) -> Result<Vec<String>> {
        self.send("GET", &format!("/tasks/{task}/dependencies"), None)
    }
}

fn status_str(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Open => "open",
        TaskStatus::InProgress => "in_progress",
        TaskStatus::Blocked => "blocked",
        TaskStatus::Done => "done",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_error_kinds_to_taxonomy() {
        let err = map_error_kind("task_not_found", "t-1 missing");
        assert!(matches!(
            err.downcast_ref::<IsollmError>(),
            Some(IsollmError::TaskNotFound(_))
        ));

        let err = map_error_kind("already_claimed", "nope");
        assert!(matches!(
            err.downcast_ref::<IsollmError>(),
            Some(IsollmError::AlreadyClaimed(_))
        ));
    }

    #[test]
    fn unknown_kind_falls_back_to_validation_failed() {
        let err = map_error_kind("something_new", "surprise");
        assert!(matches!(
            err.downcast_ref::<IsollmError>(),
            Some(IsollmError::ValidationFailed(_))
        ));
    }
}
