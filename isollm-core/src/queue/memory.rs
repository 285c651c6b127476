//! In-memory `QueueBackend` fake. Enforces the same claim/ownership/cycle
//! rules as the HTTP backend so tests exercise real semantics without a
//! network round trip.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::error::IsollmError;
use crate::queue::{ListTasksQuery, NewTask, Priority, QueueBackend, Task, TaskStatus};

struct Inner {
    tasks: HashMap<String, Task>,
    deps: HashMap<String, Vec<String>>,
    next_id: u64,
}

pub struct InMemoryQueue {
    inner: Mutex<Inner>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                tasks: HashMap::new(),
                deps: HashMap::new(),
                next_id: 1,
            }),
        }
    }

    fn parents_done(inner: &Inner, id: &str) -> bool {
        inner
            .deps
            .get(id)
            .map(|parents| {
                parents
                    .iter()
                    .all(|p| matches!(inner.tasks.get(p), Some(t) if t.status == TaskStatus::Done))
            })
            .unwrap_or(true)
    }

    fn would_cycle(inner: &Inner, child: &str, parent: &str) -> bool {
        if child == parent {
            return true;
        }
        let mut stack = vec![parent.to_string()];
        let mut seen = std::collections::HashSet::new();
        while let Some(cur) = stack.pop() {
            if cur == child {
                return true;
            }
            if !seen.insert(cur.clone()) {
                continue;
            }
            if let Some(parents) = inner.deps.get(&cur) {
                stack.extend(parents.iter().cloned());
            }
        }
        false
    }
}

impl QueueBackend for InMemoryQueue {
    fn health(&self) -> Result<()> {
        Ok(())
    }

    fn add_task(&self, _agent: &str, new_task: NewTask) -> Result<Task> {
        let mut inner = self.inner.lock().unwrap();
        let id = format!("t-{}", inner.next_id);
        inner.next_id += 1;
        let task = Task {
            id: id.clone(),
            title: new_task.title,
            priority: new_task.priority.unwrap_or(Priority::Normal),
            status: TaskStatus::Open,
            description: new_task.description,
            claimer: None,
            claimed_at: None,
            parents: Vec::new(),
        };
        inner.tasks.insert(id, task.clone());
        Ok(task)
    }

    fn get_task(&self, id: &str) -> Result<Task> {
        let inner = self.inner.lock().unwrap();
        inner
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| IsollmError::TaskNotFound(id.to_string()).into())
    }

    fn list_tasks(&self, query: ListTasksQuery) -> Result<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| query.status.map_or(true, |s| s == t.status))
            .cloned()
            .collect();
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        if let (Some(page), Some(per_page)) = (query.page, query.per_page) {
            let start = (page.saturating_sub(1) as usize) * per_page as usize;
            tasks = tasks.into_iter().skip(start).take(per_page as usize).collect();
        }
        Ok(tasks)
    }

    fn list_ready_tasks(&self) -> Result<Vec<Task>> {
        let inner = self.inner.lock().unwrap();
        let mut ready: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.status == TaskStatus::Open && Self::parents_done(&inner, &t.id))
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.priority.cmp(&b.priority).then_with(|| a.id.cmp(&b.id)));
        Ok(ready)
    }

    fn delete_task(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .tasks
            .remove(id)
            .ok_or_else(|| IsollmError::TaskNotFound(id.to_string()))?;
        inner.deps.remove(id);
        Ok(())
    }

    fn clear_done_tasks(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.retain(|_, t| t.status != TaskStatus::Done);
        Ok(())
    }

    fn clear_all_tasks(&self) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.tasks.clear();
        inner.deps.clear();
        Ok(())
    }

    fn claim_task(&self, id: &str, agent: &str) -> Result<Task> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| IsollmError::TaskNotFound(id.to_string()))?;
        if task.status != TaskStatus::Open {
            return Err(IsollmError::AlreadyClaimed(id.to_string()).into());
        }
        let task = inner.tasks.get_mut(id).unwrap();
        task.status = TaskStatus::InProgress;
        task.claimer = Some(agent.to_string());
        task.claimed_at = Some(Utc::now());
        Ok(task.clone())
    }

    fn complete_task(&self, id: &str, agent: &str) -> Result<Task> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| IsollmError::TaskNotFound(id.to_string()))?;
        if task.claimer.as_deref() != Some(agent) {
            return Err(IsollmError::NotOwner(id.to_string()).into());
        }
        if task.status != TaskStatus::InProgress {
            return Err(IsollmError::InvalidTransition(id.to_string(), "complete".into()).into());
        }
        let task = inner.tasks.get_mut(id).unwrap();
        task.status = TaskStatus::Done;
        Ok(task.clone())
    }

    fn release_task(&self, id: &str, agent: &str, force: bool) -> Result<Task> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get(id)
            .cloned()
            .ok_or_else(|| IsollmError::TaskNotFound(id.to_string()))?;
        if !force && task.claimer.as_deref() != Some(agent) {
            return Err(IsollmError::NotOwner(id.to_string()).into());
        }
        let task = inner.tasks.get_mut(id).unwrap();
        task.status = TaskStatus::Open;
        task.claimer = None;
        task.claimed_at = None;
        Ok(task.clone())
    }

    fn block_task(&self, id: &str) -> Result<Task> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| IsollmError::TaskNotFound(id.to_string()))?;
        task.status = TaskStatus::Blocked;
        Ok(task.clone())
    }

    fn unblock_task(&self, id: &str) -> Result<Task> {
        let mut inner = self.inner.lock().unwrap();
        let task = inner
            .tasks
            .get_mut(id)
            .ok_or_else(|| IsollmError::TaskNotFound(id.to_string()))?;
        if task.status != TaskStatus::Blocked {
            return Err(IsollmError::InvalidTransition(id.to_string(), "unblock".into()).into());
        }
        task.status = TaskStatus::Open;
        Ok(task.clone())
    }

    fn add_dependency(&self, child: &str, parent: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.tasks.contains_key(child) {
            return Err(IsollmError::TaskNotFound(child.to_string()).into());
        }
        if !inner.tasks.contains_key(parent) {
            return Err(IsollmError::DependencyNotFound(child.to_string(), parent.to_string()).into());
        }
        if Self::would_cycle(&inner, child, parent) {
            return Err(IsollmError::CycleDetected(child.to_string()).into());
        }
        inner.deps.entry(child.to_string()).or_default().push(parent.to_string());
        Ok(())
    }

    fn remove_dependency(&self, child: &str, parent: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(parents) = inner.deps.get_mut(child) {
            parents.retain(|p| p != parent);
        }
        Ok(())
    }

    fn list_dependencies(&self, task: &str) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.deps.get(task).cloned().unwrap_or_default())
    }
}
