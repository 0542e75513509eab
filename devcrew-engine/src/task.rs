//! Tasks and the specs they are created from.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::ids::{AgentId, ProjectId, TaskId};
use crate::role::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Ready,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Ready => "ready",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a task asks of its agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    /// Manager breaks the project description into a task plan.
    Planning,
    /// A developer produces files.
    Implementation,
    /// Manager reads finished work.
    Review,
}

/// Payload stored on a completed task.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskResult {
    pub output: String,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Task {
    pub id: TaskId,
    pub project: ProjectId,
    pub role: Role,
    pub kind: TaskKind,
    pub description: String,
    /// Higher is dispatched first.
    pub priority: i32,
    pub prerequisites: BTreeSet<TaskId>,
    pub files_expected: Vec<String>,
    /// A required task failing terminally fails the project.
    pub required: bool,
    pub status: TaskStatus,
    pub retry_count: u32,
    pub max_retries: u32,
    pub assigned_agent: Option<AgentId>,
    pub result: Option<TaskResult>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Insertion order; breaks priority ties FIFO.
    #[serde(skip)]
    pub(crate) seq: u64,
    /// Earliest instant a retried task may become ready again.
    #[serde(skip)]
    pub(crate) eligible_at: Option<Instant>,
}

impl Task {
    pub(crate) fn from_spec(spec: TaskSpec, project: ProjectId, max_retries: u32, seq: u64) -> Self {
        Self {
            id: spec.id,
            project,
            role: spec.role,
            kind: spec.kind,
            description: spec.description,
            priority: spec.priority,
            prerequisites: spec.prerequisites.into_iter().collect(),
            files_expected: spec.files_expected,
            required: spec.required,
            status: TaskStatus::Pending,
            retry_count: 0,
            max_retries,
            assigned_agent: None,
            result: None,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            seq,
            eligible_at: None,
        }
    }
}

/// Description of a task to enqueue. The id is fixed up front so later specs
/// can name it as a prerequisite.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskSpec {
    pub id: TaskId,
    pub role: Role,
    pub kind: TaskKind,
    pub description: String,
    pub priority: i32,
    pub prerequisites: Vec<TaskId>,
    pub files_expected: Vec<String>,
    pub required: bool,
}

impl TaskSpec {
    pub fn new(role: Role, description: impl Into<String>) -> Self {
        Self {
            id: TaskId::new(),
            role,
            kind: TaskKind::Implementation,
            description: description.into(),
            priority: 5,
            prerequisites: Vec::new(),
            files_expected: Vec::new(),
            required: true,
        }
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn after(mut self, prerequisite: TaskId) -> Self {
        if !self.prerequisites.contains(&prerequisite) {
            self.prerequisites.push(prerequisite);
        }
        self
    }

    pub fn after_all(self, prerequisites: impl IntoIterator<Item = TaskId>) -> Self {
        prerequisites.into_iter().fold(self, TaskSpec::after)
    }

    pub fn expect_file(mut self, path: impl Into<String>) -> Self {
        self.files_expected.push(path.into());
        self
    }

    /// Mark the task best-effort: its failure does not fail the project.
    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_builder_dedups_prerequisites() {
        let a = TaskId::new();
        let spec = TaskSpec::new(Role::Backend, "Build the API")
            .after(a)
            .after_all([a])
            .priority(8)
            .optional();
        assert_eq!(spec.prerequisites, vec![a]);
        assert_eq!(spec.priority, 8);
        assert!(!spec.required);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskStatus::Completed.is_terminal());
        assert!(TaskStatus::Failed.is_terminal());
        assert!(!TaskStatus::Ready.is_terminal());
        assert_eq!(TaskStatus::InProgress.to_string(), "in_progress");
    }
}
