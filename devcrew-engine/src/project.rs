//! Project state: status, message log, and file manifest.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::ids::{ProjectId, TaskId};
use crate::role::Role;
use crate::task::{TaskKind, TaskSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    NotStarted,
    Running,
    Paused,
    Completed,
    Failed,
    Stopped,
}

impl ProjectStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ProjectStatus::NotStarted => "not_started",
            ProjectStatus::Running => "running",
            ProjectStatus::Paused => "paused",
            ProjectStatus::Completed => "completed",
            ProjectStatus::Failed => "failed",
            ProjectStatus::Stopped => "stopped",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ProjectStatus::Completed | ProjectStatus::Failed | ProjectStatus::Stopped
        )
    }

    pub fn is_active(self) -> bool {
        matches!(self, ProjectStatus::Running | ProjectStatus::Paused)
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    TaskAssignment,
    TaskCompletion,
    TaskFailure,
    Review,
    Status,
}

/// One entry in the project's append-only message log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub from: String,
    pub to: String,
    pub kind: MessageKind,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            kind,
            content: content.into(),
            timestamp: Utc::now(),
        }
    }
}

/// A generated file in the manifest.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProjectFile {
    pub content: String,
    pub task: TaskId,
    pub author: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Project {
    pub id: ProjectId,
    pub description: String,
    pub status: ProjectStatus,
    pub messages: Vec<Message>,
    pub files: BTreeMap<String, ProjectFile>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            id: ProjectId::new(),
            description: description.into(),
            status: ProjectStatus::NotStarted,
            messages: Vec::new(),
            files: BTreeMap::new(),
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Insert or overwrite a file. Returns true when the path was new.
    pub fn put_file(&mut self, path: String, content: String, task: TaskId, author: &str) -> bool {
        self.files
            .insert(
                path,
                ProjectFile {
                    content,
                    task,
                    author: author.to_string(),
                    updated_at: Utc::now(),
                },
            )
            .is_none()
    }

    pub fn manifest(&self) -> BTreeMap<String, String> {
        self.files
            .iter()
            .map(|(path, f)| (path.clone(), f.content.clone()))
            .collect()
    }
}

/// An explicit task graph supplied in place of the manager's planning step.
#[derive(Debug, Clone, Default)]
pub struct ProjectPlan {
    specs: Vec<TaskSpec>,
}

impl ProjectPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a task; returns its id for use as a prerequisite.
    pub fn add(&mut self, spec: TaskSpec) -> TaskId {
        let id = spec.id;
        self.specs.push(spec);
        id
    }

    pub fn task(&mut self, role: Role, description: impl Into<String>) -> TaskId {
        self.add(TaskSpec::new(role, description))
    }

    pub fn specs(&self) -> &[TaskSpec] {
        &self.specs
    }

    pub fn roles(&self) -> impl Iterator<Item = Role> + '_ {
        self.specs.iter().map(|s| s.role)
    }

    pub fn into_specs(self) -> Vec<TaskSpec> {
        self.specs
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

/// The single manager task that opens a planned project.
pub(crate) fn planning_spec(description: &str) -> TaskSpec {
    TaskSpec::new(
        Role::Manager,
        format!("Break the project into tasks for the team: {description}"),
    )
    .kind(TaskKind::Planning)
    .priority(10)
}
