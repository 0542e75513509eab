//! Agent roles and the per-role prompt/validation behaviour.
//!
//! Each role is a variant of [`Role`]; the small interface every variant
//! implements is [`Role::build_prompt`] and [`Role::validate`]. The wording of
//! the prompts is deliberately plain: what matters to the engine is the shape
//! of the output (a JSON plan from the manager, fenced files from developers).

use serde::{Deserialize, Serialize};

use crate::extract;
use crate::plan;
use crate::task::TaskKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Manager,
    Frontend,
    Backend,
    Devops,
    Worker,
}

/// Which generation settings a role uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsClass {
    Manager,
    Worker,
    Specialist,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Role::Manager,
        Role::Frontend,
        Role::Backend,
        Role::Devops,
        Role::Worker,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Role::Manager => "manager",
            Role::Frontend => "frontend",
            Role::Backend => "backend",
            Role::Devops => "devops",
            Role::Worker => "worker",
        }
    }

    /// Parse a role name, accepting the loose spellings planners tend to use.
    pub fn parse(value: &str) -> Option<Self> {
        let v = value.trim().to_ascii_lowercase().replace(['_', '-'], " ");
        match v.as_str() {
            "manager" | "lead" | "architect" | "tech lead" | "project manager" => {
                Some(Role::Manager)
            }
            "frontend" | "front end" | "frontend developer" | "ui" => Some(Role::Frontend),
            "backend" | "back end" | "backend developer" | "api" => Some(Role::Backend),
            "devops" | "dev ops" | "ops" | "infrastructure" | "devops engineer" => {
                Some(Role::Devops)
            }
            "worker" | "developer" | "full stack developer" | "fullstack" | "full stack" => {
                Some(Role::Worker)
            }
            _ => None,
        }
    }

    /// Whether an agent holding `self` may take a task assigned to `task_role`.
    ///
    /// Generalist workers cover every implementation role; everyone else only
    /// covers their own.
    pub fn serves(self, task_role: Role) -> bool {
        match self {
            Role::Worker => task_role != Role::Manager,
            other => other == task_role,
        }
    }

    pub fn settings_class(self) -> SettingsClass {
        match self {
            Role::Manager => SettingsClass::Manager,
            Role::Worker => SettingsClass::Worker,
            Role::Frontend | Role::Backend | Role::Devops => SettingsClass::Specialist,
        }
    }

    fn specialty(self) -> &'static str {
        match self {
            Role::Manager => "system architecture, task breakdown, and code review",
            Role::Frontend => "user interfaces, client-side state, and styling",
            Role::Backend => "APIs, data models, persistence, and business logic",
            Role::Devops => "containers, CI pipelines, deployment, and configuration",
            Role::Worker => "full stack development across frontend, backend, and devops",
        }
    }

    pub fn system_prompt(self, agent_name: &str, skills: &[String]) -> String {
        let mut prompt = format!(
            "You are {agent_name}, a senior {} on a small software team. Your specialty: {}.",
            self.as_str(),
            self.specialty()
        );
        if !skills.is_empty() {
            prompt.push_str(&format!("\nSkills: {}.", skills.join(", ")));
        }
        match self {
            Role::Manager => prompt.push_str(PLANNER_RULES),
            _ => prompt.push_str(DEVELOPER_RULES),
        }
        prompt
    }

    pub fn build_prompt(self, ctx: &PromptContext<'_>) -> Prompt {
        let mut parts = Vec::new();
        parts.push(format!("# Project\n{}\n", ctx.project_description));

        match ctx.kind {
            TaskKind::Planning => {
                parts.push(format!("# Your task\n{}\n", ctx.task_description));
                if !ctx.team.is_empty() {
                    let team = ctx
                        .team
                        .iter()
                        .map(|(name, role)| format!("- {name} ({role})"))
                        .collect::<Vec<_>>()
                        .join("\n");
                    parts.push(format!("# Team\n{team}\n"));
                }
                parts.push(PLAN_FORMAT.to_string());
            }
            TaskKind::Implementation => {
                parts.push(format!("# Your task\n{}\n", ctx.task_description));
                if !ctx.files_expected.is_empty() {
                    parts.push(format!(
                        "# Files to create\n{}\n",
                        ctx.files_expected
                            .iter()
                            .map(|f| format!("- {f}"))
                            .collect::<Vec<_>>()
                            .join("\n")
                    ));
                }
                push_prior_outputs(&mut parts, ctx.prior_outputs);
                parts.push(FILE_FORMAT.to_string());
            }
            TaskKind::Review => {
                parts.push(format!("# Review\n{}\n", ctx.task_description));
                push_prior_outputs(&mut parts, ctx.prior_outputs);
                parts.push(
                    "Summarise what was delivered, list any gaps, and include corrected files \
                     using the same fenced format if something is missing."
                        .to_string(),
                );
            }
        }

        Prompt {
            system: self.system_prompt(ctx.agent_name, ctx.skills),
            user: parts.join("\n"),
        }
    }

    /// Check the shape of an output before it is accepted.
    pub fn validate(self, kind: TaskKind, output: &str) -> Result<(), String> {
        if output.trim().is_empty() {
            return Err("empty output".to_string());
        }
        match kind {
            TaskKind::Planning => match plan::parse_plan(output) {
                Some(p) if !p.entries.is_empty() => Ok(()),
                _ => Err("no task plan found in planner output".to_string()),
            },
            TaskKind::Implementation if self != Role::Manager => {
                if extract::extract_files(output).is_empty() {
                    Err("no files found in output".to_string())
                } else {
                    Ok(())
                }
            }
            TaskKind::Implementation | TaskKind::Review => Ok(()),
        }
    }
}

fn push_prior_outputs(parts: &mut Vec<String>, prior: &[PriorOutput]) {
    if prior.is_empty() {
        return;
    }
    parts.push("# Completed prerequisite work\n".to_string());
    for p in prior {
        let files = if p.files.is_empty() {
            "(no files)".to_string()
        } else {
            p.files.join(", ")
        };
        parts.push(format!("- {}: {}\n", p.description, files));
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::parse(s).ok_or_else(|| format!("unknown role: {s}"))
    }
}

/// A system prompt plus the user turn sent to the provider.
#[derive(Debug, Clone, PartialEq)]
pub struct Prompt {
    pub system: String,
    pub user: String,
}

/// Summary of a finished prerequisite, fed into dependent prompts.
#[derive(Debug, Clone)]
pub struct PriorOutput {
    pub description: String,
    pub files: Vec<String>,
}

/// Everything a role needs to build a prompt for one task.
#[derive(Debug, Clone)]
pub struct PromptContext<'a> {
    pub agent_name: &'a str,
    pub skills: &'a [String],
    pub kind: TaskKind,
    pub task_description: &'a str,
    pub project_description: &'a str,
    pub files_expected: &'a [String],
    pub prior_outputs: &'a [PriorOutput],
    /// (name, role) of every agent; used by planners.
    pub team: &'a [(String, Role)],
}

const PLANNER_RULES: &str = "\nBreak work into small tasks with clear owners and dependencies. \
Prefer few, well-scoped tasks. Never write implementation code yourself.";

const DEVELOPER_RULES: &str = "\nWrite complete, working code. No stubs or placeholders. \
Handle errors and keep files focused.";

const PLAN_FORMAT: &str = r#"Respond with a JSON task plan in a ```json fence:
```json
{
  "tasks": [
    {"id": "api", "role": "backend", "description": "...", "priority": 1-10,
     "dependencies": [], "files_expected": ["app.py"]}
  ]
}
```"#;

const FILE_FORMAT: &str =
    "Emit every file as a fenced block whose header names it, e.g. ```filename: src/app.py";
