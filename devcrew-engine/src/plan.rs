//! Parsing the manager's task plan and expanding it into task specs.
//!
//! Planner output is messy: the JSON may sit in a fence, have trailing commas,
//! name agents instead of roles, or reference tasks that do not exist. Parsing
//! is lenient and drops what it cannot use; expansion orders what is left so
//! every prerequisite is enqueued before its dependents.

use std::collections::{HashMap, HashSet};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::Value;

use crate::ids::TaskId;
use crate::role::Role;
use crate::task::{TaskKind, TaskSpec};

const MIN_DESCRIPTION_LEN: usize = 10;
const DEFAULT_PRIORITY: i32 = 5;

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",\s*([}\]])").expect("valid regex"));

static DEV_ALIAS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?i)(?:developer|dev|worker)\s*(\d+)$").expect("valid regex")
});

/// One task proposed by the planner.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanEntry {
    /// Key other entries use in `dependencies`.
    pub key: String,
    pub role: Option<Role>,
    /// Agent name when the planner addressed a person rather than a role.
    pub agent: Option<String>,
    pub description: String,
    pub priority: i32,
    pub dependencies: Vec<String>,
    pub files_expected: Vec<String>,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Plan {
    pub entries: Vec<PlanEntry>,
}

/// Extract a JSON object from planner output. Tries a ```json fence first,
/// then a raw object, then the outermost braces.
pub fn extract_json_block(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let content_start = start + "```json".len();
        if let Some(end) = trimmed[content_start..].find("```") {
            let block = trimmed[content_start..content_start + end].trim();
            if !block.is_empty() {
                return Some(block);
            }
        }
    }
    if trimmed.starts_with('{') {
        return Some(trimmed);
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

/// Parse a task plan. Returns `None` when no usable JSON is present.
pub fn parse_plan(text: &str) -> Option<Plan> {
    let block = extract_json_block(text)?;
    let value: Value = serde_json::from_str(block)
        .or_else(|_| serde_json::from_str(&TRAILING_COMMA.replace_all(block, "$1")))
        .ok()?;

    let tasks = match &value {
        Value::Object(map) => map.get("tasks")?.as_array()?,
        Value::Array(items) => items,
        _ => return None,
    };

    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    for (index, item) in tasks.iter().enumerate() {
        let Some(entry) = parse_entry(index, item) else {
            tracing::warn!(index, "Dropping unusable plan entry");
            continue;
        };
        if !seen.insert(entry.key.clone()) {
            tracing::warn!(key = %entry.key, "Dropping duplicate plan entry");
            continue;
        }
        entries.push(entry);
    }
    Some(Plan { entries })
}

fn parse_entry(index: usize, item: &Value) -> Option<PlanEntry> {
    let obj = item.as_object()?;

    let description = normalize_whitespace(obj.get("description")?.as_str()?);
    if description.len() < MIN_DESCRIPTION_LEN {
        return None;
    }

    let role = obj.get("role").and_then(Value::as_str).and_then(Role::parse);
    let agent = obj
        .get("agent")
        .and_then(Value::as_str)
        .map(normalize_agent_name)
        .filter(|a| !a.is_empty());
    if role.is_none() && agent.is_none() {
        return None;
    }

    let key = ["id", "name", "key"]
        .iter()
        .find_map(|k| obj.get(*k).and_then(value_as_key))
        .unwrap_or_else(|| format!("task-{}", index + 1));

    let priority = obj
        .get("priority")
        .and_then(|p| p.as_i64().or_else(|| p.as_str()?.trim().parse().ok()))
        .map(|p| p.clamp(1, 10) as i32)
        .unwrap_or(DEFAULT_PRIORITY);

    let dependencies = string_list(obj.get("dependencies").or_else(|| obj.get("depends_on")));
    let files_expected = string_list(obj.get("files_expected").or_else(|| obj.get("files")));
    let required = obj.get("required").and_then(Value::as_bool).unwrap_or(true);

    Some(PlanEntry {
        key,
        role,
        agent,
        description,
        priority,
        dependencies,
        files_expected,
        required,
    })
}

fn value_as_key(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn string_list(v: Option<&Value>) -> Vec<String> {
    v.and_then(Value::as_array)
        .map(|items| items.iter().filter_map(value_as_key).collect())
        .unwrap_or_default()
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Map the aliases planners use (`dev1`, `worker 2`) onto roster names.
pub fn normalize_agent_name(name: &str) -> String {
    let name = normalize_whitespace(name);
    match DEV_ALIAS.captures(&name) {
        Some(cap) => format!("Developer{}", &cap[1]),
        None => name,
    }
}

/// Result of expanding a plan into specs.
#[derive(Debug, Clone, Default)]
pub struct Expansion {
    /// Specs in enqueue order; prerequisites always precede dependents.
    pub specs: Vec<TaskSpec>,
    /// Keys of entries that could not be scheduled.
    pub dropped: Vec<String>,
}

/// Turn a parsed plan into specs hanging off `planning_task`.
///
/// `resolve_agent` maps an agent name onto that agent's role. Entries whose
/// role cannot be determined, or that sit on a dependency cycle, are dropped
/// along with anything that depends on them.
pub fn expand(
    plan: &Plan,
    planning_task: TaskId,
    resolve_agent: impl Fn(&str) -> Option<Role>,
    with_review: bool,
) -> Expansion {
    let mut dropped = Vec::new();

    let mut resolved: Vec<(&PlanEntry, Role)> = Vec::new();
    for entry in &plan.entries {
        let role = entry
            .role
            .or_else(|| entry.agent.as_deref().and_then(&resolve_agent))
            .or_else(|| entry.agent.as_deref().and_then(Role::parse));
        match role {
            Some(role) => resolved.push((entry, role)),
            None => {
                tracing::warn!(key = %entry.key, agent = ?entry.agent, "No role for plan entry");
                dropped.push(entry.key.clone());
            }
        }
    }

    let known: HashSet<&str> = resolved.iter().map(|(e, _)| e.key.as_str()).collect();
    let implementation_keys: Vec<&str> = resolved
        .iter()
        .filter(|(e, role)| e.required && !matches!(role, Role::Devops | Role::Manager))
        .map(|(e, _)| e.key.as_str())
        .collect();

    // key -> deps, restricted to entries that survived role resolution.
    let mut deps: HashMap<&str, Vec<&str>> = HashMap::new();
    for (entry, role) in &resolved {
        let mut list: Vec<&str> = entry
            .dependencies
            .iter()
            .map(String::as_str)
            .filter(|d| *d != entry.key && known.contains(d))
            .collect();
        if list.is_empty() && *role == Role::Devops {
            list = implementation_keys.clone();
        }
        deps.insert(entry.key.as_str(), list);
    }

    // Kahn's algorithm, preserving plan order among ready entries.
    let ids: HashMap<&str, TaskId> = resolved
        .iter()
        .map(|(e, _)| (e.key.as_str(), TaskId::new()))
        .collect();
    let mut placed: HashSet<&str> = HashSet::new();
    let mut specs = Vec::new();
    loop {
        let mut progressed = false;
        for (entry, role) in &resolved {
            let key = entry.key.as_str();
            if placed.contains(key) {
                continue;
            }
            let entry_deps = &deps[key];
            if !entry_deps.iter().all(|d| placed.contains(d)) {
                continue;
            }
            let mut spec = entry.files_expected.iter().fold(
                TaskSpec::new(*role, entry.description.clone())
                    .priority(entry.priority)
                    .after(planning_task)
                    .after_all(entry_deps.iter().map(|d| ids[d])),
                |spec, path| spec.expect_file(path.clone()),
            );
            spec.id = ids[key];
            spec.required = entry.required;
            if *role == Role::Manager {
                spec.kind = TaskKind::Review;
            }
            specs.push(spec);
            placed.insert(key);
            progressed = true;
        }
        if !progressed {
            break;
        }
    }

    for (entry, _) in &resolved {
        if !placed.contains(entry.key.as_str()) {
            tracing::warn!(key = %entry.key, "Plan entry is on or behind a dependency cycle");
            dropped.push(entry.key.clone());
        }
    }

    // Best-effort entries stay off the review's path so their failure
    // cannot cascade into it.
    if with_review && !specs.is_empty() {
        let required: Vec<TaskId> = specs.iter().filter(|s| s.required).map(|s| s.id).collect();
        specs.push(
            TaskSpec::new(
                Role::Manager,
                "Final review: check that the delivered files cover the project and fit together.",
            )
            .kind(TaskKind::Review)
            .priority(1)
            .after(planning_task)
            .after_all(required),
        );
    }

    Expansion { specs, dropped }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"Here is the plan.
```json
{
  "tasks": [
    {"id": "api", "role": "backend", "description": "Build the notes REST API", "priority": 8,
     "files_expected": ["app.py"]},
    {"id": "ui", "agent": "dev2", "description": "Build the notes web UI", "dependencies": ["api"]},
    {"id": "deploy", "role": "devops", "description": "Write Dockerfile and compose file"},
  ]
}
```
TASK COMPLETED"#;

    #[test]
    fn parses_fenced_plan_with_trailing_comma() {
        let plan = parse_plan(PLAN).unwrap();
        assert_eq!(plan.entries.len(), 3);
        assert_eq!(plan.entries[0].role, Some(Role::Backend));
        assert_eq!(plan.entries[0].priority, 8);
        assert_eq!(plan.entries[1].agent.as_deref(), Some("Developer2"));
        assert_eq!(plan.entries[1].dependencies, vec!["api"]);
        assert_eq!(plan.entries[2].priority, DEFAULT_PRIORITY);
    }

    #[test]
    fn drops_short_descriptions_and_clamps_priority() {
        let text = r#"{"tasks": [
            {"role": "backend", "description": "tiny"},
            {"role": "frontend", "description": "Build the landing page", "priority": 42}
        ]}"#;
        let plan = parse_plan(text).unwrap();
        assert_eq!(plan.entries.len(), 1);
        assert_eq!(plan.entries[0].priority, 10);
        assert_eq!(plan.entries[0].key, "task-2");
    }

    #[test]
    fn no_json_means_no_plan() {
        assert!(parse_plan("I think we should use React.").is_none());
    }

    #[test]
    fn agent_aliases_normalize() {
        assert_eq!(normalize_agent_name("dev1"), "Developer1");
        assert_eq!(normalize_agent_name("Worker 3"), "Developer3");
        assert_eq!(normalize_agent_name("BackendDev"), "BackendDev");
    }

    #[test]
    fn expansion_orders_dependencies_and_adds_review() {
        let plan = parse_plan(PLAN).unwrap();
        let planning = TaskId::new();
        let exp = expand(&plan, planning, |name| (name == "Developer2").then_some(Role::Worker), true);

        assert!(exp.dropped.is_empty());
        assert_eq!(exp.specs.len(), 4);
        let api = &exp.specs[0];
        let ui = &exp.specs[1];
        let deploy = &exp.specs[2];
        let review = &exp.specs[3];

        assert_eq!(api.role, Role::Backend);
        assert!(api.prerequisites.contains(&planning));
        assert_eq!(ui.role, Role::Worker);
        assert!(ui.prerequisites.contains(&api.id));
        // devops without explicit deps waits for all implementation work
        assert!(deploy.prerequisites.contains(&api.id));
        assert!(deploy.prerequisites.contains(&ui.id));
        assert_eq!(review.kind, TaskKind::Review);
        assert_eq!(review.prerequisites.len(), 4);
        assert!(review.prerequisites.contains(&planning));
    }

    #[test]
    fn optional_entries_stay_off_the_review_and_devops_paths() {
        let text = r#"{"tasks": [
            {"id": "api", "role": "backend", "description": "Build the notes REST API"},
            {"id": "docs", "role": "backend", "description": "Write API reference docs", "required": false},
            {"id": "deploy", "role": "devops", "description": "Write Dockerfile and compose file"}
        ]}"#;
        let plan = parse_plan(text).unwrap();
        let planning = TaskId::new();
        let exp = expand(&plan, planning, |_| None, true);

        assert_eq!(exp.specs.len(), 4);
        let api = exp.specs[0].id;
        let docs = &exp.specs[1];
        let deploy = &exp.specs[2];
        let review = &exp.specs[3];
        assert!(!docs.required);
        assert!(deploy.prerequisites.contains(&api));
        assert!(!deploy.prerequisites.contains(&docs.id));
        assert!(review.required);
        assert!(!review.prerequisites.contains(&docs.id));
        assert!(review.prerequisites.contains(&api));
        assert!(review.prerequisites.contains(&deploy.id));
    }

    #[test]
    fn expansion_drops_cycles_and_their_dependents() {
        let text = r#"{"tasks": [
            {"id": "a", "role": "backend", "description": "Task A does things", "dependencies": ["b"]},
            {"id": "b", "role": "backend", "description": "Task B does things", "dependencies": ["a"]},
            {"id": "c", "role": "frontend", "description": "Task C does things", "dependencies": ["a"]},
            {"id": "d", "role": "frontend", "description": "Task D does things"}
        ]}"#;
        let plan = parse_plan(text).unwrap();
        let exp = expand(&plan, TaskId::new(), |_| None, false);
        assert_eq!(exp.specs.len(), 1);
        assert_eq!(exp.specs[0].description, "Task D does things");
        let mut dropped = exp.dropped.clone();
        dropped.sort();
        assert_eq!(dropped, vec!["a", "b", "c"]);
    }

    #[test]
    fn unknown_agent_is_dropped() {
        let text = r#"{"tasks": [{"agent": "Zed", "description": "Do something useful"}]}"#;
        let plan = parse_plan(text).unwrap();
        let exp = expand(&plan, TaskId::new(), |_| None, true);
        assert!(exp.specs.is_empty());
        assert_eq!(exp.dropped, vec!["task-1"]);
    }
}
