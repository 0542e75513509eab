//! Terminal rendering of engine events.
//!
//! Each event becomes at most one `[who] emoji text` line; long message
//! bodies are wrapped on word boundaries.

use devcrew_engine::project::MessageKind;
use devcrew_engine::{AgentStatus, EngineEvent, MonitorSnapshot, QueueCounts, TaskId};

const WRAP: usize = 160;
const ENGINE: &str = "devcrew";

/// Format one line with an agent prefix.
pub fn status(who: &str, emoji: &str, text: &str) -> String {
    format!("[{who}] {emoji} {text}")
}

/// Render `event`, or `None` for events not worth a line. `describe` looks
/// up a task's description.
pub fn render(event: &EngineEvent, describe: impl Fn(TaskId) -> Option<String>) -> Option<String> {
    let task_name = |id: TaskId| describe(id).unwrap_or_else(|| id.to_string());
    let line = match event {
        EngineEvent::ProjectStatusChanged { status: s, .. } => {
            status(ENGINE, "🚦", &format!("Project {s}"))
        }
        EngineEvent::AgentStatusChanged {
            name,
            status: AgentStatus::Error,
            ..
        } => status(name, "⚠️", "hit an error, cooling down"),
        EngineEvent::AgentStatusChanged { .. } | EngineEvent::TaskStatusChanged { .. } => {
            return None;
        }
        EngineEvent::TaskCompleted { task, agent, files } => {
            let mut text = format!("Done: {}", task_name(*task));
            if !files.is_empty() {
                text.push_str(&format!(" ({})", files.join(", ")));
            }
            status(agent, "✅", &text)
        }
        EngineEvent::TaskRetryScheduled {
            task,
            attempt,
            delay,
            error,
        } => status(
            ENGINE,
            "🔁",
            &format!(
                "Retry {attempt} for {} in {}ms: {error}",
                task_name(*task),
                delay.as_millis()
            ),
        ),
        EngineEvent::TaskFailed { task, error } => {
            status(ENGINE, "❌", &format!("{}: {error}", task_name(*task)))
        }
        EngineEvent::MessageAppended(message) => match message.kind {
            MessageKind::TaskAssignment => status(
                &message.from,
                "📋",
                &format!("→ {}: {}", message.to, first_line(&message.content)),
            ),
            MessageKind::Review => status(
                &message.from,
                "🔍",
                &format!("→ {}: {}", message.to, message.content),
            ),
            MessageKind::Status => status(&message.from, "📣", &message.content),
            _ => return None,
        },
        EngineEvent::FileProduced { path, bytes } => {
            status(ENGINE, "📄", &format!("{path} ({bytes} bytes)"))
        }
    };
    Some(wrap_lines(&line, WRAP).join("\n    "))
}

/// End-of-run summary lines.
pub fn summary(counts: &QueueCounts, snapshot: &MonitorSnapshot, files: usize) -> Vec<String> {
    let health = snapshot.health();
    vec![
        format!(
            "Tasks: {} completed, {} failed, {} unfinished",
            counts.completed,
            counts.failed,
            counts.pending + counts.ready + counts.in_progress
        ),
        format!("Files: {files}"),
        format!(
            "Calls: {} made, {} failed, {} retries, cache hit rate {:.0}%",
            snapshot.calls_made,
            snapshot.calls_failed,
            snapshot.retries,
            snapshot.cache_hit_rate * 100.0
        ),
        format!(
            "Latency: avg {}ms, p95 {}ms",
            snapshot.avg_latency.as_millis(),
            snapshot.p95.as_millis()
        ),
        format!(
            "Health: latency {:?}, success rate {:?}, cache {:?}",
            health.latency, health.success_rate, health.cache_hit_rate
        ),
    ]
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default()
}

/// Wrap text into lines of max_len, breaking on word boundaries.
fn wrap_lines(text: &str, max_len: usize) -> Vec<String> {
    let mut result = Vec::new();
    for line in text.lines() {
        if line.chars().count() <= max_len {
            result.push(line.to_string());
            continue;
        }
        let mut current = String::new();
        for word in line.split_whitespace() {
            if !current.is_empty() && current.chars().count() + word.chars().count() + 1 > max_len {
                result.push(std::mem::take(&mut current));
            }
            if !current.is_empty() {
                current.push(' ');
            }
            current.push_str(word);
        }
        if !current.is_empty() {
            result.push(current);
        }
    }
    result
}
