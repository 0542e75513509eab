//! Agents, their status machine, and the registry the scheduler claims from.
//!
//! The registry holds one lock per agent. Claiming an idle agent is a
//! check-and-set under that agent's lock, so two scheduler passes can never
//! hand the same agent two tasks.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

use crate::ids::{AgentId, TaskId};
use crate::role::Role;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    /// Sub-state of working: a manager reading someone else's output.
    Reviewing,
    Completed,
    Error,
}

impl AgentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Reviewing => "reviewing",
            AgentStatus::Completed => "completed",
            AgentStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Allowed agent status transitions.
pub fn can_transition(from: AgentStatus, to: AgentStatus) -> bool {
    if from == to {
        return true;
    }
    match from {
        AgentStatus::Idle => matches!(
            to,
            AgentStatus::Working | AgentStatus::Reviewing | AgentStatus::Completed
        ),
        AgentStatus::Working => matches!(
            to,
            AgentStatus::Reviewing | AgentStatus::Idle | AgentStatus::Error
        ),
        AgentStatus::Reviewing => matches!(
            to,
            AgentStatus::Working | AgentStatus::Idle | AgentStatus::Error
        ),
        AgentStatus::Error => matches!(to, AgentStatus::Idle | AgentStatus::Completed),
        AgentStatus::Completed => matches!(to, AgentStatus::Idle),
    }
}

/// Running performance record for one agent.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ledger {
    pub tasks_completed: u32,
    pub tasks_failed: u32,
    pub quality_score: f64,
    pub collaboration_score: f64,
    pub avg_completion_secs: f64,
    pub last_activity: DateTime<Utc>,
}

impl Default for Ledger {
    fn default() -> Self {
        Self {
            tasks_completed: 0,
            tasks_failed: 0,
            quality_score: 85.0,
            collaboration_score: 50.0,
            avg_completion_secs: 0.0,
            last_activity: Utc::now(),
        }
    }
}

impl Ledger {
    pub fn success_rate(&self) -> f64 {
        let total = self.tasks_completed + self.tasks_failed;
        if total == 0 {
            1.0
        } else {
            self.tasks_completed as f64 / total as f64
        }
    }

    pub(crate) fn record_completion(&mut self, elapsed_secs: f64) {
        let n = self.tasks_completed as f64;
        self.avg_completion_secs = (self.avg_completion_secs * n + elapsed_secs) / (n + 1.0);
        self.tasks_completed += 1;
        self.last_activity = Utc::now();
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub role: Role,
    pub skills: Vec<String>,
    pub status: AgentStatus,
    pub is_active: bool,
    /// Back-reference to the managing agent. The only hierarchy edge stored.
    pub manager: Option<AgentId>,
    pub current_task: Option<TaskId>,
    pub ledger: Ledger,
    /// Most recent generated artifact text.
    pub work_output: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) error_since: Option<Instant>,
}

impl Agent {
    pub fn new(name: impl Into<String>, role: Role) -> Self {
        Self {
            id: AgentId::new(),
            name: name.into(),
            role,
            skills: Vec::new(),
            status: AgentStatus::Idle,
            is_active: true,
            manager: None,
            current_task: None,
            ledger: Ledger::default(),
            work_output: String::new(),
            created_at: Utc::now(),
            error_since: None,
        }
    }

    pub fn with_skills<I, S>(mut self, skills: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn reporting_to(mut self, manager: AgentId) -> Self {
        self.manager = Some(manager);
        self
    }

    /// Whether this agent can be handed a task for `role` right now.
    pub fn is_available_for(&self, role: Role) -> bool {
        self.is_active && self.status == AgentStatus::Idle && self.role.serves(role)
    }

    fn set_status(&mut self, to: AgentStatus) -> bool {
        if !can_transition(self.status, to) {
            tracing::warn!(agent = %self.name, from = %self.status, to = %to, "Refusing agent transition");
            return false;
        }
        self.status = to;
        self.ledger.last_activity = Utc::now();
        self.error_since = (to == AgentStatus::Error).then(Instant::now);
        true
    }
}

/// Read-only view of an agent with its derived subordinates.
#[derive(Debug, Clone, Serialize)]
pub struct AgentView {
    #[serde(flatten)]
    pub agent: Agent,
    pub subordinates: Vec<AgentId>,
}

/// The set of agents for a process run. Agents are fixed at construction;
/// their mutable fields live behind one lock each.
pub struct AgentRegistry {
    order: Vec<AgentId>,
    agents: HashMap<AgentId, Mutex<Agent>>,
}

impl AgentRegistry {
    pub fn new(agents: Vec<Agent>) -> Self {
        let order = agents.iter().map(|a| a.id).collect();
        let agents = agents.into_iter().map(|a| (a.id, Mutex::new(a))).collect();
        Self { order, agents }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn ids(&self) -> &[AgentId] {
        &self.order
    }

    pub fn get(&self, id: AgentId) -> Option<Agent> {
        self.agents.get(&id).map(|a| a.lock().clone())
    }

    pub fn snapshot(&self) -> Vec<Agent> {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id))
            .map(|a| a.lock().clone())
            .collect()
    }

    /// Agents with their subordinate lists derived from manager links.
    pub fn views(&self) -> Vec<AgentView> {
        let agents = self.snapshot();
        agents
            .iter()
            .map(|agent| AgentView {
                agent: agent.clone(),
                subordinates: subordinates_of(&agents, agent.id),
            })
            .collect()
    }

    pub fn subordinates(&self, manager: AgentId) -> Vec<AgentId> {
        subordinates_of(&self.snapshot(), manager)
    }

    pub fn find_by_name(&self, name: &str) -> Option<Agent> {
        self.snapshot()
            .into_iter()
            .find(|a| a.name.eq_ignore_ascii_case(name.trim()))
    }

    pub fn can_serve(&self, role: Role) -> bool {
        self.snapshot().iter().any(|a| a.is_active && a.role.serves(role))
    }

    /// Whether some idle, active agent could take a task for `role`.
    pub fn has_idle_for(&self, role: Role) -> bool {
        self.order
            .iter()
            .filter_map(|id| self.agents.get(id))
            .any(|a| a.lock().is_available_for(role))
    }

    /// Claim an idle agent for `task`. Agents whose role matches exactly are
    /// preferred over generalists.
    pub fn claim_idle(&self, role: Role, task: TaskId, reviewing: bool) -> Option<AgentId> {
        let mut candidates: Vec<&AgentId> = self.order.iter().collect();
        candidates.sort_by_key(|id| {
            self.agents
                .get(*id)
                .map(|a| a.lock().role != role)
                .unwrap_or(true)
        });
        for id in candidates {
            let Some(slot) = self.agents.get(id) else {
                continue;
            };
            let mut agent = slot.lock();
            if !agent.is_available_for(role) {
                continue;
            }
            let to = if reviewing {
                AgentStatus::Reviewing
            } else {
                AgentStatus::Working
            };
            if agent.set_status(to) {
                agent.current_task = Some(task);
                return Some(agent.id);
            }
        }
        None
    }

    /// Apply `f` to one agent under its lock.
    pub(crate) fn update<R>(&self, id: AgentId, f: impl FnOnce(&mut Agent) -> R) -> Option<R> {
        self.agents.get(&id).map(|a| f(&mut a.lock()))
    }

    /// Return an agent to idle after a dispatch, clearing its task.
    pub(crate) fn release(&self, id: AgentId) -> Option<AgentStatus> {
        self.update(id, |a| {
            a.current_task = None;
            a.set_status(AgentStatus::Idle);
            a.status
        })
    }

    pub(crate) fn mark_error(&self, id: AgentId) -> Option<AgentStatus> {
        self.update(id, |a| {
            a.current_task = None;
            a.set_status(AgentStatus::Error);
            a.status
        })
    }

    /// Move agents that have sat in `error` for at least `cooldown` back to
    /// idle. Returns the ids that recovered.
    pub(crate) fn recover(&self, cooldown: std::time::Duration) -> Vec<AgentId> {
        let now = Instant::now();
        let mut recovered = Vec::new();
        for id in &self.order {
            let Some(slot) = self.agents.get(id) else {
                continue;
            };
            let mut agent = slot.lock();
            let due = agent
                .error_since
                .is_some_and(|since| now.duration_since(since) >= cooldown);
            if agent.status == AgentStatus::Error && due && agent.set_status(AgentStatus::Idle) {
                recovered.push(agent.id);
            }
        }
        recovered
    }

    /// Put every agent into `status`, clearing in-flight work. Used at
    /// project start (idle) and at project end (completed).
    pub(crate) fn reset_all(&self, status: AgentStatus, clear_output: bool) {
        for slot in self.agents.values() {
            let mut agent = slot.lock();
            agent.current_task = None;
            agent.status = status;
            agent.error_since = None;
            agent.ledger.last_activity = Utc::now();
            if clear_output {
                agent.work_output.clear();
            }
        }
    }

    pub fn set_active(&self, id: AgentId, active: bool) -> bool {
        self.update(id, |a| a.is_active = active).is_some()
    }
}

fn subordinates_of(agents: &[Agent], manager: AgentId) -> Vec<AgentId> {
    agents
        .iter()
        .filter(|a| a.manager == Some(manager))
        .map(|a| a.id)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn team() -> (AgentRegistry, AgentId, AgentId, AgentId) {
        let lead = Agent::new("Lead", Role::Manager);
        let lead_id = lead.id;
        let fe = Agent::new("Fe", Role::Frontend).reporting_to(lead_id);
        let fe_id = fe.id;
        let dev = Agent::new("Dev", Role::Worker).reporting_to(lead_id);
        let dev_id = dev.id;
        (AgentRegistry::new(vec![lead, fe, dev]), lead_id, fe_id, dev_id)
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        assert!(can_transition(AgentStatus::Idle, AgentStatus::Working));
        assert!(can_transition(AgentStatus::Working, AgentStatus::Reviewing));
        assert!(can_transition(AgentStatus::Working, AgentStatus::Error));
        assert!(can_transition(AgentStatus::Error, AgentStatus::Idle));
        assert!(!can_transition(AgentStatus::Idle, AgentStatus::Error));
        assert!(!can_transition(AgentStatus::Completed, AgentStatus::Working));
    }

    #[test]
    fn subordinates_are_derived_from_back_references() {
        let (reg, lead, fe, dev) = team();
        let mut subs = reg.subordinates(lead);
        subs.sort();
        let mut expected = vec![fe, dev];
        expected.sort();
        assert_eq!(subs, expected);
        assert!(reg.subordinates(fe).is_empty());
    }

    #[test]
    fn claim_prefers_exact_role_and_never_double_claims() {
        let (reg, _, fe, dev) = team();
        let t1 = TaskId::new();
        let t2 = TaskId::new();
        let t3 = TaskId::new();

        assert_eq!(reg.claim_idle(Role::Frontend, t1, false), Some(fe));
        // Frontend specialist is busy; the generalist picks up the next one.
        assert_eq!(reg.claim_idle(Role::Frontend, t2, false), Some(dev));
        assert_eq!(reg.claim_idle(Role::Frontend, t3, false), None);

        assert_eq!(reg.get(fe).unwrap().current_task, Some(t1));
        reg.release(fe);
        assert_eq!(reg.get(fe).unwrap().status, AgentStatus::Idle);
        assert!(reg.has_idle_for(Role::Frontend));
    }

    #[test]
    fn inactive_agents_are_not_claimed() {
        let (reg, lead, _, _) = team();
        reg.set_active(lead, false);
        assert_eq!(reg.claim_idle(Role::Manager, TaskId::new(), false), None);
    }

    #[test]
    fn reviewing_claim_marks_manager_reviewing() {
        let (reg, lead, _, _) = team();
        assert_eq!(reg.claim_idle(Role::Manager, TaskId::new(), true), Some(lead));
        assert_eq!(reg.get(lead).unwrap().status, AgentStatus::Reviewing);
    }

    #[tokio::test(start_paused = true)]
    async fn error_agents_recover_after_cooldown() {
        let (reg, _, fe, _) = team();
        reg.claim_idle(Role::Frontend, TaskId::new(), false);
        reg.mark_error(fe);
        assert!(reg.recover(Duration::from_secs(1)).is_empty());

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(reg.recover(Duration::from_secs(1)), vec![fe]);
        assert_eq!(reg.get(fe).unwrap().status, AgentStatus::Idle);
    }

    #[test]
    fn ledger_tracks_average_completion() {
        let mut ledger = Ledger::default();
        ledger.record_completion(2.0);
        ledger.record_completion(4.0);
        assert_eq!(ledger.tasks_completed, 2);
        assert!((ledger.avg_completion_secs - 3.0).abs() < f64::EPSILON);
        assert_eq!(ledger.success_rate(), 1.0);
    }
}
