//! Preset teams.

use std::collections::{HashMap, HashSet};

use crate::agent::Agent;
use crate::error::{EngineError, HierarchyProblem, Result};
use crate::ids::AgentId;
use crate::role::Role;

const LEAD_SKILLS: &[&str] = &[
    "Architecture",
    "Project Management",
    "Code Review",
    "Quality Assurance",
    "Integration",
];

const FULL_STACK_SKILLS: &[&str] = &[
    "React",
    "TypeScript",
    "Python",
    "Flask",
    "Node.js",
    "Docker",
    "Database Design",
    "API Development",
    "UI/UX",
    "DevOps",
    "HTML",
    "CSS",
    "JavaScript",
];

/// An ordered team with exactly one manager at the head.
#[derive(Debug, Clone)]
pub struct Roster {
    agents: Vec<Agent>,
}

impl Roster {
    /// ArchitectLead plus one specialist per implementation role.
    pub fn specialists() -> Self {
        let lead = lead();
        let id = lead.id;
        Self {
            agents: vec![
                lead,
                Agent::new("FrontendDev", Role::Frontend)
                    .with_skills(["React", "TypeScript", "HTML", "CSS", "UI/UX"])
                    .reporting_to(id),
                Agent::new("BackendDev", Role::Backend)
                    .with_skills(["Python", "Flask", "Node.js", "Database Design", "API Development"])
                    .reporting_to(id),
                Agent::new("DevOpsEngineer", Role::Devops)
                    .with_skills(["Docker", "CI/CD", "Nginx", "Shell", "Monitoring"])
                    .reporting_to(id),
            ],
        }
    }

    /// ArchitectLead plus `developers` full-stack workers named Developer1..n.
    pub fn generalists(developers: usize) -> Self {
        let lead = lead();
        let id = lead.id;
        let mut agents = vec![lead];
        agents.extend((1..=developers).map(|n| {
            Agent::new(format!("Developer{n}"), Role::Worker)
                .with_skills(FULL_STACK_SKILLS.iter().copied())
                .reporting_to(id)
        }));
        Self { agents }
    }

    /// A custom team. Must contain a manager, and manager links must form a
    /// tree over agents on the roster.
    pub fn custom(agents: Vec<Agent>) -> Result<Self> {
        if !agents.iter().any(|a| a.role == Role::Manager) {
            return Err(EngineError::NoManager);
        }
        check_hierarchy(&agents)?;
        Ok(Self { agents })
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    pub fn agents(&self) -> &[Agent] {
        &self.agents
    }

    /// Check the size ceiling and hand the agents over.
    pub fn into_agents(self, max_agents: usize) -> Result<Vec<Agent>> {
        if self.agents.len() > max_agents {
            return Err(EngineError::RosterTooLarge {
                size: self.agents.len(),
                limit: max_agents,
            });
        }
        Ok(self.agents)
    }
}

fn check_hierarchy(agents: &[Agent]) -> Result<()> {
    let parents: HashMap<AgentId, Option<AgentId>> =
        agents.iter().map(|a| (a.id, a.manager)).collect();
    let invalid = |agent: &Agent, reason| EngineError::InvalidHierarchy {
        agent: agent.name.clone(),
        reason,
    };

    for agent in agents {
        if agent.manager.is_some_and(|m| !parents.contains_key(&m)) {
            return Err(invalid(agent, HierarchyProblem::UnknownManager));
        }
    }
    for agent in agents {
        let mut seen = HashSet::from([agent.id]);
        let mut current = agent.manager;
        while let Some(parent) = current {
            if !seen.insert(parent) {
                return Err(invalid(agent, HierarchyProblem::Cycle));
            }
            current = parents.get(&parent).copied().flatten();
        }
    }
    Ok(())
}

fn lead() -> Agent {
    Agent::new("ArchitectLead", Role::Manager).with_skills(LEAD_SKILLS.iter().copied())
}
