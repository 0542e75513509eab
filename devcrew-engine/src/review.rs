//! Pluggable review and scoring policies.

use crate::agent::Ledger;
use crate::task::Task;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReviewVerdict {
    Approve,
    /// Reject the output. The task fails without retry.
    Reject(String),
}

/// Decides whether a validated output is accepted.
pub trait ReviewPolicy: Send + Sync + 'static {
    fn review(&self, task: &Task, output: &str) -> ReviewVerdict;
}

/// Accepts anything that passed the role's validation rule.
#[derive(Debug, Clone, Copy, Default)]
pub struct AutoApprove;

impl ReviewPolicy for AutoApprove {
    fn review(&self, _task: &Task, _output: &str) -> ReviewVerdict {
        ReviewVerdict::Approve
    }
}

/// How a finished attempt is scored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Approved,
    Rejected,
    Failed,
}

/// Updates an agent's ledger scores after an attempt. Counters
/// (`tasks_completed`, `tasks_failed`) are maintained by the orchestrator.
pub trait ScoringPolicy: Send + Sync + 'static {
    fn score(&self, ledger: &mut Ledger, outcome: Outcome, reviewed: bool);
}

/// Moves quality toward 100 on approval and down on rejection or failure;
/// each reviewed hand-off raises collaboration.
#[derive(Debug, Clone, Copy)]
pub struct DefaultScoring {
    pub step: f64,
}

impl Default for DefaultScoring {
    fn default() -> Self {
        Self { step: 0.1 }
    }
}

impl ScoringPolicy for DefaultScoring {
    fn score(&self, ledger: &mut Ledger, outcome: Outcome, reviewed: bool) {
        ledger.quality_score = match outcome {
            Outcome::Approved => ledger.quality_score + (100.0 - ledger.quality_score) * self.step,
            Outcome::Rejected => ledger.quality_score * (1.0 - self.step),
            Outcome::Failed => ledger.quality_score * (1.0 - self.step / 2.0),
        }
        .clamp(0.0, 100.0);
        if reviewed {
            ledger.collaboration_score = (ledger.collaboration_score + 5.0).min(100.0);
        }
    }
}
