//! The orchestrator: project lifecycle and the scheduler loop.
//!
//! One scheduler loop per running project pairs ready tasks with idle agents.
//! Each pairing becomes an independent dispatch task (see `dispatch.rs`),
//! bounded by the admission gate. Dispatches report back through the queue's
//! complete/fail operations and wake the loop when they finish.

mod dispatch;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::agent::{AgentRegistry, AgentStatus, AgentView};
use crate::cache::{self, CacheStats, ResponseCache};
use crate::config::{EngineConfig, FailurePolicy};
use crate::error::{EngineError, QueueError, Result};
use crate::events::{EngineEvent, EventBus};
use crate::gate::AdmissionGate;
use crate::ids::{AgentId, ProjectId, TaskId};
use crate::monitor::{MonitorEvent, MonitorSnapshot, PerformanceMonitor};
use crate::project::{self, Message, MessageKind, Project, ProjectPlan, ProjectStatus};
use crate::provider::Provider;
use crate::queue::{QueueCounts, TaskQueue};
use crate::review::{AutoApprove, DefaultScoring, ReviewPolicy, ScoringPolicy};
use crate::role::Role;
use crate::roster::Roster;
use crate::task::{Task, TaskSpec, TaskStatus};

/// Builds an [`Orchestrator`].
pub struct OrchestratorBuilder<P> {
    config: EngineConfig,
    provider: P,
    roster: Roster,
    review: Box<dyn ReviewPolicy>,
    scoring: Box<dyn ScoringPolicy>,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl<P: Provider> OrchestratorBuilder<P> {
    pub fn roster(mut self, roster: Roster) -> Self {
        self.roster = roster;
        self
    }

    pub fn review_policy(mut self, policy: impl ReviewPolicy) -> Self {
        self.review = Box::new(policy);
        self
    }

    pub fn scoring_policy(mut self, policy: impl ScoringPolicy) -> Self {
        self.scoring = Box::new(policy);
        self
    }

    /// Share a monitor across orchestrators instead of creating one.
    pub fn monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    pub fn build(self) -> Result<Orchestrator<P>> {
        self.config.validate()?;
        let agents = self.roster.into_agents(self.config.max_agents)?;
        if !agents.iter().any(|a| a.role == Role::Manager) {
            return Err(EngineError::NoManager);
        }

        let cache = if self.config.cache_enabled {
            ResponseCache::new(self.config.cache_ttl(), self.config.cache_max_entries)
        } else {
            ResponseCache::disabled()
        };
        let gate = AdmissionGate::new(self.config.max_concurrent_requests)
            .with_rate_limit(self.config.rate_limit_per_minute);
        let monitor = self
            .monitor
            .unwrap_or_else(|| Arc::new(PerformanceMonitor::new(self.config.latency_window)));

        tracing::info!(
            agents = agents.len(),
            ceiling = self.config.max_concurrent_requests,
            model = %self.config.model,
            "Orchestrator ready"
        );

        Ok(Orchestrator {
            shared: Arc::new(Shared {
                events: EventBus::new(self.config.event_capacity),
                registry: AgentRegistry::new(agents),
                cache: Arc::new(cache),
                gate,
                monitor,
                provider: self.provider,
                review: self.review,
                scoring: self.scoring,
                run: Mutex::new(None),
                config: self.config,
            }),
        })
    }
}

pub(crate) struct Shared<P> {
    config: EngineConfig,
    provider: P,
    registry: AgentRegistry,
    cache: Arc<ResponseCache>,
    gate: AdmissionGate,
    monitor: Arc<PerformanceMonitor>,
    events: EventBus,
    review: Box<dyn ReviewPolicy>,
    scoring: Box<dyn ScoringPolicy>,
    run: Mutex<Option<Arc<Run>>>,
}

/// Per-project scheduling state.
pub(crate) struct Run {
    project: Mutex<Project>,
    queue: TaskQueue,
    cancel: CancellationToken,
    paused: AtomicBool,
    /// Dispatches spawned and not yet fully applied.
    active: AtomicUsize,
    wake: Notify,
    status: watch::Sender<ProjectStatus>,
}

impl Run {
    fn id(&self) -> ProjectId {
        self.queue.project()
    }

    fn current_status(&self) -> ProjectStatus {
        *self.status.borrow()
    }
}

/// Decrements the active-dispatch count however a dispatch exits.
struct ActiveGuard(Arc<Run>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.active.fetch_sub(1, Ordering::SeqCst);
        self.0.wake.notify_one();
    }
}

/// Runs projects against a fixed team of agents.
pub struct Orchestrator<P> {
    shared: Arc<Shared<P>>,
}

impl<P> Clone for Orchestrator<P> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<P: Provider> Orchestrator<P> {
    pub fn builder(config: EngineConfig, provider: P) -> OrchestratorBuilder<P> {
        OrchestratorBuilder {
            config,
            provider,
            roster: Roster::specialists(),
            review: Box::new(AutoApprove),
            scoring: Box::new(DefaultScoring::default()),
            monitor: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.shared.config
    }

    /// Start a project that opens with a manager planning task.
    pub fn start_project(&self, description: &str) -> Result<ProjectId> {
        let description = validate_description(description)?;
        let planning = project::planning_spec(&description);
        self.launch(description, vec![planning])
    }

    /// Start a project from an explicit task graph, skipping planning.
    pub fn start_project_with_plan(&self, description: &str, plan: ProjectPlan) -> Result<ProjectId> {
        let description = validate_description(description)?;
        if plan.is_empty() {
            return Err(EngineError::Validation("plan has no tasks".into()));
        }
        for role in plan.roles() {
            if !self.shared.registry.can_serve(role) {
                return Err(EngineError::UnservedRole(role));
            }
        }
        self.launch(description, plan.into_specs())
    }

    fn launch(&self, description: String, specs: Vec<TaskSpec>) -> Result<ProjectId> {
        let shared = &self.shared;
        let mut slot = shared.run.lock();
        if slot.as_ref().is_some_and(|r| r.current_status().is_active()) {
            return Err(EngineError::ProjectRunning);
        }

        let mut project = Project::new(description);
        let queue = TaskQueue::new(
            project.id,
            shared.config.max_task_retries,
            shared.config.retry_policy(),
        );
        for spec in specs {
            queue.enqueue(spec)?;
        }
        project.status = ProjectStatus::Running;
        let id = project.id;
        let (status, _) = watch::channel(ProjectStatus::Running);
        let run = Arc::new(Run {
            project: Mutex::new(project),
            queue,
            cancel: CancellationToken::new(),
            paused: AtomicBool::new(false),
            active: AtomicUsize::new(0),
            wake: Notify::new(),
            status,
        });
        *slot = Some(run.clone());
        drop(slot);

        shared.registry.reset_all(AgentStatus::Idle, true);
        tracing::info!(project = %id, tasks = run.queue.len(), "Project started");
        shared.events.publish(EngineEvent::ProjectStatusChanged {
            project: id,
            status: ProjectStatus::Running,
        });

        let sweep_every = shared
            .config
            .cache_ttl()
            .clamp(Duration::from_secs(1), Duration::from_secs(60));
        cache::spawn_sweeper(shared.cache.clone(), sweep_every, run.cancel.child_token());
        tokio::spawn(schedule(shared.clone(), run));
        Ok(id)
    }

    pub fn pause(&self) -> Result<()> {
        let run = self.shared.active_run()?;
        if run.current_status() == ProjectStatus::Running {
            run.paused.store(true, Ordering::SeqCst);
            self.shared.set_status(&run, ProjectStatus::Paused);
            tracing::info!(project = %run.id(), "Project paused");
        }
        Ok(())
    }

    pub fn resume(&self) -> Result<()> {
        let run = self.shared.active_run()?;
        if run.current_status() == ProjectStatus::Paused {
            run.paused.store(false, Ordering::SeqCst);
            self.shared.set_status(&run, ProjectStatus::Running);
            run.wake.notify_one();
            tracing::info!(project = %run.id(), "Project resumed");
        }
        Ok(())
    }

    /// Stop the project. In-flight dispatches keep running but their results
    /// are discarded; their tasks go back to pending.
    pub fn stop(&self) -> Result<()> {
        let run = self.shared.active_run()?;
        run.cancel.cancel();
        let reset = run.queue.close();
        for task in &reset {
            self.shared.events.publish(EngineEvent::TaskStatusChanged {
                task: *task,
                status: TaskStatus::Pending,
            });
        }
        self.shared.registry.reset_all(AgentStatus::Idle, false);
        for id in self.shared.registry.ids() {
            self.shared.agent_changed(*id);
        }
        self.shared.set_status(&run, ProjectStatus::Stopped);
        tracing::info!(project = %run.id(), reset = reset.len(), "Project stopped");
        Ok(())
    }

    /// Resolve once the current project reaches a terminal status.
    pub async fn wait(&self) -> Result<ProjectStatus> {
        let mut rx = {
            let slot = self.shared.run.lock();
            let run = slot.as_ref().ok_or(EngineError::NoProject)?;
            run.status.subscribe()
        };
        let status = rx
            .wait_for(|s| s.is_terminal())
            .await
            .map(|s| *s)
            .map_err(|_| EngineError::NoProject)?;
        Ok(status)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.shared.events.subscribe()
    }

    pub fn agents(&self) -> Vec<AgentView> {
        self.shared.registry.views()
    }

    pub fn queue_counts(&self) -> QueueCounts {
        self.shared
            .current()
            .map(|r| r.queue.counts())
            .unwrap_or_default()
    }

    pub fn tasks(&self) -> Vec<Task> {
        self.shared
            .current()
            .map(|r| r.queue.snapshot())
            .unwrap_or_default()
    }

    pub fn task(&self, id: TaskId) -> Option<Task> {
        self.shared.current().and_then(|r| r.queue.get(id))
    }

    pub fn messages(&self) -> Vec<Message> {
        self.shared
            .current()
            .map(|r| r.project.lock().messages.clone())
            .unwrap_or_default()
    }

    /// The generated file manifest: path to content.
    pub fn files(&self) -> BTreeMap<String, String> {
        self.shared
            .current()
            .map(|r| r.project.lock().manifest())
            .unwrap_or_default()
    }

    pub fn project(&self) -> Option<Project> {
        self.shared.current().map(|r| r.project.lock().clone())
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        self.shared.monitor.snapshot()
    }

    pub fn monitor(&self) -> Arc<PerformanceMonitor> {
        self.shared.monitor.clone()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.shared.cache.stats()
    }

    /// Provider calls currently holding an admission permit.
    pub fn in_flight(&self) -> usize {
        self.shared.gate.in_flight()
    }

    /// Make `task` wait for `prerequisite` in the running project. The task
    /// must not have started, and the edge must not close a cycle.
    pub fn add_dependency(&self, task: TaskId, prerequisite: TaskId) -> Result<()> {
        let run = self.shared.active_run()?;
        run.queue.add_prerequisite(task, prerequisite)?;
        if run.queue.status(task) == Some(TaskStatus::Pending) {
            self.shared.events.publish(EngineEvent::TaskStatusChanged {
                task,
                status: TaskStatus::Pending,
            });
        }
        tracing::debug!(task = %task, prerequisite = %prerequisite, "Dependency added");
        run.wake.notify_one();
        Ok(())
    }

    pub fn set_agent_active(&self, agent: AgentId, active: bool) -> bool {
        let found = self.shared.registry.set_active(agent, active);
        if found {
            self.shared.agent_changed(agent);
        }
        found
    }
}

/// The core only rejects blank descriptions; length limits belong to the
/// caller's boundary.
fn validate_description(description: &str) -> Result<String> {
    let trimmed = description.trim();
    if trimmed.is_empty() {
        return Err(EngineError::Validation(
            "project description is empty".into(),
        ));
    }
    Ok(trimmed.to_string())
}

impl<P: Provider> Shared<P> {
    fn current(&self) -> Option<Arc<Run>> {
        self.run.lock().clone()
    }

    fn active_run(&self) -> Result<Arc<Run>> {
        self.current()
            .filter(|r| r.current_status().is_active())
            .ok_or(EngineError::NoProject)
    }

    fn set_status(&self, run: &Run, status: ProjectStatus) {
        {
            let mut project = run.project.lock();
            project.status = status;
            if status.is_terminal() {
                project.completed_at = Some(Utc::now());
            }
        }
        run.status.send_replace(status);
        self.events.publish(EngineEvent::ProjectStatusChanged {
            project: run.id(),
            status,
        });
    }

    fn agent_changed(&self, id: AgentId) {
        if let Some(agent) = self.registry.get(id) {
            self.events.publish(EngineEvent::AgentStatusChanged {
                agent: id,
                name: agent.name,
                status: agent.status,
            });
        }
    }

    fn post(&self, run: &Run, message: Message) {
        run.project.lock().messages.push(message.clone());
        self.monitor.record(MonitorEvent::MessageSent);
        self.events.publish(EngineEvent::MessageAppended(message));
    }

    fn manager_name(&self) -> String {
        self.registry
            .snapshot()
            .into_iter()
            .find(|a| a.role == Role::Manager)
            .map(|a| a.name)
            .unwrap_or_else(|| "manager".to_string())
    }

    /// Pair ready tasks with idle agents until slots or work run out.
    fn fill(self: &Arc<Self>, run: &Arc<Run>, dispatches: &mut JoinSet<()>) {
        let ceiling = self.config.max_concurrent_requests;
        loop {
            if run.active.load(Ordering::SeqCst) >= ceiling {
                return;
            }
            let Some(task_id) = run.queue.next_ready(|role| self.registry.has_idle_for(role)) else {
                return;
            };
            let Some(task) = run.queue.get(task_id) else {
                return;
            };
            let reviewing = task.role == Role::Manager && task.kind == crate::task::TaskKind::Review;
            let Some(agent_id) = self.registry.claim_idle(task.role, task_id, reviewing) else {
                return;
            };

            let task = match run.queue.mark_in_progress(task_id, agent_id) {
                Ok(task) => task,
                Err(QueueError::Closed) => {
                    self.registry.release(agent_id);
                    return;
                }
                Err(e) => {
                    tracing::debug!(task = %task_id, "Claim lost: {e}");
                    self.registry.release(agent_id);
                    continue;
                }
            };
            let Some(agent) = self.registry.get(agent_id) else {
                return;
            };

            tracing::info!(task = %task.id, agent = %agent.name, role = %task.role, kind = ?task.kind, "Task dispatched");
            self.events.publish(EngineEvent::TaskStatusChanged {
                task: task.id,
                status: TaskStatus::InProgress,
            });
            self.agent_changed(agent_id);
            let from = self.manager_name();
            self.post(
                run,
                Message::new(
                    from,
                    agent.name.clone(),
                    MessageKind::TaskAssignment,
                    task.description.clone(),
                ),
            );

            run.active.fetch_add(1, Ordering::SeqCst);
            let guard = ActiveGuard(run.clone());
            let shared = self.clone();
            let run = run.clone();
            dispatches.spawn(async move {
                let _guard = guard;
                shared.dispatch(&run, task, agent).await;
            });
        }
    }

    /// Decide whether the run is over. Returns the terminal status to set.
    fn finished(&self, run: &Run) -> Option<ProjectStatus> {
        if run.active.load(Ordering::SeqCst) > 0 {
            return None;
        }
        let required_failed = run.queue.required_failed();
        if run.queue.all_terminal()
            || (required_failed && self.config.failure_policy == FailurePolicy::Abort)
        {
            Some(if required_failed {
                ProjectStatus::Failed
            } else {
                ProjectStatus::Completed
            })
        } else {
            None
        }
    }

    fn finish(&self, run: &Run, status: ProjectStatus) {
        run.queue.close();
        let agent_status = if status == ProjectStatus::Completed {
            AgentStatus::Completed
        } else {
            AgentStatus::Idle
        };
        self.registry.reset_all(agent_status, false);
        for id in self.registry.ids() {
            self.agent_changed(*id);
        }
        let counts = run.queue.counts();
        let files = run.project.lock().files.len();
        self.post(
            run,
            Message::new(
                self.manager_name(),
                "team",
                MessageKind::Status,
                format!(
                    "Project {status}: {} completed, {} failed, {files} files",
                    counts.completed, counts.failed
                ),
            ),
        );
        self.set_status(run, status);
        run.cancel.cancel();
        match status {
            ProjectStatus::Completed => {
                tracing::info!(project = %run.id(), completed = counts.completed, files, "Project completed")
            }
            _ => {
                tracing::error!(project = %run.id(), failed = counts.failed, "Project {status}")
            }
        }
    }
}

async fn schedule<P: Provider>(shared: Arc<Shared<P>>, run: Arc<Run>) {
    let mut ticker = tokio::time::interval(shared.config.tick_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut dispatches = JoinSet::new();

    loop {
        tokio::select! {
            _ = run.cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = run.wake.notified() => {}
            Some(joined) = dispatches.join_next(), if !dispatches.is_empty() => {
                if let Err(e) = joined {
                    tracing::error!("Dispatch task failed: {e}");
                }
            }
        }
        if run.cancel.is_cancelled() {
            break;
        }

        for agent in shared.registry.recover(shared.config.agent_recovery()) {
            tracing::debug!(agent = %agent, "Agent recovered");
            shared.agent_changed(agent);
        }

        let aborting = shared.config.failure_policy == FailurePolicy::Abort
            && run.queue.required_failed();
        if !run.paused.load(Ordering::SeqCst) && !aborting {
            for task in run.queue.promote_eligible(Instant::now()) {
                shared.events.publish(EngineEvent::TaskStatusChanged {
                    task,
                    status: TaskStatus::Ready,
                });
            }
            shared.fill(&run, &mut dispatches);
        }

        if let Some(status) = shared.finished(&run) {
            shared.finish(&run, status);
            break;
        }
    }

    // Late dispatches finish on their own; their results are discarded.
    dispatches.detach_all();
    tracing::debug!(project = %run.id(), "Scheduler loop exited");
}
