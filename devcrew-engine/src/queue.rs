//! The task dependency graph and its claim/complete/fail operations.
//!
//! The graph shape (which tasks exist, who depends on whom) sits behind one
//! `RwLock` that is only write-locked to add tasks or edges. Each task has its
//! own `Mutex`; claim, complete, and fail take the graph read lock plus the
//! lock of one task at a time, so unrelated tasks never contend. No path holds
//! two task locks at once.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::time::Instant;

use crate::error::{DependencyProblem, QueueError};
use crate::ids::{AgentId, ProjectId, TaskId};
use crate::retry::RetryPolicy;
use crate::role::Role;
use crate::task::{Task, TaskResult, TaskSpec, TaskStatus};

/// How a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryHint {
    /// Terminal: fail now regardless of remaining retries.
    Never,
    /// Retry after the policy's jittered backoff.
    Backoff,
    /// Retry after at least this long (e.g. a provider `retry-after`).
    After(Duration),
}

/// What `fail` did with the task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to pending; eligible again after `delay`.
    Retrying { attempt: u32, delay: Duration },
    /// Terminal. `cascaded` lists dependents failed along with it.
    Failed { cascaded: Vec<TaskId> },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: usize,
    pub ready: usize,
    pub in_progress: usize,
    pub completed: usize,
    pub failed: usize,
}

impl QueueCounts {
    pub fn total(&self) -> usize {
        self.pending + self.ready + self.in_progress + self.completed + self.failed
    }

    pub fn is_terminal(&self) -> bool {
        self.completed + self.failed == self.total()
    }
}

#[derive(Default)]
struct Graph {
    tasks: HashMap<TaskId, Arc<Mutex<Task>>>,
    /// prerequisite -> tasks that list it.
    dependents: HashMap<TaskId, Vec<TaskId>>,
    order: Vec<TaskId>,
    next_seq: u64,
    closed: bool,
}

impl Graph {
    fn slot(&self, id: TaskId) -> Result<&Arc<Mutex<Task>>, QueueError> {
        self.tasks.get(&id).ok_or(QueueError::UnknownTask(id))
    }

    fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.tasks.get(&id).map(|t| t.lock().status)
    }

    /// Whether `target` is reachable from `from` by following prerequisites.
    fn reaches(&self, from: TaskId, target: TaskId) -> bool {
        let mut seen = HashSet::new();
        let mut frontier = VecDeque::from([from]);
        while let Some(id) = frontier.pop_front() {
            if id == target {
                return true;
            }
            if !seen.insert(id) {
                continue;
            }
            if let Some(task) = self.tasks.get(&id) {
                frontier.extend(task.lock().prerequisites.iter().copied());
            }
        }
        false
    }

    fn prerequisites_met(&self, prerequisites: &[TaskId]) -> bool {
        prerequisites
            .iter()
            .all(|p| self.status(*p) == Some(TaskStatus::Completed))
    }

    /// Flip `id` from pending to ready if every prerequisite is completed and
    /// its backoff has elapsed. Returns true when this call did the flip.
    fn try_promote(&self, id: TaskId, now: Instant) -> bool {
        let Some(slot) = self.tasks.get(&id) else {
            return false;
        };
        let prerequisites: Vec<TaskId> = {
            let task = slot.lock();
            if task.status != TaskStatus::Pending {
                return false;
            }
            task.prerequisites.iter().copied().collect()
        };
        if !self.prerequisites_met(&prerequisites) {
            return false;
        }
        let mut task = slot.lock();
        let due = task.eligible_at.is_none_or(|at| at <= now);
        if task.status == TaskStatus::Pending && due {
            task.status = TaskStatus::Ready;
            task.eligible_at = None;
            true
        } else {
            false
        }
    }
}

pub struct TaskQueue {
    project: ProjectId,
    max_retries: u32,
    retry: RetryPolicy,
    graph: RwLock<Graph>,
}

impl TaskQueue {
    pub fn new(project: ProjectId, max_retries: u32, retry: RetryPolicy) -> Self {
        Self {
            project,
            max_retries,
            retry,
            graph: RwLock::new(Graph::default()),
        }
    }

    pub fn project(&self) -> ProjectId {
        self.project
    }

    /// Add a task. Every prerequisite must already be queued; the task is
    /// ready immediately if they are all completed.
    pub fn enqueue(&self, spec: TaskSpec) -> Result<TaskId, QueueError> {
        let mut graph = self.graph.write();
        if graph.closed {
            return Err(QueueError::Closed);
        }
        let id = spec.id;
        if graph.tasks.contains_key(&id) {
            return Err(QueueError::DuplicateTask(id));
        }
        for &prerequisite in &spec.prerequisites {
            let reason = if prerequisite == id || graph.reaches(prerequisite, id) {
                DependencyProblem::Cycle
            } else if !graph.tasks.contains_key(&prerequisite) {
                DependencyProblem::Unknown
            } else {
                continue;
            };
            return Err(QueueError::InvalidDependency {
                task: id,
                prerequisite,
                reason,
            });
        }

        let seq = graph.next_seq;
        graph.next_seq += 1;
        for &prerequisite in &spec.prerequisites {
            graph.dependents.entry(prerequisite).or_default().push(id);
        }
        let task = Task::from_spec(spec, self.project, self.max_retries, seq);
        tracing::debug!(task = %id, role = %task.role, priority = task.priority, "Task enqueued");
        graph.tasks.insert(id, Arc::new(Mutex::new(task)));
        graph.order.push(id);
        graph.try_promote(id, Instant::now());
        Ok(id)
    }

    /// Add an edge after the fact. The task must not have started. Rejected
    /// if it would close a cycle.
    pub fn add_prerequisite(&self, task: TaskId, prerequisite: TaskId) -> Result<(), QueueError> {
        let mut graph = self.graph.write();
        if graph.closed {
            return Err(QueueError::Closed);
        }
        let slot = graph.slot(task)?.clone();
        if !graph.tasks.contains_key(&prerequisite) {
            return Err(QueueError::InvalidDependency {
                task,
                prerequisite,
                reason: DependencyProblem::Unknown,
            });
        }
        if task == prerequisite || graph.reaches(prerequisite, task) {
            return Err(QueueError::InvalidDependency {
                task,
                prerequisite,
                reason: DependencyProblem::Cycle,
            });
        }
        let prerequisite_done = graph.status(prerequisite) == Some(TaskStatus::Completed);
        {
            let mut t = slot.lock();
            if !matches!(t.status, TaskStatus::Pending | TaskStatus::Ready) {
                return Err(QueueError::InvalidTransition {
                    task,
                    from: t.status.as_str(),
                    to: TaskStatus::Pending.as_str(),
                });
            }
            if !t.prerequisites.insert(prerequisite) {
                return Ok(());
            }
            if !prerequisite_done {
                t.status = TaskStatus::Pending;
            }
        }
        graph.dependents.entry(prerequisite).or_default().push(task);
        Ok(())
    }

    /// Promote every pending task whose prerequisites are met and whose
    /// backoff has elapsed. Returns the promoted ids.
    pub fn promote_eligible(&self, now: Instant) -> Vec<TaskId> {
        let graph = self.graph.read();
        if graph.closed {
            return Vec::new();
        }
        graph
            .order
            .iter()
            .copied()
            .filter(|id| graph.try_promote(*id, now))
            .collect()
    }

    /// The ready task to dispatch next among roles accepted by `accepts`:
    /// highest priority first, then earliest enqueued.
    pub fn next_ready(&self, accepts: impl Fn(Role) -> bool) -> Option<TaskId> {
        let graph = self.graph.read();
        if graph.closed {
            return None;
        }
        let mut best: Option<(i32, u64, TaskId)> = None;
        for id in &graph.order {
            let Some(slot) = graph.tasks.get(id) else {
                continue;
            };
            let task = slot.lock();
            if task.status != TaskStatus::Ready || !accepts(task.role) {
                continue;
            }
            let better = match best {
                None => true,
                Some((priority, seq, _)) => {
                    task.priority > priority || (task.priority == priority && task.seq < seq)
                }
            };
            if better {
                best = Some((task.priority, task.seq, task.id));
            }
        }
        best.map(|(_, _, id)| id)
    }

    /// Claim a ready task for `agent`. Exactly one caller wins.
    pub fn mark_in_progress(&self, id: TaskId, agent: AgentId) -> Result<Task, QueueError> {
        let graph = self.graph.read();
        if graph.closed {
            return Err(QueueError::Closed);
        }
        let mut task = graph.slot(id)?.lock();
        match task.status {
            TaskStatus::Ready => {
                task.status = TaskStatus::InProgress;
                task.assigned_agent = Some(agent);
                task.started_at = Some(Utc::now());
                task.error = None;
                Ok(task.clone())
            }
            TaskStatus::InProgress => Err(QueueError::AlreadyClaimed {
                task: id,
                by: task.assigned_agent.unwrap_or(agent),
            }),
            other => Err(QueueError::InvalidTransition {
                task: id,
                from: other.as_str(),
                to: TaskStatus::InProgress.as_str(),
            }),
        }
    }

    /// Complete an in-progress task and return the dependents this made
    /// ready. Completing an already completed task is a no-op.
    pub fn complete(&self, id: TaskId, result: TaskResult) -> Result<Vec<TaskId>, QueueError> {
        let graph = self.graph.read();
        if graph.closed {
            return Err(QueueError::Closed);
        }
        {
            let mut task = graph.slot(id)?.lock();
            match task.status {
                TaskStatus::Completed => return Ok(Vec::new()),
                TaskStatus::InProgress => {
                    task.status = TaskStatus::Completed;
                    task.result = Some(result);
                    task.completed_at = Some(Utc::now());
                }
                other => {
                    return Err(QueueError::InvalidTransition {
                        task: id,
                        from: other.as_str(),
                        to: TaskStatus::Completed.as_str(),
                    });
                }
            }
        }

        let now = Instant::now();
        let unlocked: Vec<TaskId> = graph
            .dependents
            .get(&id)
            .into_iter()
            .flatten()
            .copied()
            .filter(|dep| graph.try_promote(*dep, now))
            .collect();
        tracing::debug!(task = %id, unlocked = unlocked.len(), "Task completed");
        Ok(unlocked)
    }

    /// Record a failed attempt. Retries go back to pending with a backoff;
    /// terminal failures cascade to every dependent that has not finished.
    pub fn fail(
        &self,
        id: TaskId,
        error: impl Into<String>,
        hint: RetryHint,
    ) -> Result<FailOutcome, QueueError> {
        let graph = self.graph.read();
        if graph.closed {
            return Err(QueueError::Closed);
        }
        let error = error.into();
        {
            let mut task = graph.slot(id)?.lock();
            if task.status != TaskStatus::InProgress {
                return Err(QueueError::InvalidTransition {
                    task: id,
                    from: task.status.as_str(),
                    to: TaskStatus::Failed.as_str(),
                });
            }
            task.assigned_agent = None;
            task.error = Some(error.clone());

            if hint != RetryHint::Never && task.retry_count < task.max_retries {
                task.retry_count += 1;
                let mut delay = self.retry.delay(task.retry_count);
                if let RetryHint::After(min) = hint {
                    delay = delay.max(min);
                }
                task.status = TaskStatus::Pending;
                task.eligible_at = Some(Instant::now() + delay);
                return Ok(FailOutcome::Retrying {
                    attempt: task.retry_count,
                    delay,
                });
            }

            task.status = TaskStatus::Failed;
            task.completed_at = Some(Utc::now());
        }

        let mut cascaded = Vec::new();
        let mut frontier: VecDeque<TaskId> = graph
            .dependents
            .get(&id)
            .into_iter()
            .flatten()
            .copied()
            .collect();
        while let Some(dep) = frontier.pop_front() {
            let Some(slot) = graph.tasks.get(&dep) else {
                continue;
            };
            let mut task = slot.lock();
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
                continue;
            }
            task.status = TaskStatus::Failed;
            task.error = Some(format!("prerequisite {id} failed"));
            task.completed_at = Some(Utc::now());
            drop(task);
            cascaded.push(dep);
            frontier.extend(graph.dependents.get(&dep).into_iter().flatten().copied());
        }
        Ok(FailOutcome::Failed { cascaded })
    }

    /// Stop accepting transitions. In-flight tasks go back to pending so a
    /// late result can never complete them. Returns the reset ids.
    pub fn close(&self) -> Vec<TaskId> {
        let mut graph = self.graph.write();
        graph.closed = true;
        let mut reset = Vec::new();
        for id in &graph.order {
            let Some(slot) = graph.tasks.get(id) else {
                continue;
            };
            let mut task = slot.lock();
            if matches!(task.status, TaskStatus::InProgress | TaskStatus::Ready) {
                task.status = TaskStatus::Pending;
                task.assigned_agent = None;
                task.started_at = None;
                reset.push(*id);
            }
        }
        reset
    }

    pub fn get(&self, id: TaskId) -> Option<Task> {
        self.graph.read().tasks.get(&id).map(|t| t.lock().clone())
    }

    pub fn status(&self, id: TaskId) -> Option<TaskStatus> {
        self.graph.read().status(id)
    }

    /// All tasks in enqueue order.
    pub fn snapshot(&self) -> Vec<Task> {
        let graph = self.graph.read();
        graph
            .order
            .iter()
            .filter_map(|id| graph.tasks.get(id))
            .map(|t| t.lock().clone())
            .collect()
    }

    pub fn counts(&self) -> QueueCounts {
        let graph = self.graph.read();
        let mut counts = QueueCounts::default();
        for slot in graph.tasks.values() {
            match slot.lock().status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::Ready => counts.ready += 1,
                TaskStatus::InProgress => counts.in_progress += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        counts
    }

    pub fn len(&self) -> usize {
        self.graph.read().order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn all_terminal(&self) -> bool {
        self.counts().is_terminal()
    }

    /// Whether any required task has failed terminally.
    pub fn required_failed(&self) -> bool {
        self.graph
            .read()
            .tasks
            .values()
            .any(|t| {
                let t = t.lock();
                t.required && t.status == TaskStatus::Failed
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskKind;

    fn queue(max_retries: u32) -> TaskQueue {
        TaskQueue::new(
            ProjectId::new(),
            max_retries,
            RetryPolicy::new(Duration::from_millis(100), Duration::from_secs(1)),
        )
    }

    fn result(text: &str) -> TaskResult {
        TaskResult {
            output: text.to_string(),
            files: Vec::new(),
        }
    }

    fn run(q: &TaskQueue, id: TaskId) {
        q.mark_in_progress(id, AgentId::new()).unwrap();
        q.complete(id, result("done")).unwrap();
    }

    #[test]
    fn root_is_ready_dependents_wait() {
        let q = queue(3);
        let a = q.enqueue(TaskSpec::new(Role::Manager, "Plan the work")).unwrap();
        let b = q
            .enqueue(TaskSpec::new(Role::Backend, "Build the API").after(a))
            .unwrap();
        let c = q
            .enqueue(TaskSpec::new(Role::Frontend, "Build the UI").after(a))
            .unwrap();

        assert_eq!(q.status(a), Some(TaskStatus::Ready));
        assert_eq!(q.status(b), Some(TaskStatus::Pending));
        assert_eq!(q.status(c), Some(TaskStatus::Pending));

        q.mark_in_progress(a, AgentId::new()).unwrap();
        let mut unlocked = q.complete(a, result("plan")).unwrap();
        unlocked.sort();
        let mut expected = vec![b, c];
        expected.sort();
        assert_eq!(unlocked, expected);
        assert_eq!(q.status(b), Some(TaskStatus::Ready));
    }

    #[test]
    fn ready_only_when_every_prerequisite_completed() {
        let q = queue(3);
        let a = q.enqueue(TaskSpec::new(Role::Backend, "a")).unwrap();
        let b = q.enqueue(TaskSpec::new(Role::Backend, "b")).unwrap();
        let c = q
            .enqueue(TaskSpec::new(Role::Devops, "c").after_all([a, b]))
            .unwrap();

        run(&q, a);
        assert_eq!(q.status(c), Some(TaskStatus::Pending));
        run(&q, b);
        assert_eq!(q.status(c), Some(TaskStatus::Ready));
    }

    #[test]
    fn unknown_and_self_prerequisites_are_rejected() {
        let q = queue(3);
        let err = q
            .enqueue(TaskSpec::new(Role::Backend, "x").after(TaskId::new()))
            .unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidDependency {
                reason: DependencyProblem::Unknown,
                ..
            }
        ));

        let spec = TaskSpec::new(Role::Backend, "y");
        let id = spec.id;
        let err = q.enqueue(spec.after(id)).unwrap_err();
        assert!(err.is_cycle());
        assert!(q.is_empty());
    }

    #[test]
    fn edge_closing_a_cycle_is_rejected() {
        let q = queue(3);
        let a = q.enqueue(TaskSpec::new(Role::Backend, "a")).unwrap();
        let b = q.enqueue(TaskSpec::new(Role::Backend, "b").after(a)).unwrap();
        let c = q.enqueue(TaskSpec::new(Role::Backend, "c").after(b)).unwrap();

        let err = q.add_prerequisite(a, c).unwrap_err();
        assert!(err.is_cycle());
        assert!(!q.get(a).unwrap().prerequisites.contains(&c));

        // A non-cyclic edge is accepted and demotes the ready task.
        let d = q.enqueue(TaskSpec::new(Role::Backend, "d")).unwrap();
        q.add_prerequisite(a, d).unwrap();
        assert_eq!(q.status(a), Some(TaskStatus::Pending));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let q = queue(3);
        let spec = TaskSpec::new(Role::Backend, "a");
        q.enqueue(spec.clone()).unwrap();
        assert_eq!(q.enqueue(spec.clone()), Err(QueueError::DuplicateTask(spec.id)));
    }

    #[test]
    fn next_ready_orders_by_priority_then_fifo() {
        let q = queue(3);
        let low = q.enqueue(TaskSpec::new(Role::Backend, "low").priority(2)).unwrap();
        let first = q.enqueue(TaskSpec::new(Role::Backend, "first").priority(7)).unwrap();
        let second = q.enqueue(TaskSpec::new(Role::Backend, "second").priority(7)).unwrap();
        let ui = q.enqueue(TaskSpec::new(Role::Frontend, "ui").priority(9)).unwrap();

        assert_eq!(q.next_ready(|r| r == Role::Backend), Some(first));
        assert_eq!(q.next_ready(|_| true), Some(ui));
        q.mark_in_progress(first, AgentId::new()).unwrap();
        assert_eq!(q.next_ready(|r| r == Role::Backend), Some(second));
        q.mark_in_progress(second, AgentId::new()).unwrap();
        assert_eq!(q.next_ready(|r| r == Role::Backend), Some(low));
        assert_eq!(q.next_ready(|r| r == Role::Devops), None);
    }

    #[test]
    fn second_claim_loses() {
        let q = queue(3);
        let a = q.enqueue(TaskSpec::new(Role::Backend, "a")).unwrap();
        let winner = AgentId::new();
        q.mark_in_progress(a, winner).unwrap();
        assert_eq!(
            q.mark_in_progress(a, AgentId::new()).unwrap_err(),
            QueueError::AlreadyClaimed { task: a, by: winner }
        );
    }

    #[test]
    fn complete_twice_unlocks_dependents_once() {
        let q = queue(3);
        let a = q.enqueue(TaskSpec::new(Role::Backend, "a")).unwrap();
        let b = q.enqueue(TaskSpec::new(Role::Backend, "b").after(a)).unwrap();
        q.mark_in_progress(a, AgentId::new()).unwrap();
        assert_eq!(q.complete(a, result("one")).unwrap(), vec![b]);
        assert!(q.complete(a, result("two")).unwrap().is_empty());
        assert_eq!(q.get(a).unwrap().result.unwrap().output, "one");
        assert_eq!(q.counts().ready, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_for_backoff_then_exhausts() {
        let q = queue(2);
        let a = q.enqueue(TaskSpec::new(Role::Backend, "a")).unwrap();

        for attempt in 1..=2 {
            q.mark_in_progress(a, AgentId::new()).unwrap();
            let outcome = q.fail(a, "timeout", RetryHint::Backoff).unwrap();
            let FailOutcome::Retrying { attempt: n, delay } = outcome else {
                panic!("expected a retry, got {outcome:?}");
            };
            assert_eq!(n, attempt);
            assert_eq!(q.status(a), Some(TaskStatus::Pending));
            assert!(q.promote_eligible(Instant::now()).is_empty());

            tokio::time::advance(delay).await;
            assert_eq!(q.promote_eligible(Instant::now()), vec![a]);
        }

        q.mark_in_progress(a, AgentId::new()).unwrap();
        let outcome = q.fail(a, "timeout", RetryHint::Backoff).unwrap();
        assert_eq!(outcome, FailOutcome::Failed { cascaded: vec![] });
        let task = q.get(a).unwrap();
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_after_hint_sets_minimum_delay() {
        let q = queue(3);
        let a = q.enqueue(TaskSpec::new(Role::Backend, "a")).unwrap();
        q.mark_in_progress(a, AgentId::new()).unwrap();
        let outcome = q
            .fail(a, "429", RetryHint::After(Duration::from_secs(10)))
            .unwrap();
        assert_eq!(
            outcome,
            FailOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_secs(10)
            }
        );
        assert!(q.get(a).unwrap().eligible_at.is_some());
    }

    #[test]
    fn terminal_failure_cascades_to_dependents() {
        let q = queue(3);
        let a = q.enqueue(TaskSpec::new(Role::Backend, "a")).unwrap();
        let b = q.enqueue(TaskSpec::new(Role::Backend, "b").after(a)).unwrap();
        let c = q.enqueue(TaskSpec::new(Role::Devops, "c").after(b).optional()).unwrap();
        let other = q.enqueue(TaskSpec::new(Role::Frontend, "other")).unwrap();

        q.mark_in_progress(a, AgentId::new()).unwrap();
        let outcome = q.fail(a, "rejected", RetryHint::Never).unwrap();
        assert_eq!(outcome, FailOutcome::Failed { cascaded: vec![b, c] });
        assert_eq!(q.status(other), Some(TaskStatus::Ready));
        assert!(q.required_failed());
        assert!(!q.all_terminal());

        run(&q, other);
        assert!(q.all_terminal());
    }

    #[test]
    fn close_resets_in_flight_and_rejects_late_results() {
        let q = queue(3);
        let a = q.enqueue(TaskSpec::new(Role::Backend, "a").kind(TaskKind::Implementation)).unwrap();
        q.mark_in_progress(a, AgentId::new()).unwrap();

        assert_eq!(q.close(), vec![a]);
        assert_eq!(q.complete(a, result("late")), Err(QueueError::Closed));
        let task = q.get(a).unwrap();
        assert_eq!(task.status, TaskStatus::Pending);
        assert!(task.assigned_agent.is_none());
        assert_eq!(q.next_ready(|_| true), None);
    }
}

#[cfg(test)]
mod prop_tests {
    use std::collections::{HashMap, HashSet};

    use proptest::prelude::*;

    use super::*;

    const MAX_TASKS: usize = 10;

    type Edges = HashMap<TaskId, HashSet<TaskId>>;

    /// Each node's prerequisites among earlier nodes, plus a preferred
    /// completion order.
    fn arb_dag() -> impl Strategy<Value = (Vec<Vec<usize>>, Vec<usize>)> {
        (2..=MAX_TASKS).prop_flat_map(|n| {
            let masks = prop::collection::vec(prop::collection::vec(any::<bool>(), MAX_TASKS), n);
            let order = Just((0..n).collect::<Vec<_>>()).prop_shuffle();
            (masks, order).prop_map(|(masks, order)| {
                let prerequisites = masks
                    .iter()
                    .enumerate()
                    .map(|(i, mask)| (0..i).filter(|j| mask[*j]).collect())
                    .collect();
                (prerequisites, order)
            })
        })
    }

    fn build(prerequisites: &[Vec<usize>]) -> (TaskQueue, Vec<TaskId>) {
        let q = TaskQueue::new(
            ProjectId::new(),
            0,
            RetryPolicy::new(Duration::from_millis(10), Duration::from_millis(10)),
        );
        let mut ids: Vec<TaskId> = Vec::new();
        for (i, deps) in prerequisites.iter().enumerate() {
            let spec = TaskSpec::new(Role::Backend, format!("task {i}"))
                .after_all(deps.iter().map(|d| ids[*d]));
            ids.push(q.enqueue(spec).unwrap());
        }
        (q, ids)
    }

    fn edges(q: &TaskQueue) -> Edges {
        q.snapshot()
            .into_iter()
            .map(|t| (t.id, t.prerequisites.into_iter().collect()))
            .collect()
    }

    /// Whether `from` lists `target` directly or transitively.
    fn depends_on(edges: &Edges, from: TaskId, target: TaskId) -> bool {
        let mut seen = HashSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            for p in edges.get(&id).into_iter().flatten() {
                if *p == target {
                    return true;
                }
                stack.push(*p);
            }
        }
        false
    }

    fn is_acyclic(edges: &Edges) -> bool {
        let mut done: HashSet<TaskId> = HashSet::new();
        while done.len() < edges.len() {
            let next: Vec<TaskId> = edges
                .iter()
                .filter(|(id, deps)| !done.contains(*id) && deps.iter().all(|d| done.contains(d)))
                .map(|(id, _)| *id)
                .collect();
            if next.is_empty() {
                return false;
            }
            done.extend(next);
        }
        true
    }

    /// Waiting tasks are ready exactly when every prerequisite completed.
    fn check_readiness(q: &TaskQueue) -> Result<(), TestCaseError> {
        let tasks = q.snapshot();
        let status: HashMap<TaskId, TaskStatus> = tasks.iter().map(|t| (t.id, t.status)).collect();
        for task in &tasks {
            if !matches!(task.status, TaskStatus::Pending | TaskStatus::Ready) {
                continue;
            }
            let met = task
                .prerequisites
                .iter()
                .all(|p| status[p] == TaskStatus::Completed);
            prop_assert_eq!(
                task.status == TaskStatus::Ready,
                met,
                "{} is {:?} with prerequisites met = {}",
                task.description,
                task.status,
                met
            );
        }
        Ok(())
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        #[test]
        fn readiness_follows_completed_prerequisites((prerequisites, order) in arb_dag()) {
            let (q, ids) = build(&prerequisites);
            check_readiness(&q)?;

            for _ in 0..ids.len() {
                let next = order
                    .iter()
                    .map(|i| ids[*i])
                    .find(|id| q.status(*id) == Some(TaskStatus::Ready));
                prop_assert!(next.is_some(), "nothing ready before the graph finished");
                let id = next.unwrap();
                q.mark_in_progress(id, AgentId::new()).unwrap();
                check_readiness(&q)?;
                q.complete(id, TaskResult { output: String::new(), files: Vec::new() }).unwrap();
                check_readiness(&q)?;
            }
            prop_assert_eq!(q.counts().completed, ids.len());
        }

        #[test]
        fn edges_closing_a_cycle_are_refused(
            (prerequisites, _) in arb_dag(),
            extra in prop::collection::vec((0..MAX_TASKS, 0..MAX_TASKS), 1..20),
        ) {
            let (q, ids) = build(&prerequisites);
            for (x, y) in extra {
                let task = ids[x % ids.len()];
                let prerequisite = ids[y % ids.len()];
                let before = edges(&q);
                let closes = task == prerequisite || depends_on(&before, prerequisite, task);

                match q.add_prerequisite(task, prerequisite) {
                    Ok(()) => prop_assert!(!closes),
                    Err(err) => {
                        prop_assert!(closes, "unexpected refusal: {}", err);
                        prop_assert!(err.is_cycle());
                        prop_assert_eq!(edges(&q), before);
                    }
                }
                prop_assert!(is_acyclic(&edges(&q)));
            }
            check_readiness(&q)?;
        }
    }
}
