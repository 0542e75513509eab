//! A single dispatch: prompt, cache, gate, provider, then apply the result.
//!
//! Fresh output is cached only once review approves it, so a rejected or
//! invalid answer is never served again from the cache.
//!
//! Nothing here is applied once the run's cancel token has fired. The queue
//! is closed on stop, so a result that races the stop is refused by
//! `complete`/`fail` and dropped.

use std::sync::Arc;

use tokio::time::Instant;

use super::{Run, Shared};
use crate::agent::Agent;
use crate::cache::Fingerprint;
use crate::error::{DispatchError, ProviderError, QueueError};
use crate::events::EngineEvent;
use crate::extract;
use crate::monitor::MonitorEvent;
use crate::plan;
use crate::project::{Message, MessageKind};
use crate::provider::{GenerateRequest, Provider};
use crate::queue::{FailOutcome, RetryHint};
use crate::review::{Outcome, ReviewVerdict};
use crate::role::{PriorOutput, Prompt, PromptContext, Role};
use crate::task::{Task, TaskKind, TaskResult, TaskStatus};

/// Output of one dispatch. `fresh` carries the cache key when the text came
/// from the provider rather than the cache.
struct Generated {
    output: String,
    fresh: Option<Fingerprint>,
}

impl<P: Provider> Shared<P> {
    pub(super) async fn dispatch(self: &Arc<Self>, run: &Arc<Run>, task: Task, agent: Agent) {
        let started = Instant::now();
        let outcome = self.execute(run, &task, &agent).await;

        if run.cancel.is_cancelled() {
            tracing::debug!(task = %task.id, agent = %agent.name, "Discarding result after stop");
            return;
        }
        match outcome {
            Ok(generated) => self.accept(run, &task, &agent, generated, started),
            Err(err) => self.reject(run, &task, &agent, err),
        }
    }

    async fn execute(&self, run: &Run, task: &Task, agent: &Agent) -> Result<Generated, DispatchError> {
        let prompt = self.build_prompt(run, task, agent);
        let settings = self.config.roles.for_role(agent.role);
        let key = Fingerprint::new(
            &prompt.system,
            &prompt.user,
            task.role,
            &self.config.model,
            settings.max_tokens,
            settings.temperature,
        );

        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!(task = %task.id, "Cache hit");
            self.monitor.record(MonitorEvent::CacheHit);
            return Ok(Generated {
                output: hit,
                fresh: None,
            });
        }
        if self.cache.is_enabled() {
            self.monitor.record(MonitorEvent::CacheMiss);
        }

        let timeout = self.config.request_timeout();
        let permit = tokio::select! {
            _ = run.cancel.cancelled() => return Err(DispatchError::Cancelled),
            permit = self.gate.acquire(timeout) => permit?,
        };

        let req = GenerateRequest {
            system: prompt.system,
            prompt: prompt.user,
            role: task.role,
            max_tokens: settings.max_tokens,
            temperature: settings.temperature,
            timeout,
        };
        self.monitor.record(MonitorEvent::CallStarted);
        let call_started = Instant::now();
        let result = tokio::time::timeout(timeout, self.provider.generate(&req))
            .await
            .unwrap_or(Err(ProviderError::Timeout));
        drop(permit);
        self.monitor.record(MonitorEvent::CallFinished {
            latency: call_started.elapsed(),
            ok: result.is_ok(),
        });

        let output = result?;
        task.role
            .validate(task.kind, &output)
            .map_err(DispatchError::Validation)?;
        Ok(Generated {
            output,
            fresh: Some(key),
        })
    }

    fn build_prompt(&self, run: &Run, task: &Task, agent: &Agent) -> Prompt {
        let project_description = run.project.lock().description.clone();
        let prior: Vec<PriorOutput> = task
            .prerequisites
            .iter()
            .filter_map(|id| run.queue.get(*id))
            .filter(|t| t.kind != TaskKind::Planning)
            .map(|t| PriorOutput {
                description: t.description,
                files: t.result.map(|r| r.files).unwrap_or_default(),
            })
            .collect();
        let team: Vec<(String, Role)> = self
            .registry
            .snapshot()
            .into_iter()
            .filter(|a| a.is_active)
            .map(|a| (a.name, a.role))
            .collect();

        agent.role.build_prompt(&PromptContext {
            agent_name: &agent.name,
            skills: &agent.skills,
            kind: task.kind,
            task_description: &task.description,
            project_description: &project_description,
            files_expected: &task.files_expected,
            prior_outputs: &prior,
            team: &team,
        })
    }

    fn accept(&self, run: &Run, task: &Task, agent: &Agent, generated: Generated, started: Instant) {
        let Generated { output, fresh } = generated;
        let verdict = self.review.review(task, &output);
        self.post_review(run, task, agent, &verdict);
        if let ReviewVerdict::Reject(reason) = verdict {
            tracing::warn!(task = %task.id, agent = %agent.name, "Review rejected output: {reason}");
            self.reject(run, task, agent, DispatchError::Validation(format!("review rejected: {reason}")));
            return;
        }
        if let Some(key) = fresh {
            self.cache.put(key, output.clone());
        }

        if task.kind == TaskKind::Planning && !self.expand_plan(run, task, &output) {
            return;
        }

        let files = extract::extract_files(&output);
        let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
        let unlocked = match run.queue.complete(
            task.id,
            TaskResult {
                output: output.clone(),
                files: paths.clone(),
            },
        ) {
            Ok(unlocked) => unlocked,
            Err(QueueError::Closed) => {
                tracing::debug!(task = %task.id, "Queue closed, result dropped");
                return;
            }
            Err(e) => {
                tracing::warn!(task = %task.id, "Cannot complete task: {e}");
                return;
            }
        };

        for file in files {
            let bytes = file.content.len();
            run.project
                .lock()
                .put_file(file.path.clone(), file.content, task.id, &agent.name);
            self.monitor.record(MonitorEvent::FileCreated);
            self.events.publish(EngineEvent::FileProduced {
                path: file.path,
                bytes,
            });
        }

        let elapsed = started.elapsed().as_secs_f64();
        self.registry.update(agent.id, |a| {
            a.ledger.record_completion(elapsed);
            a.work_output = output;
            self.scoring
                .score(&mut a.ledger, Outcome::Approved, a.manager.is_some());
        });
        self.registry.release(agent.id);
        self.agent_changed(agent.id);
        self.monitor.record(MonitorEvent::TaskCompleted);

        tracing::info!(task = %task.id, agent = %agent.name, files = paths.len(), unlocked = unlocked.len(), "Task completed");
        self.events.publish(EngineEvent::TaskStatusChanged {
            task: task.id,
            status: TaskStatus::Completed,
        });
        self.events.publish(EngineEvent::TaskCompleted {
            task: task.id,
            agent: agent.name.clone(),
            files: paths.clone(),
        });
        for dependent in unlocked {
            self.events.publish(EngineEvent::TaskStatusChanged {
                task: dependent,
                status: TaskStatus::Ready,
            });
        }

        let summary = if paths.is_empty() {
            format!("Finished: {}", task.description)
        } else {
            format!("Finished: {} ({})", task.description, paths.join(", "))
        };
        let to = if agent.role == Role::Manager {
            "team".to_string()
        } else {
            self.manager_name()
        };
        self.post(
            run,
            Message::new(agent.name.clone(), to, MessageKind::TaskCompletion, summary),
        );
    }

    /// The manager's verdict on a worker's output, as a review message.
    /// Managers are not reviewed by themselves.
    fn post_review(&self, run: &Run, task: &Task, agent: &Agent, verdict: &ReviewVerdict) {
        if agent.role == Role::Manager {
            return;
        }
        let content = match verdict {
            ReviewVerdict::Approve => format!("Approved: {}", task.description),
            ReviewVerdict::Reject(reason) => format!("Rejected: {} ({reason})", task.description),
        };
        self.post(
            run,
            Message::new(self.manager_name(), agent.name.clone(), MessageKind::Review, content),
        );
    }

    /// Enqueue the tasks a planner produced. Returns false if the run was
    /// stopped underneath us.
    fn expand_plan(&self, run: &Run, task: &Task, output: &str) -> bool {
        let Some(parsed) = plan::parse_plan(output) else {
            return true;
        };
        let expansion = plan::expand(
            &parsed,
            task.id,
            |name| self.registry.find_by_name(name).map(|a| a.role),
            self.config.review_tasks,
        );
        if !expansion.dropped.is_empty() {
            tracing::warn!(task = %task.id, dropped = ?expansion.dropped, "Plan entries dropped");
        }

        let mut enqueued = 0;
        for mut spec in expansion.specs {
            spec.role = self.serving_role(spec.role);
            match run.queue.enqueue(spec) {
                Ok(_) => enqueued += 1,
                Err(QueueError::Closed) => return false,
                Err(e) => tracing::warn!(task = %task.id, "Plan entry rejected: {e}"),
            }
        }
        tracing::info!(task = %task.id, enqueued, "Plan expanded");
        self.post(
            run,
            Message::new(
                self.manager_name(),
                "team",
                MessageKind::Status,
                format!("Planned {enqueued} tasks"),
            ),
        );
        true
    }

    /// The role a planned task should run under given who is on the team.
    fn serving_role(&self, wanted: Role) -> Role {
        if self.registry.can_serve(wanted) {
            return wanted;
        }
        let fallback = self
            .registry
            .snapshot()
            .into_iter()
            .find(|a| a.is_active && a.role != Role::Manager)
            .map(|a| a.role)
            .unwrap_or(Role::Manager);
        tracing::debug!(wanted = %wanted, fallback = %fallback, "Remapping unserved role");
        fallback
    }

    fn reject(&self, run: &Run, task: &Task, agent: &Agent, err: DispatchError) {
        let hint = match &err {
            DispatchError::Transient(ProviderError::RateLimited {
                retry_after: Some(after),
            }) => RetryHint::After(*after),
            e if e.is_retryable() => RetryHint::Backoff,
            _ => RetryHint::Never,
        };

        let outcome = match run.queue.fail(task.id, err.to_string(), hint) {
            Ok(outcome) => outcome,
            Err(QueueError::Closed) => {
                tracing::debug!(task = %task.id, "Queue closed, failure dropped");
                return;
            }
            Err(e) => {
                tracing::warn!(task = %task.id, "Cannot fail task: {e}");
                return;
            }
        };

        self.registry.mark_error(agent.id);
        self.agent_changed(agent.id);

        match outcome {
            FailOutcome::Retrying { attempt, delay } => {
                tracing::warn!(task = %task.id, agent = %agent.name, attempt, delay_ms = delay.as_millis() as u64, "Retrying task: {err}");
                self.monitor.record(MonitorEvent::Retry);
                self.events.publish(EngineEvent::TaskStatusChanged {
                    task: task.id,
                    status: TaskStatus::Pending,
                });
                self.events.publish(EngineEvent::TaskRetryScheduled {
                    task: task.id,
                    attempt,
                    delay,
                    error: err.to_string(),
                });
            }
            FailOutcome::Failed { cascaded } => {
                tracing::error!(task = %task.id, agent = %agent.name, cascaded = cascaded.len(), "Task failed: {err}");
                self.registry.update(agent.id, |a| a.ledger.tasks_failed += 1);
                let scored = match err {
                    DispatchError::Validation(_) => Outcome::Rejected,
                    _ => Outcome::Failed,
                };
                self.score(agent, scored);
                for id in std::iter::once(task.id).chain(cascaded) {
                    self.monitor.record(MonitorEvent::TaskFailed);
                    let error = run
                        .queue
                        .get(id)
                        .and_then(|t| t.error)
                        .unwrap_or_else(|| err.to_string());
                    self.events.publish(EngineEvent::TaskStatusChanged {
                        task: id,
                        status: TaskStatus::Failed,
                    });
                    self.events.publish(EngineEvent::TaskFailed { task: id, error });
                }
                self.post(
                    run,
                    Message::new(
                        agent.name.clone(),
                        self.manager_name(),
                        MessageKind::TaskFailure,
                        format!("Failed: {} ({err})", task.description),
                    ),
                );
            }
        }
    }

    fn score(&self, agent: &Agent, outcome: Outcome) {
        self.registry.update(agent.id, |a| {
            self.scoring.score(&mut a.ledger, outcome, a.manager.is_some());
        });
    }
}
