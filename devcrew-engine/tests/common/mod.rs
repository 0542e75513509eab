//! Shared fixtures: a scripted in-memory provider and fast configs.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use devcrew_engine::{EngineConfig, GenerateRequest, Provider, ProviderError};
use parking_lot::Mutex;
use tokio::time::Instant;

type Handler = dyn Fn(&GenerateRequest, usize) -> Result<String, ProviderError> + Send + Sync;

/// One provider call as seen by the scripted provider.
#[derive(Debug, Clone)]
pub struct Call {
    pub task: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Answers every request through a closure, after an optional delay, and
/// records concurrency.
pub struct ScriptedProvider {
    handler: Box<Handler>,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
    log: Mutex<Vec<Call>>,
}

impl ScriptedProvider {
    pub fn new(
        handler: impl Fn(&GenerateRequest, usize) -> Result<String, ProviderError> + Send + Sync + 'static,
    ) -> Self {
        Self {
            handler: Box::new(handler),
            delay: Duration::from_millis(50),
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            log: Mutex::new(Vec::new()),
        }
    }

    /// Every call produces one file named after the task.
    pub fn files() -> Self {
        Self::new(|req, _| Ok(file_output(&task_of(req))))
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub fn log(&self) -> Vec<Call> {
        self.log.lock().clone()
    }

    pub fn call_for(&self, task: &str) -> Option<Call> {
        self.log.lock().iter().find(|c| c.task == task).cloned()
    }
}

impl Provider for ScriptedProvider {
    async fn generate(&self, req: &GenerateRequest) -> Result<String, ProviderError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let started = Instant::now();

        tokio::time::sleep(self.delay).await;

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.log.lock().push(Call {
            task: task_of(req),
            started,
            finished: Instant::now(),
        });
        (self.handler)(req, n)
    }
}

/// The task description line of a prompt.
pub fn task_of(req: &GenerateRequest) -> String {
    let marker = if req.prompt.contains("# Your task\n") {
        "# Your task\n"
    } else {
        "# Review\n"
    };
    req.prompt
        .split(marker)
        .nth(1)
        .and_then(|rest| rest.lines().next())
        .unwrap_or_default()
        .trim()
        .to_string()
}

/// Output containing a single file block for `task`.
pub fn file_output(task: &str) -> String {
    let name: String = task
        .to_ascii_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    format!("Here it is.\n```python filename: src/{name}.py\nprint('generated for {task}')\n```\n")
}

/// Short ticks and backoff so scenarios finish quickly on a paused clock.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        max_concurrent_requests: 2,
        request_timeout_secs: 5,
        max_task_retries: 3,
        retry_base_delay_ms: 10,
        retry_max_delay_ms: 50,
        tick_interval_ms: 10,
        agent_recovery_ms: 10,
        review_tasks: false,
        ..EngineConfig::default()
    }
}
