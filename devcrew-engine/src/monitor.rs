//! Running counters and latency percentiles for a process run.
//!
//! One monitor is constructed per run and shared by handle. Recording is a
//! handful of atomic adds plus a short lock on the latency window, so it never
//! stalls the scheduler.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// A point-in-time observation from the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MonitorEvent {
    CallStarted,
    CallFinished { latency: Duration, ok: bool },
    CacheHit,
    CacheMiss,
    Retry,
    TaskCompleted,
    TaskFailed,
    FileCreated,
    MessageSent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rating {
    Excellent,
    Good,
    Acceptable,
    Poor,
}

impl Rating {
    /// Rate `value` where lower is better.
    fn lower_is_better(value: f64, bounds: [f64; 3]) -> Self {
        match value {
            v if v <= bounds[0] => Rating::Excellent,
            v if v <= bounds[1] => Rating::Good,
            v if v <= bounds[2] => Rating::Acceptable,
            _ => Rating::Poor,
        }
    }

    /// Rate `value` where higher is better.
    fn higher_is_better(value: f64, bounds: [f64; 3]) -> Self {
        match value {
            v if v >= bounds[0] => Rating::Excellent,
            v if v >= bounds[1] => Rating::Good,
            v if v >= bounds[2] => Rating::Acceptable,
            _ => Rating::Poor,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Health {
    pub latency: Rating,
    pub success_rate: Rating,
    pub cache_hit_rate: Rating,
}

/// Immutable view of the monitor at one instant.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorSnapshot {
    pub uptime: Duration,
    pub calls_started: u64,
    pub calls_made: u64,
    pub calls_failed: u64,
    pub in_flight: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_hit_rate: f64,
    pub error_rate: f64,
    pub avg_latency: Duration,
    pub p50: Duration,
    pub p95: Duration,
    pub p99: Duration,
    pub retries: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub files_created: u64,
    pub messages_sent: u64,
}

impl MonitorSnapshot {
    pub fn success_rate(&self) -> f64 {
        1.0 - self.error_rate
    }

    pub fn health(&self) -> Health {
        Health {
            latency: Rating::lower_is_better(self.avg_latency.as_secs_f64(), [1.0, 2.0, 5.0]),
            success_rate: Rating::higher_is_better(self.success_rate(), [0.95, 0.90, 0.85]),
            cache_hit_rate: Rating::higher_is_better(self.cache_hit_rate, [0.80, 0.60, 0.40]),
        }
    }
}

pub struct PerformanceMonitor {
    started: Instant,
    window: usize,
    calls_started: AtomicU64,
    calls_made: AtomicU64,
    calls_failed: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    retries: AtomicU64,
    tasks_completed: AtomicU64,
    tasks_failed: AtomicU64,
    files_created: AtomicU64,
    messages_sent: AtomicU64,
    total_latency_us: AtomicU64,
    latencies: Mutex<VecDeque<Duration>>,
}

impl PerformanceMonitor {
    pub fn new(window: usize) -> Self {
        let window = window.max(1);
        Self {
            started: Instant::now(),
            window,
            calls_started: AtomicU64::new(0),
            calls_made: AtomicU64::new(0),
            calls_failed: AtomicU64::new(0),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            tasks_completed: AtomicU64::new(0),
            tasks_failed: AtomicU64::new(0),
            files_created: AtomicU64::new(0),
            messages_sent: AtomicU64::new(0),
            total_latency_us: AtomicU64::new(0),
            latencies: Mutex::new(VecDeque::with_capacity(window)),
        }
    }

    pub fn record(&self, event: MonitorEvent) {
        let bump = |c: &AtomicU64| {
            c.fetch_add(1, Ordering::Relaxed);
        };
        match event {
            MonitorEvent::CallStarted => bump(&self.calls_started),
            MonitorEvent::CallFinished { latency, ok } => {
                bump(&self.calls_made);
                if !ok {
                    bump(&self.calls_failed);
                }
                self.total_latency_us
                    .fetch_add(latency.as_micros() as u64, Ordering::Relaxed);
                let mut window = self.latencies.lock();
                if window.len() == self.window {
                    window.pop_front();
                }
                window.push_back(latency);
            }
            MonitorEvent::CacheHit => bump(&self.cache_hits),
            MonitorEvent::CacheMiss => bump(&self.cache_misses),
            MonitorEvent::Retry => bump(&self.retries),
            MonitorEvent::TaskCompleted => bump(&self.tasks_completed),
            MonitorEvent::TaskFailed => bump(&self.tasks_failed),
            MonitorEvent::FileCreated => bump(&self.files_created),
            MonitorEvent::MessageSent => bump(&self.messages_sent),
        }
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let calls_started = load(&self.calls_started);
        let calls_made = load(&self.calls_made);
        let calls_failed = load(&self.calls_failed);
        let cache_hits = load(&self.cache_hits);
        let cache_misses = load(&self.cache_misses);

        let mut sorted: Vec<Duration> = self.latencies.lock().iter().copied().collect();
        sorted.sort_unstable();

        let ratio = |num: u64, den: u64| if den == 0 { 0.0 } else { num as f64 / den as f64 };
        let avg_latency = if calls_made == 0 {
            Duration::ZERO
        } else {
            Duration::from_micros(load(&self.total_latency_us) / calls_made)
        };

        MonitorSnapshot {
            uptime: self.started.elapsed(),
            calls_started,
            calls_made,
            calls_failed,
            in_flight: calls_started.saturating_sub(calls_made),
            cache_hits,
            cache_misses,
            cache_hit_rate: ratio(cache_hits, cache_hits + cache_misses),
            error_rate: ratio(calls_failed, calls_made),
            avg_latency,
            p50: percentile(&sorted, 50),
            p95: percentile(&sorted, 95),
            p99: percentile(&sorted, 99),
            retries: load(&self.retries),
            tasks_completed: load(&self.tasks_completed),
            tasks_failed: load(&self.tasks_failed),
            files_created: load(&self.files_created),
            messages_sent: load(&self.messages_sent),
        }
    }
}

/// Nearest-rank percentile over an ascending slice.
fn percentile(sorted: &[Duration], pct: usize) -> Duration {
    if sorted.is_empty() {
        return Duration::ZERO;
    }
    let rank = (pct * sorted.len()).div_ceil(100).max(1);
    sorted[rank.min(sorted.len()) - 1]
}
