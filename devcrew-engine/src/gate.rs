//! Admission gate bounding concurrent provider calls.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::error::DispatchError;

/// Counting semaphore sized to the concurrency ceiling, with optional
/// per-minute pacing to smooth bursts.
pub struct AdmissionGate {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    in_flight: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
    spacing: Option<Duration>,
    next_slot: Mutex<Option<Instant>>,
}

/// Held for the duration of one provider call. Dropping it frees the slot
/// on every exit path.
#[derive(Debug)]
pub struct Permit {
    _permit: OwnedSemaphorePermit,
    in_flight: Arc<AtomicUsize>,
}

impl Drop for Permit {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

impl AdmissionGate {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            in_flight: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            spacing: None,
            next_slot: Mutex::new(None),
        }
    }

    /// Space admissions so no more than `per_minute` start in any minute.
    pub fn with_rate_limit(mut self, per_minute: Option<u32>) -> Self {
        self.spacing = per_minute
            .filter(|n| *n > 0)
            .map(|n| Duration::from_secs(60) / n);
        self
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of permits ever held at once.
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    /// Wait for a slot for at most `timeout`.
    pub async fn acquire(&self, timeout: Duration) -> Result<Permit, DispatchError> {
        let deadline = Instant::now() + timeout;
        let permit = tokio::time::timeout_at(deadline, self.semaphore.clone().acquire_owned())
            .await
            .map_err(|_| DispatchError::AdmissionTimeout(timeout))?
            .map_err(|_| DispatchError::Cancelled)?;

        if let Some(slot) = self.reserve_slot(deadline, timeout) {
            tokio::time::sleep_until(slot?).await;
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        tracing::debug!(in_flight = now, capacity = self.capacity, "Admission granted");
        Ok(Permit {
            _permit: permit,
            in_flight: self.in_flight.clone(),
        })
    }

    /// Reserve the next paced start time, if pacing is on. A slot past
    /// `deadline` is refused and left free for the next caller.
    fn reserve_slot(
        &self,
        deadline: Instant,
        timeout: Duration,
    ) -> Option<Result<Instant, DispatchError>> {
        let spacing = self.spacing?;
        let now = Instant::now();
        let mut next = self.next_slot.lock();
        let slot = next.filter(|at| *at > now).unwrap_or(now);
        if slot > deadline {
            return Some(Err(DispatchError::AdmissionTimeout(timeout)));
        }
        *next = Some(slot + spacing);
        Some(Ok(slot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn permits_are_bounded_and_released_on_drop() {
        let gate = AdmissionGate::new(2);
        let a = gate.acquire(Duration::from_secs(1)).await.unwrap();
        let _b = gate.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(gate.in_flight(), 2);

        let err = gate.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert_eq!(err, DispatchError::AdmissionTimeout(Duration::from_millis(50)));
        assert!(err.is_retryable());

        drop(a);
        assert_eq!(gate.in_flight(), 1);
        let _c = gate.acquire(Duration::from_secs(1)).await.unwrap();
        assert_eq!(gate.peak(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiter_is_admitted_when_a_slot_frees() {
        let gate = Arc::new(AdmissionGate::new(1));
        let held = gate.acquire(Duration::from_secs(1)).await.unwrap();

        let waiter = {
            let gate = gate.clone();
            tokio::spawn(async move { gate.acquire(Duration::from_secs(5)).await.is_ok() })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        drop(held);
        assert!(waiter.await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_spaces_admissions() {
        let gate = AdmissionGate::new(4).with_rate_limit(Some(60));
        let start = Instant::now();
        let _a = gate.acquire(Duration::from_secs(10)).await.unwrap();
        let _b = gate.acquire(Duration::from_secs(10)).await.unwrap();
        assert!(Instant::now() - start >= Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn refused_acquires_leave_the_pacing_schedule_alone() {
        let gate = AdmissionGate::new(4).with_rate_limit(Some(1));
        let _first = gate.acquire(Duration::from_secs(30)).await.unwrap();
        for _ in 0..3 {
            assert_eq!(
                gate.acquire(Duration::from_secs(30)).await.unwrap_err(),
                DispatchError::AdmissionTimeout(Duration::from_secs(30))
            );
        }

        tokio::time::advance(Duration::from_secs(61)).await;
        let start = Instant::now();
        assert!(gate.acquire(Duration::from_secs(30)).await.is_ok());
        assert_eq!(Instant::now(), start);
    }
}
