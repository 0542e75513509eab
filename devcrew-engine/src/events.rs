//! State-change events broadcast to observers.

use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::agent::AgentStatus;
use crate::ids::{AgentId, ProjectId, TaskId};
use crate::project::{Message, ProjectStatus};
use crate::task::TaskStatus;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    ProjectStatusChanged {
        project: ProjectId,
        status: ProjectStatus,
    },
    AgentStatusChanged {
        agent: AgentId,
        name: String,
        status: AgentStatus,
    },
    TaskStatusChanged {
        task: TaskId,
        status: TaskStatus,
    },
    TaskCompleted {
        task: TaskId,
        agent: String,
        files: Vec<String>,
    },
    TaskRetryScheduled {
        task: TaskId,
        attempt: u32,
        delay: Duration,
        error: String,
    },
    TaskFailed {
        task: TaskId,
        error: String,
    },
    MessageAppended(Message),
    FileProduced {
        path: String,
        bytes: usize,
    },
}

/// Fan-out publisher. Publishing never blocks; receivers that fall behind
/// skip ahead.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: EngineEvent) {
        // No receivers is fine.
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribers_see_events_in_order() {
        let bus = EventBus::new(8);
        let mut rx = bus.subscribe();
        let task = TaskId::new();
        bus.publish(EngineEvent::TaskStatusChanged {
            task,
            status: TaskStatus::Ready,
        });
        bus.publish(EngineEvent::TaskStatusChanged {
            task,
            status: TaskStatus::InProgress,
        });

        for expected in [TaskStatus::Ready, TaskStatus::InProgress] {
            match rx.recv().await.unwrap() {
                EngineEvent::TaskStatusChanged { status, .. } => assert_eq!(status, expected),
                other => panic!("unexpected event {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn lagging_receiver_skips_without_blocking_publisher() {
        let bus = EventBus::new(2);
        let mut rx = bus.subscribe();
        for n in 0..5 {
            bus.publish(EngineEvent::FileProduced {
                path: format!("f{n}.txt"),
                bytes: n,
            });
        }
        assert!(matches!(
            rx.recv().await,
            Err(broadcast::error::RecvError::Lagged(3))
        ));
        assert!(rx.recv().await.is_ok());
    }

    #[test]
    fn publish_without_subscribers_is_fine() {
        EventBus::new(1).publish(EngineEvent::TaskFailed {
            task: TaskId::new(),
            error: "x".into(),
        });
    }
}
