//! Lifecycle events for observers of pipeline runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{PipelineStatus, StageType};

/// Events kept for slow subscribers before they start lagging
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    TaskCreated,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    TaskTimeout,
    TaskCancelled,
}

/// One lifecycle event; `stage` is `None` for run-level events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub run_id: Uuid,
    pub kind: EventKind,
    pub stage: Option<StageType>,
    pub status: PipelineStatus,
    pub message: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl PipelineEvent {
    pub fn new(run_id: Uuid, kind: EventKind, stage: Option<StageType>, status: PipelineStatus) -> Self {
        Self {
            run_id,
            kind,
            stage,
            status,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// Broadcast channel for [`PipelineEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<PipelineEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Publish to current subscribers; without subscribers the event is dropped
    pub fn publish(&self, event: PipelineEvent) {
        tracing::trace!(kind = ?event.kind, stage = ?event.stage, "pipeline event");
        let _ = self.sender.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_without_subscribers() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish(PipelineEvent::new(
            Uuid::new_v4(),
            EventKind::TaskCreated,
            None,
            PipelineStatus::Pending,
        ));
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_in_order() {
        let bus = EventBus::new(8);
        let mut receiver = bus.subscribe();
        let run_id = Uuid::new_v4();

        bus.publish(PipelineEvent::new(run_id, EventKind::TaskCreated, None, PipelineStatus::Initializing));
        bus.publish(
            PipelineEvent::new(
                run_id,
                EventKind::TaskStarted,
                Some(StageType::PaperProcessing),
                PipelineStatus::ProcessingPaper,
            )
            .with_message("attempting"),
        );

        assert_eq!(receiver.recv().await.unwrap().kind, EventKind::TaskCreated);
        let started = receiver.recv().await.unwrap();
        assert_eq!(started.stage, Some(StageType::PaperProcessing));
        assert_eq!(started.message.as_deref(), Some("attempting"));
    }
}
