use serde::{Deserialize, Serialize};

/// # NDOC
/// component: `subsystems::change_tracking::events`
/// purpose: Wire contracts for the three ingress events named in spec.md §6. The durable queue
///   that delivers these is an out-of-scope collaborator (spec.md §1); this module exists so a
///   real queue runtime has a stable, typed payload to serialize against, and so the scheduler
///   and orchestrator agree on one shape instead of each inventing their own.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisCreatedEvent {
    pub analysis_id: String,
    pub url: String,
    pub parent_analysis_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployDetectedEvent {
    pub deploy_id: String,
    pub repo_id: String,
    pub user_id: String,
    pub commit_sha: String,
    pub full_name: String,
}

/// The on-demand checkpoint trigger carries no payload (spec.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointsRunEvent;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum IngressEvent {
    AnalysisCreated(AnalysisCreatedEvent),
    DeployDetected(DeployDetectedEvent),
    CheckpointsRun(CheckpointsRunEvent),
}

/// # NDOC
/// component: `subsystems::change_tracking::events`
/// purpose: Narrow publish surface so the scheduler's fan-out can be unit-tested without a real
///   queue: `InMemoryEventPublisher` records what would have been published, in order.
pub trait EventPublisher: Send + Sync {
    fn publish(&self, event: IngressEvent);
}

#[derive(Default)]
pub struct InMemoryEventPublisher {
    published: std::sync::Mutex<Vec<IngressEvent>>,
}

impl InMemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn drain(&self) -> Vec<IngressEvent> {
        std::mem::take(&mut self.published.lock().expect("publisher lock poisoned"))
    }
}

impl EventPublisher for InMemoryEventPublisher {
    fn publish(&self, event: IngressEvent) {
        self.published
            .lock()
            .expect("publisher lock poisoned")
            .push(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn in_memory_publisher_records_events_in_order() {
        let publisher = InMemoryEventPublisher::new();
        publisher.publish(IngressEvent::CheckpointsRun(CheckpointsRunEvent));
        publisher.publish(IngressEvent::AnalysisCreated(AnalysisCreatedEvent {
            analysis_id: "an_1".to_string(),
            url: "https://example.test".to_string(),
            parent_analysis_id: None,
        }));
        let drained = publisher.drain();
        assert_eq!(drained.len(), 2);
        assert!(publisher.drain().is_empty());
    }
}
