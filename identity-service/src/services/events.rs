//! Fire-and-forget domain event publishing.

use async_trait::async_trait;
use std::sync::Mutex;

use super::redis::RedisService;
use crate::models::{DomainEvent, EventType};

#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Hand the event off. Delivery failures are logged, never returned.
    async fn publish(&self, event: DomainEvent);
}

#[async_trait]
impl EventPublisher for RedisService {
    async fn publish(&self, event: DomainEvent) {
        let mut conn = self.connection();
        tokio::spawn(async move {
            let channel = event.channel();
            let payload = match serde_json::to_string(&event) {
                Ok(payload) => payload,
                Err(e) => {
                    tracing::warn!(event_type = event.event_type.as_str(), "Failed to encode event: {}", e);
                    return;
                }
            };

            let result: Result<i64, _> = redis::cmd("PUBLISH")
                .arg(&channel)
                .arg(payload)
                .query_async(&mut conn)
                .await;

            match result {
                Ok(receivers) => {
                    tracing::debug!(channel = %channel, receivers, event_id = %event.event_id, "Event published");
                }
                Err(e) => {
                    tracing::warn!(channel = %channel, event_id = %event.event_id, "Failed to publish event: {}", e);
                }
            }
        });
    }
}

/// Records published events for assertions.
#[derive(Default)]
pub struct MockEventPublisher {
    pub events: Mutex<Vec<DomainEvent>>,
}

impl MockEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<DomainEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn count(&self, event_type: EventType) -> usize {
        self.published()
            .iter()
            .filter(|e| e.event_type == event_type)
            .count()
    }
}

#[async_trait]
impl EventPublisher for MockEventPublisher {
    async fn publish(&self, event: DomainEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }
}
