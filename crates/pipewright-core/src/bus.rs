//! In-process event bus backed by a tokio broadcast channel.

use crate::events::{Event, subject_matches};
use crate::ports::{EventBus, EventStream};
use crate::{Error, Result};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::trace;

const DEFAULT_CAPACITY: usize = 1024;

/// Event bus delivering every published event to all live subscribers.
/// Slow subscribers that fall behind by more than the capacity receive an
/// `EventBus` error and continue from the oldest retained event.
#[derive(Debug, Clone)]
pub struct BroadcastEventBus {
    sender: broadcast::Sender<Event>,
}

impl BroadcastEventBus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Raw receiver for every event, unfiltered.
    pub fn receiver(&self) -> broadcast::Receiver<Event> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastEventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventBus for BroadcastEventBus {
    async fn publish(&self, event: Event) -> Result<()> {
        trace!(subject = %event.subject(), "Publishing event");
        // No subscribers is not an error.
        let _ = self.sender.send(event);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<EventStream> {
        let pattern = pattern.to_string();
        let stream = futures::stream::unfold(self.sender.subscribe(), |mut rx| async move {
            match rx.recv().await {
                Ok(event) => Some((Ok(event), rx)),
                Err(RecvError::Lagged(missed)) => Some((
                    Err(Error::EventBus(format!("subscriber lagged by {missed} events"))),
                    rx,
                )),
                Err(RecvError::Closed) => None,
            }
        })
        .filter(move |item| {
            let keep = match item {
                Ok(event) => subject_matches(&pattern, &event.subject()),
                Err(_) => true,
            };
            futures::future::ready(keep)
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RunCancelledPayload;
    use crate::ids::RunId;
    use chrono::Utc;

    fn cancelled(run_id: RunId) -> Event {
        Event::RunCancelled(RunCancelledPayload {
            run_id,
            pipeline: "ci".to_string(),
            cancelled_at: Utc::now(),
        })
    }

    #[tokio::test]
    async fn test_subscribe_filters_by_subject() {
        let bus = BroadcastEventBus::new();
        let wanted = RunId::new();
        let mut stream = bus.subscribe(&format!("run.{wanted}.>")).await.unwrap();

        bus.publish(cancelled(RunId::new())).await.unwrap();
        bus.publish(cancelled(wanted)).await.unwrap();

        let event = stream.next().await.unwrap().unwrap();
        assert_eq!(event.run_id(), wanted);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let bus = BroadcastEventBus::new();
        assert!(bus.publish(cancelled(RunId::new())).await.is_ok());
    }
}
