//! Event publisher: durable append plus live broadcast.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use grav_core::{
    DeliveryMode, EventSink, StreamBackend, StreamEvent, StreamSettings, ThreadLocks,
};

use crate::error::{StreamError, StreamResult};
use crate::log::{EventFrame, EventLog, FileEventLog, InMemoryEventLog};
use crate::registry::{PatternSubscription, SubscriberRegistry};
use crate::subscription::Subscription;

/// Publishes workflow events to a durable log and to live subscribers.
///
/// Without a log the publisher runs degraded: events reach whoever is
/// listening at that moment and nothing is replayed.
pub struct EventPublisher {
    log: Option<Arc<dyn EventLog>>,
    registry: Arc<SubscriberRegistry>,
    delivery_mode: DeliveryMode,
    ordering: ThreadLocks,
}

impl EventPublisher {
    pub fn new(
        log: Option<Arc<dyn EventLog>>,
        delivery_mode: DeliveryMode,
        channel_capacity: usize,
    ) -> Self {
        Self {
            log,
            registry: Arc::new(SubscriberRegistry::new(channel_capacity)),
            delivery_mode,
            ordering: ThreadLocks::new(),
        }
    }

    /// Build from settings. A log that cannot be opened puts the
    /// publisher in degraded mode instead of failing.
    pub fn from_settings(settings: &StreamSettings, data_dir: &Path) -> Self {
        let ttl = Duration::from_secs(settings.ttl_secs);
        let log: Option<Arc<dyn EventLog>> = if !settings.enabled {
            info!("Durable event log disabled; live delivery only");
            None
        } else {
            match settings.backend {
                StreamBackend::Memory => {
                    Some(Arc::new(InMemoryEventLog::new(settings.max_length, ttl)))
                }
                StreamBackend::File => {
                    match FileEventLog::open(data_dir, settings.max_length, ttl) {
                        Ok(log) => Some(Arc::new(log)),
                        Err(e) => {
                            error!("Event log unavailable, running live-only: {}", e);
                            None
                        }
                    }
                }
            }
        };
        Self::new(log, settings.delivery_mode, settings.channel_capacity)
    }

    pub fn delivery_mode(&self) -> DeliveryMode {
        self.delivery_mode
    }

    /// Whether events are durably logged.
    pub fn is_durable(&self) -> bool {
        self.log.is_some()
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Append and broadcast one event. Failures are logged, never raised.
    pub async fn publish_event(&self, event: StreamEvent) {
        // Append and broadcast happen under the thread's lock so live
        // frames reach subscribers in message id order.
        let _guard = self.ordering.acquire(&event.thread_id).await;

        let message_id = match &self.log {
            Some(log) => match log.append(&event).await {
                Ok(id) => Some(id),
                Err(e) => {
                    warn!(
                        "Failed to log event on {}: {}; delivering live only",
                        event.channel(),
                        e
                    );
                    None
                }
            },
            None => None,
        };

        debug!("Publishing {} (id {:?})", event.channel(), message_id);
        self.registry.broadcast(
            EventFrame::live(message_id, event),
            self.delivery_mode == DeliveryMode::Legacy,
        );
    }

    /// Subscribe to a thread.
    ///
    /// Without `from_message_id` the retained log is replayed first, marked
    /// historical. With it, only entries after that id are delivered.
    pub async fn subscribe(
        &self,
        thread_id: &str,
        from_message_id: Option<u64>,
    ) -> StreamResult<Subscription> {
        // Live first, so nothing published during the log read is missed
        let live = self.registry.subscribe(thread_id);

        let backlog = match &self.log {
            Some(log) => {
                let historical = from_message_id.is_none();
                log.read_after(thread_id, from_message_id)
                    .await?
                    .into_iter()
                    .map(|entry| EventFrame::from_logged(entry, historical))
                    .collect()
            }
            None => Vec::new(),
        };
        debug!(
            "Subscribed to thread {} (offset {:?}, {} backlog)",
            thread_id,
            from_message_id,
            backlog.len()
        );

        Ok(Subscription::new(
            thread_id,
            backlog,
            live,
            from_message_id.unwrap_or(0),
            self.log.clone(),
        ))
    }

    /// Subscribe to a wildcard channel pattern. Legacy delivery only.
    pub fn psubscribe(&self, pattern: &str) -> StreamResult<PatternSubscription> {
        if self.delivery_mode != DeliveryMode::Legacy {
            return Err(StreamError::PatternsDisabled);
        }
        self.registry.psubscribe(pattern)
    }

    /// Retained events of a thread after an optional id.
    pub async fn history(
        &self,
        thread_id: &str,
        after: Option<u64>,
    ) -> StreamResult<Vec<EventFrame>> {
        let Some(log) = &self.log else {
            return Ok(Vec::new());
        };
        Ok(log
            .read_after(thread_id, after)
            .await?
            .into_iter()
            .map(|entry| EventFrame::from_logged(entry, true))
            .collect())
    }

    /// Drop a thread's retained log and end its live subscriptions.
    pub async fn delete_thread(&self, thread_id: &str) -> StreamResult<usize> {
        self.registry.close(thread_id);
        match &self.log {
            Some(log) => log.delete(thread_id).await,
            None => Ok(0),
        }
    }
}

#[async_trait]
impl EventSink for EventPublisher {
    async fn publish(&self, event: StreamEvent) {
        self.publish_event(event).await;
    }
}
