//! Persistence-before-delivery event pipeline. [`EventProducer`] is the
//! only thing Admission and the Supervisor call directly — it writes the
//! durable record and returns. Nothing is delivered synchronously.
//! [`DeliveryWorker`] is a separate sweep that resolves subscriptions and
//! performs the webhook HTTP calls, so a delivery failure can never make
//! a state transition itself look like it failed.

use std::sync::Arc;
use std::time::Duration;

use orchestrator_store::Store;
use orchestrator_types::{
    ResourceId, StateChangeEvent, StateChangeEventData, Subscription, common::now_ms,
};
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub struct EventProducer {
    store: Arc<dyn Store>,
    notify: Arc<tokio::sync::Notify>,
}

impl EventProducer {
    pub fn new(store: Arc<dyn Store>, notify: Arc<tokio::sync::Notify>) -> Self {
        EventProducer { store, notify }
    }

    /// Records one resource's transition and wakes the delivery sweep.
    /// The caller is responsible for having already persisted the state
    /// change itself; this only appends to the event log.
    pub async fn emit(
        &self,
        event_type: impl Into<String>,
        data: StateChangeEventData,
        request_id: Option<String>,
    ) -> Result<StateChangeEvent> {
        let event = StateChangeEvent {
            id: ResourceId::new(),
            timestamp: now_ms(),
            event_type: event_type.into(),
            data,
            request_id,
            delivered: false,
        };
        let event = self.store.create_event(event).await?;
        self.notify.notify_waiters();
        Ok(event)
    }
}

/// Polls undelivered events and fans each one out to the subscriptions
/// that match its owner and event type. An event is marked delivered once
/// every matching subscription at the time of the sweep has accepted it;
/// a subscription whose POST failed is left to be retried on the next
/// sweep along with the event itself.
pub struct DeliveryWorker {
    store: Arc<dyn Store>,
    client: reqwest::Client,
    batch_size: i64,
    tick: Duration,
}

impl DeliveryWorker {
    pub fn new(store: Arc<dyn Store>, batch_size: i64, tick: Duration) -> Self {
        DeliveryWorker {
            store,
            client: reqwest::Client::new(),
            batch_size,
            tick,
        }
    }

    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.tick);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("event delivery worker shutting down");
                    return;
                }
                _ = ticker.tick() => {}
            }
            if let Err(e) = self.sweep().await {
                tracing::warn!(%e, "event delivery sweep failed");
            }
        }
    }

    pub async fn sweep(&self) -> anyhow::Result<()> {
        let events = self.store.list_undelivered_events(self.batch_size).await?;
        for event in events {
            self.deliver(&event).await?;
        }
        Ok(())
    }

    async fn deliver(&self, event: &StateChangeEvent) -> anyhow::Result<()> {
        let subs = self
            .store
            .subscriptions_for(&event.data.owner_id, &event.event_type)
            .await?;
        if subs.is_empty() {
            self.store.mark_event_delivered(&event.id).await?;
            return Ok(());
        }

        let mut all_succeeded = true;
        for sub in subs {
            if self.deliver_to(&sub, event).await {
                self.record_success(sub).await?;
            } else {
                all_succeeded = false;
                self.record_failure(sub).await?;
            }
        }
        if all_succeeded {
            self.store.mark_event_delivered(&event.id).await?;
        }
        Ok(())
    }

    async fn deliver_to(&self, sub: &Subscription, event: &StateChangeEvent) -> bool {
        let mut req = self.client.post(&sub.url).json(event);
        for header in &sub.headers {
            let Some(value) = header.value.value.clone().or_else(|| {
                header
                    .value
                    .secret_name
                    .as_ref()
                    .and_then(|name| std::env::var(name).ok())
            }) else {
                continue;
            };
            req = req.header(&header.key, value);
        }
        match req.send().await {
            Ok(resp) if resp.status().is_success() => true,
            Ok(resp) => {
                tracing::warn!(url = %sub.url, status = %resp.status(), "subscription delivery rejected");
                false
            }
            Err(e) => {
                tracing::warn!(url = %sub.url, %e, "subscription delivery failed");
                false
            }
        }
    }

    async fn record_success(&self, mut sub: Subscription) -> anyhow::Result<()> {
        let now = now_ms();
        sub.last_delivery_attempt_at = now;
        sub.last_delivery_success_at = now;
        sub.failure_count = 0;
        self.store.update_subscription(sub).await?;
        Ok(())
    }

    async fn record_failure(&self, mut sub: Subscription) -> anyhow::Result<()> {
        sub.last_delivery_attempt_at = now_ms();
        sub.failure_count += 1;
        self.store.update_subscription(sub).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchestrator_store::memory::MemoryStore;
    use orchestrator_types::{CreateSubscriptionRequest, SubscriptionHeader, common::EnvVar};

    #[tokio::test]
    async fn emit_persists_an_undelivered_event() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let producer = EventProducer::new(store.clone(), Arc::new(tokio::sync::Notify::new()));
        let event = producer
            .emit(
                "installation.state_changed",
                StateChangeEventData {
                    resource_type: "installation".to_string(),
                    resource_id: "installation1".into(),
                    owner_id: "owner1".to_string(),
                    old_state: "stable".to_string(),
                    new_state: "update-requested".to_string(),
                },
                Some("req-1".to_string()),
            )
            .await
            .unwrap();
        assert!(!event.delivered);
        let undelivered = store.list_undelivered_events(10).await.unwrap();
        assert_eq!(undelivered.len(), 1);
    }

    #[tokio::test]
    async fn sweep_marks_delivered_when_no_subscriptions_match() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        let producer = EventProducer::new(store.clone(), Arc::new(tokio::sync::Notify::new()));
        producer
            .emit(
                "cluster.state_changed",
                StateChangeEventData {
                    resource_type: "cluster".to_string(),
                    resource_id: "cluster1".into(),
                    owner_id: "system".to_string(),
                    old_state: "stable".to_string(),
                    new_state: "upgrade-requested".to_string(),
                },
                None,
            )
            .await
            .unwrap();
        let worker = DeliveryWorker::new(store.clone(), 10, Duration::from_secs(5));
        worker.sweep().await.unwrap();
        assert!(store.list_undelivered_events(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_delivery_leaves_event_undelivered_and_bumps_failure_count() {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::default());
        store
            .create_subscription(CreateSubscriptionRequest {
                owner_id: "owner1".to_string(),
                url: "http://127.0.0.1:1/unreachable".to_string(),
                headers: vec![SubscriptionHeader {
                    key: "X-Token".to_string(),
                    value: EnvVar::value("secret-value"),
                }],
                event_type: None,
                failure_threshold_ms: 1_000,
            })
            .await
            .unwrap();
        let producer = EventProducer::new(store.clone(), Arc::new(tokio::sync::Notify::new()));
        producer
            .emit(
                "installation.state_changed",
                StateChangeEventData {
                    resource_type: "installation".to_string(),
                    resource_id: "installation1".into(),
                    owner_id: "owner1".to_string(),
                    old_state: "stable".to_string(),
                    new_state: "update-requested".to_string(),
                },
                None,
            )
            .await
            .unwrap();
        let worker = DeliveryWorker::new(store.clone(), 10, Duration::from_secs(5));
        worker.sweep().await.unwrap();
        assert_eq!(store.list_undelivered_events(10).await.unwrap().len(), 1);
        let subs = store.subscriptions_for("owner1", "installation.state_changed").await.unwrap();
        assert_eq!(subs[0].failure_count, 1);
    }
}
