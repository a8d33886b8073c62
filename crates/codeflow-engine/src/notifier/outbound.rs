use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use codeflow_core::config::{NotifierConfig, RetryConfig};
use codeflow_core::event::{EventBus, Notification};
use codeflow_core::traits::EventChannel;

/// Outbound half of the notifier.
///
/// Every state change is published to the in-process [`EventBus`] right
/// away and queued for the external channel. Delivery to the channel never
/// blocks the caller: a full queue drops the event with a warning, and a
/// channel that stays down past the retry budget loses the event.
#[derive(Clone)]
pub struct Outbound {
    bus: Arc<EventBus>,
    queue: Option<mpsc::Sender<Notification>>,
}

impl Outbound {
    /// Publish to the in-process bus only.
    pub fn local(bus: Arc<EventBus>) -> Self {
        Self { bus, queue: None }
    }

    /// Publish to the bus and deliver to `channel` from a background worker.
    ///
    /// Must be called inside a tokio runtime. With `config.enabled = false`
    /// no worker is spawned and the channel is ignored.
    pub fn start(
        bus: Arc<EventBus>,
        channel: Arc<dyn EventChannel>,
        config: &NotifierConfig,
    ) -> (Self, Option<JoinHandle<()>>) {
        if !config.enabled {
            debug!(channel = channel.name(), "Outbound delivery disabled");
            return (Self::local(bus), None);
        }
        let (tx, rx) = mpsc::channel(config.buffer.max(1));
        let worker = tokio::spawn(delivery_worker(rx, channel, config.retry.clone()));
        (
            Self {
                bus,
                queue: Some(tx),
            },
            Some(worker),
        )
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn emit(&self, event: Notification) {
        let Some(queue) = &self.queue else {
            self.bus.publish(event);
            return;
        };
        self.bus.publish(event.clone());
        match queue.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                warn!(
                    event_type = %event.event_type,
                    entity_id = %event.entity_id,
                    "Outbound queue full, dropping event"
                );
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound worker stopped, event kept on local bus only");
            }
        }
    }
}

/// Drains the queue in order, so events for one entity reach the channel in
/// the order they were emitted.
async fn delivery_worker(
    mut rx: mpsc::Receiver<Notification>,
    channel: Arc<dyn EventChannel>,
    retry: RetryConfig,
) {
    while let Some(event) = rx.recv().await {
        deliver(channel.as_ref(), &event, &retry).await;
    }
    debug!(channel = channel.name(), "Outbound worker exiting");
}

async fn deliver(channel: &dyn EventChannel, event: &Notification, retry: &RetryConfig) -> bool {
    for attempt in 0..=retry.max_retries {
        match channel.publish(event).await {
            Ok(()) => return true,
            Err(e) if attempt < retry.max_retries => {
                let backoff = calculate_backoff(attempt, retry);
                warn!(
                    channel = channel.name(),
                    attempt = attempt + 1,
                    max_retries = retry.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %e,
                    "Retrying event delivery"
                );
                tokio::time::sleep(backoff).await;
            }
            Err(e) => {
                warn!(
                    channel = channel.name(),
                    event_type = %event.event_type,
                    entity_id = %event.entity_id,
                    error = %e,
                    "Dropping event after exhausting retries"
                );
            }
        }
    }
    false
}

fn calculate_backoff(attempt: u32, config: &RetryConfig) -> Duration {
    let ms = config
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(config.max_backoff_ms);
    // Jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
