use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::device::Device;

const SUBSCRIBER_QUEUE_SIZE: usize = 256;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceEventKind {
    Added,
    Lost,
    StateChanged,
}

/// One registry change, carrying the device snapshot it applies to.
/// Immutable; subscribers cannot reach back into the publisher.
#[derive(Clone, Debug, Serialize)]
pub struct DeviceEvent {
    pub kind: DeviceEventKind,
    pub device: Device,
}

/// Publisher holding one bounded channel per subscriber. Publishing never
/// blocks: a subscriber that cannot keep up loses events (counted), and a
/// dropped receiver unsubscribes itself.
#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<mpsc::Sender<DeviceEvent>>>,
    dropped: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self) -> mpsc::Receiver<DeviceEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE_SIZE);
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    pub fn publish(&self, event: DeviceEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                debug!(
                    device = %event.device.id,
                    "device event dropped for slow subscriber"
                );
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }

    /// Events discarded because a subscriber's queue was full.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
