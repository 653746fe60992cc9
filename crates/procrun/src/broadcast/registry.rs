//! Subscriber registry and output log.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info};
use uuid::Uuid;

use super::types::OutputSubscription;

/// Registry of live subscribers plus the log they are replayed from.
///
/// The log and the subscriber set share one lock so a new subscriber gets
/// exactly the entries recorded before it joined and every entry after.
/// Deliveries are serialized by a second lock, taken before the state lock,
/// so every subscriber sees entries in log order.
pub(crate) struct BroadcastRegistry {
    state: Mutex<RegistryState>,
    delivery: Mutex<()>,
    capacity: usize,
    /// How long a full subscriber may hold up delivery before it is
    /// disconnected. `None` waits for it indefinitely.
    send_timeout: Option<Duration>,
}

struct RegistryState {
    log: Vec<String>,
    subscribers: HashMap<Uuid, mpsc::Sender<String>>,
    /// Set once the runner stopped or finished; no new live subscribers.
    closed: bool,
}

impl BroadcastRegistry {
    /// Create a registry whose subscribers buffer up to `capacity` live lines.
    pub fn new(capacity: usize, send_timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                log: Vec::new(),
                subscribers: HashMap::new(),
                closed: false,
            }),
            delivery: Mutex::new(()),
            capacity: capacity.max(1),
            send_timeout,
        }
    }

    /// Register a subscriber and queue the current backlog on it.
    ///
    /// After [`close`](Self::close) the subscriber only gets the backlog.
    pub async fn subscribe(&self) -> OutputSubscription {
        let mut state = self.state.lock().await;
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(state.log.len() + self.capacity);

        for entry in &state.log {
            // Capacity covers the whole backlog.
            let _ = tx.try_send(entry.clone());
        }

        if state.closed {
            debug!(subscriber = %id, backlog = state.log.len(), "Subscribed after close, backlog only");
        } else {
            state.subscribers.insert(id, tx);
            debug!(
                subscriber = %id,
                backlog = state.log.len(),
                subscribers = state.subscribers.len(),
                "Subscriber registered"
            );
        }

        OutputSubscription::new(id, rx)
    }

    /// Append an entry to the log and deliver it to every subscriber.
    ///
    /// A subscriber with a full buffer is waited on for up to the send
    /// timeout and disconnected after that. One whose receiver was dropped
    /// is removed. The state lock is not held while waiting, so `close`,
    /// `subscribe` and `log` never queue behind a slow subscriber.
    pub async fn publish(&self, entry: String) {
        let _delivery = self.delivery.lock().await;

        let targets: Vec<(Uuid, mpsc::Sender<String>)> = {
            let mut state = self.state.lock().await;
            state.log.push(entry.clone());
            state
                .subscribers
                .iter()
                .map(|(id, tx)| (*id, tx.clone()))
                .collect()
        };

        let mut gone = Vec::new();
        for (id, tx) in &targets {
            if !self.deliver(*id, tx, entry.clone()).await {
                gone.push(*id);
            }
        }

        if !gone.is_empty() {
            let mut state = self.state.lock().await;
            for id in &gone {
                state.subscribers.remove(id);
            }
        }
    }

    /// Hand one entry to one subscriber. Returns `false` when the
    /// subscriber should be removed.
    async fn deliver(&self, id: Uuid, tx: &mpsc::Sender<String>, entry: String) -> bool {
        let entry = match tx.try_send(entry) {
            Ok(()) => return true,
            Err(TrySendError::Closed(_)) => {
                debug!(subscriber = %id, "Subscriber dropped");
                return false;
            }
            Err(TrySendError::Full(entry)) => entry,
        };

        let Some(grace) = self.send_timeout else {
            if tx.send(entry).await.is_ok() {
                return true;
            }
            debug!(subscriber = %id, "Subscriber dropped");
            return false;
        };

        match tx.send_timeout(entry, grace).await {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                error!(
                    subscriber = %id,
                    timeout_ms = grace.as_millis(),
                    "Subscriber stalled with a full buffer, disconnecting"
                );
                false
            }
            Err(SendTimeoutError::Closed(_)) => {
                debug!(subscriber = %id, "Subscriber dropped");
                false
            }
        }
    }

    /// Close every subscriber channel and refuse new live subscribers.
    ///
    /// Returns the number of channels closed. Idempotent.
    pub async fn close(&self) -> usize {
        let mut state = self.state.lock().await;
        state.closed = true;
        let count = state.subscribers.len();
        state.subscribers.clear();
        drop(state);

        if count > 0 {
            info!(subscribers = count, "Closed subscriber channels");
        }
        count
    }

    /// The full log, entries concatenated in arrival order.
    pub async fn log(&self) -> String {
        self.state.lock().await.log.concat()
    }

    /// Number of registered subscribers whose receiver is still alive.
    pub async fn subscriber_count(&self) -> usize {
        let mut state = self.state.lock().await;
        state.subscribers.retain(|_, tx| !tx.is_closed());
        state.subscribers.len()
    }
}
