//! Realtime subscription manager.
//!
//! Every `subscribe` call gets its own channel id and two tasks:
//!
//! - a reader that holds the transport connection, reconnects with
//!   jittered exponential backoff when it drops, filters events against the
//!   channel scope and pushes matches into a bounded queue;
//! - a dispatcher that drains the queue into the caller's callback.
//!
//! The queue is a tokio `broadcast` channel, so a slow callback loses the
//! oldest undelivered events rather than stalling the connection. Events
//! on one channel reach the callback in transport order.

mod ws;

pub use ws::WsTransport;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use campus_core::{ChangeEvent, ChangeTransport, ChannelSpec, RealtimeError};
use chrono::Utc;
use futures_util::StreamExt;
use rand::Rng;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{RealtimeSettings, ReconnectConfig};

/// Callback invoked for every matching change on a channel.
pub type ChangeCallback = Arc<dyn Fn(ChangeEvent) + Send + Sync>;

struct Subscription {
    spec: ChannelSpec,
    reader: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

impl Subscription {
    fn close(self) {
        self.reader.abort();
        self.dispatcher.abort();
    }
}

struct ManagerInner<T> {
    transport: Arc<T>,
    reconnect: ReconnectConfig,
    queue_capacity: usize,
    channels: Mutex<HashMap<String, Subscription>>,
    next_seq: AtomicU64,
}

impl<T> ManagerInner<T> {
    fn channels(&self) -> MutexGuard<'_, HashMap<String, Subscription>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<T> Drop for ManagerInner<T> {
    fn drop(&mut self) {
        for (_, subscription) in self.channels().drain() {
            subscription.close();
        }
    }
}

/// Registry of live channels over one [`ChangeTransport`].
pub struct RealtimeManager<T: ChangeTransport> {
    inner: Arc<ManagerInner<T>>,
}

impl<T: ChangeTransport> Clone for RealtimeManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: ChangeTransport> fmt::Debug for RealtimeManager<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RealtimeManager")
            .field("active", &self.active_count())
            .field("queue_capacity", &self.inner.queue_capacity)
            .finish()
    }
}

impl<T: ChangeTransport> RealtimeManager<T> {
    pub fn new(transport: T, settings: &RealtimeSettings, reconnect: ReconnectConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                transport: Arc::new(transport),
                reconnect,
                queue_capacity: settings.queue_capacity.clamp(1, usize::MAX / 2),
                channels: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    /// Open a channel for `spec` and return its id. The connection is made
    /// in the background; events emitted before it is up are not delivered.
    ///
    /// Must be called from within a tokio runtime.
    pub fn subscribe(&self, spec: ChannelSpec, callback: ChangeCallback) -> String {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let id = channel_id(&spec, Utc::now().timestamp_millis(), seq);

        let (tx, rx) = broadcast::channel(self.inner.queue_capacity);
        let dispatcher = tokio::spawn(dispatch(id.clone(), rx, callback));
        let reader = tokio::spawn(read_channel(
            id.clone(),
            Arc::clone(&self.inner.transport),
            spec.clone(),
            self.inner.reconnect.clone(),
            tx,
        ));

        info!(channel = %id, table = %spec.table, event = %spec.event, "Realtime subscription opened");
        self.inner.channels().insert(
            id.clone(),
            Subscription {
                spec,
                reader,
                dispatcher,
            },
        );
        id
    }

    /// Close one channel. Unknown ids are ignored; returns whether a channel
    /// was closed.
    pub fn unsubscribe(&self, id: &str) -> bool {
        let removed = self.inner.channels().remove(id);
        match removed {
            Some(subscription) => {
                subscription.close();
                info!(channel = %id, "Realtime subscription closed");
                true
            }
            None => false,
        }
    }

    /// Close every channel. Returns how many were open.
    pub fn unsubscribe_all(&self) -> usize {
        let drained: Vec<(String, Subscription)> = self.inner.channels().drain().collect();
        let count = drained.len();
        for (_, subscription) in drained {
            subscription.close();
        }
        if count > 0 {
            info!(count, "All realtime subscriptions closed");
        }
        count
    }

    pub fn active_count(&self) -> usize {
        self.inner.channels().len()
    }

    pub fn channel_spec(&self, id: &str) -> Option<ChannelSpec> {
        self.inner.channels().get(id).map(|s| s.spec.clone())
    }

    pub fn channel_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inner.channels().keys().cloned().collect();
        ids.sort();
        ids
    }
}

/// `{table}_{event}_{filter}_{unix ms}_{seq}`; the sequence keeps ids unique
/// within one millisecond.
fn channel_id(spec: &ChannelSpec, timestamp_ms: i64, seq: u64) -> String {
    let filter = spec
        .row_filter
        .as_ref()
        .map(|f| f.to_string())
        .unwrap_or_else(|| "all".to_string());
    format!("{}_{}_{}_{}_{}", spec.table, spec.event, filter, timestamp_ms, seq)
}

async fn read_channel<T: ChangeTransport>(
    id: String,
    transport: Arc<T>,
    spec: ChannelSpec,
    reconnect: ReconnectConfig,
    tx: broadcast::Sender<ChangeEvent>,
) {
    let mut backoff = reconnect.initial_ms;
    loop {
        match transport.connect(&spec).await {
            Ok(mut stream) => {
                debug!(channel = %id, "Realtime channel connected");
                backoff = reconnect.initial_ms;

                while let Some(item) = stream.next().await {
                    match item {
                        Ok(event) if spec.matches(&event) => {
                            // Err only when the dispatcher is gone
                            if tx.send(event).is_err() {
                                return;
                            }
                        }
                        Ok(_) => {}
                        Err(RealtimeError::Decode { reason }) => {
                            warn!(channel = %id, %reason, "Dropping undecodable change frame");
                        }
                        Err(err) => {
                            warn!(channel = %id, error = %err, "Realtime channel error");
                            break;
                        }
                    }
                }
                warn!(channel = %id, "Realtime channel disconnected");
            }
            Err(err) => {
                warn!(channel = %id, error = %err, retry_in_ms = backoff, "Realtime connect failed");
            }
        }

        let delay = jittered_backoff(backoff, reconnect.jitter_ms);
        tokio::time::sleep(Duration::from_millis(delay)).await;

        let next = (backoff as f64 * reconnect.multiplier) as u64;
        backoff = next.min(reconnect.max_ms);
    }
}

async fn dispatch(id: String, mut rx: broadcast::Receiver<ChangeEvent>, callback: ChangeCallback) {
    loop {
        match rx.recv().await {
            Ok(event) => callback(event),
            Err(RecvError::Lagged(skipped)) => {
                warn!(channel = %id, skipped, "Realtime queue full, dropped oldest events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

fn jittered_backoff(base_ms: u64, jitter_ms: u64) -> u64 {
    if jitter_ms == 0 {
        return base_ms;
    }
    let jitter = rand::rng().random_range(0..jitter_ms);
    base_ms.saturating_add(jitter)
}
