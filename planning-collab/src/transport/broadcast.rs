//! In-process fan-out with per-subscriber bounded channels.
//!
//! Every subscriber owns a bounded `mpsc` queue. Publishing awaits room in
//! each queue, so a slow subscriber slows its publisher down instead of
//! growing memory. A subscriber that stays full past `send_timeout` misses
//! that event; the miss is counted and logged.
//!
//! ```text
//!                       ┌──► [queue] ──► subscriber A
//! publish(channel) ─────┼──► [queue] ──► subscriber B
//!                       └──► [queue] ──► subscriber C
//! ```

use futures_util::future::BoxFuture;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{EventType, RealtimeEvent, Subscription, Transport, TransportError};

/// Snapshot of transport counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    pub events_published: u64,
    pub events_dropped: u64,
    pub subscribers: usize,
    pub channels: usize,
}

/// Lock-free counters on the publish path.
struct AtomicTransportStats {
    events_published: AtomicU64,
    events_dropped: AtomicU64,
}

struct Subscriber {
    sender: mpsc::Sender<Arc<RealtimeEvent>>,
    /// Empty = every event type.
    event_types: Vec<EventType>,
}

impl Subscriber {
    fn wants(&self, event_type: EventType) -> bool {
        self.event_types.is_empty() || self.event_types.contains(&event_type)
    }
}

type ChannelMap = HashMap<String, HashMap<Uuid, Subscriber>>;

pub struct LocalTransport {
    channels: RwLock<ChannelMap>,
    capacity: usize,
    send_timeout: Duration,
    stats: AtomicTransportStats,
}

impl LocalTransport {
    pub fn new(capacity: usize, send_timeout: Duration) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            send_timeout,
            stats: AtomicTransportStats {
                events_published: AtomicU64::new(0),
                events_dropped: AtomicU64::new(0),
            },
        }
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        channels.get(channel).map_or(0, |subs| subs.len())
    }

    pub fn stats(&self) -> TransportStats {
        let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
        TransportStats {
            events_published: self.stats.events_published.load(Ordering::Relaxed),
            events_dropped: self.stats.events_dropped.load(Ordering::Relaxed),
            subscribers: channels.values().map(HashMap::len).sum(),
            channels: channels.len(),
        }
    }

    /// Drop subscribers whose receiving end went away, and empty channels.
    fn prune(&self, channel: &str, closed: &[Uuid]) {
        if closed.is_empty() {
            return;
        }
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(subs) = channels.get_mut(channel) {
            for id in closed {
                subs.remove(id);
            }
            if subs.is_empty() {
                channels.remove(channel);
            }
        }
        log::debug!("Pruned {} closed subscribers from {channel}", closed.len());
    }
}

impl Default for LocalTransport {
    fn default() -> Self {
        Self::new(256, Duration::from_secs(5))
    }
}

impl Transport for LocalTransport {
    fn subscribe(&self, channel: &str, event_types: &[EventType]) -> Subscription {
        let (sender, receiver) = mpsc::channel(self.capacity);
        let id = Uuid::new_v4();
        let mut channels = self.channels.write().unwrap_or_else(PoisonError::into_inner);
        channels
            .entry(channel.to_string())
            .or_default()
            .insert(id, Subscriber { sender, event_types: event_types.to_vec() });
        Subscription::new(id, channel.to_string(), receiver)
    }

    fn publish<'a>(&'a self, channel: &'a str, event: RealtimeEvent) -> BoxFuture<'a, Result<usize, TransportError>> {
        Box::pin(async move {
            let targets: Vec<(Uuid, mpsc::Sender<Arc<RealtimeEvent>>)> = {
                let channels = self.channels.read().unwrap_or_else(PoisonError::into_inner);
                channels
                    .get(channel)
                    .map(|subs| {
                        subs.iter()
                            .filter(|(_, s)| s.wants(event.event_type))
                            .map(|(id, s)| (*id, s.sender.clone()))
                            .collect()
                    })
                    .unwrap_or_default()
            };

            let event = Arc::new(event);
            let mut delivered = 0;
            let mut closed = Vec::new();

            for (id, sender) in targets {
                match tokio::time::timeout(self.send_timeout, sender.send(event.clone())).await {
                    Ok(Ok(())) => delivered += 1,
                    Ok(Err(_)) => closed.push(id),
                    Err(_) => {
                        self.stats.events_dropped.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Subscriber {id} on {channel} is full, dropped {:?}", event.event_type);
                    }
                }
            }

            self.prune(channel, &closed);
            self.stats.events_published.fetch_add(1, Ordering::Relaxed);
            Ok(delivered)
        })
    }
}
