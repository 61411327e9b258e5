//! Household-partitioned event fan-out.
//!
//! The registry is a read-mostly map of household to [`HouseholdChannel`]; each channel
//! owns its own lock, so a broadcast only touches the subscribers of one household.
//! Sinks are written with [`EventSink::try_deliver`], which never blocks: a full sink
//! skips the event, a closed or failing sink is evicted on the spot.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use roomies_shared::api::{BrokerMetricsDto, EventPayload, HouseholdConnectionsDto, ServerEvent};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// The sink is full; this event is skipped for it.
    #[error("sink saturated")]
    Saturated,
    #[error("sink closed")]
    Closed,
    #[error("delivery failed: {0}")]
    Failed(String),
}

/// A connection-level consumer of events. Implementations must not block.
pub trait EventSink: Send + Sync {
    fn try_deliver(&self, event: Arc<ServerEvent>) -> Result<(), DeliveryError>;
}

impl EventSink for mpsc::Sender<Arc<ServerEvent>> {
    fn try_deliver(&self, event: Arc<ServerEvent>) -> Result<(), DeliveryError> {
        self.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Saturated,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }
}

#[derive(Default)]
struct HouseholdChannel {
    subscribers: Mutex<HashMap<String, Arc<dyn EventSink>>>,
}

impl HouseholdChannel {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<dyn EventSink>>> {
        self.subscribers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Default)]
struct Counters {
    connected: AtomicU64,
    dropped: AtomicU64,
    skipped: AtomicU64,
    delivered: AtomicU64,
}

#[derive(Clone, Default)]
pub struct EventBroker {
    inner: Arc<BrokerInner>,
}

#[derive(Default)]
struct BrokerInner {
    // Lock order: registry before any channel.
    registry: RwLock<HashMap<String, Arc<HouseholdChannel>>>,
    counters: Counters,
}

impl EventBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sink` under `connection_id`. A repeated id replaces the previous sink.
    pub fn subscribe(&self, household_id: &str, connection_id: &str, sink: Arc<dyn EventSink>) {
        let replaced = {
            let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry
                .get(household_id)
                .map(|channel| channel.lock().insert(connection_id.to_string(), sink.clone()))
        };
        let replaced = match replaced {
            Some(previous) => previous,
            None => {
                let mut registry = self
                    .inner
                    .registry
                    .write()
                    .unwrap_or_else(PoisonError::into_inner);
                let channel = registry.entry(household_id.to_string()).or_default();
                channel.lock().insert(connection_id.to_string(), sink)
            }
        };
        if replaced.is_none() {
            self.inner.counters.connected.fetch_add(1, Ordering::Relaxed);
        }
        debug!(household_id = %household_id, connection_id = %connection_id, "broker: subscribed");
    }

    /// Remove a connection. Returns `false` if it was not (or no longer) registered.
    pub fn unsubscribe(&self, household_id: &str, connection_id: &str) -> bool {
        let removed = self.remove(household_id, connection_id, None);
        if removed {
            debug!(household_id = %household_id, connection_id = %connection_id, "broker: unsubscribed");
        }
        removed
    }

    /// Deliver `payload` to every current subscriber of `household_id`.
    /// Returns the number of sinks that accepted it.
    pub fn broadcast(&self, household_id: &str, payload: EventPayload) -> usize {
        let snapshot: Vec<(String, Arc<dyn EventSink>)> = {
            let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
            let Some(channel) = registry.get(household_id) else {
                trace!(household_id = %household_id, event = payload.name(), "broker: no subscribers");
                return 0;
            };
            channel
                .lock()
                .iter()
                .map(|(id, sink)| (id.clone(), sink.clone()))
                .collect()
        };

        let event = Arc::new(ServerEvent::new(payload));
        let mut delivered = 0;
        for (connection_id, sink) in snapshot {
            match sink.try_deliver(event.clone()) {
                Ok(()) => delivered += 1,
                Err(DeliveryError::Saturated) => {
                    self.inner.counters.skipped.fetch_add(1, Ordering::Relaxed);
                    debug!(
                        household_id = %household_id,
                        connection_id = %connection_id,
                        event = event.name(),
                        "broker: sink saturated; event skipped"
                    );
                }
                Err(e) => {
                    // The id may have been re-subscribed since the snapshot; only the
                    // failing sink itself is evicted.
                    if self.remove(household_id, &connection_id, Some(&sink)) {
                        self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
                        warn!(
                            household_id = %household_id,
                            connection_id = %connection_id,
                            error = %e,
                            "broker: evicting connection"
                        );
                    }
                }
            }
        }
        self.inner
            .counters
            .delivered
            .fetch_add(delivered as u64, Ordering::Relaxed);
        delivered
    }

    pub fn live_connections(&self, household_id: &str) -> usize {
        let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
        registry
            .get(household_id)
            .map(|channel| channel.lock().len())
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> BrokerMetricsDto {
        let mut households: Vec<HouseholdConnectionsDto> = {
            let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
            registry
                .iter()
                .map(|(id, channel)| HouseholdConnectionsDto {
                    household_id: id.clone(),
                    live: channel.lock().len(),
                })
                .collect()
        };
        households.sort_by(|a, b| a.household_id.cmp(&b.household_id));
        let c = &self.inner.counters;
        BrokerMetricsDto {
            live_connections: households.iter().map(|h| h.live).sum(),
            households,
            total_connected: c.connected.load(Ordering::Relaxed),
            total_dropped: c.dropped.load(Ordering::Relaxed),
            total_skipped: c.skipped.load(Ordering::Relaxed),
            total_delivered: c.delivered.load(Ordering::Relaxed),
        }
    }

    /// Connected -> Removed. Only the first caller for a connection sees `true`.
    /// With `expected`, the entry is removed only while it still holds that sink.
    fn remove(
        &self,
        household_id: &str,
        connection_id: &str,
        expected: Option<&Arc<dyn EventSink>>,
    ) -> bool {
        let (removed, now_empty) = {
            let registry = self.inner.registry.read().unwrap_or_else(PoisonError::into_inner);
            let Some(channel) = registry.get(household_id) else {
                return false;
            };
            let mut subscribers = channel.lock();
            let matches = match (subscribers.get(connection_id), expected) {
                (None, _) => false,
                (Some(_), None) => true,
                (Some(current), Some(expected)) => Arc::ptr_eq(current, expected),
            };
            let removed = matches && subscribers.remove(connection_id).is_some();
            (removed, subscribers.is_empty())
        };
        if now_empty {
            self.prune(household_id);
        }
        removed
    }

    fn prune(&self, household_id: &str) {
        let mut registry = self
            .inner
            .registry
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        // A subscriber may have arrived between the read and write locks.
        let empty = registry
            .get(household_id)
            .is_some_and(|channel| channel.lock().is_empty());
        if empty {
            registry.remove(household_id);
            trace!(household_id = %household_id, "broker: pruned empty household");
        }
    }
}
