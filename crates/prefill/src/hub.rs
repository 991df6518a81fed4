//! Subscriber registry and event fan-out.

use dashmap::DashMap;
use log::{debug, info};
use tokio::sync::{broadcast, mpsc};

use crate::events::SessionEvent;

/// Size of the broadcast channel for events.
const EVENT_BUFFER_SIZE: usize = 256;

/// Size of the per-subscriber send buffer.
const SUBSCRIBER_BUFFER_SIZE: usize = 64;

/// Why an event did not reach a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// No such subscriber is connected.
    Unknown,
    /// The receiving side is gone.
    Closed,
    /// The subscriber is not keeping up.
    Full,
}

/// Connected listeners, addressed by opaque id.
///
/// Sessions keep sets of subscriber ids; the hub owns the channels. Every
/// event is also published on a broadcast channel for observers that want
/// all sessions.
pub struct EventHub {
    subscribers: DashMap<String, mpsc::Sender<SessionEvent>>,
    event_tx: broadcast::Sender<SessionEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_BUFFER_SIZE);
        Self {
            subscribers: DashMap::new(),
            event_tx,
        }
    }

    /// Connect a listener. Re-registering an id replaces its channel.
    pub fn register(&self, subscriber_id: &str) -> mpsc::Receiver<SessionEvent> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER_SIZE);
        self.subscribers.insert(subscriber_id.to_string(), tx);
        info!("registered subscriber {}", subscriber_id);
        rx
    }

    pub fn unregister(&self, subscriber_id: &str) {
        if self.subscribers.remove(subscriber_id).is_some() {
            info!("unregistered subscriber {}", subscriber_id);
        }
    }

    pub fn is_registered(&self, subscriber_id: &str) -> bool {
        self.subscribers.contains_key(subscriber_id)
    }

    /// Hand one event to one subscriber without waiting.
    pub fn deliver(&self, subscriber_id: &str, event: SessionEvent) -> Result<(), DeliveryError> {
        let Some(tx) = self.subscribers.get(subscriber_id).map(|tx| tx.clone()) else {
            return Err(DeliveryError::Unknown);
        };
        tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DeliveryError::Full,
            mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Deliver to every id in `targets` and report each result.
    ///
    /// Subscribers whose channel is closed are unregistered. A failure for
    /// one target never affects the others.
    pub fn fan_out<'a, I>(
        &self,
        targets: I,
        event: &SessionEvent,
    ) -> Vec<(String, Result<(), DeliveryError>)>
    where
        I: IntoIterator<Item = &'a String>,
    {
        let _ = self.event_tx.send(event.clone());

        let mut results = Vec::new();
        for id in targets {
            let result = self.deliver(id, event.clone());
            match result {
                Ok(()) => {}
                Err(DeliveryError::Closed) => {
                    debug!("subscriber {} went away; dropping it", id);
                    self.unregister(id);
                }
                Err(e) => debug!("{} not delivered to {}: {:?}", event.name(), id, e),
            }
            results.push((id.clone(), result));
        }
        results
    }

    /// Subscribe to every event of every session.
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.event_tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
