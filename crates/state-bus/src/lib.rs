use std::collections::HashMap;

use parking_lot::RwLock;
use thiserror::Error;
use tokio::sync::broadcast;

/// Capacity of each named channel. Lagging subscribers lose the oldest
/// events; delivery is advisory, never guaranteed.
const CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("no subscribers on channel")]
    NoSubscribers,
}

pub type BusResult<T> = Result<T, BusError>;

/// Advisory pub/sub over named channels. Subscribers that join after a
/// publish never see it, and nothing is retried or acknowledged: the bus is
/// a cache hint, not a delivery contract.
pub trait Bus<E: Clone + Send + 'static>: Send + Sync {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<E>;
    fn publish(&self, channel: &str, event: E) -> BusResult<()>;
}

/// In-process bus backed by tokio broadcast channels.
#[derive(Debug, Default)]
pub struct LocalBus<E> {
    channels: RwLock<HashMap<String, broadcast::Sender<E>>>,
}

impl<E: Clone + Send + 'static> LocalBus<E> {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    fn sender_for(&self, channel: &str) -> broadcast::Sender<E> {
        let mut guard = self.channels.write();
        guard
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl<E: Clone + Send + 'static> Bus<E> for LocalBus<E> {
    fn subscribe(&self, channel: &str) -> broadcast::Receiver<E> {
        self.sender_for(channel).subscribe()
    }

    fn publish(&self, channel: &str, event: E) -> BusResult<()> {
        let sender = self.sender_for(channel);
        sender
            .send(event)
            .map(|_| ())
            .map_err(|_| BusError::NoSubscribers)
    }
}
