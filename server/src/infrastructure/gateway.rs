use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use crate::domain::{ChannelId, ConnectionId, SelfDelivery};

#[derive(Clone, Debug)]
pub struct Frame {
    pub origin: Option<ConnectionId>,
    pub payload: Arc<str>,
}

/// One broadcast topic per channel, created on first subscription and
/// dropped when the last subscriber leaves.
pub struct ConnectionGateway {
    topics: DashMap<ChannelId, broadcast::Sender<Frame>>,
    capacity: usize,
    self_delivery: SelfDelivery,
}

impl ConnectionGateway {
    pub fn new(capacity: usize, self_delivery: SelfDelivery) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            self_delivery,
        }
    }

    pub fn subscribe(&self, channel: &ChannelId, connection: ConnectionId) -> Subscription {
        let rx = self
            .topics
            .entry(channel.clone())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe();
        Subscription {
            channel: channel.clone(),
            connection,
            self_delivery: self.self_delivery,
            rx,
        }
    }

    /// Returns how many receivers the frame was queued for.
    pub fn publish(&self, channel: &ChannelId, origin: Option<ConnectionId>, payload: &str) -> usize {
        let Some(tx) = self.topics.get(channel) else {
            return 0;
        };
        let frame = Frame {
            origin,
            payload: Arc::from(payload),
        };
        tx.send(frame).unwrap_or(0)
    }

    pub fn unsubscribe(&self, subscription: Subscription) {
        let channel = subscription.channel.clone();
        drop(subscription);
        self.topics
            .remove_if(&channel, |_, tx| tx.receiver_count() == 0);
    }

    pub fn topic_count(&self) -> usize {
        self.topics.len()
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self, channel: &ChannelId) -> usize {
        self.topics
            .get(channel)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Frame(Arc<str>),
    /// Frames were dropped from the buffer before this subscriber read them.
    /// It must be resent the whole document and then [`resubscribe`](Subscription::resubscribe).
    Resync,
}

pub struct Subscription {
    channel: ChannelId,
    connection: ConnectionId,
    self_delivery: SelfDelivery,
    rx: broadcast::Receiver<Frame>,
}

impl Subscription {
    fn wants(&self, frame: &Frame) -> bool {
        self.self_delivery == SelfDelivery::Include || frame.origin != Some(self.connection)
    }

    /// `None` once the topic is gone.
    pub async fn recv(&mut self) -> Option<Received> {
        loop {
            match self.rx.recv().await {
                Ok(frame) if self.wants(&frame) => return Some(Received::Frame(frame.payload)),
                Ok(_) => continue,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(channel = %self.channel, connection = %self.connection, skipped, "subscriber lagged");
                    return Some(Received::Resync);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Drops everything still buffered; only frames published from now on are received.
    pub fn resubscribe(&mut self) {
        self.rx = self.rx.resubscribe();
    }

    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> Option<Arc<str>> {
        use broadcast::error::TryRecvError;
        loop {
            match self.rx.try_recv() {
                Ok(frame) if self.wants(&frame) => return Some(frame.payload),
                Ok(_) => continue,
                Err(TryRecvError::Lagged(skipped)) => panic!("subscriber lagged by {skipped}"),
                Err(TryRecvError::Empty) | Err(TryRecvError::Closed) => return None,
            }
        }
    }
}
