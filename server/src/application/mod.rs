use std::sync::Arc;

use tracing::debug;

use crate::domain::protocol::{encode_snapshot, Mutation, ProtocolError, Update};
use crate::domain::{ChannelId, ConnectionId};
use crate::infrastructure::gateway::{ConnectionGateway, Subscription};
use crate::infrastructure::state::ChannelState;
use crate::infrastructure::{ChannelStore, RegistryError};

#[derive(Clone)]
pub struct AppState {
    pub channels: Arc<ChannelStore>,
    pub gateway: Arc<ConnectionGateway>,
}

pub struct Joined {
    /// Sent before anything from `subscription`.
    pub snapshot: String,
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Broadcast { receivers: usize },
    /// The channel was deleted; nothing was stored or sent.
    Dropped,
}

impl AppState {
    pub fn new(channels: Arc<ChannelStore>, gateway: Arc<ConnectionGateway>) -> Self {
        Self { channels, gateway }
    }

    pub async fn open_channel(&self, id: &ChannelId) -> Result<Arc<ChannelState>, RegistryError> {
        self.channels.get_or_create(id).await
    }

    /// Subscribes and snapshots under the channel lock that `apply_message`
    /// publishes under, so the snapshot holds exactly the writes published
    /// before the subscription existed.
    pub async fn join(&self, id: &ChannelId, connection: ConnectionId) -> Result<Joined, RegistryError> {
        let state = self.channels.get_or_create(id).await?;
        let (snapshot, subscription) = state.snapshot_with(|document| {
            (
                encode_snapshot(document),
                self.gateway.subscribe(id, connection),
            )
        });
        Ok(Joined { snapshot, subscription })
    }

    pub fn apply_message(
        &self,
        id: &ChannelId,
        origin: ConnectionId,
        raw: &str,
    ) -> Result<Applied, ProtocolError> {
        let Mutation { key, value } = Mutation::decode(raw)?;

        let Some(state) = self.channels.get(id) else {
            debug!(channel = %id, connection = %origin, "dropping write for unknown channel");
            return Ok(Applied::Dropped);
        };

        let mut receivers = 0;
        state.set_with(key, value, |key, stored| {
            let frame = Update { key, value: stored }.encode();
            receivers = self.gateway.publish(id, Some(origin), &frame);
        });
        Ok(Applied::Broadcast { receivers })
    }

    /// Fresh snapshot for a subscriber that lagged, with the subscription
    /// restarted at the same point. `None` when the channel was deleted.
    pub fn resync(&self, id: &ChannelId, subscription: &mut Subscription) -> Option<String> {
        let Some(state) = self.channels.get(id) else {
            subscription.resubscribe();
            return None;
        };
        Some(state.snapshot_with(|document| {
            subscription.resubscribe();
            encode_snapshot(document)
        }))
    }

    pub fn leave(&self, subscription: Subscription) {
        self.gateway.unsubscribe(subscription);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::SelfDelivery;
    use crate::infrastructure::gateway::Received;
    use crate::infrastructure::persistence::testing::{FailingStore, StalledStore};
    use crate::infrastructure::persistence::Persistence;
    use crate::ports::PersistencePort;
    use serde_json::{json, Value};
    use std::time::Duration;

    fn app(max_channels: usize, self_delivery: SelfDelivery) -> AppState {
        AppState::new(
            Arc::new(ChannelStore::new(max_channels, None)),
            Arc::new(ConnectionGateway::new(64, self_delivery)),
        )
    }

    fn app_with(port: Arc<dyn PersistencePort>, gateway_capacity: usize) -> AppState {
        let persistence = Persistence::new(port, Duration::from_secs(2));
        AppState::new(
            Arc::new(ChannelStore::new(10, Some(persistence))),
            Arc::new(ConnectionGateway::new(gateway_capacity, SelfDelivery::Exclude)),
        )
    }

    fn parse(frame: &str) -> Value {
        serde_json::from_str(frame).unwrap()
    }

    #[tokio::test]
    async fn fan_out_reaches_peers_only() {
        let app = app(10, SelfDelivery::Exclude);
        let channel = ChannelId::from("abc123");
        let (a, b, c) = (ConnectionId::new(), ConnectionId::new(), ConnectionId::new());
        let mut ja = app.join(&channel, a).await.unwrap();
        let mut jb = app.join(&channel, b).await.unwrap();
        let mut jc = app.join(&channel, c).await.unwrap();
        let mut elsewhere = app.join(&"other".into(), ConnectionId::new()).await.unwrap();

        let applied = app.apply_message(&channel, a, r#"{"k":"v"}"#).unwrap();
        assert_eq!(applied, Applied::Broadcast { receivers: 3 });

        for joined in [&mut jb, &mut jc] {
            assert_eq!(parse(&joined.subscription.try_recv().unwrap()), json!({"k": "v"}));
            assert_eq!(joined.subscription.try_recv(), None);
        }
        assert_eq!(ja.subscription.try_recv(), None);
        assert_eq!(elsewhere.subscription.try_recv(), None);
    }

    #[tokio::test]
    async fn include_policy_echoes_the_write() {
        let app = app(10, SelfDelivery::Include);
        let channel = ChannelId::from("abc");
        let a = ConnectionId::new();
        let mut ja = app.join(&channel, a).await.unwrap();
        app.apply_message(&channel, a, r#"{"k":1}"#).unwrap();
        assert_eq!(parse(&ja.subscription.try_recv().unwrap()), json!({"k": 1}));
    }

    #[tokio::test]
    async fn late_joiner_gets_snapshot() {
        let app = app(10, SelfDelivery::Exclude);
        let channel = ChannelId::from("abc");
        let a = ConnectionId::new();
        let _ja = app.join(&channel, a).await.unwrap();
        app.apply_message(&channel, a, r#"{"x":10}"#).unwrap();

        let jb = app.join(&channel, ConnectionId::new()).await.unwrap();
        assert_eq!(parse(&jb.snapshot), json!({"x": 10}));
    }

    #[tokio::test]
    async fn fresh_channel_snapshot_is_empty_object() {
        let app = app(10, SelfDelivery::Exclude);
        let joined = app.join(&"new".into(), ConnectionId::new()).await.unwrap();
        assert_eq!(joined.snapshot, "{}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn join_never_misses_a_concurrent_write() {
        let app = app(10, SelfDelivery::Exclude);
        let channel = ChannelId::from("abc");
        let writer = ConnectionId::new();
        let _jw = app.join(&channel, writer).await.unwrap();
        app.apply_message(&channel, writer, r#"{"x":10}"#).unwrap();

        let write = {
            let app = app.clone();
            let channel = channel.clone();
            tokio::spawn(async move { app.apply_message(&channel, writer, r#"{"y":20}"#).unwrap() })
        };
        let mut joined = app.join(&channel, ConnectionId::new()).await.unwrap();
        write.await.unwrap();

        let mut seen = match parse(&joined.snapshot) {
            Value::Object(map) => map,
            other => panic!("snapshot not an object: {other}"),
        };
        assert_eq!(seen["x"], json!(10));
        while let Some(frame) = joined.subscription.try_recv() {
            if let Value::Object(update) = parse(&frame) {
                seen.extend(update);
            }
        }
        assert_eq!(seen.get("y"), Some(&json!(20)));
    }

    #[tokio::test]
    async fn malformed_input_changes_nothing() {
        let app = app(10, SelfDelivery::Exclude);
        let channel = ChannelId::from("abc");
        let a = ConnectionId::new();
        let mut jb = {
            let _ja = app.join(&channel, a).await.unwrap();
            app.join(&channel, ConnectionId::new()).await.unwrap()
        };

        for raw in ["[1]", r#"{"":1}"#, "{}", "nope", "7"] {
            assert!(matches!(
                app.apply_message(&channel, a, raw),
                Err(ProtocolError::Malformed(_))
            ));
        }
        assert_eq!(app.channels.get(&channel).unwrap().get_all(), None);
        assert_eq!(jb.subscription.try_recv(), None);

        app.apply_message(&channel, a, r#"{"ok":true}"#).unwrap();
        assert_eq!(parse(&jb.subscription.try_recv().unwrap()), json!({"ok": true}));
    }

    #[tokio::test]
    async fn write_to_deleted_channel_is_dropped() {
        let app = app(10, SelfDelivery::Exclude);
        let channel = ChannelId::from("abc");
        let a = ConnectionId::new();
        let mut peer = {
            let _ja = app.join(&channel, a).await.unwrap();
            app.join(&channel, ConnectionId::new()).await.unwrap()
        };
        app.channels.delete(&channel).await;

        assert_eq!(app.apply_message(&channel, a, r#"{"k":1}"#).unwrap(), Applied::Dropped);
        assert_eq!(peer.subscription.try_recv(), None);
        assert_eq!(app.channels.count(), 0);
    }

    #[tokio::test]
    async fn join_at_capacity_fails() {
        let app = app(1, SelfDelivery::Exclude);
        app.join(&"a".into(), ConnectionId::new()).await.unwrap();
        assert!(matches!(
            app.join(&"b".into(), ConnectionId::new()).await,
            Err(RegistryError::CapacityExceeded { max: 1 })
        ));
    }

    #[tokio::test]
    async fn leave_only_unsubscribes() {
        let app = app(10, SelfDelivery::Exclude);
        let channel = ChannelId::from("abc");
        let a = ConnectionId::new();
        let joined = app.join(&channel, a).await.unwrap();
        app.apply_message(&channel, a, r#"{"k":1}"#).unwrap();
        app.leave(joined.subscription);

        assert_eq!(app.gateway.subscriber_count(&channel), 0);
        assert_eq!(app.channels.count(), 1);
        assert_eq!(app.channels.get(&channel).unwrap().get("k"), Some(json!(1)));
    }

    #[tokio::test]
    async fn lagged_reader_converges_after_resync() {
        let app = AppState::new(
            Arc::new(ChannelStore::new(10, None)),
            Arc::new(ConnectionGateway::new(2, SelfDelivery::Exclude)),
        );
        let channel = ChannelId::from("abc");
        let writer = ConnectionId::new();
        let _jw = app.join(&channel, writer).await.unwrap();
        let mut reader = app.join(&channel, ConnectionId::new()).await.unwrap();

        for i in 0..5 {
            app.apply_message(&channel, writer, &format!("{{\"k{i}\":{i}}}")).unwrap();
        }
        assert_eq!(reader.subscription.recv().await, Some(Received::Resync));

        let snapshot = app.resync(&channel, &mut reader.subscription).unwrap();
        let mut mirror = parse(&snapshot);
        app.apply_message(&channel, writer, r#"{"k5":5}"#).unwrap();
        match reader.subscription.recv().await {
            Some(Received::Frame(frame)) => {
                if let (Value::Object(doc), Value::Object(update)) = (&mut mirror, parse(&frame)) {
                    doc.extend(update);
                }
            }
            other => panic!("expected a frame, got {other:?}"),
        }

        let server = app.channels.get(&channel).unwrap().get_all().map(Value::Object);
        assert_eq!(Some(mirror), server);
        assert_eq!(server.unwrap().as_object().unwrap().len(), 6);
    }

    #[tokio::test]
    async fn resync_of_deleted_channel_sends_nothing() {
        let app = app(10, SelfDelivery::Exclude);
        let channel = ChannelId::from("abc");
        let mut joined = app.join(&channel, ConnectionId::new()).await.unwrap();
        app.channels.delete(&channel).await;
        assert_eq!(app.resync(&channel, &mut joined.subscription), None);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_backend_does_not_delay_fan_out() {
        let app = app_with(Arc::new(StalledStore), 64);
        let channel = ChannelId::from("abc");
        let a = ConnectionId::new();
        let _ja = app.join(&channel, a).await.unwrap();
        let mut peer = app.join(&channel, ConnectionId::new()).await.unwrap();

        for i in 0..3 {
            let raw = format!("{{\"n\":{i}}}");
            assert_eq!(
                app.apply_message(&channel, a, &raw).unwrap(),
                Applied::Broadcast { receivers: 2 }
            );
            assert_eq!(parse(&peer.subscription.try_recv().unwrap()), json!({"n": i}));
        }
        assert_eq!(app.channels.get(&channel).unwrap().get("n"), Some(json!(2)));
    }

    #[tokio::test]
    async fn failing_backend_does_not_block_fan_out() {
        let app = app_with(Arc::new(FailingStore), 64);
        let channel = ChannelId::from("abc");
        let a = ConnectionId::new();
        let _ja = app.join(&channel, a).await.unwrap();
        let mut peer = app.join(&channel, ConnectionId::new()).await.unwrap();

        app.apply_message(&channel, a, r#"{"k":"v"}"#).unwrap();
        assert_eq!(parse(&peer.subscription.try_recv().unwrap()), json!({"k": "v"}));
        tokio::task::yield_now().await;
        assert_eq!(app.channels.get(&channel).unwrap().get("k"), Some(json!("v")));
    }
}
