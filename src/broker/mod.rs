//! Broker Link
//!
//! One publish/subscribe session per process, identified by the node id.
//! The link sits on top of a [`Transport`] that does the actual network
//! work and reports connection changes as [`LinkEvent`]s. On every
//! (re)connect the link replays all registered subscriptions, so callers
//! subscribe once and never think about session loss again.
//!
//! Delivery is at-most-once: a publish issued while the session is down is
//! dropped and reported as [`ConnError::NotConnected`].

pub mod backoff;
pub mod memory;
pub mod mqtt;
pub mod topic;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::BrokerConfig;
use crate::logging::OutcomeLog;

pub use backoff::Backoff;
pub use memory::MemoryBroker;
pub use mqtt::MqttTransport;
pub use rumqttc::QoS;
pub use topic::topic_matches;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnError {
    #[error("broker session is down; message dropped")]
    NotConnected,
    #[error("connection attempt cancelled")]
    Cancelled,
    #[error("broker link closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// A message received on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Reported by a transport as its session changes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Disconnected(String),
    Message(Message),
}

/// Network side of a broker session.
///
/// `publish` and `subscribe` must not block: they hand the request to the
/// transport's own event loop.
#[async_trait]
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), ConnError>;
    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), ConnError>;
    async fn disconnect(&self) -> Result<(), ConnError>;
}

/// Where a node's broker session goes
#[derive(Clone)]
pub enum BrokerEndpoint {
    Mqtt(BrokerConfig),
    /// In-process broker, shared by every link connected to it
    Memory(MemoryBroker),
}

impl BrokerEndpoint {
    /// Open a session and wait for the broker to accept it
    pub async fn connect(&self, client_id: &str, cancel: CancellationToken) -> Result<BrokerLink, ConnError> {
        match self {
            BrokerEndpoint::Mqtt(config) => BrokerLink::connect(config, client_id, cancel).await,
            BrokerEndpoint::Memory(broker) => {
                let (transport, events) = broker.connect(client_id);
                let link = BrokerLink::new(client_id, transport, events, cancel);
                link.wait_connected().await?;
                Ok(link)
            }
        }
    }
}

struct Subscription {
    filter: String,
    qos: QoS,
    lane: mpsc::UnboundedSender<Message>,
}

struct Inner {
    client_id: String,
    transport: Arc<dyn Transport>,
    subscriptions: RwLock<Vec<Subscription>>,
    connected: watch::Sender<bool>,
    closed: AtomicBool,
    router: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
    log: OutcomeLog,
}

/// Cheaply cloneable handle to the node's broker session. Safe to use from
/// any task without extra locking.
#[derive(Clone)]
pub struct BrokerLink {
    inner: Arc<Inner>,
}

impl fmt::Debug for BrokerLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerLink")
            .field("client_id", &self.inner.client_id)
            .field("connected", &self.is_connected())
            .field("subscriptions", &self.inner.subscriptions.read().len())
            .finish()
    }
}

impl BrokerLink {
    /// Wrap a transport and start routing its events. Does not wait for the
    /// session to come up; see [`BrokerLink::wait_connected`].
    pub fn new(
        client_id: impl Into<String>,
        transport: Arc<dyn Transport>,
        events: mpsc::UnboundedReceiver<LinkEvent>,
        cancel: CancellationToken,
    ) -> Self {
        let (connected, _) = watch::channel(false);
        let link = Self {
            inner: Arc::new(Inner {
                client_id: client_id.into(),
                transport,
                subscriptions: RwLock::new(Vec::new()),
                connected,
                closed: AtomicBool::new(false),
                router: Mutex::new(None),
                cancel,
                log: OutcomeLog::new("broker"),
            }),
        };
        let router = tokio::spawn(link.clone().route(events));
        *link.inner.router.lock() = Some(router);
        link
    }

    /// Open an MQTT session for `client_id` and wait until the broker has
    /// accepted it. Retries with backoff until connected or cancelled.
    pub async fn connect(
        config: &BrokerConfig,
        client_id: &str,
        cancel: CancellationToken,
    ) -> Result<Self, ConnError> {
        let (transport, events) = MqttTransport::start(config, client_id, cancel.clone());
        let link = Self::new(client_id, transport, events, cancel);
        link.inner
            .log
            .started(format!("connecting to {}:{} as {}", config.host, config.port, client_id));
        link.wait_connected().await?;
        Ok(link)
    }

    pub fn client_id(&self) -> &str {
        &self.inner.client_id
    }

    pub fn is_connected(&self) -> bool {
        *self.inner.connected.borrow()
    }

    /// Resolve once the session is up
    pub async fn wait_connected(&self) -> Result<(), ConnError> {
        let mut state = self.inner.connected.subscribe();
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(ConnError::Cancelled),
            result = state.wait_for(|up| *up) => result.map(|_| ()).map_err(|_| ConnError::Closed),
        }
    }

    /// Fire-and-forget publish
    pub fn publish(&self, topic: &str, payload: impl Into<Vec<u8>>, qos: QoS) -> Result<(), ConnError> {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }
        if !self.is_connected() {
            tracing::debug!(component = "broker", topic, "dropping publish while disconnected");
            return Err(ConnError::NotConnected);
        }
        self.inner.transport.publish(topic, payload.into(), qos)
    }

    /// Register `handler` for every message matching `filter`.
    ///
    /// Each subscription gets its own lane: messages are handed to the
    /// handler one at a time in arrival order, and a slow handler only
    /// delays its own lane.
    pub fn subscribe<F>(&self, filter: &str, qos: QoS, mut handler: F) -> Result<(), ConnError>
    where
        F: FnMut(Message) + Send + 'static,
    {
        if self.is_closed() {
            return Err(ConnError::Closed);
        }

        let (lane, mut inbox) = mpsc::unbounded_channel::<Message>();
        tokio::spawn(async move {
            while let Some(message) = inbox.recv().await {
                handler(message);
            }
        });

        self.inner.subscriptions.write().push(Subscription {
            filter: filter.to_string(),
            qos,
            lane,
        });

        // Otherwise picked up by the replay on the next Connected event
        if self.is_connected() {
            self.inner.transport.subscribe(filter, qos)?;
        }
        Ok(())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.inner
            .subscriptions
            .read()
            .iter()
            .map(|s| s.filter.clone())
            .collect()
    }

    fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire) || self.inner.cancel.is_cancelled()
    }

    /// Close the session and stop every subscription lane.
    ///
    /// A live session is closed with a proper DISCONNECT; the transport then
    /// ends its event stream, which stops the router.
    pub async fn disconnect(&self) -> Result<(), ConnError> {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let was_connected = self.inner.connected.send_replace(false);
        self.inner.subscriptions.write().clear();

        let result = if was_connected {
            self.inner.transport.disconnect().await
        } else {
            Ok(())
        };

        let router = self.inner.router.lock().take();
        if let Some(router) = router {
            if was_connected && result.is_ok() {
                let _ = tokio::time::timeout(Duration::from_secs(1), router).await;
            } else {
                router.abort();
            }
        }
        self.inner.cancel.cancel();
        self.inner.log.succeeded("session closed");
        result
    }

    async fn route(self, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        loop {
            let event = tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                LinkEvent::Connected if self.inner.closed.load(Ordering::Acquire) => {}
                LinkEvent::Connected => {
                    self.inner.connected.send_replace(true);
                    self.resubscribe();
                    self.inner.log.succeeded(format!("connected as {}", self.inner.client_id));
                }
                LinkEvent::Disconnected(reason) => {
                    let was_connected = self.inner.connected.send_replace(false);
                    if was_connected {
                        self.inner.log.warned(format!("session lost: {}", reason));
                    } else {
                        tracing::debug!(component = "broker", %reason, "connection attempt failed");
                    }
                }
                LinkEvent::Message(message) => self.dispatch(message),
            }
        }
        self.inner.connected.send_replace(false);
    }

    fn resubscribe(&self) {
        let subscriptions = self.inner.subscriptions.read();
        for subscription in subscriptions.iter() {
            if let Err(e) = self.inner.transport.subscribe(&subscription.filter, subscription.qos) {
                self.inner
                    .log
                    .failed(format!("resubscribe to {} failed: {}", subscription.filter, e));
            }
        }
    }

    fn dispatch(&self, message: Message) {
        let subscriptions = self.inner.subscriptions.read();
        for subscription in subscriptions.iter() {
            if topic_matches(&subscription.filter, &message.topic) {
                let _ = subscription.lane.send(message.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn recv(rx: &mut mpsc::UnboundedReceiver<Message>) -> Message {
        timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("lane closed")
    }

    async fn link(broker: &MemoryBroker, id: &str) -> BrokerLink {
        let (transport, events) = broker.connect(id);
        let link = BrokerLink::new(id, transport, events, CancellationToken::new());
        link.wait_connected().await.unwrap();
        link
    }

    #[tokio::test]
    async fn test_publish_reaches_subscriber() {
        let broker = MemoryBroker::new();
        let a = link(&broker, "a").await;
        let b = link(&broker, "b").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        b.subscribe("video/request_play", QoS::AtLeastOnce, move |m| {
            let _ = tx.send(m);
        })
        .unwrap();

        a.publish("video/request_play", "2,5", QoS::AtLeastOnce).unwrap();
        let message = recv(&mut rx).await;
        assert_eq!(message.payload, b"2,5");
    }

    #[tokio::test]
    async fn test_handler_sees_messages_in_order() {
        let broker = MemoryBroker::new();
        let a = link(&broker, "a").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        a.subscribe("seq", QoS::AtMostOnce, move |m| {
            let _ = tx.send(m);
        })
        .unwrap();

        for i in 0..20 {
            a.publish("seq", i.to_string(), QoS::AtMostOnce).unwrap();
        }
        for i in 0..20 {
            assert_eq!(recv(&mut rx).await.payload, i.to_string().into_bytes());
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_blocked_lane_does_not_block_other_topics() {
        let broker = MemoryBroker::new();
        let a = link(&broker, "a").await;

        let (release, gate) = std::sync::mpsc::channel::<()>();
        a.subscribe("slow", QoS::AtMostOnce, move |_| {
            let _ = gate.recv_timeout(Duration::from_secs(2));
        })
        .unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        a.subscribe("fast", QoS::AtMostOnce, move |m| {
            let _ = tx.send(m);
        })
        .unwrap();

        a.publish("slow", "x", QoS::AtMostOnce).unwrap();
        a.publish("fast", "y", QoS::AtMostOnce).unwrap();
        let message = recv(&mut rx).await;
        assert_eq!(message.topic, "fast");
        let _ = release.send(());
    }

    #[tokio::test]
    async fn test_reconnect_preserves_subscriptions() {
        let broker = MemoryBroker::new();
        let publisher = link(&broker, "brain").await;
        let subscriber = link(&broker, "client-1").await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        subscriber
            .subscribe("video/request_play", QoS::AtLeastOnce, move |m| {
                let _ = tx.send(m);
            })
            .unwrap();

        broker.drop_client("client-1");
        timeout(Duration::from_secs(1), async {
            while subscriber.is_connected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(
            subscriber.publish("video/status/client-1", "{}", QoS::AtMostOnce),
            Err(ConnError::NotConnected)
        );

        broker.restore_client("client-1");
        subscriber.wait_connected().await.unwrap();
        // give the replayed subscribe a moment to land
        timeout(Duration::from_secs(1), async {
            while !broker.is_subscribed("client-1", "video/request_play") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        publisher.publish("video/request_play", "1,0", QoS::AtLeastOnce).unwrap();
        assert_eq!(recv(&mut rx).await.payload, b"1,0");
    }

    #[tokio::test]
    async fn test_publish_after_disconnect_is_rejected() {
        let broker = MemoryBroker::new();
        let a = link(&broker, "a").await;
        a.disconnect().await.unwrap();
        assert_eq!(a.publish("t", "x", QoS::AtMostOnce), Err(ConnError::Closed));
        assert!(a.subscriptions().is_empty());
    }

    #[tokio::test]
    async fn test_wait_connected_is_cancellable() {
        let broker = MemoryBroker::new();
        let (transport, events) = broker.connect("a");
        broker.drop_client("a");
        let cancel = CancellationToken::new();
        let link = BrokerLink::new("a", transport, events, cancel.clone());

        cancel.cancel();
        assert_eq!(link.wait_connected().await, Err(ConnError::Cancelled));
    }
}
