//! In-process broker
//!
//! Routes messages between links in the same process without a network,
//! and can simulate session loss for any client. Backs the test suites.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;

use async_trait::async_trait;

use super::{topic_matches, ConnError, LinkEvent, Message, QoS, Transport};

/// Most recent messages kept for `published`
const PUBLISHED_LOG_LIMIT: usize = 1024;

struct Session {
    generation: u64,
    online: bool,
    filters: Vec<String>,
    events: mpsc::UnboundedSender<LinkEvent>,
}

#[derive(Default)]
struct State {
    sessions: HashMap<String, Session>,
    published: VecDeque<Message>,
    next_generation: u64,
}

#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<State>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a session for `client_id`. An existing session with the same id
    /// is taken over: the old one is told it was disconnected and can no
    /// longer publish.
    pub fn connect(&self, client_id: &str) -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();
        state.next_generation += 1;
        let generation = state.next_generation;

        let _ = events.send(LinkEvent::Connected);
        let session = Session {
            generation,
            online: true,
            filters: Vec::new(),
            events,
        };
        if let Some(old) = state.sessions.insert(client_id.to_string(), session) {
            let _ = old
                .events
                .send(LinkEvent::Disconnected("session taken over".to_string()));
        }

        let transport = Arc::new(MemoryTransport {
            broker: self.clone(),
            client_id: client_id.to_string(),
            generation,
        });
        (transport, rx)
    }

    /// Simulate a dropped connection. Subscriptions are lost, as with a
    /// clean MQTT session.
    pub fn drop_client(&self, client_id: &str) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(client_id) {
            session.online = false;
            session.filters.clear();
            let _ = session
                .events
                .send(LinkEvent::Disconnected("connection reset".to_string()));
        }
    }

    /// Bring a dropped client back online
    pub fn restore_client(&self, client_id: &str) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(client_id) {
            session.online = true;
            let _ = session.events.send(LinkEvent::Connected);
        }
    }

    pub fn is_subscribed(&self, client_id: &str, filter: &str) -> bool {
        self.state
            .lock()
            .sessions
            .get(client_id)
            .is_some_and(|s| s.filters.iter().any(|f| f == filter))
    }

    /// The most recent published messages, oldest first
    pub fn published(&self) -> Vec<Message> {
        self.state.lock().published.iter().cloned().collect()
    }

    /// Publish as if from an external client
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) {
        self.route(Message::new(topic, payload));
    }

    fn route(&self, message: Message) {
        let mut state = self.state.lock();
        for session in state.sessions.values() {
            if session.online && session.filters.iter().any(|f| topic_matches(f, &message.topic)) {
                let _ = session.events.send(LinkEvent::Message(message.clone()));
            }
        }
        if state.published.len() == PUBLISHED_LOG_LIMIT {
            state.published.pop_front();
        }
        state.published.push_back(message);
    }

    fn with_live_session<T>(
        &self,
        client_id: &str,
        generation: u64,
        f: impl FnOnce(&mut Session) -> T,
    ) -> Result<T, ConnError> {
        let mut state = self.state.lock();
        match state.sessions.get_mut(client_id) {
            Some(session) if session.generation == generation && session.online => Ok(f(session)),
            _ => Err(ConnError::NotConnected),
        }
    }
}

struct MemoryTransport {
    broker: MemoryBroker,
    client_id: String,
    generation: u64,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>, _qos: QoS) -> Result<(), ConnError> {
        self.broker.with_live_session(&self.client_id, self.generation, |_| ())?;
        self.broker.route(Message::new(topic, payload));
        Ok(())
    }

    fn subscribe(&self, filter: &str, _qos: QoS) -> Result<(), ConnError> {
        self.broker
            .with_live_session(&self.client_id, self.generation, |session| {
                if !session.filters.iter().any(|f| f == filter) {
                    session.filters.push(filter.to_string());
                }
            })
    }

    async fn disconnect(&self) -> Result<(), ConnError> {
        let mut state = self.broker.state.lock();
        if state
            .sessions
            .get(&self.client_id)
            .is_some_and(|s| s.generation == self.generation)
        {
            state.sessions.remove(&self.client_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_client_id_takes_over_session() {
        let broker = MemoryBroker::new();
        let (first, mut first_events) = broker.connect("client-1");
        assert_eq!(first_events.recv().await, Some(LinkEvent::Connected));

        let (_second, _) = broker.connect("client-1");
        assert!(matches!(first_events.recv().await, Some(LinkEvent::Disconnected(_))));
        assert_eq!(
            first.publish("t", b"x".to_vec(), QoS::AtMostOnce),
            Err(ConnError::NotConnected)
        );
    }

    #[tokio::test]
    async fn test_routes_only_to_matching_online_sessions() {
        let broker = MemoryBroker::new();
        let (a, mut a_events) = broker.connect("a");
        let (b, mut b_events) = broker.connect("b");
        a.subscribe("video/status/+", QoS::AtMostOnce).unwrap();
        b.subscribe("clients/status", QoS::AtMostOnce).unwrap();
        let _ = a_events.recv().await;
        let _ = b_events.recv().await;

        broker.inject("video/status/b", b"{}".to_vec());
        assert_eq!(
            a_events.recv().await,
            Some(LinkEvent::Message(Message::new("video/status/b", "{}")))
        );
        assert!(b_events.try_recv().is_err());
        assert_eq!(broker.published().len(), 1);
    }

    #[test]
    fn test_published_log_keeps_latest_messages() {
        let broker = MemoryBroker::new();
        for i in 0..PUBLISHED_LOG_LIMIT + 10 {
            broker.inject("clients/status", format!("client-{}", i));
        }

        let published = broker.published();
        assert_eq!(published.len(), PUBLISHED_LOG_LIMIT);
        assert_eq!(published[0].payload, b"client-10".to_vec());
        assert_eq!(
            published[PUBLISHED_LOG_LIMIT - 1].payload,
            format!("client-{}", PUBLISHED_LOG_LIMIT + 9).into_bytes()
        );
    }

    #[tokio::test]
    async fn test_dropped_client_loses_subscriptions() {
        let broker = MemoryBroker::new();
        let (a, _events) = broker.connect("a");
        a.subscribe("x", QoS::AtMostOnce).unwrap();
        broker.drop_client("a");
        assert!(!broker.is_subscribed("a", "x"));
        assert_eq!(a.subscribe("x", QoS::AtMostOnce), Err(ConnError::NotConnected));
    }
}
