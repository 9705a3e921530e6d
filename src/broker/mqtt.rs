use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use async_trait::async_trait;

use super::{Backoff, ConnError, LinkEvent, Message, Transport};
use crate::config::BrokerConfig;

/// MQTT 3.1.1 transport backed by `rumqttc`
pub struct MqttTransport {
    client: AsyncClient,
}

impl MqttTransport {
    /// Build the client and spawn the event pump. The pump keeps
    /// reconnecting with backoff until `cancel` fires or the client
    /// disconnects.
    pub fn start(
        config: &BrokerConfig,
        client_id: &str,
        cancel: CancellationToken,
    ) -> (Arc<dyn Transport>, mpsc::UnboundedReceiver<LinkEvent>) {
        let mut options = MqttOptions::new(client_id, config.host.clone(), config.port);
        options.set_keep_alive(Duration::from_secs(config.keep_alive_secs.max(5)));
        options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(options, config.request_capacity.max(1));
        let (events, rx) = mpsc::unbounded_channel();
        tokio::spawn(pump(eventloop, events, Backoff::from_config(config), cancel));

        (Arc::new(Self { client }), rx)
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS) -> Result<(), ConnError> {
        self.client
            .try_publish(topic, qos, false, payload)
            .map_err(|e| ConnError::Transport(e.to_string()))
    }

    fn subscribe(&self, filter: &str, qos: QoS) -> Result<(), ConnError> {
        self.client
            .try_subscribe(filter, qos)
            .map_err(|e| ConnError::Transport(e.to_string()))
    }

    async fn disconnect(&self) -> Result<(), ConnError> {
        self.client
            .disconnect()
            .await
            .map_err(|e| ConnError::Transport(e.to_string()))
    }
}

async fn pump(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<LinkEvent>,
    mut backoff: Backoff,
    cancel: CancellationToken,
) {
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        let event = match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                backoff.reset();
                LinkEvent::Connected
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                LinkEvent::Message(Message::new(publish.topic, publish.payload.to_vec()))
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
            Ok(_) => continue,
            Err(e) => {
                if events.send(LinkEvent::Disconnected(e.to_string())).is_err() {
                    break;
                }
                let delay = backoff.next_delay();
                tracing::debug!(component = "broker", ?delay, "retrying broker connection");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => continue,
                }
            }
        };

        if events.send(event).is_err() {
            break;
        }
    }
}
