use super::{Asset, AssetLibrary, PlaybackError};
use crate::broker::{BrokerLink, QoS};
use crate::logging::OutcomeLog;
use crate::types::{PlaybackCommand, COMMAND_TOPIC};

/// Issues playback commands to the whole fleet.
///
/// Returns as soon as the broker has the command. Agents are not waited
/// for: each one seeks to the embedded offset on its own clock.
#[derive(Debug, Clone)]
pub struct PlaybackCoordinator {
    link: BrokerLink,
    library: Option<AssetLibrary>,
    log: OutcomeLog,
}

impl PlaybackCoordinator {
    pub fn new(link: BrokerLink) -> Self {
        Self {
            link,
            library: None,
            log: OutcomeLog::new("coordinator"),
        }
    }

    /// Validate indices against a local copy of the media
    pub fn with_library(mut self, library: AssetLibrary) -> Self {
        self.library = Some(library);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    pub fn library(&self) -> Option<&AssetLibrary> {
        self.library.as_ref()
    }

    /// Assets known locally; empty when there is no local library
    pub fn assets(&self) -> Result<Vec<Asset>, PlaybackError> {
        match &self.library {
            Some(library) => library.scan(),
            None => Ok(Vec::new()),
        }
    }

    pub fn request_play(&self, video_index: usize, offset_seconds: f64) -> Result<PlaybackCommand, PlaybackError> {
        let command = PlaybackCommand::new(video_index, offset_seconds)?;
        if let Some(library) = &self.library {
            let available = library.scan()?.len();
            if video_index >= available {
                let err = PlaybackError::InvalidIndex {
                    index: video_index,
                    available,
                };
                self.log.warned(&err);
                return Err(err);
            }
        }

        let payload = command.to_payload();
        if let Err(e) = self.link.publish(COMMAND_TOPIC, payload.as_bytes(), QoS::AtLeastOnce) {
            self.log.failed(format!("command {} not sent: {}", payload, e));
            return Err(e.into());
        }
        self.log.succeeded(format!("requested video {} at {}s", video_index, offset_seconds));
        Ok(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{ConnError, MemoryBroker};
    use tokio_util::sync::CancellationToken;

    async fn coordinator(broker: &MemoryBroker) -> PlaybackCoordinator {
        let (transport, events) = broker.connect("brain");
        let link = BrokerLink::new("brain", transport, events, CancellationToken::new());
        link.wait_connected().await.unwrap();
        PlaybackCoordinator::new(link)
    }

    #[tokio::test]
    async fn test_request_play_publishes_wire_payload() {
        let broker = MemoryBroker::new();
        let coordinator = coordinator(&broker).await;

        coordinator.request_play(2, 5.0).unwrap();
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, COMMAND_TOPIC);
        assert_eq!(published[0].payload, b"2,5");
    }

    #[tokio::test]
    async fn test_rejects_index_outside_library() {
        let media = tempfile::tempdir().unwrap();
        std::fs::write(media.path().join("only.mp4"), b"").unwrap();
        let broker = MemoryBroker::new();
        let coordinator = coordinator(&broker)
            .await
            .with_library(AssetLibrary::new(media.path(), &["mp4".to_string()]));

        assert!(matches!(
            coordinator.request_play(3, 0.0),
            Err(PlaybackError::InvalidIndex { index: 3, available: 1 })
        ));
        assert!(coordinator.request_play(0, 0.0).is_ok());
        assert_eq!(broker.published().len(), 1);
    }

    #[tokio::test]
    async fn test_rejects_negative_offset() {
        let broker = MemoryBroker::new();
        let coordinator = coordinator(&broker).await;
        assert!(matches!(
            coordinator.request_play(0, -1.0),
            Err(PlaybackError::Command(_))
        ));
        assert!(broker.published().is_empty());
    }

    #[tokio::test]
    async fn test_disconnected_link_reports_dropped_command() {
        let broker = MemoryBroker::new();
        let coordinator = coordinator(&broker).await;
        broker.drop_client("brain");
        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            while coordinator.link.is_connected() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        assert!(matches!(
            coordinator.request_play(0, 0.0),
            Err(PlaybackError::Broker(ConnError::NotConnected))
        ));
    }
}
