#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use screensync::asset_sync::{CommandOutput, CommandRunner};
use screensync::broker::{BrokerLink, MemoryBroker, Message, QoS};
use screensync::playback::{MediaPlayer, PlayRequest, PlaybackError, PlaybackHandle};
use screensync::types::{AgentStatus, STATUS_TOPIC_FILTER};

/// Records every start and stop; playbacks end only when told to
#[derive(Default)]
pub struct FakePlayer {
    pub started: Mutex<Vec<PlayRequest>>,
    pub stopped: Arc<Mutex<usize>>,
    finishers: Mutex<Vec<oneshot::Sender<()>>>,
}

impl FakePlayer {
    pub fn starts(&self) -> Vec<PlayRequest> {
        self.started.lock().clone()
    }

    pub fn stops(&self) -> usize {
        *self.stopped.lock()
    }

    /// End the most recent playback as if the file ran out
    pub fn finish_latest(&self) {
        if let Some(done) = self.finishers.lock().pop() {
            let _ = done.send(());
        }
    }
}

struct FakeHandle {
    done: Option<oneshot::Receiver<()>>,
    stopped: Arc<Mutex<usize>>,
}

impl MediaPlayer for FakePlayer {
    fn start(&self, request: &PlayRequest) -> Result<Box<dyn PlaybackHandle>, PlaybackError> {
        let (tx, rx) = oneshot::channel();
        self.started.lock().push(request.clone());
        self.finishers.lock().push(tx);
        Ok(Box::new(FakeHandle {
            done: Some(rx),
            stopped: self.stopped.clone(),
        }))
    }
}

#[async_trait]
impl PlaybackHandle for FakeHandle {
    async fn finished(&mut self) -> Result<(), PlaybackError> {
        match self.done.as_mut() {
            Some(done) => {
                let _ = done.await;
                self.done = None;
                Ok(())
            }
            None => std::future::pending().await,
        }
    }

    async fn stop(&mut self) {
        *self.stopped.lock() += 1;
        self.done = None;
    }
}

/// Git stand-in that always succeeds
#[derive(Default)]
pub struct NoopRunner {
    pub calls: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandRunner for NoopRunner {
    async fn run(&self, program: &str, args: &[&str], _cwd: &Path) -> std::io::Result<CommandOutput> {
        self.calls.lock().push(format!("{} {}", program, args.join(" ")));
        Ok(CommandOutput {
            success: true,
            stdout: "0000000".to_string(),
            stderr: String::new(),
        })
    }
}

pub fn media_dir(names: &[&str]) -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    for name in names {
        std::fs::write(dir.path().join(name), b"").unwrap();
    }
    dir
}

pub async fn connect(broker: &MemoryBroker, id: &str) -> BrokerLink {
    let (transport, events) = broker.connect(id);
    let link = BrokerLink::new(id, transport, events, CancellationToken::new());
    link.wait_connected().await.unwrap();
    link
}

/// Collects every status report published on the broker
pub struct StatusWatch {
    rx: mpsc::UnboundedReceiver<AgentStatus>,
    _link: BrokerLink,
}

impl StatusWatch {
    pub async fn attach(broker: &MemoryBroker) -> Self {
        let link = connect(broker, "observer").await;
        let (tx, rx) = mpsc::unbounded_channel();
        link.subscribe(STATUS_TOPIC_FILTER, QoS::AtLeastOnce, move |message: Message| {
            if let Ok(status) = serde_json::from_slice::<AgentStatus>(&message.payload) {
                let _ = tx.send(status);
            }
        })
        .unwrap();
        Self { rx, _link: link }
    }

    pub async fn next(&mut self) -> AgentStatus {
        tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("no status published")
            .expect("status stream closed")
    }

    /// Next status from a given node
    pub async fn next_from(&mut self, node_id: &str) -> AgentStatus {
        loop {
            let status = self.next().await;
            if status.node_id == node_id {
                return status;
            }
        }
    }

    /// Assert nothing arrives for a short while
    pub async fn assert_quiet(&mut self) {
        let extra = tokio::time::timeout(Duration::from_millis(200), self.rx.recv()).await;
        assert!(extra.is_err(), "unexpected status: {:?}", extra);
    }
}

pub async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(2), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
}
