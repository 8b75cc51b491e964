use std::path::Path;

use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use floatone_ipc::{BusFrame, BusRequest};
use floatone_store::{BusError, Envelope, EventBus, LocalBus, Subscription};

enum Outgoing {
    Request(BusRequest),
    Flush(oneshot::Sender<()>),
}

/// Event bus backed by a connection to the bus hub.
/// Received events fan out to local subscribers; publishes are queued to a writer task.
pub struct SocketBus {
    local: LocalBus,
    outgoing: mpsc::UnboundedSender<Outgoing>,
    closed: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl SocketBus {
    pub async fn connect(socket_path: &Path, window: &str) -> Result<Self> {
        Self::connect_with(socket_path, BusRequest::hello(window)).await
    }

    /// Connect announcing only `events`; an empty list receives everything
    pub async fn connect_filtered(
        socket_path: &Path,
        window: &str,
        events: Vec<String>,
    ) -> Result<Self> {
        let hello = BusRequest::Hello {
            window: window.to_string(),
            events,
        };
        Self::connect_with(socket_path, hello).await
    }

    async fn connect_with(socket_path: &Path, hello: BusRequest) -> Result<Self> {
        let stream = UnixStream::connect(socket_path)
            .await
            .with_context(|| format!("Failed to connect to floatone hub at {:?}", socket_path))?;
        let (reader, writer) = stream.into_split();

        let (outgoing, requests) = mpsc::unbounded_channel();
        outgoing
            .send(Outgoing::Request(hello))
            .map_err(|_| anyhow!("Bus writer stopped before start"))?;

        let local = LocalBus::new();
        let (closed_tx, closed) = watch::channel(false);
        let tasks = vec![
            tokio::spawn(write_loop(writer, requests)),
            tokio::spawn(read_loop(reader, local.clone(), closed_tx)),
        ];

        Ok(Self {
            local,
            outgoing,
            closed,
            tasks,
        })
    }

    /// Wait until everything published so far has been written to the hub
    pub async fn flush(&self) -> Result<()> {
        let (done, written) = oneshot::channel();
        self.outgoing
            .send(Outgoing::Flush(done))
            .map_err(|_| anyhow!("Bus connection is closed"))?;
        written.await.context("Bus connection is closed")
    }

    /// Resolves once the hub has closed the connection
    pub async fn closed(&self) {
        let mut closed = self.closed.clone();
        let _ = closed.wait_for(|closed| *closed).await;
    }
}

impl EventBus for SocketBus {
    fn publish(&self, event: &str, payload: Value) -> Result<(), BusError> {
        let request = BusRequest::Publish {
            event: event.to_string(),
            payload,
        };
        self.outgoing
            .send(Outgoing::Request(request))
            .map_err(|_| BusError::Closed)
    }

    fn subscribe(&self, event: &str) -> Subscription {
        self.local.subscribe(event)
    }
}

impl Drop for SocketBus {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn write_loop(mut writer: OwnedWriteHalf, mut requests: mpsc::UnboundedReceiver<Outgoing>) {
    while let Some(outgoing) = requests.recv().await {
        match outgoing {
            Outgoing::Request(request) => {
                if let Err(e) = write_request(&mut writer, &request).await {
                    tracing::warn!("Failed to write to bus hub: {}", e);
                    break;
                }
            }
            Outgoing::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}

async fn write_request(writer: &mut OwnedWriteHalf, request: &BusRequest) -> Result<()> {
    let json = serde_json::to_string(request)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

async fn read_loop(reader: OwnedReadHalf, local: LocalBus, closed: watch::Sender<bool>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<BusFrame>(&line) {
                Ok(BusFrame::Event { event, payload }) => {
                    local.dispatch(Envelope { event, payload });
                }
                Ok(BusFrame::Error { message }) => {
                    tracing::warn!("Bus hub rejected a request: {}", message);
                }
                Ok(BusFrame::Lagged { missed }) => {
                    tracing::warn!(
                        "Missed {} events from the bus hub; values may be stale until they change again",
                        missed
                    );
                }
                Err(e) => {
                    tracing::warn!("Ignoring malformed frame from bus hub: {}", e);
                }
            },
            Ok(None) => {
                tracing::info!("Bus hub closed the connection");
                break;
            }
            Err(e) => {
                tracing::warn!("Bus connection failed: {}", e);
                break;
            }
        }
    }
    closed.send_replace(true);
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use floatone_ipc::{FloatOneConfig, Theme};
    use floatone_store::{app_schema, Window, CONFIG, NEW_VERSION_DOWNLOADED};
    use serde_json::json;

    use super::*;
    use crate::ipc::{BusServer, FrameBroadcaster};

    struct Hub {
        path: std::path::PathBuf,
        broadcaster: FrameBroadcaster,
        task: JoinHandle<Result<()>>,
    }

    impl Hub {
        fn start(dir: &tempfile::TempDir) -> Self {
            let path = dir.path().join("bus.sock");
            let server = BusServer::new(&path);
            let listener = server.bind().unwrap();
            let broadcaster = server.broadcaster().clone();
            Self {
                path,
                broadcaster,
                task: tokio::spawn(server.serve(listener)),
            }
        }

        /// Connect and wait until the hub has accepted the connection
        async fn connect(&self, label: &str) -> Arc<SocketBus> {
            let expected = self.broadcaster.connection_count() + 1;
            let bus = Arc::new(SocketBus::connect(&self.path, label).await.unwrap());
            tokio::time::timeout(Duration::from_secs(2), async {
                while self.broadcaster.connection_count() < expected {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("hub did not accept connection");
            bus
        }
    }

    async fn recv(sub: &mut Subscription) -> Envelope {
        tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("timed out waiting for event")
            .expect("bus closed")
    }

    #[tokio::test]
    async fn test_connect_fails_without_hub() {
        let dir = tempfile::tempdir().unwrap();
        assert!(SocketBus::connect(&dir.path().join("none.sock"), "a")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_events_round_trip_through_hub() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::start(&dir);

        let a = hub.connect("a").await;
        let b = hub.connect("b").await;
        let mut sub = b.subscribe("config-update");
        let mut own = a.subscribe("config-update");

        a.publish("config-update", json!({"theme": "light"})).unwrap();
        a.flush().await.unwrap();

        assert_eq!(recv(&mut sub).await.payload, json!({"theme": "light"}));
        // The hub echoes to the publisher too
        assert_eq!(recv(&mut own).await.event, "config-update");
    }

    #[tokio::test]
    async fn test_closed_resolves_when_hub_stops() {
        let dir = tempfile::tempdir().unwrap();
        let hub = Hub::start(&dir);
        let bus = hub.connect("a").await;

        hub.task.abort();
        tokio::time::timeout(Duration::from_secs(2), bus.closed())
            .await
            .expect("connection stayed open");
    }

    #[tokio::test]
    async fn test_windows_converge_through_hub() {
        let dir = tempfile::tempdir().unwrap();
        let store_path = dir.path().join("store.bin");
        let hub = Hub::start(&dir);
        let schema = Arc::new(app_schema().unwrap());

        let tipbar = Window::open("tipbar", schema.clone(), &store_path, hub.connect("tipbar").await);
        let settings = Window::open("settings", schema, &store_path, hub.connect("settings").await);
        tipbar.init().await.unwrap();
        settings.init().await.unwrap();

        let mut binding = tipbar.store().use_key(&CONFIG).unwrap();
        let config = FloatOneConfig {
            theme: Theme::Light,
            ..FloatOneConfig::default()
        };
        settings.store().set(&CONFIG, config.clone()).await.unwrap();
        settings.store().set(&NEW_VERSION_DOWNLOADED, true).await.unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(2), binding.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(seen, config);
        assert_eq!(tipbar.store().get(&CONFIG).unwrap().theme, Theme::Light);

        let mut downloaded = tipbar.store().use_key(&NEW_VERSION_DOWNLOADED).unwrap();
        if !downloaded.get().unwrap() {
            let value = tokio::time::timeout(Duration::from_secs(2), downloaded.changed())
                .await
                .unwrap()
                .unwrap();
            assert!(value);
        }
    }
}
