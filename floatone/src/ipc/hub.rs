use std::collections::HashSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;

use floatone_ipc::{BusFrame, BusRequest};

const BROADCAST_CAPACITY: usize = 1024;

/// Relays every published event to all connected windows
pub struct BusServer {
    socket_path: PathBuf,
    broadcaster: FrameBroadcaster,
}

impl BusServer {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            broadcaster: FrameBroadcaster::new(BROADCAST_CAPACITY),
        }
    }

    pub fn broadcaster(&self) -> &FrameBroadcaster {
        &self.broadcaster
    }

    pub fn bind(&self) -> Result<UnixListener> {
        // Remove a socket left behind by a previous hub
        if self.socket_path.exists() {
            std::fs::remove_file(&self.socket_path)
                .with_context(|| format!("Failed to remove stale socket {:?}", self.socket_path))?;
        }

        let listener = UnixListener::bind(&self.socket_path)
            .with_context(|| format!("Failed to bind bus hub to {:?}", self.socket_path))?;
        tracing::info!("Bus hub listening on {:?}", self.socket_path);
        Ok(listener)
    }

    /// Accept windows until the future is dropped, which also closes every connection
    pub async fn serve(self, listener: UnixListener) -> Result<()> {
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _addr)) => {
                        let frames = self.broadcaster.subscribe();
                        let broadcaster = self.broadcaster.clone();
                        connections.spawn(async move {
                            if let Err(e) = Self::handle_connection(stream, frames, broadcaster).await {
                                tracing::debug!("Bus connection closed: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::error!("Bus hub accept error: {}", e);
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }
    }

    async fn handle_connection(
        stream: UnixStream,
        mut frames: broadcast::Receiver<BusFrame>,
        broadcaster: FrameBroadcaster,
    ) -> Result<()> {
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();
        let mut peer = Peer::default();

        // Hello first; frames published meanwhile wait in `frames` and are filtered once it is known
        let Some(first) = lines.next_line().await? else {
            return Ok(());
        };
        peer.handle(&first, &broadcaster, &mut writer).await?;

        loop {
            tokio::select! {
                line = lines.next_line() => {
                    let Some(line) = line? else {
                        tracing::debug!("Window {} disconnected", peer.window);
                        break;
                    };
                    peer.handle(&line, &broadcaster, &mut writer).await?;
                }
                frame = frames.recv() => match frame {
                    Ok(frame) => {
                        if matches_filter(peer.filter.as_ref(), &frame) {
                            write_frame(&mut writer, &frame).await?;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Window {} lagged by {} events", peer.window, n);
                        write_frame(&mut writer, &BusFrame::Lagged { missed: n }).await?;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }

        Ok(())
    }
}

/// One connected window as the hub sees it
struct Peer {
    window: String,
    /// None forwards every event
    filter: Option<HashSet<String>>,
}

impl Default for Peer {
    fn default() -> Self {
        Self {
            window: String::from("<anonymous>"),
            filter: None,
        }
    }
}

impl Peer {
    async fn handle(
        &mut self,
        line: &str,
        broadcaster: &FrameBroadcaster,
        writer: &mut OwnedWriteHalf,
    ) -> Result<()> {
        if line.trim().is_empty() {
            return Ok(());
        }

        match serde_json::from_str::<BusRequest>(line) {
            Ok(BusRequest::Hello { window, events }) => {
                tracing::debug!("Window {} subscribed to {:?}", window, events);
                self.filter = (!events.is_empty()).then(|| events.into_iter().collect());
                self.window = window;
            }
            Ok(BusRequest::Publish { event, payload }) => {
                broadcaster.send(BusFrame::Event { event, payload });
            }
            Err(e) => {
                tracing::warn!("Invalid request from window {}: {}", self.window, e);
                let frame = BusFrame::Error {
                    message: format!("Invalid request: {}", e),
                };
                write_frame(writer, &frame).await?;
            }
        }
        Ok(())
    }
}

impl Drop for BusServer {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.socket_path);
    }
}

fn matches_filter(filter: Option<&HashSet<String>>, frame: &BusFrame) -> bool {
    match (filter, frame) {
        (None, _) => true,
        (Some(events), BusFrame::Event { event, .. }) => events.contains(event),
        (Some(_), BusFrame::Error { .. } | BusFrame::Lagged { .. }) => false,
    }
}

async fn write_frame(writer: &mut OwnedWriteHalf, frame: &BusFrame) -> Result<()> {
    let json = serde_json::to_string(frame)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

/// Sender side of the hub's fan-out channel
#[derive(Clone)]
pub struct FrameBroadcaster {
    frame_tx: broadcast::Sender<BusFrame>,
}

impl FrameBroadcaster {
    pub fn new(capacity: usize) -> Self {
        let (frame_tx, _) = broadcast::channel(capacity);
        Self { frame_tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BusFrame> {
        self.frame_tx.subscribe()
    }

    /// Send a frame to all connections
    pub fn send(&self, frame: BusFrame) {
        // No connections is not an error
        let _ = self.frame_tx.send(frame);
    }

    pub fn connection_count(&self) -> usize {
        self.frame_tx.receiver_count()
    }
}
