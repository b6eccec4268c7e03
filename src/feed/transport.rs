use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;

use crate::error::FeedError;
use crate::feed::protocol::{ControlMessage, FeedEvent, FrameCodec, JsonCodec};

pub const SESSION_CHANNEL_SIZE: usize = 1024;

/// Opens sessions to the upstream push feed.
#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Connects and completes the transport handshake.
    async fn connect(&self) -> Result<FeedSession, FeedError>;
}

/// One live connection. Dropping `outbound` asks the transport to close;
/// `inbound` yields decoded events and ends (or yields `Closed`) when the
/// connection goes away.
pub struct FeedSession {
    pub outbound: mpsc::Sender<ControlMessage>,
    pub inbound: mpsc::Receiver<FeedEvent>,
    pub guard: SessionGuard,
}

/// Background tasks that keep a session alive. Aborted on drop.
#[derive(Default)]
pub struct SessionGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl SessionGuard {
    pub fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }

    /// Gives the tasks `grace` to finish on their own, then aborts the rest.
    pub async fn shutdown(mut self, grace: Duration) {
        let tasks = std::mem::take(&mut self.tasks);
        let deadline = tokio::time::Instant::now() + grace;
        for mut task in tasks {
            if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
                task.abort();
            }
        }
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// WebSocket transport; frames are text encoded by a [`FrameCodec`].
pub struct WsTransport {
    url: String,
    codec: Arc<dyn FrameCodec>,
}

impl WsTransport {
    pub fn new(url: &str) -> Self {
        Self::with_codec(url, Arc::new(JsonCodec))
    }

    pub fn with_codec(url: &str, codec: Arc<dyn FrameCodec>) -> Self {
        Self {
            url: url.to_string(),
            codec,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn connect(&self) -> Result<FeedSession, FeedError> {
        let (ws_stream, response) = connect_async(self.url.as_str()).await?;
        info!("Connected to feed at {} (HTTP {})", self.url, response.status());

        let (mut write, mut read) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ControlMessage>(SESSION_CHANNEL_SIZE);
        let (inbound_tx, inbound_rx) = mpsc::channel::<FeedEvent>(SESSION_CHANNEL_SIZE);

        // Write task - control frames out, close frame once the client lets go
        let codec = self.codec.clone();
        let write_task = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let frame = match codec.encode(&message) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!("Failed to encode {:?}: {}", message, e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(frame)).await {
                    error!("Error sending control frame: {:?}", e);
                    return;
                }
            }

            debug!("Outbound channel closed, sending close frame");
            let _ = write
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "Client closing".into(),
                })))
                .await;
        });

        // Read task - decode frames and forward events
        let codec = self.codec.clone();
        let read_task = tokio::spawn(async move {
            let mut reason = None;
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => match codec.decode(&text) {
                        Ok(Some(event)) => {
                            if inbound_tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => warn!("Dropping malformed feed frame: {}", e),
                    },
                    Ok(Message::Binary(data)) => match std::str::from_utf8(&data) {
                        Ok(text) => match codec.decode(text) {
                            Ok(Some(event)) => {
                                if inbound_tx.send(event).await.is_err() {
                                    return;
                                }
                            }
                            Ok(None) => {}
                            Err(e) => warn!("Dropping malformed binary frame: {}", e),
                        },
                        Err(_) => warn!("Dropping non UTF-8 binary frame ({} bytes)", data.len()),
                    },
                    Ok(Message::Close(frame)) => {
                        info!("Feed sent close frame: {:?}", frame);
                        reason = Some(
                            frame
                                .map(|f| format!("closed by server: {}", f.reason))
                                .unwrap_or_else(|| "closed by server".to_string()),
                        );
                        break;
                    }
                    Ok(Message::Ping(_)) | Ok(Message::Pong(_)) | Ok(Message::Frame(_)) => {}
                    Err(e) => {
                        error!("Error reading from feed: {:?}", e);
                        reason = Some(e.to_string());
                        break;
                    }
                }
            }
            let _ = inbound_tx.send(FeedEvent::Closed(reason)).await;
        });

        Ok(FeedSession {
            outbound: outbound_tx,
            inbound: inbound_rx,
            guard: SessionGuard::new(vec![write_task, read_task]),
        })
    }
}
