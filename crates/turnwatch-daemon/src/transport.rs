//! Socket pumps. Each connection gets a task that only moves text frames
//! between the WebSocket and channels; all protocol handling stays with the
//! manager.

use futures_util::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    Opened {
        endpoint_id: String,
        generation: u64,
    },
    Frame {
        endpoint_id: String,
        generation: u64,
        text: String,
    },
    Closed {
        endpoint_id: String,
        generation: u64,
        reason: String,
    },
}

impl ConnectionSignal {
    pub fn endpoint_id(&self) -> &str {
        match self {
            ConnectionSignal::Opened { endpoint_id, .. }
            | ConnectionSignal::Frame { endpoint_id, .. }
            | ConnectionSignal::Closed { endpoint_id, .. } => endpoint_id,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            ConnectionSignal::Opened { generation, .. }
            | ConnectionSignal::Frame { generation, .. }
            | ConnectionSignal::Closed { generation, .. } => *generation,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect to {url} failed: {message}")]
    Connect { url: String, message: String },
    #[error("receive failed: {0}")]
    Receive(String),
    #[error("send failed: {0}")]
    Send(String),
    #[error("transport closed")]
    Closed,
}

/// Opens transports. The manager holds one for its lifetime.
pub trait TransportFactory: Send + Sync {
    fn open(
        &self,
        endpoint_id: &str,
        url: &Url,
        generation: u64,
        signals: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> TransportHandle;
}

/// Outbound half of a transport. Dropping it stops the pump.
#[derive(Debug)]
pub struct TransportHandle {
    outbound: mpsc::UnboundedSender<String>,
    task: Option<JoinHandle<()>>,
}

impl TransportHandle {
    pub fn new(outbound: mpsc::UnboundedSender<String>, task: Option<JoinHandle<()>>) -> Self {
        Self { outbound, task }
    }

    pub fn send(&self, text: String) -> Result<(), TransportError> {
        self.outbound.send(text).map_err(|_| TransportError::Closed)
    }
}

impl Drop for TransportHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct WebSocketTransport;

impl TransportFactory for WebSocketTransport {
    fn open(
        &self,
        endpoint_id: &str,
        url: &Url,
        generation: u64,
        signals: mpsc::UnboundedSender<ConnectionSignal>,
    ) -> TransportHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let endpoint_id = endpoint_id.to_string();
        let url = url.clone();
        let task = tokio::spawn(async move {
            let reason = match pump(&endpoint_id, &url, generation, &signals, outbound_rx).await {
                Ok(()) => "closed".to_string(),
                Err(err) => err.to_string(),
            };
            let _ = signals.send(ConnectionSignal::Closed {
                endpoint_id,
                generation,
                reason,
            });
        });
        TransportHandle::new(outbound_tx, Some(task))
    }
}

async fn pump(
    endpoint_id: &str,
    url: &Url,
    generation: u64,
    signals: &mpsc::UnboundedSender<ConnectionSignal>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) -> Result<(), TransportError> {
    let (mut ws, _) = connect_async(url.as_str())
        .await
        .map_err(|err| TransportError::Connect {
            url: url.to_string(),
            message: err.to_string(),
        })?;
    if signals
        .send(ConnectionSignal::Opened {
            endpoint_id: endpoint_id.to_string(),
            generation,
        })
        .is_err()
    {
        return Ok(());
    }

    loop {
        tokio::select! {
            incoming = ws.next() => {
                let text = match incoming {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => text,
                        Err(_) => {
                            debug!(event = "endpoint_binary_frame_dropped", endpoint_id);
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => return Err(TransportError::Receive(err.to_string())),
                };
                let frame = ConnectionSignal::Frame {
                    endpoint_id: endpoint_id.to_string(),
                    generation,
                    text,
                };
                if signals.send(frame).is_err() {
                    break;
                }
            }
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(text) => {
                        ws.send(Message::Text(text))
                            .await
                            .map_err(|err| TransportError::Send(err.to_string()))?;
                    }
                    None => {
                        let _ = ws.close(None).await;
                        break;
                    }
                }
            }
        }
    }
    Ok(())
}
