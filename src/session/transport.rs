use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{self, protocol::Message};
use tokio_tungstenite::connect_async;
use url::Url;

use crate::error::ConnectionError;

/// Inbound traffic and lifecycle notices from an open channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Text(String),
    Binary(Bytes),
    /// Orderly close, with the peer's reason if any.
    Closed(Option<String>),
    /// Transport failure; the channel is gone.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelCommand {
    SendText(String),
    SendBinary(Bytes),
}

/// Both halves of an open realtime channel. Dropping `commands` closes it.
pub struct Channel {
    pub commands: mpsc::Sender<ChannelCommand>,
    pub events: mpsc::Receiver<ChannelEvent>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChannelRequest {
    pub url: Url,
    pub bearer: Option<String>,
}

/// Opens realtime channels. The session owns at most one at a time.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn open(&self, request: ChannelRequest) -> Result<Channel, ConnectionError>;
}

/// WebSocket channel over tokio-tungstenite.
pub struct WebSocketTransport {
    buffer: usize,
}

impl WebSocketTransport {
    pub fn new() -> Self {
        Self { buffer: 100 }
    }

    pub fn with_buffer(buffer: usize) -> Self {
        Self { buffer: buffer.max(1) }
    }
}

impl Default for WebSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn open(&self, request: ChannelRequest) -> Result<Channel, ConnectionError> {
        let mut ws_request = request
            .url
            .as_str()
            .into_client_request()
            .map_err(|e| ConnectionError::Handshake(e.to_string()))?;

        if let Some(token) = &request.bearer {
            let value = HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| ConnectionError::Handshake(e.to_string()))?;
            ws_request.headers_mut().insert(AUTHORIZATION, value);
        }

        log::info!("Connecting to {}://{}{}", request.url.scheme(), request.url.authority(), request.url.path());
        let (ws_stream, _) = connect_async(ws_request).await.map_err(connect_error)?;
        log::info!("Connected!");

        let (cmd_tx, cmd_rx) = mpsc::channel::<ChannelCommand>(self.buffer);
        let (event_tx, event_rx) = mpsc::channel::<ChannelEvent>(self.buffer);

        tokio::spawn(pump(ws_stream, cmd_rx, event_tx));

        Ok(Channel {
            commands: cmd_tx,
            events: event_rx,
        })
    }
}

// 连不上对端算传输错误，其余都是握手失败
fn connect_error(e: tungstenite::Error) -> ConnectionError {
    match e {
        tungstenite::Error::Io(e) => ConnectionError::Transport(e.to_string()),
        other => ConnectionError::Handshake(other.to_string()),
    }
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

// 主循环，处理读取和写入，直到任意一端关闭
async fn pump(
    ws_stream: WsStream,
    mut cmd_rx: mpsc::Receiver<ChannelCommand>,
    event_tx: mpsc::Sender<ChannelEvent>,
) {
    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            msg = read.next() => {
                let event = match msg {
                    Some(Ok(Message::Text(text))) => ChannelEvent::Text(text.as_str().to_string()),
                    Some(Ok(Message::Binary(data))) => ChannelEvent::Binary(data),
                    Some(Ok(Message::Close(frame))) => {
                        log::info!("Server closed connection: {:?}", frame);
                        let reason = frame
                            .map(|f| f.reason.as_str().to_string())
                            .filter(|r| !r.is_empty());
                        let _ = event_tx.send(ChannelEvent::Closed(reason)).await;
                        return;
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        log::warn!("WebSocket read error: {}", e);
                        let _ = event_tx.send(ChannelEvent::Failed(e.to_string())).await;
                        return;
                    }
                    None => {
                        let _ = event_tx.send(ChannelEvent::Closed(None)).await;
                        return;
                    }
                };
                if event_tx.send(event).await.is_err() {
                    // Session dropped its receiver.
                    let _ = write.send(Message::Close(None)).await;
                    return;
                }
            }
            cmd = cmd_rx.recv() => {
                let result = match cmd {
                    Some(ChannelCommand::SendText(text)) => write.send(Message::Text(text.into())).await,
                    Some(ChannelCommand::SendBinary(data)) => write.send(Message::Binary(data)).await,
                    None => {
                        log::debug!("Command channel closed, closing WebSocket");
                        let _ = write.send(Message::Close(None)).await;
                        return;
                    }
                };
                if let Err(e) = result {
                    log::warn!("WebSocket write error: {}", e);
                    let _ = event_tx.send(ChannelEvent::Failed(e.to_string())).await;
                    return;
                }
            }
        }
    }
}
