use crate::realtime::backoff::{CLOSE_ABNORMAL, CLOSE_NO_STATUS};
use crate::realtime::error::RealtimeError;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// What the channel asks the socket to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Close { code: u16 },
}

/// What the socket reports back. `Closed` is always the last event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketEvent {
    Text(String),
    Closed { code: u16 },
}

/// An open socket, seen as a pair of queues. Dropping the link closes the
/// socket.
#[derive(Debug)]
pub struct SocketLink {
    pub outbound: mpsc::UnboundedSender<Outbound>,
    pub inbound: mpsc::UnboundedReceiver<SocketEvent>,
}

impl SocketLink {
    /// Returns the link plus the far ends: the receiver of outbound commands
    /// and the sender of inbound events.
    pub fn pair() -> (
        Self,
        mpsc::UnboundedReceiver<Outbound>,
        mpsc::UnboundedSender<SocketEvent>,
    ) {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        (
            Self {
                outbound: outbound_tx,
                inbound: inbound_rx,
            },
            outbound_rx,
            inbound_tx,
        )
    }
}

#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, url: &Url) -> Result<SocketLink, RealtimeError>;
}

/// Production connector backed by `tokio-tungstenite`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TungsteniteConnector;

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &Url) -> Result<SocketLink, RealtimeError> {
        let (ws_stream, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| RealtimeError::Connect(format!("timed out connecting to {url}")))??;

        let (link, outbound_rx, inbound_tx) = SocketLink::pair();
        tokio::spawn(async move {
            pump_websocket(ws_stream, outbound_rx, inbound_tx).await;
        });
        Ok(link)
    }
}

async fn pump_websocket(
    ws_stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    inbound: mpsc::UnboundedSender<SocketEvent>,
) {
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    loop {
        tokio::select! {
            command = outbound.recv() => match command {
                Some(Outbound::Text(text)) => {
                    if let Err(err) = ws_sender.send(Message::Text(text)).await {
                        tracing::debug!(
                            target: "console_link::realtime",
                            error = %err,
                            "websocket send failed"
                        );
                        let _ = inbound.send(SocketEvent::Closed { code: CLOSE_ABNORMAL });
                        break;
                    }
                }
                Some(Outbound::Close { code }) => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: Cow::Borrowed(""),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    let _ = ws_sender.close().await;
                    break;
                }
                None => {
                    let _ = ws_sender.close().await;
                    break;
                }
            },
            message = ws_receiver.next() => match message {
                Some(Ok(Message::Text(text))) => {
                    if inbound.send(SocketEvent::Text(text)).is_err() {
                        break;
                    }
                }
                Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                    Ok(text) => {
                        if inbound.send(SocketEvent::Text(text)).is_err() {
                            break;
                        }
                    }
                    Err(_) => tracing::warn!(
                        target: "console_link::realtime",
                        "dropping non-utf8 binary frame"
                    ),
                },
                Some(Ok(Message::Close(frame))) => {
                    let code = frame.map_or(CLOSE_NO_STATUS, |frame| u16::from(frame.code));
                    let _ = inbound.send(SocketEvent::Closed { code });
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    tracing::debug!(
                        target: "console_link::realtime",
                        error = %err,
                        "websocket read failed"
                    );
                    let _ = inbound.send(SocketEvent::Closed { code: CLOSE_ABNORMAL });
                    break;
                }
                None => {
                    let _ = inbound.send(SocketEvent::Closed { code: CLOSE_ABNORMAL });
                    break;
                }
            },
        }
    }
}
