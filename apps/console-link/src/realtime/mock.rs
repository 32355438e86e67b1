//! In-memory broker for exercising the realtime channel without a network.

use crate::realtime::error::RealtimeError;
use crate::realtime::transport::{Connector, Outbound, SocketEvent, SocketLink};
use async_trait::async_trait;
use realtime_proto::ClientFrame;
use serde_json::Value;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use url::Url;

/// Creates a connector and the broker that sees every connection it opens.
pub fn mock_broker() -> (Arc<MockConnector>, MockBroker) {
    let (accepted_tx, accepted_rx) = mpsc::unbounded_channel();
    let attempts = Arc::new(AtomicUsize::new(0));
    let connector = Arc::new(MockConnector {
        accepted: accepted_tx,
        refuse: AtomicUsize::new(0),
        attempts: Arc::clone(&attempts),
    });
    (
        connector,
        MockBroker {
            accepted: accepted_rx,
            attempts,
        },
    )
}

pub struct MockConnector {
    accepted: mpsc::UnboundedSender<MockSocket>,
    refuse: AtomicUsize,
    attempts: Arc<AtomicUsize>,
}

impl MockConnector {
    /// Fails the next `count` connection attempts.
    pub fn refuse_next(&self, count: usize) {
        self.refuse.store(count, Ordering::SeqCst);
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &Url) -> Result<SocketLink, RealtimeError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let refused = self
            .refuse
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if refused {
            return Err(RealtimeError::Connect(format!("refused by mock broker: {url}")));
        }

        let (link, from_client, to_client) = SocketLink::pair();
        self.accepted
            .send(MockSocket {
                from_client,
                to_client,
            })
            .map_err(|_| RealtimeError::Shutdown)?;
        Ok(link)
    }
}

pub struct MockBroker {
    accepted: mpsc::UnboundedReceiver<MockSocket>,
    attempts: Arc<AtomicUsize>,
}

impl MockBroker {
    /// Waits for the next connection the channel opens.
    pub async fn accept(&mut self) -> Option<MockSocket> {
        self.accepted.recv().await
    }

    /// Connection attempts seen so far, refused ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

/// The broker's end of one connection.
pub struct MockSocket {
    from_client: mpsc::UnboundedReceiver<Outbound>,
    to_client: mpsc::UnboundedSender<SocketEvent>,
}

impl MockSocket {
    /// Next frame from the client. `None` once the client closed or dropped
    /// the socket.
    pub async fn recv_frame(&mut self) -> Option<ClientFrame> {
        loop {
            match self.from_client.recv().await? {
                Outbound::Text(text) => match serde_json::from_str(&text) {
                    Ok(frame) => return Some(frame),
                    Err(err) => {
                        tracing::warn!(error = %err, "mock broker received undecodable frame");
                    }
                },
                Outbound::Close { .. } => return None,
            }
        }
    }

    /// Next raw command, for asserting on close codes.
    pub async fn recv_outbound(&mut self) -> Option<Outbound> {
        self.from_client.recv().await
    }

    /// Frames already sent by the client, without waiting.
    pub fn drain_frames(&mut self) -> Vec<ClientFrame> {
        let mut frames = Vec::new();
        while let Ok(command) = self.from_client.try_recv() {
            if let Outbound::Text(text) = command {
                if let Ok(frame) = serde_json::from_str(&text) {
                    frames.push(frame);
                }
            }
        }
        frames
    }

    pub fn send_json(&self, value: &Value) -> bool {
        self.send_text(value.to_string())
    }

    pub fn send_text(&self, text: impl Into<String>) -> bool {
        self.to_client.send(SocketEvent::Text(text.into())).is_ok()
    }

    /// Completes the handshake the way the broker does after `authenticate`.
    pub fn acknowledge(&self, user_id: &str) -> bool {
        self.send_json(&serde_json::json!({"type": "connected", "user_id": user_id}))
    }

    pub fn close(self, code: u16) {
        let _ = self.to_client.send(SocketEvent::Closed { code });
    }
}
