use thiserror::Error;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("realtime channel has shut down")]
    Shutdown,
}
