//! Persistent realtime channel: one socket, durable subscriptions and
//! per-subscription listeners.

pub mod backoff;
pub mod channel;
pub mod error;
pub mod listeners;
pub mod mock;
pub mod subscriptions;
pub mod transport;

pub use backoff::{ReconnectDecision, ReconnectPolicy};
pub use channel::{ChannelOptions, ConnectionState, RealtimeChannel};
pub use error::RealtimeError;
pub use listeners::{ListenerHandle, ListenerId};
pub use subscriptions::Subscription;
pub use transport::{Connector, TungsteniteConnector};
