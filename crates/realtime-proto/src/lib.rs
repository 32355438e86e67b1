//! Wire frames for the console realtime broker.
//!
//! Every frame is a JSON object tagged by `type`. Client frames are strongly
//! typed; server frames are classified from a raw [`Value`] so that event
//! payloads can be handed to listeners verbatim, including fields this crate
//! does not know about.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub const TYPE_CONNECTED: &str = "connected";
pub const TYPE_SUBSCRIBED: &str = "subscribed";
pub const TYPE_UNSUBSCRIBED: &str = "unsubscribed";
pub const TYPE_ERROR: &str = "error";
pub const TYPE_DATABASE_CHANGE: &str = "database_change";

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Authenticate {
        token: String,
    },
    Subscribe {
        subscription_id: String,
        #[serde(default)]
        data: Value,
    },
    /// Carries the filter the subscription was made with.
    Unsubscribe {
        subscription_id: String,
        #[serde(default)]
        data: Value,
    },
}

impl ClientFrame {
    pub fn authenticate(token: impl Into<String>) -> Self {
        ClientFrame::Authenticate {
            token: token.into(),
        }
    }

    pub fn subscribe(subscription_id: impl Into<String>, filter: Value) -> Self {
        ClientFrame::Subscribe {
            subscription_id: subscription_id.into(),
            data: filter,
        }
    }

    pub fn unsubscribe(subscription_id: impl Into<String>, filter: Value) -> Self {
        ClientFrame::Unsubscribe {
            subscription_id: subscription_id.into(),
            data: filter,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a json object")]
    NotAnObject,
}

/// A classified server frame.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    /// Authentication accepted.
    Connected { user_id: Option<Value> },
    Subscribed { subscription_id: String },
    Unsubscribed { subscription_id: String },
    /// Broker-level error that is not tied to a subscription.
    Error { message: String },
    /// Anything routed by `subscription_id`. `frame` is the full message as
    /// received.
    Event {
        subscription_id: String,
        kind: Option<String>,
        frame: Value,
    },
    /// A well-formed frame with no routing key and no known type.
    Unrouted { kind: Option<String> },
}

impl ServerFrame {
    pub fn parse(text: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(text)?;
        Self::classify(value)
    }

    pub fn classify(value: Value) -> Result<Self, FrameError> {
        let object = value.as_object().ok_or(FrameError::NotAnObject)?;
        let kind = string_field(object, "type");
        let subscription_id = string_field(object, "subscription_id");

        let frame = match (kind.as_deref(), subscription_id) {
            (Some(TYPE_CONNECTED), _) => ServerFrame::Connected {
                user_id: object.get("user_id").cloned(),
            },
            (Some(TYPE_SUBSCRIBED), Some(subscription_id)) => {
                ServerFrame::Subscribed { subscription_id }
            }
            (Some(TYPE_UNSUBSCRIBED), Some(subscription_id)) => {
                ServerFrame::Unsubscribed { subscription_id }
            }
            (Some(TYPE_ERROR), None) => ServerFrame::Error {
                message: string_field(object, "message")
                    .unwrap_or_else(|| "unspecified broker error".into()),
            },
            (_, Some(subscription_id)) => ServerFrame::Event {
                subscription_id,
                kind,
                frame: value,
            },
            (_, None) => ServerFrame::Unrouted { kind },
        };
        Ok(frame)
    }
}

fn string_field(object: &Map<String, Value>, key: &str) -> Option<String> {
    object.get(key).and_then(Value::as_str).map(str::to_owned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn client_frames_match_broker_shape() {
        let auth = serde_json::to_value(ClientFrame::authenticate("tok")).unwrap();
        assert_eq!(auth, json!({"type": "authenticate", "token": "tok"}));

        let sub = serde_json::to_value(ClientFrame::subscribe(
            "tables_changes",
            json!({"schema": "public"}),
        ))
        .unwrap();
        assert_eq!(
            sub,
            json!({
                "type": "subscribe",
                "subscription_id": "tables_changes",
                "data": {"schema": "public"}
            })
        );

        let unsub = serde_json::to_value(ClientFrame::unsubscribe(
            "tables_changes",
            json!({"schema": "public"}),
        ))
        .unwrap();
        assert_eq!(
            unsub,
            json!({
                "type": "unsubscribe",
                "subscription_id": "tables_changes",
                "data": {"schema": "public"}
            })
        );

        // Unknown filters still put the key on the wire.
        let bare = serde_json::to_value(ClientFrame::unsubscribe("buckets", Value::Null)).unwrap();
        assert_eq!(
            bare,
            json!({"type": "unsubscribe", "subscription_id": "buckets", "data": null})
        );
    }

    #[test]
    fn database_change_is_routed_by_subscription_id() {
        let text = r#"{"type":"database_change","subscription_id":"tables_changes","data":{"op":"INSERT"}}"#;
        match ServerFrame::parse(text).unwrap() {
            ServerFrame::Event {
                subscription_id,
                kind,
                frame,
            } => {
                assert_eq!(subscription_id, "tables_changes");
                assert_eq!(kind.as_deref(), Some(TYPE_DATABASE_CHANGE));
                assert_eq!(frame["data"]["op"], "INSERT");
            }
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[test]
    fn untyped_frames_with_routing_key_are_events() {
        let frame = ServerFrame::parse(r#"{"subscription_id":"a","data":1}"#).unwrap();
        assert!(matches!(frame, ServerFrame::Event { kind: None, .. }));
    }

    #[test]
    fn acknowledgements_and_errors_are_classified() {
        assert_eq!(
            ServerFrame::parse(r#"{"type":"connected","user_id":"u-1"}"#).unwrap(),
            ServerFrame::Connected {
                user_id: Some(json!("u-1"))
            }
        );
        assert_eq!(
            ServerFrame::parse(r#"{"type":"subscribed","subscription_id":"a"}"#).unwrap(),
            ServerFrame::Subscribed {
                subscription_id: "a".into()
            }
        );
        assert_eq!(
            ServerFrame::parse(r#"{"type":"error","message":"bad filter"}"#).unwrap(),
            ServerFrame::Error {
                message: "bad filter".into()
            }
        );
        assert_eq!(
            ServerFrame::parse(r#"{"type":"pong"}"#).unwrap(),
            ServerFrame::Unrouted {
                kind: Some("pong".into())
            }
        );
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(matches!(
            ServerFrame::parse("{not json"),
            Err(FrameError::Json(_))
        ));
        assert!(matches!(
            ServerFrame::parse("[1,2]"),
            Err(FrameError::NotAnObject)
        ));
    }
}
