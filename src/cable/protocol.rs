//! Action Cable wire messages
//!
//! JSON text messages exchanged over the websocket. Clients send commands
//! naming a subscription identifier, itself a JSON document encoded as a
//! string. The server answers with typed control messages and untyped
//! `message` envelopes carrying channel data.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Type of a server control message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Welcome,
    Ping,
    ConfirmSubscription,
    RejectSubscription,
    Disconnect,
}

/// Message sent from the server to the client
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerMessage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<MessageType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconnect: Option<bool>,
}

impl ServerMessage {
    fn control(kind: MessageType) -> Self {
        Self {
            kind: Some(kind),
            identifier: None,
            message: None,
            reason: None,
            reconnect: None,
        }
    }

    pub fn welcome() -> Self {
        Self::control(MessageType::Welcome)
    }

    /// Keepalive carrying the server's unix time in seconds
    pub fn ping(unix_seconds: i64) -> Self {
        Self {
            message: Some(Value::from(unix_seconds)),
            ..Self::control(MessageType::Ping)
        }
    }

    pub fn confirm_subscription(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            ..Self::control(MessageType::ConfirmSubscription)
        }
    }

    pub fn reject_subscription(identifier: impl Into<String>) -> Self {
        Self {
            identifier: Some(identifier.into()),
            ..Self::control(MessageType::RejectSubscription)
        }
    }

    pub fn disconnect(reason: impl Into<String>, reconnect: bool) -> Self {
        Self {
            reason: Some(reason.into()),
            reconnect: Some(reconnect),
            ..Self::control(MessageType::Disconnect)
        }
    }

    /// Channel data for one subscription
    pub fn message(identifier: impl Into<String>, message: Value) -> Self {
        Self {
            kind: None,
            identifier: Some(identifier.into()),
            message: Some(message),
            reason: None,
            reconnect: None,
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Kind of a client command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Subscribe,
    Unsubscribe,
    Message,
}

/// Command sent from the client to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command: CommandKind,
    /// Subscription identifier, a JSON document encoded as a string
    pub identifier: String,
    /// Action payload of `message` commands, also JSON encoded as a string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<String>,
}

impl Command {
    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Fields of a subscription identifier the server looks at
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Identifier {
    /// Channel class name, e.g. `Video::StreamsChannel`
    pub channel: String,
    /// Stream name, for channels that have one
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default, rename = "csrfToken")]
    pub csrf_token: Option<String>,
}

impl Identifier {
    pub fn parse(raw: &str) -> Result<Self> {
        serde_json::from_str(raw).map_err(|e| {
            Error::Identifier(format!("couldn't parse subscription identifier {raw}: {e}"))
        })
    }
}
