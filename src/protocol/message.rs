//! Chat message definitions
//!
//! Frame format (JSON text over an ordered, reliable data channel):
//! - `type`: frame discriminator, `"chat-message"` for chat traffic
//! - remaining fields: the flattened [`ChatMessage`] in camelCase

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Frame discriminator for chat messages
pub const FRAME_TYPE_CHAT: &str = "chat-message";

/// Kind of chat message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MessageKind {
    /// Plain text typed by a participant
    #[default]
    Text,
    /// Notices generated by the application
    System,
    /// Result of a dice roll
    DiceRoll,
}

impl MessageKind {
    /// Wire name of the kind
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::System => "system",
            Self::DiceRoll => "diceRoll",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(Self::Text),
            "system" => Ok(Self::System),
            "diceRoll" | "dice_roll" | "dice" => Ok(Self::DiceRoll),
            other => Err(format!("Unknown message kind: {}", other)),
        }
    }
}

/// A single chat message
///
/// `id` is unique per message instance; the same value is seen by the
/// author's local echo and by every remote delivery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_display_name: String,
    pub body: String,
    /// Milliseconds since the Unix epoch
    pub timestamp: i64,
    pub kind: MessageKind,
}

impl ChatMessage {
    /// Create a message with a fresh id and the current timestamp
    pub fn new(
        sender_id: impl Into<String>,
        sender_display_name: impl Into<String>,
        body: impl Into<String>,
        kind: MessageKind,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            sender_id: sender_id.into(),
            sender_display_name: sender_display_name.into(),
            body: body.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            kind,
        }
    }

    /// Check whether the message was authored by the given peer
    pub fn is_from(&self, peer_id: &str) -> bool {
        self.sender_id == peer_id
    }
}

/// Frames exchanged over a peer data channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ChannelFrame {
    #[serde(rename = "chat-message")]
    Chat(ChatMessage),
}

impl ChannelFrame {
    /// Serialize to the JSON text sent over the channel
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parse JSON text received from the channel
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_has_unique_id() {
        let a = ChatMessage::new("p1", "Alice", "hi", MessageKind::Text);
        let b = ChatMessage::new("p1", "Alice", "hi", MessageKind::Text);
        assert_ne!(a.id, b.id);
        assert!(a.timestamp > 0);
        assert!(a.is_from("p1"));
        assert!(!a.is_from("p2"));
    }

    #[test]
    fn test_frame_wire_shape() {
        let msg = ChatMessage {
            id: "m-1".to_string(),
            sender_id: "p1".to_string(),
            sender_display_name: "Alice".to_string(),
            body: "rolled 2d6: 9".to_string(),
            timestamp: 1_700_000_000_000,
            kind: MessageKind::DiceRoll,
        };

        let json = ChannelFrame::Chat(msg.clone()).to_json().unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(value["type"], FRAME_TYPE_CHAT);
        assert_eq!(value["senderId"], "p1");
        assert_eq!(value["senderDisplayName"], "Alice");
        assert_eq!(value["kind"], "diceRoll");

        match ChannelFrame::from_json(&json).unwrap() {
            ChannelFrame::Chat(parsed) => assert_eq!(parsed, msg),
        }
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let json = r#"{"type":"typing","senderId":"p1"}"#;
        assert!(ChannelFrame::from_json(json).is_err());
    }

    #[test]
    fn test_message_kind_parse() {
        assert_eq!("text".parse::<MessageKind>().unwrap(), MessageKind::Text);
        assert_eq!("dice_roll".parse::<MessageKind>().unwrap(), MessageKind::DiceRoll);
        assert!("shout".parse::<MessageKind>().is_err());
        assert_eq!(MessageKind::DiceRoll.to_string(), "diceRoll");
    }
}
