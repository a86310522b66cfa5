//! Chat protocol definitions
//!
//! Defines the chat message model and the frame format carried over
//! peer data channels.

mod message;

pub use message::{ChannelFrame, ChatMessage, MessageKind, FRAME_TYPE_CHAT};
