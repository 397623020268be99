use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type UserId = u64;

/// A short descriptive label plus emoji shown next to a user's mentions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserStatus {
    pub description: String,
    /// Emoji identifier, resolved to `{emoji_base_url}/{emoji}.png`.
    pub emoji: String,
}

/// Author of a chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatUser {
    pub id: UserId,
    pub username: String,
}

/// A user referenced by an @mention inside a message.
///
/// The embedded status is a snapshot taken when the message was produced,
/// not a live reference; later `user-status:changed` broadcasts override it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MentionedUser {
    pub id: UserId,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<UserStatus>,
}

/// A chat message as delivered by the server, immutable once received.
/// Edits arrive as a wholesale replacement carrying the same id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: u64,
    /// Raw message text as typed.
    pub message: String,
    /// Server-rendered markup of the message body.
    pub cooked: String,
    #[serde(default)]
    pub mentioned_users: Vec<MentionedUser>,
    pub user: ChatUser,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_channel_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub excerpt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_title: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub available_flags: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uploads: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelMeta {
    pub channel_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub can_join_chat_channel: Option<bool>,
}

/// Body of `GET /chat/{channel_id}/messages`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessagesResponse {
    pub meta: ChannelMeta,
    pub chat_messages: Vec<ChatMessage>,
}

/// An update delivered on the `/chat/{channel_id}` bus topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelUpdate {
    Sent { chat_message: ChatMessage },
    Edit { chat_message: ChatMessage },
    Delete { deleted_id: u64 },
}

/// Payload of a `user-status:changed` broadcast: per user id, the new
/// status, or `None` (JSON `null`) to clear it.
pub type StatusMap = HashMap<UserId, Option<UserStatus>>;
