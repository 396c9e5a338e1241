//! Inbound Telegram updates

use serde::Deserialize;

use super::types::{CallbackQuery, ChatMemberUpdated, Message};

/// A single event delivered by Telegram
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawUpdate")]
pub struct Update {
    pub update_id: i64,
    pub kind: UpdateKind,
}

/// The payload an update carries; Telegram sets exactly one of these
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateKind {
    Message(Message),
    EditedMessage(Message),
    ChannelPost(Message),
    EditedChannelPost(Message),
    CallbackQuery(CallbackQuery),
    MyChatMember(ChatMemberUpdated),
    /// An update type this gateway does not model
    Other { kind: String },
}

impl UpdateKind {
    /// Wire name of the update type
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Message(_) => "message",
            Self::EditedMessage(_) => "edited_message",
            Self::ChannelPost(_) => "channel_post",
            Self::EditedChannelPost(_) => "edited_channel_post",
            Self::CallbackQuery(_) => "callback_query",
            Self::MyChatMember(_) => "my_chat_member",
            Self::Other { kind } => kind,
        }
    }
}

impl Update {
    /// Chat the update originated from, if any
    #[must_use]
    pub fn chat_id(&self) -> Option<i64> {
        match &self.kind {
            UpdateKind::Message(m)
            | UpdateKind::EditedMessage(m)
            | UpdateKind::ChannelPost(m)
            | UpdateKind::EditedChannelPost(m) => Some(m.chat.id),
            UpdateKind::CallbackQuery(q) => q.message.as_ref().map(|m| m.chat.id),
            UpdateKind::MyChatMember(c) => Some(c.chat.id),
            UpdateKind::Other { .. } => None,
        }
    }
}

/// Wire shape: `update_id` plus one optional field per update type
#[derive(Deserialize)]
struct RawUpdate {
    update_id: i64,
    message: Option<Message>,
    edited_message: Option<Message>,
    channel_post: Option<Message>,
    edited_channel_post: Option<Message>,
    callback_query: Option<CallbackQuery>,
    my_chat_member: Option<ChatMemberUpdated>,
    #[serde(flatten)]
    rest: serde_json::Map<String, serde_json::Value>,
}

impl TryFrom<RawUpdate> for Update {
    type Error = String;

    fn try_from(raw: RawUpdate) -> Result<Self, Self::Error> {
        let kind = if let Some(m) = raw.message {
            UpdateKind::Message(m)
        } else if let Some(m) = raw.edited_message {
            UpdateKind::EditedMessage(m)
        } else if let Some(m) = raw.channel_post {
            UpdateKind::ChannelPost(m)
        } else if let Some(m) = raw.edited_channel_post {
            UpdateKind::EditedChannelPost(m)
        } else if let Some(q) = raw.callback_query {
            UpdateKind::CallbackQuery(q)
        } else if let Some(c) = raw.my_chat_member {
            UpdateKind::MyChatMember(c)
        } else if let Some((kind, _)) = raw.rest.into_iter().find(|(_, v)| v.is_object()) {
            UpdateKind::Other { kind }
        } else {
            return Err(format!("update {} carries no payload", raw.update_id));
        };

        Ok(Self {
            update_id: raw.update_id,
            kind,
        })
    }
}
