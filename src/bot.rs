//! Default update handler
//!
//! Answers `/start` and `/help` through the delivery queue and logs
//! everything else. Replies are never sent inline: the webhook answers
//! Telegram as soon as the job is queued.

use std::sync::Arc;

use async_trait::async_trait;

use crate::delivery::{DeliveryQueue, Job};
use crate::telegram::types::{CallbackQuery, ChatMemberUpdated};
use crate::telegram::{
    InlineKeyboardButton, InlineKeyboardMarkup, Message, ParseMode, SendMessage, Update,
    UpdateHandler,
};
use crate::Result;

const WELCOME: &str = "<b>Welcome!</b>\nTap the button below to open the app.";
const WELCOME_NO_APP: &str = "<b>Welcome!</b>\nYou will receive your notifications here.";
const HELP: &str = "/start - open the app\n/help - show this message";

/// Handler wired into the webhook by default
#[derive(Debug)]
pub struct CourierBot {
    queue: Arc<DeliveryQueue>,
    webapp_url: Option<String>,
}

impl CourierBot {
    #[must_use]
    pub const fn new(queue: Arc<DeliveryQueue>, webapp_url: Option<String>) -> Self {
        Self { queue, webapp_url }
    }

    fn welcome(&self, chat_id: i64) -> SendMessage {
        match &self.webapp_url {
            Some(url) => SendMessage::new(chat_id, WELCOME)
                .parse_mode(ParseMode::Html)
                .reply_markup(InlineKeyboardMarkup::single(InlineKeyboardButton::web_app(
                    "Open app", url,
                ))),
            None => SendMessage::new(chat_id, WELCOME_NO_APP).parse_mode(ParseMode::Html),
        }
    }
}

#[async_trait]
impl UpdateHandler for CourierBot {
    async fn on_message(&self, update_id: i64, message: Message) -> Result<()> {
        let chat_id = message.chat.id;

        let reply = match message.command() {
            Some("start") => self.welcome(chat_id),
            Some("help") => SendMessage::new(chat_id, HELP),
            command => {
                tracing::debug!(update_id, chat_id, ?command, "message ignored");
                return Ok(());
            }
        };

        let job_id = self.queue.enqueue(Job::Message(reply))?;
        tracing::info!(update_id, chat_id, %job_id, "command reply queued");
        Ok(())
    }

    async fn on_callback_query(&self, update_id: i64, query: CallbackQuery) -> Result<()> {
        tracing::info!(
            update_id,
            user_id = query.from.id,
            data = ?query.data,
            "callback query received"
        );
        Ok(())
    }

    async fn on_chat_member(&self, update_id: i64, change: ChatMemberUpdated) -> Result<()> {
        let status = change.new_chat_member.status.as_str();
        if matches!(status, "kicked" | "left") {
            tracing::warn!(update_id, chat_id = change.chat.id, status, "bot removed from chat");
        } else {
            tracing::info!(update_id, chat_id = change.chat.id, status, "bot membership changed");
        }
        Ok(())
    }

    async fn on_other(&self, update: Update) -> Result<()> {
        tracing::debug!(
            update_id = update.update_id,
            kind = update.kind.name(),
            "update not handled"
        );
        Ok(())
    }
}
