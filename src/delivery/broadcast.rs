//! Broadcast fan-out over the delivery queue
//!
//! A broadcast turns into one independent message job per recipient. Jobs
//! are spaced by a fixed offset so the fan-out stays under the global rate
//! limit, and the broadcast waits for their reports until its deadline.

use std::collections::HashSet;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::{DeliveryQueue, Job, Outcome};
use crate::telegram::{InlineKeyboardMarkup, ParseMode, SendMessage};
use crate::{Error, Result};

/// A user the application may broadcast to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Recipient {
    /// Application-level user id
    pub id: i64,
    /// Linked Telegram chat, if the user has connected one
    #[serde(default)]
    pub telegram_id: Option<i64>,
}

/// Source of broadcast recipients
#[async_trait]
pub trait RecipientDirectory: Send + Sync {
    /// All known recipients, linked or not
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be read
    async fn recipients(&self) -> Result<Vec<Recipient>>;
}

/// Fixed recipient list, optionally loaded from a JSON file
#[derive(Debug, Clone, Default)]
pub struct StaticDirectory {
    recipients: Vec<Recipient>,
}

impl StaticDirectory {
    #[must_use]
    pub const fn new(recipients: Vec<Recipient>) -> Self {
        Self { recipients }
    }

    /// Load a JSON array of recipients
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let recipients: Vec<Recipient> = serde_json::from_str(&contents)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;

        tracing::info!(path = %path.display(), count = recipients.len(), "loaded broadcast recipients");
        Ok(Self { recipients })
    }
}

#[async_trait]
impl RecipientDirectory for StaticDirectory {
    async fn recipients(&self) -> Result<Vec<Recipient>> {
        Ok(self.recipients.clone())
    }
}

/// Message to send to every selected recipient
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BroadcastRequest {
    pub text: String,
    #[serde(default)]
    pub parse_mode: Option<ParseMode>,
    #[serde(default)]
    pub reply_markup: Option<InlineKeyboardMarkup>,
    /// Restrict to these application user ids; `None` means everyone
    #[serde(default)]
    pub recipient_ids: Option<Vec<i64>>,
}

impl BroadcastRequest {
    #[must_use]
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            parse_mode: None,
            reply_markup: None,
            recipient_ids: None,
        }
    }

    #[must_use]
    pub fn only(mut self, ids: impl IntoIterator<Item = i64>) -> Self {
        self.recipient_ids = Some(ids.into_iter().collect());
        self
    }

    fn message_for(&self, chat_id: i64) -> SendMessage {
        SendMessage {
            chat_id,
            text: self.text.clone(),
            parse_mode: self.parse_mode,
            disable_notification: None,
            reply_markup: self.reply_markup.clone(),
        }
    }

    /// Telegram chats to target, in directory order
    fn targets(&self, recipients: Vec<Recipient>) -> Vec<i64> {
        let filter: Option<HashSet<i64>> = self
            .recipient_ids
            .as_ref()
            .map(|ids| ids.iter().copied().collect());

        recipients
            .into_iter()
            .filter(|r| filter.as_ref().is_none_or(|ids| ids.contains(&r.id)))
            .filter_map(|r| r.telegram_id)
            .collect()
    }
}

/// Result of a broadcast
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastSummary {
    /// Linked recipients selected
    pub total: usize,
    pub sent: usize,
    pub failed: usize,
    /// Jobs with no report when the deadline passed
    pub pending: usize,
}

impl DeliveryQueue {
    /// Fan a message out to every selected recipient with a Telegram link
    ///
    /// Recipient `i` is scheduled `i * broadcast_spacing` from now. The
    /// broadcast itself runs once, bounded by `broadcast_timeout`; jobs still
    /// unreported at the deadline are counted as pending.
    ///
    /// # Errors
    ///
    /// Returns error if the recipient directory fails
    pub async fn broadcast(
        &self,
        directory: &dyn RecipientDirectory,
        request: &BroadcastRequest,
    ) -> Result<BroadcastSummary> {
        let deadline = Instant::now() + self.config.broadcast_timeout;

        let targets = request.targets(directory.recipients().await?);
        let mut summary = BroadcastSummary {
            total: targets.len(),
            ..BroadcastSummary::default()
        };

        tracing::info!(queue = %self.config.name, total = summary.total, "broadcast started");

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut outstanding = 0usize;

        for (index, chat_id) in targets.into_iter().enumerate() {
            let offset = self
                .config
                .broadcast_spacing
                .saturating_mul(u32::try_from(index).unwrap_or(u32::MAX));

            match self.push(
                Job::Message(request.message_for(chat_id)),
                offset,
                Some(tx.clone()),
            ) {
                Ok(_) => outstanding += 1,
                Err(e) => {
                    summary.failed += 1;
                    tracing::warn!(chat_id, error = %e, "broadcast job not queued");
                }
            }
        }
        drop(tx);

        while outstanding > 0 {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(report)) => {
                    outstanding -= 1;
                    match report.outcome {
                        Outcome::Sent => summary.sent += 1,
                        Outcome::Failed { .. } => summary.failed += 1,
                    }
                }
                // Remaining jobs were cancelled
                Ok(None) => break,
                Err(_) => {
                    tracing::warn!(
                        queue = %self.config.name,
                        outstanding,
                        "broadcast deadline reached"
                    );
                    break;
                }
            }
        }

        summary.pending = summary.total - summary.sent - summary.failed;

        tracing::info!(
            queue = %self.config.name,
            total = summary.total,
            sent = summary.sent,
            failed = summary.failed,
            pending = summary.pending,
            "broadcast finished"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recipients() -> Vec<Recipient> {
        vec![
            Recipient { id: 1, telegram_id: Some(100) },
            Recipient { id: 2, telegram_id: None },
            Recipient { id: 3, telegram_id: Some(300) },
        ]
    }

    #[test]
    fn unlinked_recipients_are_skipped() {
        let request = BroadcastRequest::new("hi");
        assert_eq!(request.targets(recipients()), vec![100, 300]);
    }

    #[test]
    fn id_filter_narrows_targets() {
        let request = BroadcastRequest::new("hi").only([2, 3]);
        assert_eq!(request.targets(recipients()), vec![300]);
    }

    #[test]
    fn request_deserializes_with_defaults() {
        let request: BroadcastRequest =
            serde_json::from_str(r#"{"text":"<b>news</b>","parse_mode":"HTML"}"#).unwrap();
        assert_eq!(request.parse_mode, Some(ParseMode::Html));
        assert!(request.recipient_ids.is_none());

        let message = request.message_for(5);
        assert_eq!(message.chat_id, 5);
        assert_eq!(message.text, "<b>news</b>");
    }

    #[test]
    fn directory_file_must_be_json_array() {
        let path = std::env::temp_dir().join(format!("recipients-{}.json", uuid::Uuid::new_v4()));
        std::fs::write(&path, r#"[{"id":1,"telegram_id":10},{"id":2}]"#).unwrap();

        let directory = StaticDirectory::from_file(&path).unwrap();
        assert_eq!(directory.recipients.len(), 2);

        std::fs::write(&path, "{}").unwrap();
        assert!(matches!(StaticDirectory::from_file(&path), Err(Error::Config(_))));

        std::fs::remove_file(&path).unwrap();
    }
}
