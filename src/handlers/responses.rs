use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use teloxide::prelude::*;
use teloxide::types::{
    InlineKeyboardButton, InlineKeyboardMarkup, InputFile, MessageId, ParseMode, ReplyParameters,
};
use teloxide::RequestError;
use tracing::{debug, warn};

use crate::utils::telegram::telegram_retryable_error;

const TELEGRAM_RETRY_ATTEMPTS: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionButton {
    pub label: String,
    pub token: String,
}

/// Platform-neutral inline keyboard.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionGrid {
    pub rows: Vec<Vec<ActionButton>>,
}

impl ActionGrid {
    pub fn tokens(&self) -> Vec<String> {
        self.rows
            .iter()
            .flatten()
            .map(|button| button.token.clone())
            .collect()
    }

    fn to_markup(&self) -> InlineKeyboardMarkup {
        InlineKeyboardMarkup::new(self.rows.iter().map(|row| {
            row.iter()
                .map(|button| {
                    InlineKeyboardButton::callback(button.label.clone(), button.token.clone())
                })
                .collect::<Vec<_>>()
        }))
    }
}

/// Replies into the chat an event came from. Text is HTML-formatted.
#[async_trait]
pub trait ChatReplier: Send + Sync {
    async fn send_text(&self, text: &str) -> Result<()>;

    async fn send_text_with_grid(&self, text: &str, grid: &ActionGrid) -> Result<()>;

    async fn send_photo(&self, path: &Path, grid: &ActionGrid) -> Result<()>;

    async fn send_document(&self, path: &Path) -> Result<()>;
}

pub struct TelegramReplier {
    bot: Bot,
    chat_id: ChatId,
    reply_to: Option<MessageId>,
}

impl TelegramReplier {
    pub fn new(bot: Bot, chat_id: ChatId, reply_to: Option<MessageId>) -> Self {
        TelegramReplier {
            bot,
            chat_id,
            reply_to,
        }
    }

    async fn send_html_with_retry(
        &self,
        text: &str,
        markup: Option<InlineKeyboardMarkup>,
    ) -> Result<Message> {
        let mut delay = Duration::from_secs_f32(1.5);
        for attempt in 0..TELEGRAM_RETRY_ATTEMPTS {
            let mut request = self
                .bot
                .send_message(self.chat_id, text.to_string())
                .parse_mode(ParseMode::Html);
            if let Some(reply_to) = self.reply_to {
                request = request.reply_parameters(ReplyParameters::new(reply_to));
            }
            if let Some(markup) = markup.clone() {
                request = request.reply_markup(markup);
            }
            match request.await {
                Ok(message) => return Ok(message),
                Err(err) => {
                    if !telegram_retryable_error(&err) || attempt + 1 == TELEGRAM_RETRY_ATTEMPTS {
                        return Err(err.into());
                    }
                    warn!("send_message attempt {} failed: {err}", attempt + 1);
                    if let RequestError::RetryAfter(wait) = err {
                        tokio::time::sleep(wait.duration()).await;
                    } else {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }

        unreachable!("send_message retry loop exhausted")
    }
}

#[async_trait]
impl ChatReplier for TelegramReplier {
    async fn send_text(&self, text: &str) -> Result<()> {
        debug!("sending message: {text}");
        self.send_html_with_retry(text, None).await?;
        Ok(())
    }

    async fn send_text_with_grid(&self, text: &str, grid: &ActionGrid) -> Result<()> {
        self.send_html_with_retry(text, Some(grid.to_markup()))
            .await?;
        Ok(())
    }

    async fn send_photo(&self, path: &Path, grid: &ActionGrid) -> Result<()> {
        let mut request = self
            .bot
            .send_photo(self.chat_id, InputFile::file(path.to_path_buf()))
            .reply_markup(grid.to_markup());
        if let Some(reply_to) = self.reply_to {
            request = request.reply_parameters(ReplyParameters::new(reply_to));
        }
        request.await?;
        Ok(())
    }

    async fn send_document(&self, path: &Path) -> Result<()> {
        let mut request = self
            .bot
            .send_document(self.chat_id, InputFile::file(path.to_path_buf()));
        if let Some(reply_to) = self.reply_to {
            request = request.reply_parameters(ReplyParameters::new(reply_to));
        }
        request.await?;
        Ok(())
    }
}
