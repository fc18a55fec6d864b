use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

use super::{Channel, ChannelSender, DeliveryReceipt};
use crate::scheduling::posts::Post;

pub const CHANNEL_TYPE: &str = "telegram";

/// Connection settings stored in `channels.config_json`.
#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub telegram_bot_token: String,
    /// Numeric chat id or `@channel` handle.
    pub telegram_channel_id: Value,
    #[serde(default = "default_parse_mode")]
    pub parse_mode: String,
}

fn default_parse_mode() -> String {
    "html".to_string()
}

impl TelegramConfig {
    pub fn from_channel(channel: &Channel) -> Result<Self> {
        serde_json::from_value(channel.config_json.clone())
            .with_context(|| format!("channel {} has no usable telegram config", channel.id))
    }
}

#[derive(Debug, Deserialize)]
struct BotApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    result: Option<BotApiMessage>,
}

#[derive(Debug, Deserialize)]
struct BotApiMessage {
    message_id: i64,
}

/// key: telegram-sender -> bot api sendMessage
#[derive(Clone)]
pub struct TelegramSender {
    client: reqwest::Client,
    api_base: String,
}

impl TelegramSender {
    pub fn new(api_base: impl Into<String>, timeout_secs: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build telegram client")?;
        Ok(Self {
            client,
            api_base: api_base.into(),
        })
    }

    fn endpoint(&self, token: &str) -> String {
        format!("{}/bot{}/sendMessage", self.api_base.trim_end_matches('/'), token)
    }
}

#[async_trait]
impl ChannelSender for TelegramSender {
    async fn send(&self, channel: &Channel, post: &Post) -> Result<DeliveryReceipt> {
        let config = TelegramConfig::from_channel(channel)?;
        let payload = json!({
            "chat_id": config.telegram_channel_id,
            "text": post.content,
            "parse_mode": config.parse_mode,
        });

        let response = self
            .client
            .post(self.endpoint(&config.telegram_bot_token))
            .json(&payload)
            .send()
            .await
            .context("failed to reach telegram")?;

        let status = response.status();
        let parsed: BotApiResponse = response
            .json()
            .await
            .with_context(|| format!("failed to decode telegram response ({status})"))?;

        match (parsed.ok, parsed.result) {
            (true, Some(message)) => Ok(DeliveryReceipt {
                external_id: message.message_id.to_string(),
            }),
            _ => Err(anyhow!(
                "telegram rejected message: {}",
                parsed
                    .description
                    .unwrap_or_else(|| format!("status {status}"))
            )),
        }
    }
}
