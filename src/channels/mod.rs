pub mod logs;
pub mod telegram;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};

use crate::scheduling::posts::Post;

pub use logs::ChannelLogger;
pub use telegram::TelegramSender;

/// key: channel-model -> delivery target
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Channel {
    pub id: i32,
    pub company_id: i32,
    pub channel_type: String,
    pub config_json: Value,
    pub created_at: DateTime<Utc>,
}

pub async fn channel_by_id(pool: &PgPool, channel_id: i32) -> Result<Option<Channel>> {
    let channel = sqlx::query_as::<_, Channel>("SELECT * FROM channels WHERE id = $1")
        .bind(channel_id)
        .fetch_optional(pool)
        .await?;
    Ok(channel)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub external_id: String,
}

/// key: channel-sender -> provider delivery seam
#[async_trait]
pub trait ChannelSender: Send + Sync {
    async fn send(&self, channel: &Channel, post: &Post) -> Result<DeliveryReceipt>;
}

/// Senders keyed by `channel_type`.
#[derive(Clone, Default)]
pub struct SenderRegistry {
    senders: HashMap<String, Arc<dyn ChannelSender>>,
}

impl SenderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, channel_type: &str, sender: Arc<dyn ChannelSender>) -> Self {
        self.senders.insert(channel_type.to_string(), sender);
        self
    }

    pub fn for_channel(&self, channel: &Channel) -> Option<Arc<dyn ChannelSender>> {
        self.senders.get(channel.channel_type.as_str()).cloned()
    }
}
