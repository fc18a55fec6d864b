use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use tokio::time::{self, Duration as TokioDuration};
use tracing::{info, warn};

pub const ACTION_POST_SEND: &str = "post_send";
pub const ACTION_AI_GENERATE: &str = "ai_generate";

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct ChannelLog {
    pub id: i64,
    pub channel_id: i32,
    pub post_id: Option<i32>,
    pub action: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// key: channel-logger -> user-visible per-channel activity
///
/// Append-only. A failed write is reported through tracing and never surfaces to the caller.
#[derive(Clone)]
pub struct ChannelLogger {
    pool: PgPool,
}

impl ChannelLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log(&self, channel_id: i32, message: &str, action: Option<&str>, post_id: Option<i32>) {
        let result = sqlx::query(
            "INSERT INTO channel_logs (channel_id, post_id, action, message) VALUES ($1, $2, $3, $4)",
        )
        .bind(channel_id)
        .bind(post_id)
        .bind(action)
        .bind(message)
        .execute(&self.pool)
        .await;

        if let Err(err) = result {
            warn!(?err, %channel_id, ?post_id, entry = message, "failed to append channel log");
        }
    }

    pub async fn recent(&self, channel_id: i32, limit: i64) -> Result<Vec<ChannelLog>, sqlx::Error> {
        sqlx::query_as::<_, ChannelLog>(
            "SELECT * FROM channel_logs WHERE channel_id = $1 ORDER BY created_at DESC, id DESC LIMIT $2",
        )
        .bind(channel_id)
        .bind(limit.clamp(1, 200))
        .fetch_all(&self.pool)
        .await
    }

    /// Whether a successful send of `post_id` was already recorded.
    pub async fn has_delivery(&self, post_id: i32) -> Result<bool, sqlx::Error> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM channel_logs WHERE post_id = $1 AND action = $2)",
        )
        .bind(post_id)
        .bind(ACTION_POST_SEND)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn remove_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, sqlx::Error> {
        let removed = sqlx::query("DELETE FROM channel_logs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(removed)
    }
}

/// key: channel-log-retention -> daily cleanup
pub fn spawn_retention(logger: ChannelLogger, retention_days: i64, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = time::interval(TokioDuration::from_secs(interval_secs));
        loop {
            ticker.tick().await;
            let cutoff = Utc::now() - Duration::days(retention_days);
            match logger.remove_older_than(cutoff).await {
                Ok(removed) if removed > 0 => info!(removed, %cutoff, "old channel logs removed"),
                Ok(_) => {}
                Err(err) => warn!(?err, "channel log retention tick failed"),
            }
        }
    });
}
