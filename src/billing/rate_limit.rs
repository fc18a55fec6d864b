use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use sqlx::PgPool;

use crate::error::AppError;

/// key: channel-rate-limit -> per-minute action caps counted from channel logs
#[derive(Debug, Clone, Default)]
pub struct RateLimits {
    per_minute: HashMap<String, i64>,
}

impl RateLimits {
    pub fn new(per_minute: HashMap<String, i64>) -> Self {
        Self { per_minute }
    }

    /// Unknown actions have a limit of zero.
    pub fn limit_for(&self, action: &str) -> i64 {
        self.per_minute.get(action).copied().unwrap_or(0)
    }

    pub fn allows(&self, action: &str, recent: i64) -> bool {
        recent < self.limit_for(action)
    }

    pub async fn check(
        &self,
        pool: &PgPool,
        channel_id: i32,
        action: &str,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let recent: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM channel_logs
            WHERE channel_id = $1
              AND action = $2
              AND created_at >= $3
            "#,
        )
        .bind(channel_id)
        .bind(action)
        .bind(now - Duration::minutes(1))
        .fetch_one(pool)
        .await?;
        Ok(self.allows(action, recent))
    }

    pub async fn require(
        &self,
        pool: &PgPool,
        channel_id: i32,
        action: &str,
    ) -> Result<(), AppError> {
        if self.check(pool, channel_id, action, Utc::now()).await? {
            Ok(())
        } else {
            Err(AppError::TooManyRequests(
                "Rate limit exceeded. Try again later.".into(),
            ))
        }
    }
}
