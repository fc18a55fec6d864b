use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc::Sender;

use crate::billing::{ActionKind, QuotaLedger, RateLimits};
use crate::channels::logs::{ChannelLog, ACTION_AI_GENERATE, ACTION_POST_SEND};
use crate::channels::{channel_by_id, ChannelLogger};
use crate::error::{AppError, AppResult};
use crate::generation::ContentGenerator;
use crate::job_queue::{GenerationJob, Job};

use super::posts::{post_by_id, schedule_now};
use super::recurrence::resolve_timezone;

#[derive(Debug, Deserialize)]
pub struct GenerateNowRequest {
    pub topic: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default)]
    pub use_random_context: bool,
    #[serde(default)]
    pub publish_immediately: bool,
    #[serde(default = "default_timezone")]
    pub timezone: String,
}

fn default_timezone() -> String {
    "UTC".to_string()
}

/// key: generate-now -> rate limit, ai quota, generation job
pub async fn generate_now(
    Extension(pool): Extension<PgPool>,
    Extension(ledger): Extension<QuotaLedger>,
    Extension(limits): Extension<RateLimits>,
    Extension(jobs): Extension<Sender<Job>>,
    Extension(generator): Extension<Arc<dyn ContentGenerator>>,
    Path(channel_id): Path<i32>,
    Json(payload): Json<GenerateNowRequest>,
) -> AppResult<(StatusCode, Json<Value>)> {
    if payload.topic.trim().is_empty() {
        return Err(AppError::BadRequest("topic is required".into()));
    }
    resolve_timezone(&payload.timezone)?;
    if !generator.is_enabled() {
        return Err(AppError::Unavailable("content generation is not configured".into()));
    }
    let channel = channel_by_id(&pool, channel_id)
        .await?
        .ok_or(AppError::NotFound)?;

    limits.require(&pool, channel.id, ACTION_AI_GENERATE).await?;
    ledger.require(channel.company_id, ActionKind::Ai).await?;

    jobs.send(Job::GeneratePost(GenerationJob {
        rule_id: None,
        company_id: channel.company_id,
        channel_id: channel.id,
        topic: payload.topic.trim().to_string(),
        prompt: payload.prompt,
        use_random_context: payload.use_random_context,
        publish_immediately: payload.publish_immediately,
        timezone: payload.timezone,
        quota_prepaid: true,
    }))
    .await
    .map_err(|_| AppError::Message("generation worker unavailable".into()))?;

    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "queued" }))))
}

/// key: send-now -> reschedule for the next post sweep
pub async fn send_now(
    Extension(pool): Extension<PgPool>,
    Extension(limits): Extension<RateLimits>,
    Path(post_id): Path<i32>,
) -> AppResult<(StatusCode, Json<Value>)> {
    let post = post_by_id(&pool, post_id).await?.ok_or(AppError::NotFound)?;
    limits.require(&pool, post.channel_id, ACTION_POST_SEND).await?;

    if !schedule_now(&pool, post.id, Utc::now()).await? {
        return Err(AppError::BadRequest(format!(
            "post {} is already {}",
            post.id, post.status
        )));
    }
    Ok((StatusCode::ACCEPTED, Json(json!({ "status": "scheduled" }))))
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_log_limit")]
    pub limit: i64,
}

fn default_log_limit() -> i64 {
    50
}

pub async fn channel_logs(
    Extension(pool): Extension<PgPool>,
    Extension(logger): Extension<ChannelLogger>,
    Path(channel_id): Path<i32>,
    Query(query): Query<LogsQuery>,
) -> AppResult<Json<Vec<ChannelLog>>> {
    channel_by_id(&pool, channel_id)
        .await?
        .ok_or(AppError::NotFound)?;
    Ok(Json(logger.recent(channel_id, query.limit).await?))
}
