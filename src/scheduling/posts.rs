use anyhow::Result;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, PgPool};

use crate::error::ConfigurationError;

use super::recurrence::local_to_utc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PostStatus {
    Draft,
    Scheduled,
    Published,
    Failed,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Draft => "draft",
            PostStatus::Scheduled => "scheduled",
            PostStatus::Published => "published",
            PostStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PostStatus::Published | PostStatus::Failed)
    }
}

/// key: content-item-model -> scheduled post
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Post {
    pub id: i32,
    pub company_id: i32,
    pub channel_id: i32,
    pub content: String,
    pub ai_generated: bool,
    pub status: String,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub timezone: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewPost {
    pub company_id: i32,
    pub channel_id: i32,
    pub content: String,
    pub ai_generated: bool,
    pub status: PostStatus,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub timezone: String,
}

impl NewPost {
    /// A post scheduled at a wall-clock time the user entered in `timezone`.
    pub fn scheduled_at_local(
        company_id: i32,
        channel_id: i32,
        content: String,
        local: NaiveDateTime,
        timezone: &str,
    ) -> Result<Self, ConfigurationError> {
        Ok(Self {
            company_id,
            channel_id,
            content,
            ai_generated: false,
            status: PostStatus::Scheduled,
            scheduled_time: Some(local_to_utc(local, timezone)?),
            timezone: timezone.to_string(),
        })
    }
}

pub async fn create_post(pool: &PgPool, post: &NewPost) -> Result<Post> {
    let created = sqlx::query_as::<_, Post>(
        r#"
        INSERT INTO posts (
            company_id,
            channel_id,
            content,
            ai_generated,
            status,
            scheduled_time,
            timezone
        ) VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING *
        "#,
    )
    .bind(post.company_id)
    .bind(post.channel_id)
    .bind(&post.content)
    .bind(post.ai_generated)
    .bind(post.status.as_str())
    .bind(post.scheduled_time)
    .bind(&post.timezone)
    .fetch_one(pool)
    .await?;
    Ok(created)
}

pub async fn post_by_id(pool: &PgPool, post_id: i32) -> Result<Option<Post>> {
    let post = sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = $1")
        .bind(post_id)
        .fetch_optional(pool)
        .await?;
    Ok(post)
}

pub async fn due_posts(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<Post>> {
    let posts = sqlx::query_as::<_, Post>(
        r#"
        SELECT * FROM posts
        WHERE status = 'scheduled'
          AND scheduled_time IS NOT NULL
          AND scheduled_time <= $1
        ORDER BY scheduled_time ASC, id ASC
        LIMIT $2
        "#,
    )
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await?;
    Ok(posts)
}

/// Moves a scheduled post to a terminal status. Returns `false` when the post already left
/// `scheduled`, so each post is published or failed at most once.
pub async fn finish(pool: &PgPool, post_id: i32, status: PostStatus) -> Result<bool> {
    debug_assert!(status.is_terminal());
    let updated = sqlx::query("UPDATE posts SET status = $2 WHERE id = $1 AND status = 'scheduled'")
        .bind(post_id)
        .bind(status.as_str())
        .execute(pool)
        .await?
        .rows_affected();
    Ok(updated == 1)
}

/// Puts a draft back in line for the next sweep, used by the "send now" action.
pub async fn schedule_now(pool: &PgPool, post_id: i32, now: DateTime<Utc>) -> Result<bool> {
    let updated = sqlx::query(
        "UPDATE posts SET status = 'scheduled', scheduled_time = $2 WHERE id = $1 AND status IN ('draft', 'scheduled')",
    )
    .bind(post_id)
    .bind(now)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(updated == 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{NaiveDate, TimeZone};

    #[test]
    fn local_schedule_is_stored_as_utc() {
        let local = NaiveDate::from_ymd_opt(2024, 12, 24)
            .unwrap()
            .and_hms_opt(18, 0, 0)
            .unwrap();
        let post =
            NewPost::scheduled_at_local(1, 2, "Merry".into(), local, "Europe/Kyiv").unwrap();
        assert_eq!(
            post.scheduled_time,
            Some(Utc.with_ymd_and_hms(2024, 12, 24, 16, 0, 0).unwrap())
        );
        assert_eq!(post.status, PostStatus::Scheduled);
        assert_eq!(post.timezone, "Europe/Kyiv");
    }

    #[test]
    fn unknown_timezone_rejects_schedule() {
        let local = NaiveDate::from_ymd_opt(2024, 12, 24)
            .unwrap()
            .and_hms_opt(18, 0, 0)
            .unwrap();
        assert!(NewPost::scheduled_at_local(1, 2, "x".into(), local, "Nowhere/Land").is_err());
    }

    #[test]
    fn only_published_and_failed_are_terminal() {
        assert!(PostStatus::Published.is_terminal());
        assert!(PostStatus::Failed.is_terminal());
        assert!(!PostStatus::Scheduled.is_terminal());
        assert!(!PostStatus::Draft.is_terminal());
    }
}
