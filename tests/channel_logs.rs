use std::collections::HashMap;

use chrono::{Duration, Utc};
use postmeter::billing::RateLimits;
use postmeter::channels::ChannelLogger;
use sqlx::PgPool;

async fn channel(pool: &PgPool) -> i32 {
    let company_id: i32 = sqlx::query_scalar(
        "INSERT INTO companies (name, referral_code) VALUES ('Logs', 'LOGS000001') RETURNING id",
    )
    .fetch_one(pool)
    .await
    .unwrap();
    sqlx::query_scalar(
        "INSERT INTO channels (company_id, channel_type) VALUES ($1, 'telegram') RETURNING id",
    )
    .bind(company_id)
    .fetch_one(pool)
    .await
    .unwrap()
}

// key: channel-log-tests -> rate limit window, retention
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn rate_limit_counts_labelled_logs_in_the_last_minute(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let channel_id = channel(&pool).await;
    let logger = ChannelLogger::new(pool.clone());
    let limits = RateLimits::new(HashMap::from([("post_send".to_string(), 2)]));

    logger.log(channel_id, "Post sent", Some("post_send"), None).await;
    logger.log(channel_id, "unlabelled", None, None).await;
    assert!(limits.check(&pool, channel_id, "post_send", Utc::now()).await.unwrap());

    logger.log(channel_id, "Post sent", Some("post_send"), None).await;
    assert!(!limits.check(&pool, channel_id, "post_send", Utc::now()).await.unwrap());
    assert!(limits
        .check(&pool, channel_id, "post_send", Utc::now() + Duration::minutes(2))
        .await
        .unwrap());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn retention_removes_only_old_entries(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let channel_id = channel(&pool).await;
    let logger = ChannelLogger::new(pool.clone());
    sqlx::query("INSERT INTO channel_logs (channel_id, message, created_at) VALUES ($1, 'old', $2)")
        .bind(channel_id)
        .bind(Utc::now() - Duration::days(31))
        .execute(&pool)
        .await
        .unwrap();
    logger.log(channel_id, "recent", None, None).await;

    let removed = logger
        .remove_older_than(Utc::now() - Duration::days(30))
        .await
        .unwrap();

    assert_eq!(removed, 1);
    let remaining = logger.recent(channel_id, 10).await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].message, "recent");
}
