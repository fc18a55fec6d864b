use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::mpsc::Sender;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{self, sleep, timeout, Duration};
use tracing::{debug, error, info, warn};

use crate::billing::ledger::QuotaLedger;
use crate::billing::models::ActionKind;
use crate::channels::logs::ACTION_POST_SEND;
use crate::channels::{channel_by_id, ChannelLogger, SenderRegistry};
use crate::job_queue::{GenerationJob, Job};

use super::posts::{due_posts, finish, Post, PostStatus};
use super::recurrence::{is_due, RecurrenceRule};

const DUE_POST_BATCH: i64 = 200;
const CONCURRENT_SENDS: usize = 16;
const STATUS_WRITE_ATTEMPTS: u32 = 3;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PostSweepReport {
    pub published: u32,
    pub failed: u32,
    pub skipped: u32,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RuleSweepReport {
    pub enqueued: u32,
    pub already_fired: u32,
    pub misconfigured: u32,
}

/// key: post-dispatcher -> due posts through ledger and sender
#[derive(Clone)]
pub struct PostDispatcher {
    pool: PgPool,
    ledger: QuotaLedger,
    logger: ChannelLogger,
    senders: SenderRegistry,
    send_timeout: Duration,
}

impl PostDispatcher {
    pub fn new(
        pool: PgPool,
        ledger: QuotaLedger,
        logger: ChannelLogger,
        senders: SenderRegistry,
        send_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            ledger,
            logger,
            senders,
            send_timeout,
        }
    }

    /// Sends due posts concurrently, at most `CONCURRENT_SENDS` at a time.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<PostSweepReport> {
        let posts = due_posts(&self.pool, now, DUE_POST_BATCH)
            .await
            .context("failed to load due posts")?;

        let permits = Arc::new(Semaphore::new(CONCURRENT_SENDS));
        let mut sends = JoinSet::new();
        for post in posts {
            let permit = permits
                .clone()
                .acquire_owned()
                .await
                .context("send limiter closed")?;
            let dispatcher = self.clone();
            sends.spawn(async move {
                let _permit = permit;
                let result = dispatcher.dispatch(&post, now).await;
                (post.id, result)
            });
        }

        let mut report = PostSweepReport::default();
        while let Some(joined) = sends.join_next().await {
            match joined {
                Ok((_, Ok(Some(PostStatus::Published)))) => report.published += 1,
                Ok((_, Ok(Some(_)))) => report.failed += 1,
                Ok((_, Ok(None))) => report.skipped += 1,
                Ok((post_id, Err(err))) => {
                    report.skipped += 1;
                    warn!(?err, post_id, "post dispatch failed");
                }
                Err(err) => {
                    report.skipped += 1;
                    error!(?err, "post dispatch task aborted");
                }
            }
        }
        Ok(report)
    }

    /// Delivers one due post. Quota is only consumed once a sender for the channel exists.
    /// Returns the terminal status reached, or `None` when the post already left `scheduled`.
    ///
    /// A post whose delivery is already in the channel log is only marked published, never
    /// sent again.
    pub async fn dispatch(&self, post: &Post, now: DateTime<Utc>) -> Result<Option<PostStatus>> {
        if self.logger.has_delivery(post.id).await? {
            info!(post_id = post.id, "post was delivered earlier, recording its status");
            return self.record_delivery(post).await;
        }

        let Some(channel) = channel_by_id(&self.pool, post.channel_id).await? else {
            return self
                .conclude(post, PostStatus::Failed, "Post not sent: channel not found.", None)
                .await;
        };

        let Some(sender) = self.senders.for_channel(&channel) else {
            let message = format!(
                "Post not sent: channel type `{}` is not supported.",
                channel.channel_type
            );
            return self.conclude(post, PostStatus::Failed, &message, None).await;
        };

        let outcome = self
            .ledger
            .check_and_consume_at(post.company_id, ActionKind::Post, now)
            .await?;
        if !outcome.admitted {
            return self
                .conclude(post, PostStatus::Failed, &format!("Post not sent: {}.", outcome.reason), None)
                .await;
        }

        match timeout(self.send_timeout, sender.send(&channel, post)).await {
            Ok(Ok(receipt)) => {
                let message = format!(
                    "Post sent to {}. Message ID: {}",
                    channel.channel_type, receipt.external_id
                );
                self.logger
                    .log(post.channel_id, &message, Some(ACTION_POST_SEND), Some(post.id))
                    .await;
                self.record_delivery(post).await.map_err(|err| {
                    error!(
                        ?err,
                        post_id = post.id,
                        external_id = %receipt.external_id,
                        "post delivered but its status could not be written",
                    );
                    err
                })
            }
            Ok(Err(err)) => {
                warn!(?err, post_id = post.id, "channel sender failed");
                let message = format!("Failed to send post. Error: {err:#}");
                self.conclude(post, PostStatus::Failed, &message, None).await
            }
            Err(_) => {
                warn!(post_id = post.id, "channel sender timed out");
                self.conclude(post, PostStatus::Failed, "Failed to send post. Error: timed out", None)
                    .await
            }
        }
    }

    async fn conclude(
        &self,
        post: &Post,
        status: PostStatus,
        message: &str,
        action: Option<&str>,
    ) -> Result<Option<PostStatus>> {
        if !finish(&self.pool, post.id, status).await? {
            debug!(post_id = post.id, "post already concluded");
            return Ok(None);
        }
        self.logger
            .log(post.channel_id, message, action, Some(post.id))
            .await;
        Ok(Some(status))
    }

    /// Marks a delivered post published, retrying the write a few times.
    async fn record_delivery(&self, post: &Post) -> Result<Option<PostStatus>> {
        let mut attempt = 1;
        loop {
            match finish(&self.pool, post.id, PostStatus::Published).await {
                Ok(true) => return Ok(Some(PostStatus::Published)),
                Ok(false) => {
                    debug!(post_id = post.id, "post already concluded");
                    return Ok(None);
                }
                Err(err) if attempt < STATUS_WRITE_ATTEMPTS => {
                    warn!(?err, post_id = post.id, attempt, "retrying published status write");
                    sleep(Duration::from_millis(250 * u64::from(attempt))).await;
                    attempt += 1;
                }
                Err(err) => return Err(err).context("failed to mark delivered post published"),
            }
        }
    }
}

/// key: recurring-sweep -> due rules to generation jobs
pub struct RecurringSweep {
    pool: PgPool,
    jobs: Sender<Job>,
    /// rule id -> minute (unix seconds / 60) of the last enqueue
    last_enqueued: HashMap<i32, i64>,
}

impl RecurringSweep {
    pub fn new(pool: PgPool, jobs: Sender<Job>) -> Self {
        Self {
            pool,
            jobs,
            last_enqueued: HashMap::new(),
        }
    }

    pub async fn sweep(&mut self, now: DateTime<Utc>) -> Result<RuleSweepReport> {
        let rules = sqlx::query_as::<_, RecurrenceRule>(
            "SELECT * FROM scheduled_ai_posts WHERE is_active ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .context("failed to load recurrence rules")?;

        let minute = now.timestamp().div_euclid(60);
        self.last_enqueued.retain(|_, fired| *fired == minute);

        let mut report = RuleSweepReport::default();
        for rule in rules {
            match is_due(&rule, now) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(err) => {
                    report.misconfigured += 1;
                    warn!(%err, rule_id = rule.id, "skipping misconfigured recurrence rule");
                    continue;
                }
            }

            if rule.fired_in_minute_of(now) || self.last_enqueued.get(&rule.id) == Some(&minute) {
                report.already_fired += 1;
                continue;
            }

            self.jobs
                .send(Job::GeneratePost(generation_job_for(&rule)))
                .await
                .context("job worker is gone")?;
            self.last_enqueued.insert(rule.id, minute);
            report.enqueued += 1;
        }
        Ok(report)
    }
}

pub fn generation_job_for(rule: &RecurrenceRule) -> GenerationJob {
    GenerationJob {
        rule_id: Some(rule.id),
        company_id: rule.company_id,
        channel_id: rule.channel_id,
        topic: rule.topic.clone(),
        prompt: rule.prompt.clone(),
        use_random_context: rule.use_random_context,
        publish_immediately: rule.publish_immediately,
        timezone: rule.timezone.clone(),
        quota_prepaid: false,
    }
}

/// key: dispatch-tickers -> one independent ticker per sweep
pub fn spawn_post_sweep(posts: PostDispatcher, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match posts.sweep(Utc::now()).await {
                Ok(report) if report != PostSweepReport::default() => {
                    info!(?report, "scheduled posts dispatched")
                }
                Ok(_) => {}
                Err(err) => warn!(?err, "scheduled post sweep failed"),
            }
        }
    });
}

pub fn spawn_recurring_sweep(mut rules: RecurringSweep, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = time::interval(Duration::from_secs(interval_secs));
        ticker.set_missed_tick_behavior(time::MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            match rules.sweep(Utc::now()).await {
                Ok(report) if report.enqueued > 0 => info!(?report, "recurring generation enqueued"),
                Ok(_) => {}
                Err(err) => warn!(?err, "recurring sweep failed"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn rule_jobs_are_not_prepaid() {
        let rule = RecurrenceRule {
            id: 4,
            company_id: 1,
            channel_id: 9,
            weekdays: vec![0],
            times: vec!["09:00".into()],
            timezone: "UTC".into(),
            topic: "news".into(),
            prompt: String::new(),
            use_random_context: false,
            publish_immediately: false,
            is_active: true,
            last_run_at: None,
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };
        let job = generation_job_for(&rule);
        assert_eq!(job.rule_id, Some(4));
        assert_eq!(job.channel_id, 9);
        assert!(!job.quota_prepaid);
        assert!(!job.publish_immediately);
    }
}
