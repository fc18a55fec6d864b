use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tokio::sync::mpsc::{channel, Receiver, Sender};
use tokio::time::{timeout, Duration};

use crate::billing::ledger::QuotaLedger;
use crate::billing::models::ActionKind;
use crate::channels::logs::ACTION_AI_GENERATE;
use crate::channels::ChannelLogger;
use crate::generation::{ContentGenerator, GenerationRequest};
use crate::scheduling::posts::{create_post, NewPost, PostStatus};

/// Self-describing payload for one generation run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationJob {
    pub rule_id: Option<i32>,
    pub company_id: i32,
    pub channel_id: i32,
    pub topic: String,
    pub prompt: String,
    pub use_random_context: bool,
    pub publish_immediately: bool,
    pub timezone: String,
    /// Set when the caller already took the `ai` unit from the ledger.
    pub quota_prepaid: bool,
}

impl GenerationJob {
    fn request(&self) -> GenerationRequest {
        GenerationRequest {
            company_id: self.company_id,
            channel_id: self.channel_id,
            rule_id: self.rule_id,
            topic: self.topic.clone(),
            prompt: self.prompt.clone(),
            use_random_context: self.use_random_context,
            timezone: self.timezone.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Job {
    GeneratePost(GenerationJob),
}

#[derive(Clone)]
pub struct JobContext {
    pub pool: PgPool,
    pub ledger: QuotaLedger,
    pub logger: ChannelLogger,
    pub generator: Arc<dyn ContentGenerator>,
    pub provider_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GenerationOutcome {
    Created { post_id: i32 },
    QuotaDenied { reason: String },
    Disabled,
    Empty,
    Failed,
}

pub fn start_worker(context: JobContext) -> Sender<Job> {
    let (tx, mut rx): (Sender<Job>, Receiver<Job>) = channel(32);

    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            match job {
                Job::GeneratePost(job) => {
                    let context = context.clone();
                    tokio::spawn(async move {
                        match run_generation_job(&context, &job, Utc::now()).await {
                            Ok(outcome) => {
                                tracing::info!(
                                    ?outcome,
                                    channel_id = job.channel_id,
                                    rule_id = ?job.rule_id,
                                    "generation job completed",
                                );
                            }
                            Err(err) => {
                                tracing::warn!(
                                    ?err,
                                    channel_id = job.channel_id,
                                    rule_id = ?job.rule_id,
                                    "generation job failed",
                                );
                            }
                        }
                    });
                }
            }
        }
    });
    tx
}

/// key: generate-post-job -> quota, generator, post
///
/// Generator failures and empty output only leave a channel log; the rule simply waits for
/// its next slot. Without a configured generator no `ai` unit is taken.
pub async fn run_generation_job(
    context: &JobContext,
    job: &GenerationJob,
    now: DateTime<Utc>,
) -> Result<GenerationOutcome> {
    if !context.generator.is_enabled() {
        tracing::warn!(
            channel_id = job.channel_id,
            rule_id = ?job.rule_id,
            "generation skipped, no generator configured",
        );
        context
            .logger
            .log(
                job.channel_id,
                &format!("AI generation is not available. Topic: {}.", job.topic),
                None,
                None,
            )
            .await;
        return Ok(GenerationOutcome::Disabled);
    }

    if !job.quota_prepaid {
        let outcome = context
            .ledger
            .check_and_consume_at(job.company_id, ActionKind::Ai, now)
            .await
            .context("failed to consult quota ledger")?;
        if !outcome.admitted {
            context
                .logger
                .log(
                    job.channel_id,
                    &format!("AI generation skipped: {}.", outcome.reason),
                    None,
                    None,
                )
                .await;
            return Ok(GenerationOutcome::QuotaDenied {
                reason: outcome.reason,
            });
        }
    }

    let generated = match timeout(context.provider_timeout, context.generator.generate(&job.request())).await {
        Ok(Ok(generated)) => generated,
        Ok(Err(err)) => {
            tracing::warn!(?err, channel_id = job.channel_id, "content generator failed");
            context
                .logger
                .log(
                    job.channel_id,
                    &format!(
                        "Error while generating post, try again later. Topic: {}.",
                        job.topic
                    ),
                    None,
                    None,
                )
                .await;
            return Ok(GenerationOutcome::Failed);
        }
        Err(_) => {
            tracing::warn!(channel_id = job.channel_id, "content generator timed out");
            context
                .logger
                .log(
                    job.channel_id,
                    &format!("Generation timed out, try again later. Topic: {}.", job.topic),
                    None,
                    None,
                )
                .await;
            return Ok(GenerationOutcome::Failed);
        }
    };

    let Some(content) = generated.filter(|text| !text.trim().is_empty()) else {
        context
            .logger
            .log(
                job.channel_id,
                &format!(
                    "Sorry, I couldn't generate a post by topic {}. Please try again.",
                    job.topic
                ),
                None,
                None,
            )
            .await;
        return Ok(GenerationOutcome::Empty);
    };

    let post = create_post(&context.pool, &draft_for(job, content, now))
        .await
        .context("failed to store generated post")?;

    if let Some(rule_id) = job.rule_id {
        sqlx::query("UPDATE scheduled_ai_posts SET last_run_at = $2 WHERE id = $1")
            .bind(rule_id)
            .bind(now)
            .execute(&context.pool)
            .await
            .context("failed to record rule run")?;
    }

    context
        .logger
        .log(
            job.channel_id,
            "AI generated post successfully.",
            Some(ACTION_AI_GENERATE),
            Some(post.id),
        )
        .await;

    Ok(GenerationOutcome::Created { post_id: post.id })
}

fn draft_for(job: &GenerationJob, content: String, now: DateTime<Utc>) -> NewPost {
    let (status, scheduled_time) = if job.publish_immediately {
        (PostStatus::Scheduled, Some(now))
    } else {
        (PostStatus::Draft, None)
    };
    NewPost {
        company_id: job.company_id,
        channel_id: job.channel_id,
        content,
        ai_generated: true,
        status,
        scheduled_time,
        timezone: job.timezone.clone(),
    }
}
