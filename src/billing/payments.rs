use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::mpsc::{channel, Sender};
use tracing::{error, info, warn};

use super::liqpay::{OrderId, PaymentEvent, PaymentStatusClass, PAYMENT_SERVICE};
use super::models::{Company, Payment};
use super::referral::{self, ReferralReward};
use super::subscription::{self, SubscriptionService};

/// What applying a single provider notification did.
#[derive(Debug, Clone)]
pub enum PaymentEventOutcome {
    Applied {
        company: Company,
        payment: Payment,
        reward: Option<ReferralReward>,
    },
    Duplicate {
        order_id: String,
    },
    Reverted {
        company: Company,
    },
    Ignored {
        status: String,
    },
}

/// key: payment-events -> idempotent provider notifications
#[derive(Clone)]
pub struct PaymentEventProcessor {
    pool: PgPool,
    subscriptions: SubscriptionService,
    referral_bonus_tokens: i32,
}

impl PaymentEventProcessor {
    pub fn new(pool: PgPool, subscriptions: SubscriptionService, referral_bonus_tokens: i32) -> Self {
        Self {
            pool,
            subscriptions,
            referral_bonus_tokens,
        }
    }

    pub async fn apply(&self, event: &PaymentEvent) -> Result<PaymentEventOutcome> {
        self.apply_at(event, Utc::now()).await
    }

    pub async fn apply_at(
        &self,
        event: &PaymentEvent,
        now: DateTime<Utc>,
    ) -> Result<PaymentEventOutcome> {
        let class = event.classify();
        if class == PaymentStatusClass::Other {
            info!(status = %event.status, order_id = %event.order_id, "payment event ignored");
            return Ok(PaymentEventOutcome::Ignored {
                status: event.status.clone(),
            });
        }

        let order = OrderId::parse(&event.order_id)?;
        let mut tx = self.pool.begin().await?;

        if class == PaymentStatusClass::Failure {
            // failures leave no payment row behind, only the plan reset and its dedupe marker
            let company = subscription::apply_payment_failure(&mut tx, order.company_id, now).await?;
            let first_seen: Option<String> = sqlx::query_scalar(
                r#"
                INSERT INTO payment_failures (order_id, company_id, status, created_at)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (order_id) DO NOTHING
                RETURNING order_id
                "#,
            )
            .bind(&event.order_id)
            .bind(order.company_id)
            .bind(&event.status)
            .bind(now)
            .fetch_optional(&mut tx)
            .await?;
            if first_seen.is_none() {
                tx.rollback().await?;
                info!(order_id = %event.order_id, "duplicate failure notification ignored");
                return Ok(PaymentEventOutcome::Duplicate {
                    order_id: event.order_id.clone(),
                });
            }

            tx.commit().await?;
            warn!(
                company_id = order.company_id,
                order_id = %event.order_id,
                status = %event.status,
                "payment failed or reversed, company reset to trial plan without a payment record"
            );
            return Ok(PaymentEventOutcome::Reverted { company });
        }

        let payment = sqlx::query_as::<_, Payment>(
            r#"
            INSERT INTO payments (
                company_id,
                order_id,
                amount,
                description,
                is_successful,
                payment_service,
                created_at
            ) VALUES ($1, $2, $3, $4, TRUE, $5, $6)
            ON CONFLICT (order_id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(order.company_id)
        .bind(&event.order_id)
        .bind(event.amount)
        .bind(&event.description)
        .bind(PAYMENT_SERVICE)
        .bind(now)
        .fetch_optional(&mut tx)
        .await?;

        let Some(payment) = payment else {
            tx.rollback().await?;
            info!(order_id = %event.order_id, "duplicate payment notification ignored");
            return Ok(PaymentEventOutcome::Duplicate {
                order_id: event.order_id.clone(),
            });
        };

        let company = subscription::apply_payment_success(
            &mut tx,
            order.company_id,
            order.plan_id,
            PAYMENT_SERVICE,
            now,
            self.subscriptions.period(),
        )
        .await?;
        let reward =
            referral::grant_pending_reward(&mut tx, order.company_id, self.referral_bonus_tokens)
                .await?;
        tx.commit().await?;

        info!(
            company_id = company.id,
            plan_id = order.plan_id,
            payment_id = payment.id,
            valid_until = ?company.subscription_valid_until,
            rewarded = reward.is_some(),
            "payment applied"
        );
        Ok(PaymentEventOutcome::Applied {
            company,
            payment,
            reward,
        })
    }

    pub async fn payments_for(&self, company_id: i32, page: i64, limit: i64) -> Result<(Vec<Payment>, i64)> {
        let limit = limit.clamp(1, 100);
        let offset = (page.max(1) - 1) * limit;
        let payments = sqlx::query_as::<_, Payment>(
            "SELECT * FROM payments WHERE company_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(company_id)
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM payments WHERE company_id = $1")
            .bind(company_id)
            .fetch_one(&self.pool)
            .await?;
        Ok((payments, total))
    }
}

/// key: payment-events-handle -> enqueue interface for the webhook receiver
#[derive(Clone)]
pub struct PaymentEventHandle {
    sender: Sender<PaymentEvent>,
}

impl PaymentEventHandle {
    pub fn from_sender(sender: Sender<PaymentEvent>) -> Self {
        Self { sender }
    }

    pub async fn dispatch(&self, event: PaymentEvent) -> Result<()> {
        self.sender
            .send(event)
            .await
            .map_err(|err| anyhow!("failed to enqueue payment event: {err}"))
    }
}

pub fn start_payment_worker(processor: PaymentEventProcessor) -> PaymentEventHandle {
    let (tx, mut rx) = channel::<PaymentEvent>(64);
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Err(err) = processor.apply(&event).await {
                error!(
                    ?err,
                    order_id = %event.order_id,
                    status = %event.status,
                    "failed to apply payment event"
                );
            }
        }
    });
    PaymentEventHandle { sender: tx }
}
