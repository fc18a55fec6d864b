use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::postgres::PgConnection;
use sqlx::PgPool;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::ConfigurationError;

use super::models::{BillingSnapshot, Company, Plan, SubscriptionState};
use super::referral;

/// key: subscription-service -> plan lifecycle per company
#[derive(Clone)]
pub struct SubscriptionService {
    pool: PgPool,
    period: Duration,
}

#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionView {
    pub company: Company,
    pub plan: Option<Plan>,
    pub state: SubscriptionState,
    pub used_posts: i64,
    pub used_ai: i64,
}

impl SubscriptionService {
    pub fn new(pool: PgPool, period_days: i64) -> Self {
        Self {
            pool,
            period: Duration::days(period_days),
        }
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub async fn ensure_trial_plan(&self) -> Result<Plan> {
        let mut conn = self.pool.acquire().await?;
        trial_plan(&mut conn).await
    }

    pub async fn company(&self, company_id: i32) -> Result<Option<Company>> {
        let company = sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE id = $1")
            .bind(company_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(company)
    }

    pub async fn subscription_view(
        &self,
        company_id: i32,
        now: DateTime<Utc>,
    ) -> Result<Option<SubscriptionView>> {
        let Some(company) = self.company(company_id).await? else {
            return Ok(None);
        };
        let plan = match company.current_plan_id {
            Some(plan_id) => sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
                .bind(plan_id)
                .fetch_optional(&self.pool)
                .await?,
            None => None,
        };
        let (used_posts, used_ai): (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE action_kind = 'post'),
                COUNT(*) FILTER (WHERE action_kind = 'ai')
            FROM usage_events
            WHERE company_id = $1 AND created_at >= $2
            "#,
        )
        .bind(company_id)
        .bind(company.last_payment_at)
        .fetch_one(&self.pool)
        .await?;

        let state =
            SubscriptionState::derive(plan.as_ref(), company.subscription_valid_until, now);
        Ok(Some(SubscriptionView {
            company,
            plan,
            state,
            used_posts,
            used_ai,
        }))
    }

    /// Registers a company on the trial plan, linking it to a referrer when a code is given.
    pub async fn register_company(
        &self,
        name: &str,
        referrer_code: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Company> {
        let mut tx = self.pool.begin().await?;
        let trial = trial_plan(&mut tx).await?;

        let referrer_id = match referrer_code {
            Some(code) => Some(
                referral::referrer_by_code(&mut tx, code)
                    .await?
                    .ok_or_else(|| ConfigurationError::new(format!("unknown referral code {code}")))?,
            ),
            None => None,
        };

        let company = sqlx::query_as::<_, Company>(
            r#"
            INSERT INTO companies (
                name,
                current_plan_id,
                plan_started_at,
                balance_tokens,
                referral_code,
                referred_by_id,
                last_payment_at
            ) VALUES ($1, $2, $3, 0, $4, $5, $3)
            RETURNING *
            "#,
        )
        .bind(name)
        .bind(trial.id)
        .bind(now)
        .bind(new_referral_code())
        .bind(referrer_id)
        .fetch_one(&mut tx)
        .await
        .context("failed to insert company")?;

        if let Some(referrer_id) = referrer_id {
            referral::link(&mut tx, referrer_id, company.id).await?;
        }

        tx.commit().await?;
        info!(company_id = company.id, ?referrer_id, "company registered on trial plan");
        Ok(company)
    }

    /// Resets every company whose paid period has lapsed back to the trial plan.
    pub async fn expire_overdue(&self, now: DateTime<Utc>) -> Result<u64> {
        let candidates: Vec<i32> = sqlx::query_scalar(
            r#"
            SELECT id FROM companies
            WHERE subscription_valid_until IS NOT NULL
              AND subscription_valid_until < $1
            ORDER BY id
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let mut expired = 0;
        for company_id in candidates {
            let mut tx = self.pool.begin().await?;
            match reset_to_trial(&mut tx, company_id, now, Some(now)).await {
                Ok(Some(_)) => {
                    tx.commit().await?;
                    expired += 1;
                    info!(%company_id, "subscription expired, company reset to trial plan");
                }
                Ok(None) => {
                    tx.rollback().await?;
                }
                Err(err) => {
                    tx.rollback().await?;
                    warn!(?err, %company_id, "failed to expire subscription");
                }
            }
        }
        Ok(expired)
    }

    /// Rolls the usage window forward for trial companies whose window is older than a period.
    pub async fn renew_trials(&self, now: DateTime<Utc>) -> Result<u64> {
        let renewed = sqlx::query(
            r#"
            UPDATE companies c
            SET last_payment_at = $1
            FROM plans p
            WHERE p.id = c.current_plan_id
              AND p.is_trial
              AND c.last_payment_at < $2
            "#,
        )
        .bind(now)
        .bind(now - self.period)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if renewed > 0 {
            info!(renewed, "trial usage windows renewed");
        }
        Ok(renewed)
    }
}

/// Get-or-create of the single trial plan. The partial unique index on `is_trial` makes a
/// concurrent bootstrap collapse onto one row.
pub async fn trial_plan(conn: &mut PgConnection) -> Result<Plan> {
    if let Some(plan) = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE is_trial LIMIT 1")
        .fetch_optional(&mut *conn)
        .await?
    {
        return Ok(plan);
    }

    let inserted = sqlx::query_as::<_, Plan>(
        r#"
        INSERT INTO plans (
            name,
            price,
            send_post_limit,
            ai_generation_limit,
            channels_limit,
            knowledge_base_limit,
            is_trial
        ) VALUES ('Trial', 0, 10, 10, 1, 5, TRUE)
        ON CONFLICT (is_trial) WHERE is_trial DO NOTHING
        RETURNING *
        "#,
    )
    .fetch_optional(&mut *conn)
    .await?;

    match inserted {
        Some(plan) => {
            info!(plan_id = plan.id, "trial plan created");
            Ok(plan)
        }
        None => sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE is_trial LIMIT 1")
            .fetch_optional(&mut *conn)
            .await?
            .ok_or_else(|| anyhow!("trial plan bootstrap failed")),
    }
}

/// Locks the company row for the rest of the caller's transaction.
pub async fn lock_company(conn: &mut PgConnection, company_id: i32) -> Result<Option<Company>> {
    let company = sqlx::query_as::<_, Company>("SELECT * FROM companies WHERE id = $1 FOR UPDATE")
        .bind(company_id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(company)
}

pub async fn apply_payment_success(
    conn: &mut PgConnection,
    company_id: i32,
    paid_plan_id: i32,
    payment_service: &str,
    now: DateTime<Utc>,
    period: Duration,
) -> Result<Company> {
    let company = lock_company(conn, company_id)
        .await?
        .ok_or_else(|| ConfigurationError::new(format!("payment for unknown company {company_id}")))?;
    let plan_exists: bool = sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM plans WHERE id = $1)")
        .bind(paid_plan_id)
        .fetch_one(&mut *conn)
        .await?;
    if !plan_exists {
        return Err(ConfigurationError::new(format!("payment for unknown plan {paid_plan_id}")).into());
    }

    let next = company
        .billing_snapshot()
        .after_payment_success(paid_plan_id, payment_service, now, period);
    write_snapshot(conn, company_id, &next).await
}

/// Payment failure or reversal: back to trial unconditionally.
pub async fn apply_payment_failure(
    conn: &mut PgConnection,
    company_id: i32,
    now: DateTime<Utc>,
) -> Result<Company> {
    reset_to_trial(conn, company_id, now, None)
        .await?
        .ok_or_else(|| ConfigurationError::new(format!("payment for unknown company {company_id}")).into())
}

/// Resets a company to the trial plan. With `expired_before` set the reset only happens if the
/// paid-through date is still earlier than that instant once the row is locked.
pub async fn reset_to_trial(
    conn: &mut PgConnection,
    company_id: i32,
    now: DateTime<Utc>,
    expired_before: Option<DateTime<Utc>>,
) -> Result<Option<Company>> {
    let trial = trial_plan(conn).await?;
    let Some(company) = lock_company(conn, company_id).await? else {
        return Ok(None);
    };

    if let Some(cutoff) = expired_before {
        match company.subscription_valid_until {
            Some(until) if until < cutoff => {}
            _ => return Ok(None),
        }
    }

    let next = company.billing_snapshot().after_reset_to_trial(trial.id, now);
    write_snapshot(conn, company_id, &next).await.map(Some)
}

async fn write_snapshot(
    conn: &mut PgConnection,
    company_id: i32,
    snapshot: &BillingSnapshot,
) -> Result<Company> {
    let company = sqlx::query_as::<_, Company>(
        r#"
        UPDATE companies
        SET current_plan_id = $2,
            plan_started_at = $3,
            last_payment_at = $4,
            subscription_valid_until = $5,
            payment_service = $6
        WHERE id = $1
        RETURNING *
        "#,
    )
    .bind(company_id)
    .bind(snapshot.current_plan_id)
    .bind(snapshot.plan_started_at)
    .bind(snapshot.last_payment_at)
    .bind(snapshot.subscription_valid_until)
    .bind(snapshot.payment_service.as_deref())
    .fetch_one(&mut *conn)
    .await?;
    Ok(company)
}

fn new_referral_code() -> String {
    Uuid::new_v4().simple().to_string()[..10].to_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn referral_codes_are_short_and_uppercase() {
        let code = new_referral_code();
        assert_eq!(code.len(), 10);
        assert!(code.chars().all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
        assert_ne!(code, new_referral_code());
    }
}
