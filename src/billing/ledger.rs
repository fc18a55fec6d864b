use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row};
use tracing::{debug, info};

use crate::error::AppError;

use super::models::{ActionKind, Plan, QuotaDecision, QuotaOutcome};

/// key: quota-ledger -> admit/deny metered actions
///
/// Every consumption runs in one transaction that holds the company row lock, so concurrent
/// callers for the same company are serialised and cannot both take the last unit of quota.
#[derive(Clone)]
pub struct QuotaLedger {
    pool: PgPool,
}

impl QuotaLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Non-raising mode used by background sweeps: a denial is an outcome, not an error.
    pub async fn check_and_consume(
        &self,
        company_id: i32,
        kind: ActionKind,
    ) -> Result<QuotaOutcome> {
        self.check_and_consume_at(company_id, kind, Utc::now()).await
    }

    pub async fn check_and_consume_at(
        &self,
        company_id: i32,
        kind: ActionKind,
        now: DateTime<Utc>,
    ) -> Result<QuotaOutcome> {
        let mut tx = self.pool.begin().await?;

        let company = sqlx::query(
            r#"
            SELECT current_plan_id, balance_tokens, last_payment_at
            FROM companies
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(company_id)
        .fetch_optional(&mut tx)
        .await?
        .ok_or_else(|| anyhow!("company {company_id} not found"))?;

        let plan_id: Option<i32> = company.get("current_plan_id");
        let balance_tokens: i32 = company.get("balance_tokens");
        let window_start: DateTime<Utc> = company.get("last_payment_at");

        let plan = match plan_id {
            Some(plan_id) => sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1")
                .bind(plan_id)
                .fetch_optional(&mut tx)
                .await?,
            None => None,
        };

        let used: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM usage_events
            WHERE company_id = $1
              AND action_kind = $2
              AND created_at >= $3
            "#,
        )
        .bind(company_id)
        .bind(kind.as_str())
        .bind(window_start)
        .fetch_one(&mut tx)
        .await?;

        let mut decision = decide(plan.as_ref(), kind, used, balance_tokens);
        let mut remaining_tokens = balance_tokens;

        if decision == QuotaDecision::ConsumeWithToken {
            let updated: Option<i32> = sqlx::query_scalar(
                r#"
                UPDATE companies
                SET balance_tokens = balance_tokens - 1
                WHERE id = $1 AND balance_tokens > 0
                RETURNING balance_tokens
                "#,
            )
            .bind(company_id)
            .fetch_optional(&mut tx)
            .await?;
            match updated {
                Some(balance) => remaining_tokens = balance,
                None => decision = QuotaDecision::DenyLimitExceeded,
            }
        }

        if decision.admitted() {
            sqlx::query(
                "INSERT INTO usage_events (company_id, action_kind, created_at) VALUES ($1, $2, $3)",
            )
            .bind(company_id)
            .bind(kind.as_str())
            .bind(now)
            .execute(&mut tx)
            .await
            .context("failed to record usage event")?;
            tx.commit().await?;
            info!(
                %company_id,
                action = %kind,
                used = used + 1,
                balance_tokens = remaining_tokens,
                reason = decision.reason(),
                "metered action admitted"
            );
        } else {
            tx.rollback().await?;
            debug!(
                %company_id,
                action = %kind,
                used,
                reason = decision.reason(),
                "metered action denied"
            );
        }

        Ok(QuotaOutcome {
            admitted: decision.admitted(),
            reason: decision.reason().to_string(),
            action_kind: kind,
            used_quantity: used,
            limit_quantity: plan.as_ref().map(|plan| plan.limit_for(kind)),
            balance_tokens: remaining_tokens,
        })
    }

    /// Raising mode used by user-facing endpoints: a denial becomes an HTTP error.
    pub async fn require(&self, company_id: i32, kind: ActionKind) -> Result<QuotaOutcome, AppError> {
        let outcome = self.check_and_consume(company_id, kind).await?;
        if outcome.admitted {
            return Ok(outcome);
        }
        match outcome.limit_quantity {
            None => Err(AppError::BadRequest(outcome.reason)),
            Some(_) => Err(AppError::PaymentRequired(format!(
                "{}. Upgrade plan or buy tokens.",
                outcome.reason
            ))),
        }
    }
}

/// Pure admission rule: plan quota first, then one token from the balance.
pub fn decide(plan: Option<&Plan>, kind: ActionKind, used: i64, balance_tokens: i32) -> QuotaDecision {
    let Some(plan) = plan else {
        return QuotaDecision::DenyNoPlan;
    };
    if used < plan.limit_for(kind) {
        QuotaDecision::Consume
    } else if balance_tokens > 0 {
        QuotaDecision::ConsumeWithToken
    } else {
        QuotaDecision::DenyLimitExceeded
    }
}
