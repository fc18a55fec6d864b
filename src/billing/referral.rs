use anyhow::{Context, Result};
use sqlx::postgres::PgConnection;
use sqlx::Row;
use tracing::info;

use crate::error::ConfigurationError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferralReward {
    pub referral_id: i32,
    pub referrer_id: i32,
    pub referred_id: i32,
    pub bonus_tokens: i32,
    pub referrer_balance: i32,
}

pub async fn referrer_by_code(conn: &mut PgConnection, code: &str) -> Result<Option<i32>> {
    let id = sqlx::query_scalar("SELECT id FROM companies WHERE referral_code = $1")
        .bind(code.trim().to_uppercase())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(id)
}

/// Records that `referred_id` joined through `referrer_id`. Referrals are one level deep: a
/// company that was itself referred by the new company cannot become its referrer.
pub async fn link(conn: &mut PgConnection, referrer_id: i32, referred_id: i32) -> Result<()> {
    if referrer_id == referred_id {
        return Err(ConfigurationError::new("a company cannot refer itself").into());
    }
    let reverse_exists: bool = sqlx::query_scalar(
        "SELECT EXISTS (SELECT 1 FROM referrals WHERE referrer_id = $1 AND referred_id = $2)",
    )
    .bind(referred_id)
    .bind(referrer_id)
    .fetch_one(&mut *conn)
    .await?;
    if reverse_exists {
        return Err(ConfigurationError::new(format!(
            "company {referrer_id} was referred by {referred_id}; referral cycles are not allowed"
        ))
        .into());
    }

    sqlx::query(
        "INSERT INTO referrals (referrer_id, referred_id, reward_given) VALUES ($1, $2, FALSE)",
    )
    .bind(referrer_id)
    .bind(referred_id)
    .execute(&mut *conn)
    .await
    .context("failed to record referral")?;
    Ok(())
}

/// key: referral-reward -> at most one credit per referred company
///
/// The pending referral row is locked before the referrer is credited, so two payment events
/// for the same referred company cannot both observe `reward_given = false`.
pub async fn grant_pending_reward(
    conn: &mut PgConnection,
    referred_id: i32,
    bonus_tokens: i32,
) -> Result<Option<ReferralReward>> {
    let Some(row) = sqlx::query(
        r#"
        SELECT id, referrer_id
        FROM referrals
        WHERE referred_id = $1 AND reward_given = FALSE
        FOR UPDATE
        "#,
    )
    .bind(referred_id)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };

    let referral_id: i32 = row.get("id");
    let referrer_id: i32 = row.get("referrer_id");

    let Some(referrer_balance) = sqlx::query_scalar::<_, i32>(
        r#"
        UPDATE companies
        SET balance_tokens = balance_tokens + $2
        WHERE id = $1
        RETURNING balance_tokens
        "#,
    )
    .bind(referrer_id)
    .bind(bonus_tokens)
    .fetch_optional(&mut *conn)
    .await?
    else {
        return Ok(None);
    };

    sqlx::query("UPDATE referrals SET reward_given = TRUE WHERE id = $1")
        .bind(referral_id)
        .execute(&mut *conn)
        .await?;

    info!(
        %referral_id,
        %referrer_id,
        %referred_id,
        bonus_tokens,
        referrer_balance,
        "referral reward granted"
    );

    Ok(Some(ReferralReward {
        referral_id,
        referrer_id,
        referred_id,
        bonus_tokens,
        referrer_balance,
    }))
}
