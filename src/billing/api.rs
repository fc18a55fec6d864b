use axum::{
    extract::{Extension, Path, Query},
    Json,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

use crate::config::{BACKEND_URL, FRONTEND_URL};
use crate::error::{AppError, AppResult};

use super::liqpay::{CheckoutForm, LiqPayCredentials};
use super::models::{Company, Payment, Plan};
use super::payments::PaymentEventProcessor;
use super::subscription::{SubscriptionService, SubscriptionView};

/// key: billing-api -> rest endpoints
pub async fn list_plans(Extension(pool): Extension<PgPool>) -> AppResult<Json<Vec<Plan>>> {
    let plans = sqlx::query_as::<_, Plan>(
        "SELECT * FROM plans WHERE is_active ORDER BY price ASC, id ASC",
    )
    .fetch_all(&pool)
    .await?;
    Ok(Json(plans))
}

#[derive(Debug, Deserialize)]
pub struct RegisterCompanyRequest {
    pub name: String,
    #[serde(default)]
    pub referral_code: Option<String>,
}

pub async fn register_company(
    Extension(subscriptions): Extension<SubscriptionService>,
    Json(payload): Json<RegisterCompanyRequest>,
) -> AppResult<Json<Company>> {
    let name = payload.name.trim();
    if name.is_empty() {
        return Err(AppError::BadRequest("company name is required".into()));
    }
    let referral_code = payload
        .referral_code
        .as_deref()
        .map(str::trim)
        .filter(|code| !code.is_empty());
    let company = subscriptions
        .register_company(name, referral_code, Utc::now())
        .await?;
    Ok(Json(company))
}

pub async fn get_subscription(
    Extension(subscriptions): Extension<SubscriptionService>,
    Path(company_id): Path<i32>,
) -> AppResult<Json<SubscriptionView>> {
    subscriptions
        .subscription_view(company_id, Utc::now())
        .await?
        .map(Json)
        .ok_or(AppError::NotFound)
}

#[derive(Debug, Deserialize)]
pub struct PaymentsQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_page() -> i64 {
    1
}

fn default_limit() -> i64 {
    10
}

#[derive(Debug, Serialize)]
pub struct PaymentsPage {
    pub items: Vec<Payment>,
    pub total: i64,
    pub page: i64,
    pub limit: i64,
}

pub async fn list_payments(
    Extension(processor): Extension<PaymentEventProcessor>,
    Path(company_id): Path<i32>,
    Query(query): Query<PaymentsQuery>,
) -> AppResult<Json<PaymentsPage>> {
    let (items, total) = processor
        .payments_for(company_id, query.page, query.limit)
        .await?;
    Ok(Json(PaymentsPage {
        items,
        total,
        page: query.page.max(1),
        limit: query.limit.clamp(1, 100),
    }))
}

#[derive(Debug, Deserialize)]
pub struct CheckoutRequest {
    pub plan_id: i32,
}

pub async fn create_checkout(
    Extension(pool): Extension<PgPool>,
    Extension(credentials): Extension<LiqPayCredentials>,
    Path(company_id): Path<i32>,
    Json(payload): Json<CheckoutRequest>,
) -> AppResult<Json<CheckoutForm>> {
    let exists: Option<i32> = sqlx::query_scalar("SELECT id FROM companies WHERE id = $1")
        .bind(company_id)
        .fetch_optional(&pool)
        .await?;
    if exists.is_none() {
        return Err(AppError::NotFound);
    }

    let plan = sqlx::query_as::<_, Plan>("SELECT * FROM plans WHERE id = $1 AND is_active")
        .bind(payload.plan_id)
        .fetch_optional(&pool)
        .await?
        .ok_or(AppError::NotFound)?;
    if plan.is_trial {
        return Err(AppError::BadRequest("the trial plan cannot be purchased".into()));
    }

    Ok(Json(credentials.checkout(
        company_id,
        &plan,
        BACKEND_URL.as_str(),
        FRONTEND_URL.as_str(),
    )))
}
