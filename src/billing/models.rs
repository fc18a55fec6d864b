use std::fmt;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// key: billing-models -> plans,companies,usage
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Plan {
    pub id: i32,
    pub name: String,
    pub price: i32,
    pub send_post_limit: i32,
    pub ai_generation_limit: i32,
    pub channels_limit: i32,
    pub knowledge_base_limit: i32,
    pub ai_enabled: bool,
    pub is_active: bool,
    pub is_trial: bool,
}

impl Plan {
    pub fn limit_for(&self, kind: ActionKind) -> i64 {
        match kind {
            ActionKind::Post => i64::from(self.send_post_limit),
            ActionKind::Ai => i64::from(self.ai_generation_limit),
        }
    }
}

/// key: billing-company-model -> billing unit
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Company {
    pub id: i32,
    pub name: String,
    pub current_plan_id: Option<i32>,
    pub plan_started_at: DateTime<Utc>,
    pub balance_tokens: i32,
    pub referral_code: String,
    pub referred_by_id: Option<i32>,
    pub last_payment_at: DateTime<Utc>,
    pub subscription_valid_until: Option<DateTime<Utc>>,
    pub payment_service: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Company {
    pub fn billing_snapshot(&self) -> BillingSnapshot {
        BillingSnapshot {
            current_plan_id: self.current_plan_id,
            plan_started_at: self.plan_started_at,
            last_payment_at: self.last_payment_at,
            subscription_valid_until: self.subscription_valid_until,
            payment_service: self.payment_service.clone(),
        }
    }
}

/// Billable action categories subject to plan limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Post,
    Ai,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Post => "post",
            ActionKind::Ai => "ai",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Payment {
    pub id: i32,
    pub company_id: i32,
    pub order_id: String,
    pub amount: i64,
    pub description: String,
    pub is_successful: bool,
    pub payment_service: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Ledger verdict for a single metered action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaDecision {
    Consume,
    ConsumeWithToken,
    DenyNoPlan,
    DenyLimitExceeded,
}

impl QuotaDecision {
    pub fn admitted(&self) -> bool {
        matches!(self, QuotaDecision::Consume | QuotaDecision::ConsumeWithToken)
    }

    pub fn reason(&self) -> &'static str {
        match self {
            QuotaDecision::Consume => "usage consumed",
            QuotaDecision::ConsumeWithToken => "usage consumed with tokens",
            QuotaDecision::DenyNoPlan => "no active plan",
            QuotaDecision::DenyLimitExceeded => "usage limit exceeded",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QuotaOutcome {
    pub admitted: bool,
    pub reason: String,
    pub action_kind: ActionKind,
    pub used_quantity: i64,
    pub limit_quantity: Option<i64>,
    pub balance_tokens: i32,
}

/// Subscription state, derived from the plan and the paid-through date rather than stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionState {
    Trial,
    Active,
    Expired,
}

impl SubscriptionState {
    pub fn derive(
        plan: Option<&Plan>,
        subscription_valid_until: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Self {
        match plan {
            None => SubscriptionState::Expired,
            Some(plan) if plan.is_trial => SubscriptionState::Trial,
            Some(_) => match subscription_valid_until {
                Some(until) if until >= now => SubscriptionState::Active,
                _ => SubscriptionState::Expired,
            },
        }
    }
}

/// The billing columns of a company touched by subscription transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BillingSnapshot {
    pub current_plan_id: Option<i32>,
    pub plan_started_at: DateTime<Utc>,
    pub last_payment_at: DateTime<Utc>,
    pub subscription_valid_until: Option<DateTime<Utc>>,
    pub payment_service: Option<String>,
}

impl BillingSnapshot {
    pub fn after_payment_success(
        &self,
        paid_plan_id: i32,
        payment_service: &str,
        now: DateTime<Utc>,
        period: Duration,
    ) -> Self {
        let plan_started_at = if self.current_plan_id == Some(paid_plan_id) {
            self.plan_started_at
        } else {
            now
        };
        Self {
            current_plan_id: Some(paid_plan_id),
            plan_started_at,
            last_payment_at: now,
            subscription_valid_until: Some(now + period),
            payment_service: Some(payment_service.to_string()),
        }
    }

    pub fn after_reset_to_trial(&self, trial_plan_id: i32, now: DateTime<Utc>) -> Self {
        let plan_started_at = if self.current_plan_id == Some(trial_plan_id) {
            self.plan_started_at
        } else {
            now
        };
        Self {
            current_plan_id: Some(trial_plan_id),
            plan_started_at,
            last_payment_at: now,
            subscription_valid_until: None,
            payment_service: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn plan(is_trial: bool) -> Plan {
        Plan {
            id: if is_trial { 1 } else { 2 },
            name: if is_trial { "Trial" } else { "Pro" }.to_string(),
            price: if is_trial { 0 } else { 20 },
            send_post_limit: 30,
            ai_generation_limit: 2,
            channels_limit: 1,
            knowledge_base_limit: 5,
            ai_enabled: true,
            is_active: true,
            is_trial,
        }
    }

    fn snapshot(plan_id: i32, at: DateTime<Utc>) -> BillingSnapshot {
        BillingSnapshot {
            current_plan_id: Some(plan_id),
            plan_started_at: at,
            last_payment_at: at,
            subscription_valid_until: None,
            payment_service: None,
        }
    }

    #[test]
    fn limits_follow_action_kind() {
        let plan = plan(false);
        assert_eq!(plan.limit_for(ActionKind::Post), 30);
        assert_eq!(plan.limit_for(ActionKind::Ai), 2);
    }

    #[test]
    fn state_is_derived_from_plan_and_paid_through_date() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(
            SubscriptionState::derive(Some(&plan(true)), None, now),
            SubscriptionState::Trial
        );
        assert_eq!(
            SubscriptionState::derive(Some(&plan(false)), Some(now + Duration::days(3)), now),
            SubscriptionState::Active
        );
        assert_eq!(
            SubscriptionState::derive(Some(&plan(false)), Some(now - Duration::seconds(1)), now),
            SubscriptionState::Expired
        );
        assert_eq!(
            SubscriptionState::derive(None, None, now),
            SubscriptionState::Expired
        );
    }

    #[test]
    fn payment_success_opens_a_new_period() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 8, 30, 0).unwrap();
        let next = snapshot(1, start).after_payment_success(2, "liqpay", now, Duration::days(30));

        assert_eq!(next.current_plan_id, Some(2));
        assert_eq!(next.plan_started_at, now);
        assert_eq!(next.last_payment_at, now);
        assert_eq!(next.subscription_valid_until, Some(now + Duration::days(30)));
        assert_eq!(next.payment_service.as_deref(), Some("liqpay"));
    }

    #[test]
    fn renewal_on_the_same_plan_keeps_plan_start() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let next = snapshot(2, start).after_payment_success(2, "liqpay", now, Duration::days(30));
        assert_eq!(next.plan_started_at, start);
        assert_eq!(next.last_payment_at, now);
    }

    #[test]
    fn reset_to_trial_clears_paid_fields() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 0, 0, 0).unwrap();
        let paid = snapshot(1, start).after_payment_success(2, "liqpay", start, Duration::days(30));
        let reset = paid.after_reset_to_trial(1, now);

        assert_eq!(reset.current_plan_id, Some(1));
        assert_eq!(reset.plan_started_at, now);
        assert_eq!(reset.last_payment_at, now);
        assert_eq!(reset.subscription_valid_until, None);
        assert_eq!(reset.payment_service, None);
    }
}
