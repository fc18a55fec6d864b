pub mod api;
pub mod ledger;
pub mod liqpay;
pub mod models;
pub mod payments;
pub mod rate_limit;
pub mod referral;
pub mod scheduler;
pub mod subscription;

pub use api::{
    create_checkout as billing_create_checkout, get_subscription as billing_get_subscription,
    list_payments as billing_list_payments, list_plans as billing_list_plans,
    register_company as billing_register_company,
};
pub use ledger::QuotaLedger;
pub use liqpay::{LiqPayCredentials, PaymentEvent};
pub use models::{ActionKind, Company, Plan, QuotaOutcome, SubscriptionState};
pub use payments::{start_payment_worker, PaymentEventHandle, PaymentEventOutcome, PaymentEventProcessor};
pub use rate_limit::RateLimits;
pub use scheduler::{process_tick as run_subscription_tick, spawn as spawn_subscription_scheduler};
pub use subscription::SubscriptionService;
