use axum::{
    routing::{get, post},
    Router,
};

use crate::{billing, scheduling, webhooks};

pub fn api_routes() -> Router {
    Router::new()
        .route("/api/plans", get(billing::billing_list_plans))
        .route("/api/companies", post(billing::billing_register_company))
        .route(
            "/api/companies/:id/subscription",
            get(billing::billing_get_subscription),
        )
        .route(
            "/api/companies/:id/payments",
            get(billing::billing_list_payments),
        )
        .route(
            "/api/companies/:id/checkout",
            post(billing::billing_create_checkout),
        )
        .route(
            "/api/channels/:id/generate",
            post(scheduling::api::generate_now),
        )
        .route("/api/channels/:id/logs", get(scheduling::api::channel_logs))
        .route("/api/posts/:id/send", post(scheduling::api::send_now))
        .route(
            "/webhooks/payment/liqpay-callback",
            post(webhooks::liqpay_callback),
        )
}
