use axum::{extract::Extension, http::StatusCode, Form, Json};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::billing::liqpay::decode_callback;
use crate::billing::{LiqPayCredentials, PaymentEventHandle};

/// key: webhooks-liqpay -> signed callback entrypoint
#[derive(Debug, Deserialize)]
pub struct LiqPayCallback {
    pub data: String,
    pub signature: String,
}

/// Verifies the callback signature before anything touches billing state, then hands the
/// decoded event to the payment worker.
pub async fn liqpay_callback(
    Extension(credentials): Extension<LiqPayCredentials>,
    Extension(payments): Extension<PaymentEventHandle>,
    Form(callback): Form<LiqPayCallback>,
) -> Result<Json<Value>, (StatusCode, String)> {
    if !credentials.verify(&callback.data, &callback.signature) {
        tracing::warn!("liqpay callback rejected: bad signature");
        return Err((StatusCode::BAD_REQUEST, "Bad signature".to_string()));
    }

    let event = decode_callback(&callback.data).map_err(|err| {
        tracing::warn!(%err, "liqpay callback payload could not be decoded");
        (StatusCode::BAD_REQUEST, err.to_string())
    })?;

    tracing::info!(
        order_id = %event.order_id,
        status = %event.status,
        "liqpay callback accepted"
    );
    payments.dispatch(event).await.map_err(|err| {
        tracing::error!(?err, "payment worker unavailable");
        (StatusCode::INTERNAL_SERVER_ERROR, "payment worker unavailable".to_string())
    })?;

    Ok(Json(json!({ "status": "ok" })))
}
