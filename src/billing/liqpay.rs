use base64::engine::general_purpose::STANDARD as Base64Engine;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use uuid::Uuid;

use crate::error::ConfigurationError;

use super::models::Plan;

pub const CHECKOUT_URL: &str = "https://www.liqpay.ua/api/3/checkout";
pub const PAYMENT_SERVICE: &str = "liqpay";

/// Merchant credentials, constructed once by the entry point and injected where needed.
#[derive(Clone)]
pub struct LiqPayCredentials {
    pub public_key: String,
    pub private_key: String,
    pub sandbox: bool,
}

impl std::fmt::Debug for LiqPayCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiqPayCredentials")
            .field("public_key", &self.public_key)
            .field("private_key", &"<redacted>")
            .field("sandbox", &self.sandbox)
            .finish()
    }
}

impl LiqPayCredentials {
    /// `base64(sha1(private_key + data + private_key))`
    pub fn sign(&self, data: &str) -> String {
        let mut hasher = Sha1::new();
        hasher.update(self.private_key.as_bytes());
        hasher.update(data.as_bytes());
        hasher.update(self.private_key.as_bytes());
        Base64Engine.encode(hasher.finalize())
    }

    pub fn verify(&self, data: &str, signature: &str) -> bool {
        let expected = self.sign(data);
        expected.as_bytes().ct_eq(signature.trim().as_bytes()).into()
    }

    pub fn checkout(
        &self,
        company_id: i32,
        plan: &Plan,
        backend_url: &str,
        frontend_url: &str,
    ) -> CheckoutForm {
        let order_id = OrderId::generate(company_id, plan.id);
        let sandbox = u8::from(self.sandbox);
        let payload = json!({
            "public_key": self.public_key,
            "action": "subscribe",
            "version": "3",
            "amount": plan.price,
            "currency": "USD",
            "description": format!("Subscription to plan {}", plan.name),
            "order_id": order_id.to_string(),
            "subscribe_periodicity": "month",
            "server_url": format!("{}/webhooks/payment/liqpay-callback", backend_url.trim_end_matches('/')),
            "result_url": format!("{}/dashboard/subscription/success", frontend_url.trim_end_matches('/')),
            "sandbox": sandbox,
        });
        let data = Base64Engine.encode(payload.to_string());
        let signature = self.sign(&data);
        CheckoutForm {
            liqpay_url: CHECKOUT_URL.to_string(),
            data,
            signature,
            order_id: order_id.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutForm {
    pub liqpay_url: String,
    pub data: String,
    pub signature: String,
    pub order_id: String,
}

/// Order identifier in the `"{company_id}-{opaque}-{plan_id}"` format shared with the provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderId {
    pub company_id: i32,
    pub opaque: String,
    pub plan_id: i32,
}

impl OrderId {
    pub fn generate(company_id: i32, plan_id: i32) -> Self {
        Self {
            company_id,
            opaque: Uuid::new_v4().simple().to_string(),
            plan_id,
        }
    }

    pub fn parse(raw: &str) -> Result<Self, ConfigurationError> {
        let parts: Vec<&str> = raw.trim().split('-').collect();
        let [company, opaque, plan] = parts.as_slice() else {
            return Err(ConfigurationError::new(format!(
                "order id `{raw}` is not in company-opaque-plan format"
            )));
        };
        let company_id = company
            .parse::<i32>()
            .map_err(|_| ConfigurationError::new(format!("order id `{raw}` has a non-numeric company id")))?;
        let plan_id = plan
            .parse::<i32>()
            .map_err(|_| ConfigurationError::new(format!("order id `{raw}` has a non-numeric plan id")))?;
        if opaque.is_empty() {
            return Err(ConfigurationError::new(format!("order id `{raw}` has an empty opaque segment")));
        }
        Ok(Self {
            company_id,
            opaque: opaque.to_string(),
            plan_id,
        })
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}-{}", self.company_id, self.opaque, self.plan_id)
    }
}

/// Decoded body of a provider callback.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PaymentEvent {
    pub status: String,
    pub order_id: String,
    #[serde(default, deserialize_with = "amount_from_number")]
    pub amount: i64,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentStatusClass {
    Success,
    Failure,
    Other,
}

impl PaymentEvent {
    pub fn classify(&self) -> PaymentStatusClass {
        match self.status.as_str() {
            "subscribed" | "success" | "sandbox" => PaymentStatusClass::Success,
            "failure" | "error" | "reversed" | "unsubscribed" => PaymentStatusClass::Failure,
            _ => PaymentStatusClass::Other,
        }
    }
}

/// Decodes the base64 `data` field of a callback into an event.
pub fn decode_callback(data: &str) -> Result<PaymentEvent, ConfigurationError> {
    let raw = Base64Engine
        .decode(data.trim())
        .map_err(|err| ConfigurationError::new(format!("callback data is not base64: {err}")))?;
    serde_json::from_slice(&raw)
        .map_err(|err| ConfigurationError::new(format!("callback data is not a payment event: {err}")))
}

fn amount_from_number<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::Number(number) => Ok(number
            .as_i64()
            .or_else(|| number.as_f64().map(|amount| amount.round() as i64))
            .unwrap_or_default()),
        Value::String(text) => text
            .trim()
            .parse::<f64>()
            .map(|amount| amount.round() as i64)
            .map_err(serde::de::Error::custom),
        Value::Null => Ok(0),
        other => Err(serde::de::Error::custom(format!("unexpected amount {other}"))),
    }
}
