use axum::{http::StatusCode, response::{IntoResponse, Response}};
use thiserror::Error;

/// A value that cannot be acted upon because the stored configuration is invalid: an unknown
/// timezone, a malformed schedule or an order id that does not follow the checkout format.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("configuration error: {0}")]
pub struct ConfigurationError(pub String);

impl ConfigurationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("payment required: {0}")]
    PaymentRequired(String),
    #[error("too many requests: {0}")]
    TooManyRequests(String),
    #[error("service unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Message(String),
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        let err = match err.downcast::<ConfigurationError>() {
            Ok(config) => return AppError::Configuration(config),
            Err(other) => other,
        };
        match err.downcast::<sqlx::Error>() {
            Ok(db) => AppError::Db(db),
            Err(other) => AppError::Message(format!("{other:#}")),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) | AppError::Configuration(_) => StatusCode::BAD_REQUEST,
            AppError::PaymentRequired(_) => StatusCode::PAYMENT_REQUIRED,
            AppError::TooManyRequests(_) => StatusCode::TOO_MANY_REQUESTS,
            AppError::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Db(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(?self);
        } else {
            tracing::debug!(?self, "request rejected");
        }
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_denials_map_to_client_errors() {
        let response = AppError::PaymentRequired("usage limit exceeded".into()).into_response();
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let response = AppError::TooManyRequests("slow down".into()).into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn configuration_errors_are_bad_requests() {
        let err: AppError = ConfigurationError::new("unknown timezone Mars/Base").into();
        assert_eq!(err.to_string(), "configuration error: unknown timezone Mars/Base");
        assert_eq!(err.into_response().status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn anyhow_errors_keep_their_database_cause() {
        let err: AppError = anyhow::Error::new(sqlx::Error::RowNotFound)
            .context("failed to load company")
            .into();
        assert!(matches!(err, AppError::Db(sqlx::Error::RowNotFound)));

        let err: AppError = anyhow::anyhow!("generator offline").into();
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
