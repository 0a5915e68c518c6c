// src/error.rs

use actix_web::{HttpResponse, ResponseError, http::StatusCode};
use serde_json::json;
use thiserror::Error;

/// Closed set of domain failures. Callers branch on the kind,
/// never on message text.
#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("insufficient funds")]
    InsufficientFunds,

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("gateway error {code}: {message}")]
    Gateway { code: String, message: String },

    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
}

/// True when `err` is a unique violation on the named index or constraint.
pub fn is_unique_violation(err: &sqlx::Error, constraint: &str) -> bool {
    match err.as_database_error() {
        Some(db) => db.is_unique_violation() && db.constraint() == Some(constraint),
        None => false,
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
            AppError::InsufficientFunds => StatusCode::UNPROCESSABLE_ENTITY,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::InvalidState(_) => StatusCode::CONFLICT,
            AppError::Gateway { .. } => StatusCode::BAD_GATEWAY,
            AppError::Db(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let AppError::Db(e) = self {
            log::error!("database error: {e}");
            return HttpResponse::InternalServerError().json(json!({"error": "internal error"}));
        }

        let body = match self {
            AppError::Gateway { code, message } => json!({
                "error": self.to_string(),
                "gateway_code": code,
                "gateway_message": message,
            }),
            _ => json!({"error": self.to_string()}),
        };

        HttpResponse::build(self.status_code()).json(body)
    }
}
