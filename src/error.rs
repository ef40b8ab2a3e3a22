use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::tokens::TokenError;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error(transparent)]
    Token(#[from] TokenError),
    #[error("not found")]
    NotFound,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("{0}")]
    Message(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::Token(err) => match err {
                TokenError::UnknownActionType(_)
                | TokenError::UnknownPlan(_)
                | TokenError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
                TokenError::SubscriptionMissing(_) => StatusCode::NOT_FOUND,
                TokenError::SubscriptionFrozen(_)
                | TokenError::ConcurrentDebitConflict
                | TokenError::RolloverAlreadyApplied { .. } => StatusCode::CONFLICT,
                TokenError::InsufficientBalance { .. } => StatusCode::PAYMENT_REQUIRED,
                TokenError::LedgerDivergence { .. } | TokenError::Db(_) => {
                    StatusCode::INTERNAL_SERVER_ERROR
                }
            },
            AppError::Db(_) | AppError::Message(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(?self);
        (status, self.to_string()).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
