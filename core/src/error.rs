use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Unified error type returned by Store, Lock Manager, State Machine
/// Registry, and Admission operations. The HTTP surface is the only layer
/// that maps this to a status code.
#[derive(Debug, Error)]
pub enum Error {
    #[error("{0} {1} not found")]
    NotFound(&'static str, String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("precondition failed: {reason}")]
    PreconditionFailed { reason: String, dns_conflict: bool },

    #[error("resource is locked")]
    Locked,

    #[error("resource is API-locked")]
    ApiLocked,

    #[error("resource is deletion-locked")]
    DeletionLocked,

    #[error("annotation is in use")]
    AnnotationInUse,

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound(kind, id.into())
    }

    pub fn precondition(reason: impl Into<String>) -> Self {
        Error::PreconditionFailed {
            reason: reason.into(),
            dns_conflict: false,
        }
    }

    pub fn dns_conflict(reason: impl Into<String>) -> Self {
        Error::PreconditionFailed {
            reason: reason.into(),
            dns_conflict: true,
        }
    }

    pub fn is_dns_conflict(&self) -> bool {
        matches!(
            self,
            Error::PreconditionFailed {
                dns_conflict: true,
                ..
            }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

/// The one place an `Error` becomes an HTTP status, so handlers never each
/// invent their own mapping.
impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::NotFound(..) => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            // a DNS collision is the one precondition reported as a conflict
            Error::PreconditionFailed { dns_conflict: true, .. } => StatusCode::CONFLICT,
            Error::PreconditionFailed { .. } => StatusCode::BAD_REQUEST,
            Error::Locked => StatusCode::CONFLICT,
            Error::ApiLocked | Error::DeletionLocked | Error::AnnotationInUse => {
                StatusCode::FORBIDDEN
            }
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if matches!(status, StatusCode::INTERNAL_SERVER_ERROR) {
            tracing::error!(error = %self, "internal error");
        }
        (status, Json(serde_json::json!({"reason": self.to_string()}))).into_response()
    }
}
