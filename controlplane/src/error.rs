use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use releasy_common::deployment::{DomainError, Step};
use releasy_common::job::JobError;
use serde_json::json;
use uuid::Uuid;

/// A wrapper to capture any error possible with this service
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("unknown service `{application}/{name}`")]
    ServiceNotFound { application: String, name: String },
    #[error("unknown deployment `{0}`")]
    DeploymentNotFound(Uuid),
    #[error("deployment `{id}` is at step `{step}`, finish requires `effective`")]
    FinishPrecondition { id: Uuid, step: Step },
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("job payload error: {0}")]
    Job(#[from] JobError),
    #[error("backend failure: {0}")]
    Store(#[from] releasy_store::Error),
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::ServiceNotFound { .. } | Error::DeploymentNotFound(_) => StatusCode::NOT_FOUND,
            Error::FinishPrecondition { .. } | Error::Job(_) | Error::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };

        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, Error>;
