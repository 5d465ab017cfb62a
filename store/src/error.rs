use releasy_common::deployment::Step;
use uuid::Uuid;

/// A wrapper to capture any error possible with the backends
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("stream error: {0}")]
    Stream(#[from] redis::RedisError),
    #[error("persisted row is corrupt: {0}")]
    Corrupt(String),
    #[error("deployment `{0}` not found")]
    NotFound(Uuid),
    #[error("step cannot advance from `{from}` to `{to}`")]
    StepTransition { from: Step, to: Step },
}

pub type Result<T> = std::result::Result<T, Error>;
