use releasy_common::deployment::Step;

use crate::health::ProbeError;
use crate::router::RouterError;

/// A wrapper to capture any error possible while driving a rollout
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("docker API error: {0}")]
    Docker(#[from] bollard::errors::Error),
    #[error("router document error: {0}")]
    Router(#[from] RouterError),
    #[error("health check failed: {0}")]
    HealthCheck(#[from] ProbeError),
    #[error("store error: {0}")]
    Store(#[from] releasy_store::Error),
    #[error("unknown service `{application}/{name}`")]
    MissingService { application: String, name: String },
    #[error("unknown deployment `{0}`")]
    MissingDeployment(uuid::Uuid),
    #[error("rollback is not allowed from step `{0}`")]
    RollbackNotAllowed(Step),
    #[error("infrastructure failure: {0}")]
    Infra(String),
}

pub type Result<T> = std::result::Result<T, Error>;
