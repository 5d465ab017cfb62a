use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use uuid::Uuid;

pub const DEFAULT_SWAP_INTERVAL_SECONDS: u64 = 30;
pub const DEFAULT_HEALTH_CHECK_INTERVAL_SECONDS: u64 = 5;
pub const DEFAULT_MAX_WAIT_TIME_SECONDS: u64 = 3600;

#[derive(thiserror::Error, Debug)]
pub enum DomainError {
    #[error("`{0}` is not a valid deployment strategy")]
    InvalidStrategy(String),
    #[error("`{0}` is not a valid deployment action")]
    InvalidAction(String),
    #[error("failed to serialize environment list: {0}")]
    Envs(#[from] serde_json::Error),
}

/// Rollout strategies a deployment can request
#[derive(
    Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Hash, Serialize, Deserialize,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    BlueGreen,
    RollingUpdate,
    Canary,
    AllIn,
    Initialize,
}

#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Create,
    Finish,
    Rollback,
}

/// Phases a rollout moves through
#[derive(Clone, Copy, Debug, Display, EnumString, PartialEq, Eq, Serialize, Deserialize)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum Step {
    /// Row persisted at intake, nothing provisioned yet
    Creating,

    /// Candidate slot containers are being created and probed
    CreatingInfra,

    /// Traffic is being shifted from the old slot to the candidate
    SwapTraffic,

    /// All traffic reaches the candidate; the old slot still runs
    Effective,

    /// Operator asked to finish; old slot being reclaimed
    Finishing,

    /// Rollout complete, single slot serving
    Finished,

    /// Rollout aborted and the candidate slot reclaimed
    Failed,
}

impl Step {
    /// Whether `next` is directly reachable from the current step.
    pub fn can_advance_to(self, next: Step) -> bool {
        use Step::*;

        matches!(
            (self, next),
            (Creating, CreatingInfra)
                | (CreatingInfra, SwapTraffic)
                | (CreatingInfra, Finished)
                | (CreatingInfra, Failed)
                | (SwapTraffic, Effective)
                | (SwapTraffic, Failed)
                | (Effective, Finishing)
                | (Effective, Failed)
                | (Finishing, Finished)
        )
    }

    /// Whether a persisted row at this step may be rewritten to `next`.
    /// Re-asserting the current step is allowed so a re-delivered job can
    /// resume the phase it froze in.
    pub fn permits_update_to(self, next: Step) -> bool {
        self == next || self.can_advance_to(next)
    }
}

/// One rollout attempt. The persisted row is authoritative for rollout
/// state; the snapshot on the job stream carries the same fields.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    pub id: Uuid,
    pub application: String,
    pub service_name: String,
    pub strategy: Strategy,
    pub action: Action,
    pub step: Step,
    pub version: String,
    pub image: String,
    pub replicas: u32,
    pub swap_interval: u64,
    pub health_check_interval: u64,
    pub max_wait_time: u64,
    #[serde(rename = "env")]
    pub envs: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// The identifier drivers address the service by, shared between the
    /// router document and the container inventory.
    pub fn service_key(&self) -> String {
        format!("{}-{}", self.application, self.service_name)
    }

    /// Name of the candidate slot this deployment rolls out.
    pub fn slot(&self) -> String {
        format!("{}-{}", self.service_key(), self.version)
    }
}
