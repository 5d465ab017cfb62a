use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The long-lived target of deployments, unique per `(application, name)`.
/// The row's `version` tracks the slot that finished its rollout last.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Service {
    pub id: Uuid,
    pub application: String,
    pub name: String,
    pub version: String,
    pub image: String,
    pub replicas: u32,
    pub envs: String,
    pub weight: u32,
    pub hostname: String,
    pub created_at: DateTime<Utc>,
}
