use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Append-only audit record for a service's rollout history.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: Uuid,
    pub application: String,
    pub service_name: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Event {
    pub fn new(application: &str, service_name: &str, message: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            application: application.to_string(),
            service_name: service_name.to_string(),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}
