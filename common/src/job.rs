use std::collections::HashMap;

use chrono::{DateTime, Utc};

use crate::deployment::Deployment;

/// Stream every deployment job is published on.
pub const JOB_STREAM: &str = "releasy_jobs";

const PAYLOAD_FIELD: &str = "payload";
const CREATED_AT_FIELD: &str = "created_at";

#[derive(thiserror::Error, Debug)]
pub enum JobError {
    #[error("job entry is missing the `{0}` field")]
    MissingField(&'static str),
    #[error("job entry carries an invalid timestamp: {0}")]
    InvalidTimestamp(#[from] chrono::ParseError),
    #[error("failed to decode job payload: {0}")]
    Payload(#[from] serde_json::Error),
}

/// Wire form of a job: the deployment snapshot as a JSON string plus the
/// time it was enqueued.
#[derive(Clone, Debug, PartialEq)]
pub struct JobPayload {
    pub payload: String,
    pub created_at: DateTime<Utc>,
}

impl JobPayload {
    pub fn for_deployment(deployment: &Deployment) -> Result<Self, JobError> {
        Ok(Self {
            payload: serde_json::to_string(deployment)?,
            created_at: Utc::now(),
        })
    }

    pub fn deployment(&self) -> Result<Deployment, JobError> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    /// Field pairs in the shape the stream stores them.
    pub fn to_entries(&self) -> Vec<(String, String)> {
        vec![
            (PAYLOAD_FIELD.to_string(), self.payload.clone()),
            (CREATED_AT_FIELD.to_string(), self.created_at.to_rfc3339()),
        ]
    }

    pub fn from_entries(entries: &HashMap<String, String>) -> Result<Self, JobError> {
        let payload = entries
            .get(PAYLOAD_FIELD)
            .ok_or(JobError::MissingField(PAYLOAD_FIELD))?
            .clone();
        let created_at = entries
            .get(CREATED_AT_FIELD)
            .ok_or(JobError::MissingField(CREATED_AT_FIELD))?;
        let created_at = DateTime::parse_from_rfc3339(created_at)?.with_timezone(&Utc);

        Ok(Self {
            payload,
            created_at,
        })
    }
}
