use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use releasy_common::deployment::{
    Action, Deployment, DomainError, Step, Strategy, DEFAULT_HEALTH_CHECK_INTERVAL_SECONDS,
    DEFAULT_MAX_WAIT_TIME_SECONDS, DEFAULT_SWAP_INTERVAL_SECONDS,
};
use releasy_common::env::build_envs_payload;
use releasy_common::event::Event;
use releasy_common::job::{JobPayload, JOB_STREAM};
use releasy_common::service::Service;
use releasy_store::Postgres;
use serde::Deserialize;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::error::{Error, Result};

/// How many rollout rows to keep per service; older ones are pruned on
/// each new intake.
const DEPLOYMENT_HISTORY_KEEP: i64 = 50;

/// Rollout request as received on the wire. Strategy and action arrive as
/// raw strings and are validated here, before anything is persisted.
#[derive(Debug, Deserialize)]
pub struct DeploymentCommand {
    pub strategy: String,
    pub application: String,
    pub service_name: String,
    #[serde(default)]
    pub replicas: u32,
    pub image: String,
    #[serde(default)]
    pub swap_interval: Option<u64>,
    #[serde(default)]
    pub health_check_interval: Option<u64>,
    #[serde(default)]
    pub envs: Vec<String>,
    #[serde(default)]
    pub max_wait_time: Option<u64>,
    pub version: String,
    #[serde(default)]
    pub action: Option<String>,
}

/// What the control plane needs from the durable store.
#[async_trait]
pub trait IntakeStore: Send + Sync {
    async fn get_service(&self, application: &str, name: &str)
        -> releasy_store::Result<Option<Service>>;
    async fn save_service(&self, service: &Service) -> releasy_store::Result<()>;
    async fn delete_service(&self, application: &str, name: &str) -> releasy_store::Result<()>;
    async fn save_deployment(&self, deployment: &Deployment) -> releasy_store::Result<()>;
    async fn get_deployment_by_id(&self, id: Uuid) -> releasy_store::Result<Option<Deployment>>;
    async fn get_deployments(
        &self,
        application: &str,
        name: &str,
        limit: i64,
    ) -> releasy_store::Result<Vec<Deployment>>;
    async fn delete_old_deployments(
        &self,
        application: &str,
        name: &str,
        keep_last: i64,
    ) -> releasy_store::Result<()>;
    async fn update_deployment_action(&self, id: Uuid, action: Action)
        -> releasy_store::Result<()>;
    async fn save_event(&self, event: &Event) -> releasy_store::Result<()>;
    async fn get_events(
        &self,
        application: &str,
        name: &str,
        limit: i64,
    ) -> releasy_store::Result<Vec<Event>>;
}

#[async_trait]
impl IntakeStore for releasy_store::Postgres {
    async fn get_service(
        &self,
        application: &str,
        name: &str,
    ) -> releasy_store::Result<Option<Service>> {
        Postgres::get_service(self, application, name).await
    }

    async fn save_service(&self, service: &Service) -> releasy_store::Result<()> {
        Postgres::save_service(self, service).await
    }

    async fn delete_service(&self, application: &str, name: &str) -> releasy_store::Result<()> {
        Postgres::delete_service(self, application, name).await
    }

    async fn save_deployment(&self, deployment: &Deployment) -> releasy_store::Result<()> {
        Postgres::save_deployment(self, deployment).await
    }

    async fn get_deployment_by_id(&self, id: Uuid) -> releasy_store::Result<Option<Deployment>> {
        Postgres::get_deployment_by_id(self, id).await
    }

    async fn get_deployments(
        &self,
        application: &str,
        name: &str,
        limit: i64,
    ) -> releasy_store::Result<Vec<Deployment>> {
        Postgres::get_deployments(self, application, name, limit).await
    }

    async fn delete_old_deployments(
        &self,
        application: &str,
        name: &str,
        keep_last: i64,
    ) -> releasy_store::Result<()> {
        Postgres::delete_old_deployments(self, application, name, keep_last).await
    }

    async fn update_deployment_action(
        &self,
        id: Uuid,
        action: Action,
    ) -> releasy_store::Result<()> {
        Postgres::update_deployment_action(self, id, action).await
    }

    async fn save_event(&self, event: &Event) -> releasy_store::Result<()> {
        Postgres::save_event(self, event).await
    }

    async fn get_events(
        &self,
        application: &str,
        name: &str,
        limit: i64,
    ) -> releasy_store::Result<Vec<Event>> {
        Postgres::get_events(self, application, name, limit).await
    }
}

/// What intake needs from the job stream.
#[async_trait]
pub trait JobPublisher: Send + Sync {
    async fn publish(&self, stream: &str, entries: &[(String, String)])
        -> releasy_store::Result<String>;
}

#[async_trait]
impl JobPublisher for releasy_store::JobStream {
    async fn publish(
        &self,
        stream: &str,
        entries: &[(String, String)],
    ) -> releasy_store::Result<String> {
        releasy_store::JobStream::publish(self, stream, entries).await
    }
}

/// Validates rollout requests, persists the deployment row and publishes
/// the job the agents pick up.
#[derive(Clone)]
pub struct DeploymentService {
    store: Arc<dyn IntakeStore>,
    jobs: Arc<dyn JobPublisher>,
}

impl DeploymentService {
    pub fn new(store: Arc<dyn IntakeStore>, jobs: Arc<dyn JobPublisher>) -> Self {
        Self { store, jobs }
    }

    #[instrument(skip(self, command), fields(application = %command.application, service = %command.service_name, version = %command.version))]
    pub async fn execute(&self, command: DeploymentCommand) -> Result<Uuid> {
        let strategy = Strategy::from_str(&command.strategy)
            .map_err(|_| DomainError::InvalidStrategy(command.strategy.clone()))?;
        let action = match command.action.as_deref() {
            None | Some("") => Action::Create,
            Some(raw) => {
                Action::from_str(raw).map_err(|_| DomainError::InvalidAction(raw.to_string()))?
            }
        };

        let service = self
            .store
            .get_service(&command.application, &command.service_name)
            .await?
            .ok_or_else(|| Error::ServiceNotFound {
                application: command.application.clone(),
                name: command.service_name.clone(),
            })?;

        if command.replicas != 0 && command.replicas != service.replicas {
            debug!(
                requested = command.replicas,
                inherited = service.replicas,
                "replica count is owned by the service row"
            );
        }

        let now = Utc::now();
        let deployment = Deployment {
            id: Uuid::new_v4(),
            application: command.application,
            service_name: command.service_name,
            strategy,
            action,
            step: Step::Creating,
            version: command.version,
            image: command.image,
            // The service row owns the replica count; the command value is
            // ignored on create.
            replicas: service.replicas,
            swap_interval: command.swap_interval.unwrap_or(DEFAULT_SWAP_INTERVAL_SECONDS),
            health_check_interval: command
                .health_check_interval
                .unwrap_or(DEFAULT_HEALTH_CHECK_INTERVAL_SECONDS),
            max_wait_time: command.max_wait_time.unwrap_or(DEFAULT_MAX_WAIT_TIME_SECONDS),
            envs: build_envs_payload(&command.envs).map_err(DomainError::Envs)?,
            created_at: now,
            updated_at: now,
        };

        self.store.save_deployment(&deployment).await?;

        if let Err(error) = self
            .store
            .delete_old_deployments(
                &deployment.application,
                &deployment.service_name,
                DEPLOYMENT_HISTORY_KEEP,
            )
            .await
        {
            warn!(error = %error, "failed to prune deployment history");
        }

        self.record_event(
            &deployment,
            format!("deployment {} created for {}", deployment.id, deployment.version),
        )
        .await;

        let payload = JobPayload::for_deployment(&deployment)?;
        self.jobs.publish(JOB_STREAM, &payload.to_entries()).await?;

        info!(deployment_id = %deployment.id, "deployment job published");

        Ok(deployment.id)
    }

    /// Flips the deployment's action to `finish` and enqueues the job. The
    /// row's step is advanced by the agent, not here.
    #[instrument(skip(self))]
    pub async fn finish(&self, id: Uuid) -> Result<()> {
        let mut deployment = self
            .store
            .get_deployment_by_id(id)
            .await?
            .ok_or(Error::DeploymentNotFound(id))?;

        if deployment.step != Step::Effective {
            return Err(Error::FinishPrecondition {
                id,
                step: deployment.step,
            });
        }

        deployment.action = Action::Finish;
        self.store.update_deployment_action(id, Action::Finish).await?;

        let payload = JobPayload::for_deployment(&deployment)?;
        self.jobs.publish(JOB_STREAM, &payload.to_entries()).await?;

        self.record_event(&deployment, format!("finish requested for deployment {id}"))
            .await;

        info!(deployment_id = %id, "finish job published");

        Ok(())
    }

    /// Audit rows must never block a rollout.
    async fn record_event(&self, deployment: &Deployment, message: String) {
        let event = Event::new(&deployment.application, &deployment.service_name, message);
        if let Err(error) = self.store.save_event(&event).await {
            warn!(error = %error, "failed to record event");
        }
    }
}
