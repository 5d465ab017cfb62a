use std::sync::Arc;

use chrono::Utc;
use releasy_common::deployment::{
    Action, Deployment, DomainError, Step, Strategy, DEFAULT_HEALTH_CHECK_INTERVAL_SECONDS,
    DEFAULT_MAX_WAIT_TIME_SECONDS,
};
use releasy_common::env::build_envs_payload;
use releasy_common::event::Event;
use releasy_common::job::{JobPayload, JOB_STREAM};
use releasy_common::service::Service;
use serde::Deserialize;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::deployment::{IntakeStore, JobPublisher};
use crate::error::{Error, Result};

const DEFAULT_SERVICE_WEIGHT: u32 = 100;
const DEPLOYMENT_HISTORY_LIMIT: i64 = 20;
const EVENT_HISTORY_LIMIT: i64 = 50;

/// Enrolment request for a brand-new service.
#[derive(Debug, Deserialize)]
pub struct CreateServiceCommand {
    pub application: String,
    pub service_name: String,
    pub replicas: u32,
    pub image: String,
    pub version: String,
    #[serde(default)]
    pub envs: Vec<String>,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub max_wait_time: Option<u64>,
}

/// Manages the long-lived service registry: enrolment (which also kicks
/// off the first rollout), deletion and per-service history.
#[derive(Clone)]
pub struct ServiceService {
    store: Arc<dyn IntakeStore>,
    jobs: Arc<dyn JobPublisher>,
}

impl ServiceService {
    pub fn new(store: Arc<dyn IntakeStore>, jobs: Arc<dyn JobPublisher>) -> Self {
        Self { store, jobs }
    }

    /// Persists the service row and publishes an initialize job that
    /// bootstraps its first slot.
    #[instrument(skip(self, command), fields(application = %command.application, service = %command.service_name, version = %command.version))]
    pub async fn create(&self, command: CreateServiceCommand) -> Result<Uuid> {
        let envs = build_envs_payload(&command.envs).map_err(DomainError::Envs)?;
        let now = Utc::now();
        let hostname = command.hostname.unwrap_or_else(|| {
            format!("{}-{}.local", command.application, command.service_name)
        });

        let service = Service {
            id: Uuid::new_v4(),
            application: command.application.clone(),
            name: command.service_name.clone(),
            version: command.version.clone(),
            image: command.image.clone(),
            replicas: command.replicas,
            envs: envs.clone(),
            weight: DEFAULT_SERVICE_WEIGHT,
            hostname,
            created_at: now,
        };
        self.store.save_service(&service).await?;

        let deployment = Deployment {
            id: Uuid::new_v4(),
            application: command.application,
            service_name: command.service_name,
            strategy: Strategy::Initialize,
            action: Action::Create,
            step: Step::Creating,
            version: command.version,
            image: command.image,
            replicas: command.replicas,
            // No predecessor, so there is no traffic to shift.
            swap_interval: 0,
            health_check_interval: DEFAULT_HEALTH_CHECK_INTERVAL_SECONDS,
            max_wait_time: command.max_wait_time.unwrap_or(DEFAULT_MAX_WAIT_TIME_SECONDS),
            envs,
            created_at: now,
            updated_at: now,
        };
        self.store.save_deployment(&deployment).await?;

        let payload = JobPayload::for_deployment(&deployment)?;
        self.jobs.publish(JOB_STREAM, &payload.to_entries()).await?;

        self.record_event(
            &deployment.application,
            &deployment.service_name,
            format!("service enrolled, bootstrapping {}", deployment.version),
        )
        .await;

        info!(deployment_id = %deployment.id, "initialize job published");

        Ok(deployment.id)
    }

    #[instrument(skip(self))]
    pub async fn delete(&self, application: &str, name: &str) -> Result<()> {
        self.store
            .get_service(application, name)
            .await?
            .ok_or_else(|| Error::ServiceNotFound {
                application: application.to_string(),
                name: name.to_string(),
            })?;

        self.store.delete_service(application, name).await?;
        self.record_event(application, name, "service deleted".to_string())
            .await;

        info!("service deleted");

        Ok(())
    }

    /// Most recent rollout attempts for a service, newest first.
    pub async fn deployment_history(
        &self,
        application: &str,
        name: &str,
    ) -> Result<Vec<Deployment>> {
        self.store
            .get_service(application, name)
            .await?
            .ok_or_else(|| Error::ServiceNotFound {
                application: application.to_string(),
                name: name.to_string(),
            })?;

        Ok(self
            .store
            .get_deployments(application, name, DEPLOYMENT_HISTORY_LIMIT)
            .await?)
    }

    /// Audit trail for a service, newest first.
    pub async fn events(&self, application: &str, name: &str) -> Result<Vec<Event>> {
        Ok(self
            .store
            .get_events(application, name, EVENT_HISTORY_LIMIT)
            .await?)
    }

    async fn record_event(&self, application: &str, name: &str, message: String) {
        let event = Event::new(application, name, message);
        if let Err(error) = self.store.save_event(&event).await {
            warn!(error = %error, "failed to record event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{FakePublisher, FakeStore};

    fn command() -> CreateServiceCommand {
        CreateServiceCommand {
            application: "shop".to_string(),
            service_name: "api".to_string(),
            replicas: 2,
            image: "shop/api:v1".to_string(),
            version: "v1".to_string(),
            envs: vec!["APP_PORT=8080".to_string()],
            hostname: None,
            max_wait_time: Some(30),
        }
    }

    #[tokio::test]
    async fn enrolment_saves_the_row_and_publishes_an_initialize_job() {
        let store = Arc::new(FakeStore::default());
        let jobs = Arc::new(FakePublisher::default());
        let services = ServiceService::new(store.clone(), jobs.clone());

        let job_id = services.create(command()).await.unwrap();

        let row = store
            .services
            .lock()
            .unwrap()
            .get(&("shop".to_string(), "api".to_string()))
            .cloned()
            .unwrap();
        assert_eq!(row.version, "v1");
        assert_eq!(row.replicas, 2);
        assert_eq!(row.weight, 100);
        assert_eq!(row.hostname, "shop-api.local");

        let deployment = store
            .deployments
            .lock()
            .unwrap()
            .get(&job_id)
            .cloned()
            .unwrap();
        assert_eq!(deployment.strategy, Strategy::Initialize);
        assert_eq!(deployment.step, Step::Creating);
        assert_eq!(deployment.replicas, 2);

        let published = jobs.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, JOB_STREAM);
        let job = JobPayload::from_entries(&published[0].1)
            .unwrap()
            .deployment()
            .unwrap();
        assert_eq!(job.strategy, Strategy::Initialize);
        assert_eq!(job.id, job_id);
    }

    #[tokio::test]
    async fn delete_removes_the_service_row() {
        let store = Arc::new(FakeStore::default());
        let jobs = Arc::new(FakePublisher::default());
        let services = ServiceService::new(store.clone(), jobs.clone());

        services.create(command()).await.unwrap();
        services.delete("shop", "api").await.unwrap();

        assert!(store.services.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn delete_rejects_an_unknown_service() {
        let store = Arc::new(FakeStore::default());
        let jobs = Arc::new(FakePublisher::default());
        let services = ServiceService::new(store, jobs);

        assert!(matches!(
            services.delete("shop", "api").await.unwrap_err(),
            Error::ServiceNotFound { .. }
        ));
    }

    #[tokio::test]
    async fn history_lists_rollouts_and_events_for_the_service() {
        let store = Arc::new(FakeStore::default());
        let jobs = Arc::new(FakePublisher::default());
        let services = ServiceService::new(store.clone(), jobs.clone());

        services.create(command()).await.unwrap();

        let history = services.deployment_history("shop", "api").await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].strategy, Strategy::Initialize);

        let events = services.events("shop", "api").await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(events[0].message.contains("enrolled"));
    }

    #[tokio::test]
    async fn history_rejects_an_unknown_service() {
        let store = Arc::new(FakeStore::default());
        let jobs = Arc::new(FakePublisher::default());
        let services = ServiceService::new(store, jobs);

        assert!(matches!(
            services.deployment_history("shop", "api").await.unwrap_err(),
            Error::ServiceNotFound { .. }
        ));
    }
}
