pub mod blue_green;
pub mod initial;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use releasy_common::deployment::{Deployment, Step, Strategy};
use releasy_common::event::Event;
use releasy_common::service::Service;
use releasy_store::Postgres;
use tracing::warn;
use uuid::Uuid;

use crate::error::Result;

pub use blue_green::BlueGreenHandler;
pub use initial::InitializeHandler;

/// A strategy implementation the worker dispatches jobs to.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn run(&self, deploy: &Deployment) -> Result<()>;
}

/// What handlers need from the durable store.
#[async_trait]
pub trait DeploymentStateStore: Send + Sync {
    async fn update_step(&self, id: Uuid, step: Step) -> releasy_store::Result<()>;
    async fn get_step(&self, id: Uuid) -> releasy_store::Result<Option<Step>>;
    async fn get_service(&self, application: &str, name: &str)
        -> releasy_store::Result<Option<Service>>;
    async fn update_service(&self, service: &Service) -> releasy_store::Result<()>;
    async fn save_event(&self, event: &Event) -> releasy_store::Result<()>;
}

#[async_trait]
impl DeploymentStateStore for Postgres {
    async fn update_step(&self, id: Uuid, step: Step) -> releasy_store::Result<()> {
        Postgres::update_deployment_step(self, id, step).await
    }

    async fn get_step(&self, id: Uuid) -> releasy_store::Result<Option<Step>> {
        Ok(Postgres::get_deployment_by_id(self, id)
            .await?
            .map(|deployment| deployment.step))
    }

    async fn get_service(
        &self,
        application: &str,
        name: &str,
    ) -> releasy_store::Result<Option<Service>> {
        Postgres::get_service(self, application, name).await
    }

    async fn update_service(&self, service: &Service) -> releasy_store::Result<()> {
        Postgres::update_service(self, service).await
    }

    async fn save_event(&self, event: &Event) -> releasy_store::Result<()> {
        Postgres::save_event(self, event).await
    }
}

/// Audit rows must never block a rollout.
pub(crate) async fn record_event(
    store: &dyn DeploymentStateStore,
    deploy: &Deployment,
    message: String,
) {
    let event = Event::new(&deploy.application, &deploy.service_name, message);
    if let Err(error) = store.save_event(&event).await {
        warn!(error = %error, "failed to record event");
    }
}

/// Terminal rollout steps own the service row: point it at the version
/// that is now serving.
pub(crate) async fn sync_service_row(
    store: &dyn DeploymentStateStore,
    deploy: &Deployment,
) -> Result<()> {
    let mut service = store
        .get_service(&deploy.application, &deploy.service_name)
        .await?
        .ok_or_else(|| crate::error::Error::MissingService {
            application: deploy.application.clone(),
            name: deploy.service_name.clone(),
        })?;

    service.version = deploy.version.clone();
    service.image = deploy.image.clone();
    service.replicas = deploy.replicas;
    service.envs = deploy.envs.clone();
    store.update_service(&service).await?;

    Ok(())
}

/// Strategy handlers registered at startup. The worker's dispatch is a
/// closed lookup over this table.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<Strategy, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, strategy: Strategy, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(strategy, handler);
        self
    }

    pub fn get(&self, strategy: Strategy) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&strategy).cloned()
    }
}
