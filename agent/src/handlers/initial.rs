use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use releasy_common::deployment::{Deployment, Step};
use releasy_common::env::{extract_port, parse_env_string};
use tracing::{info, instrument, warn};

use crate::docker::ContainerDriver;
use crate::error::{Error, Result};
use crate::handlers::{record_event, sync_service_row, DeploymentStateStore, JobHandler};
use crate::health::HealthProbe;
use crate::router::{TrafficRouter, WeightedBackend};

/// Bootstraps a brand-new service: one slot, full weight, no traffic
/// shifting. The rollout terminates at `finished` directly.
pub struct InitializeHandler {
    containers: Arc<dyn ContainerDriver>,
    router: Arc<dyn TrafficRouter>,
    prober: Arc<dyn HealthProbe>,
    store: Arc<dyn DeploymentStateStore>,
}

impl InitializeHandler {
    pub fn new(
        containers: Arc<dyn ContainerDriver>,
        router: Arc<dyn TrafficRouter>,
        prober: Arc<dyn HealthProbe>,
        store: Arc<dyn DeploymentStateStore>,
    ) -> Self {
        Self {
            containers,
            router,
            prober,
            store,
        }
    }
}

#[async_trait]
impl JobHandler for InitializeHandler {
    #[instrument(skip(self, deploy), fields(deployment_id = %deploy.id, service = %deploy.service_key(), version = %deploy.version))]
    async fn run(&self, deploy: &Deployment) -> Result<()> {
        // The service must have been enrolled before its first rollout.
        self.store
            .get_service(&deploy.application, &deploy.service_name)
            .await?
            .ok_or_else(|| Error::MissingService {
                application: deploy.application.clone(),
                name: deploy.service_name.clone(),
            })?;

        let envs = parse_env_string(&deploy.envs);
        let port = extract_port(&envs);
        let service = deploy.service_key();
        let slot = deploy.slot();

        self.store.update_step(deploy.id, Step::CreatingInfra).await?;

        self.containers
            .create_service(
                &service,
                &deploy.version,
                &deploy.image,
                deploy.replicas,
                &envs,
                port,
                true,
            )
            .await?;

        self.router
            .ensure_router(&service, &format!("Host(`{service}.local`)"))
            .await?;

        if let Err(error) = self
            .prober
            .ping(
                &slot,
                port,
                Duration::from_secs(deploy.health_check_interval),
                Duration::from_secs(deploy.max_wait_time),
            )
            .await
        {
            warn!(%slot, "health check failed, removing candidate slot");
            if let Err(remove) = self.containers.remove_slot(&service, &deploy.version).await {
                warn!(error = %remove, %slot, "failed to remove unhealthy slot");
            }
            return Err(error.into());
        }

        self.router
            .insert_weighted_service(&service, &[WeightedBackend::new(slot.clone(), 100)])
            .await?;
        self.router.point_router_to(&service, &deploy.version).await?;

        self.store.update_step(deploy.id, Step::Finished).await?;
        sync_service_row(self.store.as_ref(), deploy).await?;
        record_event(
            self.store.as_ref(),
            deploy,
            format!("service initialized with slot {slot}"),
        )
        .await;

        info!("service initialized");

        Ok(())
    }
}
