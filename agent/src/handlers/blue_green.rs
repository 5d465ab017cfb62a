use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use releasy_common::deployment::{Action, Deployment, Step};
use releasy_common::env::{extract_port, parse_env_string};
use tracing::{info, instrument, warn};

use crate::docker::ContainerDriver;
use crate::error::{Error, Result};
use crate::handlers::{record_event, sync_service_row, DeploymentStateStore, JobHandler};
use crate::health::HealthProbe;
use crate::router::{RouterError, TrafficRouter, WeightedBackend};

const WEIGHT_STEP: u32 = 20;
const INITIAL_OLD_WEIGHT: u32 = 80;

/// Drives the Blue/Green rollout state machine. Each phase persists its
/// step before producing side effects, so a re-delivered job observes
/// where the previous attempt stopped.
pub struct BlueGreenHandler {
    containers: Arc<dyn ContainerDriver>,
    router: Arc<dyn TrafficRouter>,
    prober: Arc<dyn HealthProbe>,
    store: Arc<dyn DeploymentStateStore>,
}

impl BlueGreenHandler {
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

    #[instrument(skip(self, deploy), fields(deployment_id = %deploy.id, service = %deploy.service_key(), version = %deploy.version))]
    async fn execute_create(&self, deploy: &Deployment) -> Result<()> {
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
                false,
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

        let old_version = match self.router.get_current_slot(&service).await {
            Ok(version) => version,
            Err(RouterError::NoCurrentSlot(_)) | Err(RouterError::RouterNotFound(_)) => {
                return self.promote_without_predecessor(deploy, &service, &slot).await;
            }
            Err(error) => return Err(error.into()),
        };
        info!(%old_version, "current slot resolved");

        self.store.update_step(deploy.id, Step::SwapTraffic).await?;

        let old_backend = format!("{service}-{old_version}");
        let mut old_weight = INITIAL_OLD_WEIGHT;
        let mut new_weight = 100 - old_weight;

        self.router
            .insert_weighted_service(
                &service,
                &[
                    WeightedBackend::new(old_backend.clone(), old_weight),
                    WeightedBackend::new(slot.clone(), new_weight),
                ],
            )
            .await?;
        info!(old = old_weight, new = new_weight, "traffic split updated");

        while old_weight > 0 {
            tokio::time::sleep(Duration::from_secs(deploy.swap_interval)).await;
            old_weight = old_weight.saturating_sub(WEIGHT_STEP);
            new_weight = 100 - old_weight;

            self.router
                .insert_weighted_service(
                    &service,
                    &[
                        WeightedBackend::new(old_backend.clone(), old_weight),
                        WeightedBackend::new(slot.clone(), new_weight),
                    ],
                )
                .await?;
            info!(old = old_weight, new = new_weight, "traffic split updated");
        }

        self.store.update_step(deploy.id, Step::Effective).await?;
        record_event(
            self.store.as_ref(),
            deploy,
            format!("deployment effective, all traffic on {slot}"),
        )
        .await;

        info!("rollout effective");

        Ok(())
    }

    /// First rollout of a service: there is no predecessor to drain, so the
    /// candidate takes all traffic at once and the rollout terminates.
    async fn promote_without_predecessor(
        &self,
        deploy: &Deployment,
        service: &str,
        slot: &str,
    ) -> Result<()> {
        info!(%service, "no slot currently routed, promoting candidate directly");

        self.router
            .insert_weighted_service(service, &[WeightedBackend::new(slot.to_string(), 100)])
            .await?;
        self.router.point_router_to(service, &deploy.version).await?;

        self.store.update_step(deploy.id, Step::Finished).await?;
        sync_service_row(self.store.as_ref(), deploy).await?;
        record_event(
            self.store.as_ref(),
            deploy,
            format!("initial slot {slot} promoted"),
        )
        .await;

        Ok(())
    }

    #[instrument(skip(self, deploy), fields(deployment_id = %deploy.id, service = %deploy.service_key(), version = %deploy.version))]
    async fn execute_finish(&self, deploy: &Deployment) -> Result<()> {
        self.store.update_step(deploy.id, Step::Finishing).await?;

        let service = deploy.service_key();
        let slot = deploy.slot();

        // The service row tracks the slot that finished last; that is the
        // one to reclaim.
        let previous = self
            .store
            .get_service(&deploy.application, &deploy.service_name)
            .await?
            .ok_or_else(|| Error::MissingService {
                application: deploy.application.clone(),
                name: deploy.service_name.clone(),
            })?;
        info!(old_version = %previous.version, "reclaiming previous slot");

        self.router
            .insert_weighted_service(&service, &[WeightedBackend::new(slot.clone(), 100)])
            .await?;

        if previous.version != deploy.version {
            if let Err(error) = self.containers.remove_slot(&service, &previous.version).await {
                warn!(error = %error, old_version = %previous.version, "failed to remove old slot");
            }
        }

        self.router.point_router_to(&service, &deploy.version).await?;

        self.store.update_step(deploy.id, Step::Finished).await?;
        sync_service_row(self.store.as_ref(), deploy).await?;
        record_event(
            self.store.as_ref(),
            deploy,
            format!("rollout finished, {slot} is the only live slot"),
        )
        .await;

        info!("rollout finished");

        Ok(())
    }

    #[instrument(skip(self, deploy), fields(deployment_id = %deploy.id, service = %deploy.service_key(), version = %deploy.version))]
    async fn execute_rollback(&self, deploy: &Deployment) -> Result<()> {
        let step = self
            .store
            .get_step(deploy.id)
            .await?
            .ok_or(Error::MissingDeployment(deploy.id))?;

        if !matches!(step, Step::Effective | Step::SwapTraffic) {
            return Err(Error::RollbackNotAllowed(step));
        }

        let service = deploy.service_key();
        let previous = self
            .store
            .get_service(&deploy.application, &deploy.service_name)
            .await?
            .ok_or_else(|| Error::MissingService {
                application: deploy.application.clone(),
                name: deploy.service_name.clone(),
            })?;

        let old_backend = format!("{service}-{}", previous.version);
        self.router
            .insert_weighted_service(&service, &[WeightedBackend::new(old_backend, 100)])
            .await?;

        if let Err(error) = self.containers.remove_slot(&service, &deploy.version).await {
            warn!(error = %error, version = %deploy.version, "failed to remove candidate slot");
        }

        self.store.update_step(deploy.id, Step::Failed).await?;
        record_event(
            self.store.as_ref(),
            deploy,
            format!("rollout rolled back to {}", previous.version),
        )
        .await;

        info!(restored = %previous.version, "rollout rolled back");

        Ok(())
    }
}

#[async_trait]
impl JobHandler for BlueGreenHandler {
    async fn run(&self, deploy: &Deployment) -> Result<()> {
        match deploy.action {
            Action::Create => self.execute_create(deploy).await,
            Action::Finish => self.execute_finish(deploy).await,
            Action::Rollback => self.execute_rollback(deploy).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use releasy_common::deployment::Strategy;
    use releasy_common::env::build_envs_payload;
    use uuid::Uuid;

    use super::*;
    use crate::handlers::test_support::{FakeContainers, FakeProbe, FakeRouter, FakeStore};

    fn deployment(action: Action) -> Deployment {
        Deployment {
            id: Uuid::new_v4(),
            application: "shop".to_string(),
            service_name: "api".to_string(),
            strategy: Strategy::BlueGreen,
            action,
            step: Step::Creating,
            version: "v2".to_string(),
            image: "shop/api:v2".to_string(),
            replicas: 2,
            swap_interval: 0,
            health_check_interval: 1,
            max_wait_time: 30,
            envs: build_envs_payload(&["APP_PORT=8080".to_string()]).unwrap(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn handler(
        containers: &Arc<FakeContainers>,
        router: &Arc<FakeRouter>,
        probe: &Arc<FakeProbe>,
        store: &Arc<FakeStore>,
    ) -> BlueGreenHandler {
        BlueGreenHandler::new(
            containers.clone(),
            router.clone(),
            probe.clone(),
            store.clone(),
        )
    }

    #[tokio::test]
    async fn create_shifts_all_traffic_to_the_candidate() {
        let containers = Arc::new(FakeContainers::default());
        let router = Arc::new(FakeRouter::with_slot("shop-api", "v1"));
        let probe = Arc::new(FakeProbe::healthy());
        let store = Arc::new(FakeStore::with_service("shop", "api", "v1", 2));

        handler(&containers, &router, &probe, &store)
            .run(&deployment(Action::Create))
            .await
            .unwrap();

        assert_eq!(
            store.recorded_steps(),
            vec![Step::CreatingInfra, Step::SwapTraffic, Step::Effective]
        );

        let created = containers.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].service, "shop-api");
        assert_eq!(created[0].version, "v2");
        assert_eq!(created[0].replicas, 2);
        assert_eq!(created[0].port, 8080);
        assert!(!created[0].pull_always);

        let final_split = router.current_split("shop-api");
        assert_eq!(
            final_split,
            vec![
                WeightedBackend::new("shop-api-v1", 0),
                WeightedBackend::new("shop-api-v2", 100),
            ]
        );

        // The old slot keeps running until finish.
        assert!(containers.removed().is_empty());

        let events = store.events();
        assert_eq!(events.len(), 1);
        assert!(events[0].message.contains("effective"));
    }

    #[tokio::test]
    async fn swap_weights_decrement_in_steps_of_twenty() {
        let containers = Arc::new(FakeContainers::default());
        let router = Arc::new(FakeRouter::with_slot("shop-api", "v1"));
        let probe = Arc::new(FakeProbe::healthy());
        let store = Arc::new(FakeStore::with_service("shop", "api", "v1", 2));

        handler(&containers, &router, &probe, &store)
            .run(&deployment(Action::Create))
            .await
            .unwrap();

        let history = router.split_history("shop-api");
        let old_weights: Vec<u32> = history
            .iter()
            .map(|split| split.iter().find(|b| b.name == "shop-api-v1").unwrap().weight)
            .collect();

        assert_eq!(old_weights, vec![80, 60, 40, 20, 0]);
        for split in &history {
            let total: u32 = split.iter().map(|backend| backend.weight).sum();
            assert_eq!(total, 100);
            assert!(split.iter().all(|backend| backend.weight % 20 == 0));
        }
    }

    #[tokio::test]
    async fn failed_health_check_reclaims_the_candidate() {
        let containers = Arc::new(FakeContainers::default());
        let router = Arc::new(FakeRouter::with_slot("shop-api", "v1"));
        let probe = Arc::new(FakeProbe::unhealthy());
        let store = Arc::new(FakeStore::with_service("shop", "api", "v1", 2));

        let error = handler(&containers, &router, &probe, &store)
            .run(&deployment(Action::Create))
            .await
            .unwrap_err();

        assert!(matches!(error, Error::HealthCheck(_)));
        // Frozen at the infra phase so a retry can resume there.
        assert_eq!(store.recorded_steps(), vec![Step::CreatingInfra]);
        assert_eq!(containers.removed(), vec!["shop-api-v2".to_string()]);
        // The split is never touched for an unhealthy candidate.
        assert!(router.split_history("shop-api").is_empty());
    }

    #[tokio::test]
    async fn container_failure_freezes_the_rollout_at_creating_infra() {
        let containers = Arc::new(FakeContainers::failing());
        let router = Arc::new(FakeRouter::with_slot("shop-api", "v1"));
        let probe = Arc::new(FakeProbe::healthy());
        let store = Arc::new(FakeStore::with_service("shop", "api", "v1", 2));

        let error = handler(&containers, &router, &probe, &store)
            .run(&deployment(Action::Create))
            .await
            .unwrap_err();

        assert!(matches!(error, Error::Infra(_)));
        assert_eq!(store.recorded_steps(), vec![Step::CreatingInfra]);
        assert!(router.split_history("shop-api").is_empty());
    }

    #[tokio::test]
    async fn create_on_a_virgin_service_promotes_directly() {
        let containers = Arc::new(FakeContainers::default());
        let router = Arc::new(FakeRouter::default());
        let probe = Arc::new(FakeProbe::healthy());
        let store = Arc::new(FakeStore::with_service("shop", "api", "v0", 2));

        handler(&containers, &router, &probe, &store)
            .run(&deployment(Action::Create))
            .await
            .unwrap();

        assert_eq!(
            store.recorded_steps(),
            vec![Step::CreatingInfra, Step::Finished]
        );
        assert_eq!(
            router.current_split("shop-api"),
            vec![WeightedBackend::new("shop-api-v2", 100)]
        );
        assert_eq!(store.service_version(), "v2");
    }

    #[tokio::test]
    async fn finish_reclaims_the_old_slot_and_normalises_the_split() {
        let containers = Arc::new(FakeContainers::default());
        let router = Arc::new(FakeRouter::default());
        router.seed_split(
            "shop-api",
            &[
                WeightedBackend::new("shop-api-v1", 0),
                WeightedBackend::new("shop-api-v2", 100),
            ],
        );
        let probe = Arc::new(FakeProbe::healthy());
        let store = Arc::new(FakeStore::with_service("shop", "api", "v1", 2));
        store.set_step(Step::Effective);

        handler(&containers, &router, &probe, &store)
            .run(&deployment(Action::Finish))
            .await
            .unwrap();

        assert_eq!(
            store.recorded_steps(),
            vec![Step::Finishing, Step::Finished]
        );

        // Exactly one live backend remains, at full weight.
        let split = router.current_split("shop-api");
        assert_eq!(split, vec![WeightedBackend::new("shop-api-v2", 100)]);

        assert_eq!(containers.removed(), vec!["shop-api-v1".to_string()]);
        assert_eq!(store.service_version(), "v2");
    }

    #[tokio::test]
    async fn finish_redelivery_never_removes_the_live_slot() {
        let containers = Arc::new(FakeContainers::default());
        let router = Arc::new(FakeRouter::default());
        router.seed_split("shop-api", &[WeightedBackend::new("shop-api-v2", 100)]);
        let probe = Arc::new(FakeProbe::healthy());
        // The row already points at the candidate: this finish ran before.
        let store = Arc::new(FakeStore::with_service("shop", "api", "v2", 2));
        store.set_step(Step::Effective);

        handler(&containers, &router, &probe, &store)
            .run(&deployment(Action::Finish))
            .await
            .unwrap();

        assert!(containers.removed().is_empty());
        assert_eq!(
            router.current_split("shop-api"),
            vec![WeightedBackend::new("shop-api-v2", 100)]
        );
    }

    #[tokio::test]
    async fn finish_on_an_unready_row_is_refused_by_the_store() {
        let containers = Arc::new(FakeContainers::default());
        let router = Arc::new(FakeRouter::with_slot("shop-api", "v1"));
        let probe = Arc::new(FakeProbe::healthy());
        // Row still at `creating`: `finishing` is not a legal advance.
        let store = Arc::new(FakeStore::with_service("shop", "api", "v1", 2));

        let error = handler(&containers, &router, &probe, &store)
            .run(&deployment(Action::Finish))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::Store(releasy_store::Error::StepTransition {
                from: Step::Creating,
                to: Step::Finishing,
            })
        ));
        assert!(store.recorded_steps().is_empty());
        assert!(containers.removed().is_empty());
    }

    #[tokio::test]
    async fn rollback_is_rejected_outside_live_steps() {
        let containers = Arc::new(FakeContainers::default());
        let router = Arc::new(FakeRouter::with_slot("shop-api", "v1"));
        let probe = Arc::new(FakeProbe::healthy());
        let store = Arc::new(FakeStore::with_service("shop", "api", "v1", 2));
        store.set_step(Step::CreatingInfra);

        let error = handler(&containers, &router, &probe, &store)
            .run(&deployment(Action::Rollback))
            .await
            .unwrap_err();

        assert!(matches!(
            error,
            Error::RollbackNotAllowed(Step::CreatingInfra)
        ));
        assert!(router.split_history("shop-api").is_empty());
        assert!(containers.removed().is_empty());
    }

    #[tokio::test]
    async fn rollback_restores_the_previous_slot() {
        let containers = Arc::new(FakeContainers::default());
        let router = Arc::new(FakeRouter::default());
        router.seed_split(
            "shop-api",
            &[
                WeightedBackend::new("shop-api-v1", 40),
                WeightedBackend::new("shop-api-v2", 60),
            ],
        );
        let probe = Arc::new(FakeProbe::healthy());
        let store = Arc::new(FakeStore::with_service("shop", "api", "v1", 2));
        store.set_step(Step::SwapTraffic);

        handler(&containers, &router, &probe, &store)
            .run(&deployment(Action::Rollback))
            .await
            .unwrap();

        assert_eq!(
            router.current_split("shop-api"),
            vec![WeightedBackend::new("shop-api-v1", 100)]
        );
        assert_eq!(containers.removed(), vec!["shop-api-v2".to_string()]);
        assert_eq!(store.recorded_steps(), vec![Step::Failed]);
    }
}
