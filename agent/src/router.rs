use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(thiserror::Error, Debug)]
pub enum RouterError {
    #[error("failed to access the router document: {0}")]
    Io(#[from] std::io::Error),
    #[error("router document is malformed: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("router `{0}` not found")]
    RouterNotFound(String),
    #[error("no slot is currently routed for `{0}`")]
    NoCurrentSlot(String),
}

pub type RouterResult<T> = std::result::Result<T, RouterError>;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeightedBackend {
    pub name: String,
    pub weight: u32,
}

impl WeightedBackend {
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight,
        }
    }
}

/// Read and rewrite the proxy's dynamic routing document.
#[async_trait]
pub trait TrafficRouter: Send + Sync {
    /// Creates the router entry for a service if missing. An existing
    /// entry is left untouched.
    async fn ensure_router(&self, service: &str, rule: &str) -> RouterResult<()>;

    /// Overwrites the service's weighted split and makes the router point
    /// at it.
    async fn insert_weighted_service(
        &self,
        service: &str,
        backends: &[WeightedBackend],
    ) -> RouterResult<()>;

    /// Version of the slot currently receiving the most traffic.
    async fn get_current_slot(&self, service: &str) -> RouterResult<String>;

    /// Points the router back at the service's split block.
    async fn point_router_to(&self, service: &str, version: &str) -> RouterResult<()>;
}

const PROVIDER_SUFFIX: &str = "@docker";

fn split_name(service: &str) -> String {
    format!("{service}-svc")
}

fn backend_name(slot: &str) -> String {
    format!("{slot}{PROVIDER_SUFFIX}")
}

/// Recover the version token from a backend name shaped `{service}-{version}`,
/// with or without a provider suffix.
pub(crate) fn version_from_backend(service: &str, backend: &str) -> Option<String> {
    let name = backend.split('@').next().unwrap_or(backend);

    name.strip_prefix(service)
        .and_then(|rest| rest.strip_prefix('-'))
        .filter(|version| !version.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct DynamicConfig {
    #[serde(default)]
    http: HttpConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct HttpConfig {
    #[serde(default)]
    routers: BTreeMap<String, RouterEntry>,
    #[serde(default)]
    services: BTreeMap<String, ServiceBlock>,
}

#[derive(Debug, Serialize, Deserialize)]
struct RouterEntry {
    rule: String,
    service: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct ServiceBlock {
    #[serde(rename = "loadBalancer", default, skip_serializing_if = "Option::is_none")]
    load_balancer: Option<LoadBalancer>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    weighted: Option<Weighted>,
}

#[derive(Debug, Serialize, Deserialize)]
struct LoadBalancer {
    servers: Vec<Server>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Server {
    url: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Weighted {
    services: Vec<WeightedEntry>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WeightedEntry {
    name: String,
    weight: u32,
}

/// File-backed Traefik dynamic configuration. Every mutation is a whole
/// document read-modify-write, serialised through one lock because agents
/// share the file with no other coordination.
#[derive(Clone)]
pub struct TraefikRouter {
    path: PathBuf,
    lock: Arc<Mutex<()>>,
}

impl TraefikRouter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Arc::new(Mutex::new(())),
        }
    }

    async fn load(&self) -> RouterResult<DynamicConfig> {
        let raw = tokio::fs::read_to_string(&self.path).await?;
        if raw.trim().is_empty() {
            return Ok(DynamicConfig::default());
        }

        Ok(serde_yaml::from_str(&raw)?)
    }

    async fn save(&self, config: &DynamicConfig) -> RouterResult<()> {
        let raw = serde_yaml::to_string(config)?;
        tokio::fs::write(&self.path, raw).await?;

        Ok(())
    }
}

#[async_trait]
impl TrafficRouter for TraefikRouter {
    async fn ensure_router(&self, service: &str, rule: &str) -> RouterResult<()> {
        let _guard = self.lock.lock().await;
        let mut config = self.load().await?;

        if config.http.routers.contains_key(service) {
            return Ok(());
        }

        config.http.routers.insert(
            service.to_string(),
            RouterEntry {
                rule: rule.to_string(),
                service: split_name(service),
            },
        );
        debug!(%service, %rule, "created router entry");

        self.save(&config).await
    }

    async fn insert_weighted_service(
        &self,
        service: &str,
        backends: &[WeightedBackend],
    ) -> RouterResult<()> {
        let _guard = self.lock.lock().await;
        let mut config = self.load().await?;

        let split = split_name(service);
        if let Some(router) = config.http.routers.get_mut(service) {
            router.service = split.clone();
        }

        let weighted = Weighted {
            services: backends
                .iter()
                .map(|backend| WeightedEntry {
                    name: backend_name(&backend.name),
                    weight: backend.weight,
                })
                .collect(),
        };
        config.http.services.insert(
            split,
            ServiceBlock {
                load_balancer: None,
                weighted: Some(weighted),
            },
        );

        self.save(&config).await
    }

    async fn get_current_slot(&self, service: &str) -> RouterResult<String> {
        let _guard = self.lock.lock().await;
        let config = self.load().await?;

        let router = config
            .http
            .routers
            .get(service)
            .ok_or_else(|| RouterError::RouterNotFound(service.to_string()))?;

        // A router still pointing at a direct backend predates any split
        // block; infer the version from the backend name itself.
        if router.service != split_name(service) {
            return version_from_backend(service, &router.service)
                .ok_or_else(|| RouterError::NoCurrentSlot(service.to_string()));
        }

        let backends = config
            .http
            .services
            .get(&router.service)
            .and_then(|block| block.weighted.as_ref())
            .map(|weighted| weighted.services.as_slice())
            .unwrap_or_default();

        backends
            .iter()
            .max_by_key(|entry| entry.weight)
            .and_then(|best| version_from_backend(service, &best.name))
            .ok_or_else(|| RouterError::NoCurrentSlot(service.to_string()))
    }

    async fn point_router_to(&self, service: &str, version: &str) -> RouterResult<()> {
        let _guard = self.lock.lock().await;
        let mut config = self.load().await?;

        let router = config
            .http
            .routers
            .get_mut(service)
            .ok_or_else(|| RouterError::RouterNotFound(service.to_string()))?;

        router.service = split_name(service);
        debug!(%service, %version, "router points at the split block");

        self.save(&config).await
    }
}

#[cfg(test)]
mod tests {
    use tempfile::NamedTempFile;

    use super::*;

    fn router_over(content: &str) -> (NamedTempFile, TraefikRouter) {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), content).unwrap();

        let router = TraefikRouter::new(file.path().to_path_buf());
        (file, router)
    }

    #[tokio::test]
    async fn ensure_router_is_idempotent() {
        let (_file, router) = router_over("");

        router
            .ensure_router("shop-api", "Host(`shop-api.local`)")
            .await
            .unwrap();
        router
            .ensure_router("shop-api", "Host(`other.rule`)")
            .await
            .unwrap();

        let config: DynamicConfig =
            serde_yaml::from_str(&std::fs::read_to_string(router.path.clone()).unwrap()).unwrap();
        let entry = config.http.routers.get("shop-api").unwrap();

        // The first rule wins; a second ensure never overwrites.
        assert_eq!(entry.rule, "Host(`shop-api.local`)");
        assert_eq!(entry.service, "shop-api-svc");
    }

    #[tokio::test]
    async fn weighted_split_overwrites_and_routes_through_the_split() {
        let (_file, router) = router_over("");
        router
            .ensure_router("shop-api", "Host(`shop-api.local`)")
            .await
            .unwrap();

        router
            .insert_weighted_service(
                "shop-api",
                &[
                    WeightedBackend::new("shop-api-v1", 80),
                    WeightedBackend::new("shop-api-v2", 20),
                ],
            )
            .await
            .unwrap();
        router
            .insert_weighted_service(
                "shop-api",
                &[
                    WeightedBackend::new("shop-api-v1", 0),
                    WeightedBackend::new("shop-api-v2", 100),
                ],
            )
            .await
            .unwrap();

        let config: DynamicConfig =
            serde_yaml::from_str(&std::fs::read_to_string(router.path.clone()).unwrap()).unwrap();
        let weighted = config
            .http
            .services
            .get("shop-api-svc")
            .and_then(|block| block.weighted.as_ref())
            .unwrap();

        assert_eq!(weighted.services.len(), 2);
        assert_eq!(weighted.services[0].name, "shop-api-v1@docker");
        assert_eq!(weighted.services[0].weight, 0);
        assert_eq!(weighted.services[1].name, "shop-api-v2@docker");
        assert_eq!(weighted.services[1].weight, 100);
    }

    #[tokio::test]
    async fn current_slot_is_the_heaviest_backend() {
        let (_file, router) = router_over("");
        router
            .ensure_router("shop-api", "Host(`shop-api.local`)")
            .await
            .unwrap();

        router
            .insert_weighted_service(
                "shop-api",
                &[
                    WeightedBackend::new("shop-api-v1", 60),
                    WeightedBackend::new("shop-api-v2", 40),
                ],
            )
            .await
            .unwrap();
        assert_eq!(router.get_current_slot("shop-api").await.unwrap(), "v1");

        router
            .insert_weighted_service(
                "shop-api",
                &[
                    WeightedBackend::new("shop-api-v1", 20),
                    WeightedBackend::new("shop-api-v2", 80),
                ],
            )
            .await
            .unwrap();
        assert_eq!(router.get_current_slot("shop-api").await.unwrap(), "v2");
    }

    #[tokio::test]
    async fn current_slot_falls_back_to_a_direct_backend() {
        let (_file, router) = router_over(
            "http:\n  routers:\n    shop-api:\n      rule: \"Host(`shop-api.local`)\"\n      service: shop-api-v3@docker\n",
        );

        assert_eq!(router.get_current_slot("shop-api").await.unwrap(), "v3");
    }

    #[tokio::test]
    async fn virgin_service_has_no_current_slot() {
        let (_file, router) = router_over("");
        router
            .ensure_router("shop-api", "Host(`shop-api.local`)")
            .await
            .unwrap();

        assert!(matches!(
            router.get_current_slot("shop-api").await,
            Err(RouterError::NoCurrentSlot(_))
        ));

        assert!(matches!(
            router.get_current_slot("unknown").await,
            Err(RouterError::RouterNotFound(_))
        ));
    }

    #[tokio::test]
    async fn point_router_resets_the_service_reference() {
        let (_file, router) = router_over(
            "http:\n  routers:\n    shop-api:\n      rule: \"Host(`shop-api.local`)\"\n      service: shop-api-v1@docker\n",
        );

        router.point_router_to("shop-api", "v2").await.unwrap();

        let config: DynamicConfig =
            serde_yaml::from_str(&std::fs::read_to_string(router.path.clone()).unwrap()).unwrap();
        assert_eq!(
            config.http.routers.get("shop-api").unwrap().service,
            "shop-api-svc"
        );
    }
}
