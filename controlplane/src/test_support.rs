use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use releasy_common::deployment::{Action, Deployment};
use releasy_common::event::Event;
use releasy_common::service::Service;
use uuid::Uuid;

use crate::deployment::{IntakeStore, JobPublisher};

#[derive(Default)]
pub struct FakeStore {
    pub services: Mutex<HashMap<(String, String), Service>>,
    pub deployments: Mutex<HashMap<Uuid, Deployment>>,
    pub events: Mutex<Vec<Event>>,
}

impl FakeStore {
    pub fn with_service(service: Service) -> Self {
        let store = Self::default();
        store
            .services
            .lock()
            .unwrap()
            .insert((service.application.clone(), service.name.clone()), service);
        store
    }

    pub fn with_deployment(self, deployment: Deployment) -> Self {
        self.deployments
            .lock()
            .unwrap()
            .insert(deployment.id, deployment);
        self
    }
}

#[async_trait]
impl IntakeStore for FakeStore {
    async fn get_service(
        &self,
        application: &str,
        name: &str,
    ) -> releasy_store::Result<Option<Service>> {
        Ok(self
            .services
            .lock()
            .unwrap()
            .get(&(application.to_string(), name.to_string()))
            .cloned())
    }

    async fn save_service(&self, service: &Service) -> releasy_store::Result<()> {
        self.services.lock().unwrap().insert(
            (service.application.clone(), service.name.clone()),
            service.clone(),
        );
        Ok(())
    }

    async fn delete_service(&self, application: &str, name: &str) -> releasy_store::Result<()> {
        self.services
            .lock()
            .unwrap()
            .remove(&(application.to_string(), name.to_string()));
        Ok(())
    }

    async fn save_deployment(&self, deployment: &Deployment) -> releasy_store::Result<()> {
        self.deployments
            .lock()
            .unwrap()
            .insert(deployment.id, deployment.clone());
        Ok(())
    }

    async fn get_deployment_by_id(&self, id: Uuid) -> releasy_store::Result<Option<Deployment>> {
        Ok(self.deployments.lock().unwrap().get(&id).cloned())
    }

    async fn get_deployments(
        &self,
        application: &str,
        name: &str,
        limit: i64,
    ) -> releasy_store::Result<Vec<Deployment>> {
        let mut rows: Vec<Deployment> = self
            .deployments
            .lock()
            .unwrap()
            .values()
            .filter(|row| row.application == application && row.service_name == name)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }

    async fn delete_old_deployments(
        &self,
        application: &str,
        name: &str,
        keep_last: i64,
    ) -> releasy_store::Result<()> {
        let keep: Vec<Uuid> = self
            .get_deployments(application, name, keep_last)
            .await?
            .into_iter()
            .map(|row| row.id)
            .collect();
        self.deployments.lock().unwrap().retain(|id, row| {
            row.application != application || row.service_name != name || keep.contains(id)
        });
        Ok(())
    }

    async fn update_deployment_action(
        &self,
        id: Uuid,
        action: Action,
    ) -> releasy_store::Result<()> {
        if let Some(deployment) = self.deployments.lock().unwrap().get_mut(&id) {
            deployment.action = action;
        }
        Ok(())
    }

    async fn save_event(&self, event: &Event) -> releasy_store::Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn get_events(
        &self,
        application: &str,
        name: &str,
        limit: i64,
    ) -> releasy_store::Result<Vec<Event>> {
        let mut rows: Vec<Event> = self
            .events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.application == application && event.service_name == name)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        rows.truncate(limit as usize);
        Ok(rows)
    }
}

#[derive(Default)]
pub struct FakePublisher {
    published: Mutex<Vec<(String, HashMap<String, String>)>>,
}

impl FakePublisher {
    pub fn published(&self) -> Vec<(String, HashMap<String, String>)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl JobPublisher for FakePublisher {
    async fn publish(
        &self,
        stream: &str,
        entries: &[(String, String)],
    ) -> releasy_store::Result<String> {
        self.published
            .lock()
            .unwrap()
            .push((stream.to_string(), entries.iter().cloned().collect()));
        Ok("0-1".to_string())
    }
}
