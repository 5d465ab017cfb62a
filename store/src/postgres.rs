use std::str::FromStr;

use chrono::{DateTime, Utc};
use releasy_common::deployment::{Action, Deployment, Step, Strategy};
use releasy_common::event::Event;
use releasy_common::service::Service;
use sqlx::postgres::PgPool;
use uuid::Uuid;

use crate::error::{Error, Result};

/// Durable store for services, deployments and events.
///
/// The pool is cheap to clone; share one instance per process instead of
/// reconnecting.
#[derive(Clone)]
pub struct Postgres {
    pool: PgPool,
}

impl Postgres {
    pub async fn connect(dsn: &str) -> Result<Self> {
        let pool = PgPool::connect(dsn).await?;

        Ok(Self { pool })
    }

    /// Creates all tables the store relies on. Statements are idempotent
    /// so every process can run this at startup.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS services (
                id UUID PRIMARY KEY,       -- Identifier of the service.
                application TEXT NOT NULL, -- Application the service belongs to.
                name TEXT NOT NULL,        -- Name of the service.
                version TEXT NOT NULL,     -- Version of the slot currently serving.
                image TEXT NOT NULL,
                replicas INTEGER NOT NULL,
                envs TEXT NOT NULL,        -- Serialized KEY=VALUE list.
                weight INTEGER NOT NULL,
                hostname TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                UNIQUE (application, name)
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS deployments (
                id UUID PRIMARY KEY,       -- Identifier of the deployment.
                application TEXT NOT NULL,
                service_name TEXT NOT NULL,
                strategy TEXT NOT NULL,
                action TEXT NOT NULL,
                step TEXT NOT NULL,        -- Current phase of the rollout.
                version TEXT NOT NULL,
                image TEXT NOT NULL,
                replicas INTEGER NOT NULL,
                swap_interval BIGINT NOT NULL,
                health_check_interval BIGINT NOT NULL,
                max_wait_time BIGINT NOT NULL,
                envs TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id UUID PRIMARY KEY,
                application TEXT NOT NULL,
                service_name TEXT NOT NULL,
                message TEXT NOT NULL,
                created_at TIMESTAMPTZ NOT NULL
            )",
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn save_deployment(&self, deployment: &Deployment) -> Result<()> {
        sqlx::query(
            "INSERT INTO deployments (
                id, application, service_name, strategy, action, step, version,
                image, replicas, swap_interval, health_check_interval,
                max_wait_time, envs, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)",
        )
        .bind(deployment.id)
        .bind(&deployment.application)
        .bind(&deployment.service_name)
        .bind(deployment.strategy.to_string())
        .bind(deployment.action.to_string())
        .bind(deployment.step.to_string())
        .bind(&deployment.version)
        .bind(&deployment.image)
        .bind(deployment.replicas as i32)
        .bind(deployment.swap_interval as i64)
        .bind(deployment.health_check_interval as i64)
        .bind(deployment.max_wait_time as i64)
        .bind(&deployment.envs)
        .bind(deployment.created_at)
        .bind(deployment.updated_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Error::from)
    }

    pub async fn get_deployment_by_id(&self, id: Uuid) -> Result<Option<Deployment>> {
        sqlx::query_as::<_, DeploymentRow>("SELECT * FROM deployments WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(Deployment::try_from)
            .transpose()
    }

    /// Advances the rollout phase of a deployment. The write is refused
    /// when the row's current step does not permit the transition, so an
    /// illegal advance surfaces as an error instead of being persisted.
    pub async fn update_deployment_step(&self, id: Uuid, step: Step) -> Result<()> {
        let current: Option<(String,)> =
            sqlx::query_as("SELECT step FROM deployments WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        let (current,) = current.ok_or(Error::NotFound(id))?;
        let from = Step::from_str(&current)
            .map_err(|_| Error::Corrupt(format!("unknown step `{current}`")))?;

        if !from.permits_update_to(step) {
            return Err(Error::StepTransition { from, to: step });
        }

        sqlx::query("UPDATE deployments SET step = $1, updated_at = $2 WHERE id = $3")
            .bind(step.to_string())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Error::from)
    }

    pub async fn update_deployment_action(&self, id: Uuid, action: Action) -> Result<()> {
        sqlx::query("UPDATE deployments SET action = $1, updated_at = $2 WHERE id = $3")
            .bind(action.to_string())
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Error::from)
    }

    pub async fn get_deployments(
        &self,
        application: &str,
        service_name: &str,
        limit: i64,
    ) -> Result<Vec<Deployment>> {
        sqlx::query_as::<_, DeploymentRow>(
            "SELECT * FROM deployments
                WHERE application = $1 AND service_name = $2
                ORDER BY created_at DESC
                LIMIT $3",
        )
        .bind(application)
        .bind(service_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Deployment::try_from)
        .collect()
    }

    pub async fn delete_old_deployments(
        &self,
        application: &str,
        service_name: &str,
        keep_last: i64,
    ) -> Result<()> {
        sqlx::query(
            "DELETE FROM deployments
                WHERE application = $1 AND service_name = $2 AND id NOT IN (
                    SELECT id FROM deployments
                    WHERE application = $1 AND service_name = $2
                    ORDER BY created_at DESC
                    LIMIT $3
                )",
        )
        .bind(application)
        .bind(service_name)
        .bind(keep_last)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Error::from)
    }

    pub async fn save_service(&self, service: &Service) -> Result<()> {
        sqlx::query(
            "INSERT INTO services (
                id, application, name, version, image, replicas, envs, weight,
                hostname, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT (application, name) DO UPDATE SET
                version = EXCLUDED.version,
                image = EXCLUDED.image,
                replicas = EXCLUDED.replicas,
                envs = EXCLUDED.envs,
                weight = EXCLUDED.weight,
                hostname = EXCLUDED.hostname",
        )
        .bind(service.id)
        .bind(&service.application)
        .bind(&service.name)
        .bind(&service.version)
        .bind(&service.image)
        .bind(service.replicas as i32)
        .bind(&service.envs)
        .bind(service.weight as i32)
        .bind(&service.hostname)
        .bind(service.created_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Error::from)
    }

    pub async fn get_service(&self, application: &str, name: &str) -> Result<Option<Service>> {
        sqlx::query_as::<_, ServiceRow>(
            "SELECT * FROM services WHERE application = $1 AND name = $2",
        )
        .bind(application)
        .bind(name)
        .fetch_optional(&self.pool)
        .await?
        .map(Service::try_from)
        .transpose()
    }

    pub async fn update_service(&self, service: &Service) -> Result<()> {
        sqlx::query(
            "UPDATE services SET
                version = $1, image = $2, replicas = $3, envs = $4, weight = $5,
                hostname = $6
            WHERE application = $7 AND name = $8",
        )
        .bind(&service.version)
        .bind(&service.image)
        .bind(service.replicas as i32)
        .bind(&service.envs)
        .bind(service.weight as i32)
        .bind(&service.hostname)
        .bind(&service.application)
        .bind(&service.name)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Error::from)
    }

    pub async fn delete_service(&self, application: &str, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM services WHERE application = $1 AND name = $2")
            .bind(application)
            .bind(name)
            .execute(&self.pool)
            .await
            .map(|_| ())
            .map_err(Error::from)
    }

    pub async fn save_event(&self, event: &Event) -> Result<()> {
        sqlx::query(
            "INSERT INTO events (id, application, service_name, message, created_at)
                VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(event.id)
        .bind(&event.application)
        .bind(&event.service_name)
        .bind(&event.message)
        .bind(event.created_at)
        .execute(&self.pool)
        .await
        .map(|_| ())
        .map_err(Error::from)
    }

    pub async fn get_events(
        &self,
        application: &str,
        service_name: &str,
        limit: i64,
    ) -> Result<Vec<Event>> {
        let rows = sqlx::query_as::<_, EventRow>(
            "SELECT * FROM events
                WHERE application = $1 AND service_name = $2
                ORDER BY created_at DESC
                LIMIT $3",
        )
        .bind(application)
        .bind(service_name)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Event::from).collect())
    }
}

/// Raw deployments row. Enum columns are TEXT and converted at the edge so
/// a corrupt row surfaces as an explicit error instead of a decode panic.
#[derive(sqlx::FromRow, Debug)]
struct DeploymentRow {
    id: Uuid,
    application: String,
    service_name: String,
    strategy: String,
    action: String,
    step: String,
    version: String,
    image: String,
    replicas: i32,
    swap_interval: i64,
    health_check_interval: i64,
    max_wait_time: i64,
    envs: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<DeploymentRow> for Deployment {
    type Error = Error;

    fn try_from(row: DeploymentRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            application: row.application,
            service_name: row.service_name,
            strategy: Strategy::from_str(&row.strategy)
                .map_err(|_| Error::Corrupt(format!("unknown strategy `{}`", row.strategy)))?,
            action: Action::from_str(&row.action)
                .map_err(|_| Error::Corrupt(format!("unknown action `{}`", row.action)))?,
            step: Step::from_str(&row.step)
                .map_err(|_| Error::Corrupt(format!("unknown step `{}`", row.step)))?,
            version: row.version,
            image: row.image,
            replicas: u32::try_from(row.replicas)
                .map_err(|_| Error::Corrupt(format!("negative replicas `{}`", row.replicas)))?,
            swap_interval: u64::try_from(row.swap_interval)
                .map_err(|_| Error::Corrupt("negative swap interval".to_string()))?,
            health_check_interval: u64::try_from(row.health_check_interval)
                .map_err(|_| Error::Corrupt("negative health check interval".to_string()))?,
            max_wait_time: u64::try_from(row.max_wait_time)
                .map_err(|_| Error::Corrupt("negative max wait time".to_string()))?,
            envs: row.envs,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct ServiceRow {
    id: Uuid,
    application: String,
    name: String,
    version: String,
    image: String,
    replicas: i32,
    envs: String,
    weight: i32,
    hostname: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<ServiceRow> for Service {
    type Error = Error;

    fn try_from(row: ServiceRow) -> Result<Self> {
        Ok(Self {
            id: row.id,
            application: row.application,
            name: row.name,
            version: row.version,
            image: row.image,
            replicas: u32::try_from(row.replicas)
                .map_err(|_| Error::Corrupt(format!("negative replicas `{}`", row.replicas)))?,
            envs: row.envs,
            weight: u32::try_from(row.weight)
                .map_err(|_| Error::Corrupt(format!("negative weight `{}`", row.weight)))?,
            hostname: row.hostname,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow, Debug)]
struct EventRow {
    id: Uuid,
    application: String,
    service_name: String,
    message: String,
    created_at: DateTime<Utc>,
}

impl From<EventRow> for Event {
    fn from(row: EventRow) -> Self {
        Self {
            id: row.id,
            application: row.application,
            service_name: row.service_name,
            message: row.message,
            created_at: row.created_at,
        }
    }
}
