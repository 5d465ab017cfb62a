mod args;
mod docker;
mod error;
mod handlers;
mod health;
mod router;
mod worker;

use std::sync::Arc;

use clap::Parser;
use releasy_common::deployment::Strategy;
use releasy_store::{JobStream, Postgres};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::args::Args;
use crate::docker::{ContainerDriver, DockerDriver};
use crate::handlers::{
    BlueGreenHandler, DeploymentStateStore, HandlerRegistry, InitializeHandler,
};
use crate::health::{HealthProbe, HttpProber};
use crate::router::{TraefikRouter, TrafficRouter};
use crate::worker::Agent;

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let fmt_layer = fmt::layer();
    let filter_layer = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    let store = Postgres::connect(&args.postgres_dsn)
        .await
        .expect("failed to connect to postgres");

    let jobs = JobStream::connect(&args.redis_addr)
        .await
        .expect("failed to connect to redis");
    jobs.ensure_group(&args.stream, &args.group)
        .await
        .expect("failed to create consumer group");
    info!(addr = %args.redis_addr, stream = %args.stream, "connected to job stream broker");

    let containers: Arc<dyn ContainerDriver> = Arc::new(
        DockerDriver::new(args.network.clone()).expect("failed to initialize docker client"),
    );
    info!(network = %args.network, "docker client ready");

    let router: Arc<dyn TrafficRouter> = Arc::new(TraefikRouter::new(args.dynamic_file.clone()));
    let prober: Arc<dyn HealthProbe> = Arc::new(HttpProber::new());
    let store: Arc<dyn DeploymentStateStore> = Arc::new(store);

    let registry = HandlerRegistry::new()
        .register(
            Strategy::BlueGreen,
            Arc::new(BlueGreenHandler::new(
                containers.clone(),
                router.clone(),
                prober.clone(),
                store.clone(),
            )),
        )
        .register(
            Strategy::Initialize,
            Arc::new(InitializeHandler::new(
                containers,
                router,
                prober,
                store,
            )),
        );

    let consumer = format!("agent-{}", gethostname::gethostname().to_string_lossy());
    let agent = Agent::new(consumer, args.stream, args.group, jobs, registry);

    agent.start().await;
}
