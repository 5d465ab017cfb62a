mod args;
mod deployment;
mod error;
mod handlers;
mod service;
#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::sync::Arc;

use clap::Parser;
use releasy_store::{JobStream, Postgres};
use tracing::info;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

use crate::args::Args;
use crate::deployment::DeploymentService;
use crate::service::ServiceService;

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
    store
        .init_schema()
        .await
        .expect("failed to initialize database schema");

    let jobs = JobStream::connect(&args.redis_addr)
        .await
        .expect("failed to connect to redis");
    info!(addr = %args.redis_addr, "connected to job stream broker");

    let store = Arc::new(store);
    let jobs = Arc::new(jobs);
    let deployment_service = DeploymentService::new(store.clone(), jobs.clone());
    let service_service = ServiceService::new(store, jobs);

    let router = handlers::make_router(deployment_service, service_service);
    let addr = SocketAddr::from(([0, 0, 0, 0], args.port));

    info!(%addr, "starting control plane API server");

    axum::Server::bind(&addr)
        .serve(router.into_make_service())
        .await
        .unwrap_or_else(|_| panic!("Failed to bind to address: {}", addr));
}
