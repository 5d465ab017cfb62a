use clap::Parser;

/// Agent worker for releasy: consumes rollout jobs from the stream and
/// drives containers, routing and health checks for each deployment.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// Address of the Redis broker carrying the job stream
    #[clap(long, env = "RELEASY_REDIS_ADDR", default_value = "redis://127.0.0.1:6379")]
    pub redis_addr: String,

    /// Connection string of the deployment database
    #[clap(long, env = "RELEASY_POSTGRES_DSN")]
    pub postgres_dsn: String,

    /// User-defined docker network slot containers attach to
    #[clap(long, env = "RELEASY_NETWORK", default_value = "releasy_network")]
    pub network: String,

    /// Path of the proxy's dynamic configuration file
    #[clap(long, env = "TRAEFIK_DYNAMIC_FILE", default_value = "./dynamic.yml")]
    pub dynamic_file: String,

    /// Stream to consume jobs from
    #[clap(long, default_value = "releasy_jobs")]
    pub stream: String,

    /// Consumer group this agent joins
    #[clap(long, default_value = "releasy-group")]
    pub group: String,
}
