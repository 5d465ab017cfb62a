use clap::Parser;

/// Control plane for releasy deployments: accepts rollout requests,
/// persists them and publishes jobs for the agents.
#[derive(Parser, Debug, Clone)]
#[clap(author, version, about)]
pub struct Args {
    /// Connection string of the deployment database
    #[clap(long, env = "RELEASY_POSTGRES_DSN")]
    pub postgres_dsn: String,

    /// Address of the Redis broker carrying the job stream
    #[clap(long, env = "RELEASY_REDIS_ADDR", default_value = "redis://127.0.0.1:6379")]
    pub redis_addr: String,

    /// Port to serve the API on
    #[clap(long, env = "RELEASY_PORT", default_value = "3344")]
    pub port: u16,
}
