use std::time::Duration;

use async_trait::async_trait;
use http::StatusCode;
use hyper::client::HttpConnector;
use hyper::{Client, Uri};
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

#[derive(thiserror::Error, Debug)]
pub enum ProbeError {
    #[error("invalid probe url: {0}")]
    InvalidUri(#[from] http::uri::InvalidUri),
    #[error("`{host}` did not become healthy within {deadline:?}")]
    DeadlineExceeded { host: String, deadline: Duration },
}

/// Poll a target until it answers a successful health response or the
/// deadline elapses.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn ping(
        &self,
        host: &str,
        port: u16,
        interval: Duration,
        deadline: Duration,
    ) -> Result<(), ProbeError>;
}

pub struct HttpProber {
    client: Client<HttpConnector>,
}

impl HttpProber {
    pub fn new() -> Self {
        Self {
            client: Client::new(),
        }
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HealthProbe for HttpProber {
    async fn ping(
        &self,
        host: &str,
        port: u16,
        interval: Duration,
        deadline: Duration,
    ) -> Result<(), ProbeError> {
        let uri: Uri = format!("http://{host}:{port}/ping").parse()?;
        info!(%uri, "starting health check");

        let probe = async {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match self.client.get(uri.clone()).await {
                    Ok(response) if response.status() == StatusCode::OK => {
                        info!(%uri, "ping ok, service is healthy");
                        return;
                    }
                    Ok(response) => {
                        warn!(%uri, status = %response.status(), "ping returned unexpected status, retrying");
                    }
                    Err(error) => {
                        warn!(%uri, error = %error, "error pinging service, retrying");
                    }
                }
            }
        };

        tokio::time::timeout(deadline, probe)
            .await
            .map_err(|_| ProbeError::DeadlineExceeded {
                host: host.to_string(),
                deadline,
            })
    }
}
