use std::time::Duration;

use async_trait::async_trait;
use releasy_common::job::JobPayload;
use releasy_store::{JobMessage, JobStream};
use tracing::{error, info, warn};

use crate::handlers::HandlerRegistry;

const READ_BLOCK: Duration = Duration::from_secs(5);
const READ_RETRY_BACKOFF: Duration = Duration::from_secs(2);

/// What the worker needs from the job stream.
#[async_trait]
pub trait JobSource: Send + Sync {
    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> releasy_store::Result<Vec<JobMessage>>;

    async fn ack(&self, stream: &str, group: &str, id: &str) -> releasy_store::Result<()>;
}

#[async_trait]
impl JobSource for JobStream {
    async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> releasy_store::Result<Vec<JobMessage>> {
        JobStream::read(self, stream, group, consumer, block).await
    }

    async fn ack(&self, stream: &str, group: &str, id: &str) -> releasy_store::Result<()> {
        JobStream::ack(self, stream, group, id).await
    }
}

/// Polls the stream for its consumer group and dispatches each job to the
/// handler registered for its strategy. Jobs are acknowledged only after
/// the handler succeeds; everything else stays pending for a retry.
pub struct Agent<S> {
    name: String,
    stream: String,
    group: String,
    jobs: S,
    registry: HandlerRegistry,
}

impl<S: JobSource> Agent<S> {
    pub fn new(
        name: String,
        stream: String,
        group: String,
        jobs: S,
        registry: HandlerRegistry,
    ) -> Self {
        Self {
            name,
            stream,
            group,
            jobs,
            registry,
        }
    }

    pub async fn start(self) {
        info!(agent = %self.name, stream = %self.stream, "agent started, watching stream");

        loop {
            let messages = match self
                .jobs
                .read(&self.stream, &self.group, &self.name, READ_BLOCK)
                .await
            {
                Ok(messages) => messages,
                Err(err) => {
                    error!(error = %err, "failed to read jobs");
                    tokio::time::sleep(READ_RETRY_BACKOFF).await;
                    continue;
                }
            };

            for message in messages {
                self.process(message).await;
            }
        }
    }

    pub(crate) async fn process(&self, message: JobMessage) {
        let deploy = match JobPayload::from_entries(&message.entries)
            .and_then(|payload| payload.deployment())
        {
            Ok(deploy) => deploy,
            Err(err) => {
                error!(message_id = %message.id, error = %err, "failed to decode job, leaving it pending");
                return;
            }
        };

        info!(
            deployment_id = %deploy.id,
            strategy = %deploy.strategy,
            action = %deploy.action,
            service = %deploy.service_key(),
            "processing job"
        );

        let Some(handler) = self.registry.get(deploy.strategy) else {
            warn!(strategy = %deploy.strategy, "no handler registered for strategy, leaving job pending");
            return;
        };

        if let Err(err) = handler.run(&deploy).await {
            error!(deployment_id = %deploy.id, error = %err, "job failed, leaving it pending");
            return;
        }

        match self.jobs.ack(&self.stream, &self.group, &message.id).await {
            Ok(()) => info!(deployment_id = %deploy.id, message_id = %message.id, "job acknowledged"),
            Err(err) => error!(message_id = %message.id, error = %err, "failed to acknowledge job"),
        }
    }
}
