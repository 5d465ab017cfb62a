use std::collections::HashMap;
use std::time::Duration;

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tracing::trace;

use crate::error::Result;

const BUSYGROUP: &str = "BUSYGROUP";

/// One entry delivered from the job stream. Ownership stays with the
/// consumer group until the id is acknowledged.
#[derive(Clone, Debug)]
pub struct JobMessage {
    pub id: String,
    pub entries: HashMap<String, String>,
}

/// Durable append-only queue with consumer-group delivery, backed by
/// Redis streams.
#[derive(Clone)]
pub struct JobStream {
    manager: ConnectionManager,
}

impl JobStream {
    /// Connects eagerly so a broken broker address fails at startup.
    pub async fn connect(addr: &str) -> Result<Self> {
        let client = redis::Client::open(addr)?;
        let manager = ConnectionManager::new(client).await?;

        Ok(Self { manager })
    }

    /// Creates the consumer group, tolerating one that already exists.
    pub async fn ensure_group(&self, stream: &str, group: &str) -> Result<()> {
        let mut con = self.manager.clone();

        match con
            .xgroup_create_mkstream::<_, _, _, String>(stream, group, "$")
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if error.code() == Some(BUSYGROUP) => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    pub async fn publish(&self, stream: &str, entries: &[(String, String)]) -> Result<String> {
        let mut con = self.manager.clone();
        let id: String = con.xadd(stream, "*", entries).await?;
        trace!(%stream, %id, "published job");

        Ok(id)
    }

    /// Blocking read of fresh entries for this consumer. Returns an empty
    /// batch when the block timeout elapses with nothing to deliver.
    pub async fn read(
        &self,
        stream: &str,
        group: &str,
        consumer: &str,
        block: Duration,
    ) -> Result<Vec<JobMessage>> {
        let mut con = self.manager.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .block(block.as_millis() as usize)
            .count(1);

        let reply: StreamReadReply = con.xread_options(&[stream], &[">"], &options).await?;

        let mut messages = Vec::new();
        for key in reply.keys {
            for entry in key.ids {
                let mut entries = HashMap::new();
                for (field, value) in &entry.map {
                    if let Ok(text) = redis::from_redis_value::<String>(value) {
                        entries.insert(field.clone(), text);
                    }
                }
                messages.push(JobMessage {
                    id: entry.id.clone(),
                    entries,
                });
            }
        }

        Ok(messages)
    }

    pub async fn ack(&self, stream: &str, group: &str, id: &str) -> Result<()> {
        let mut con = self.manager.clone();
        let _: i64 = con.xack(stream, group, &[id]).await?;

        Ok(())
    }
}
