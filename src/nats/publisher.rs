//! NATS payload sink
//!
//! Each endpoint address maps to one JetStream subject under a shared prefix:
//! `projector.indexer-1_9104` for address `indexer-1:9104`.

use crate::error::ProjectorError;
use crate::events::ShardPayload;
use crate::sink::Sink;
use async_nats::jetstream::{self, Context as JsContext};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Stream holding every projector subject
pub const STREAM_NAME: &str = "PROJECTOR";

/// Connect to NATS
///
/// Wrap the client with [`jetstream_context`] to publish.
pub async fn connect(servers: &str) -> Result<async_nats::Client, ProjectorError> {
    info!(servers, "Connecting to NATS");

    let client = async_nats::connect(servers)
        .await
        .map_err(|e| ProjectorError::NatsConnectionFailed(Box::new(e)))?;

    info!("Connected to NATS");
    Ok(client)
}

pub fn jetstream_context(client: &async_nats::Client) -> JsContext {
    jetstream::new(client.clone())
}

/// Check if the client currently holds a server connection
pub fn is_connected(client: &async_nats::Client) -> bool {
    matches!(
        client.connection_state(),
        async_nats::connection::State::Connected
    )
}

/// Ensure the projector stream exists with the expected subjects
///
/// Typically run once at startup.
pub async fn ensure_stream(js: &JsContext, prefix: &str) -> Result<(), ProjectorError> {
    use async_nats::jetstream::stream::{Config, RetentionPolicy, StorageType};

    // Memory storage, 5min retention: consumers rebuild from the feed on loss
    let config = Config {
        name: STREAM_NAME.to_string(),
        subjects: vec![format!("{prefix}.>")],
        retention: RetentionPolicy::Limits,
        max_age: Duration::from_secs(300),
        storage: StorageType::Memory,
        ..Default::default()
    };

    js.get_or_create_stream(config)
        .await
        .map_err(|e| ProjectorError::NatsConnectionFailed(Box::new(e)))?;

    info!(stream = STREAM_NAME, prefix, "NATS stream configured");
    Ok(())
}

/// Subject for an endpoint address
pub fn subject_for(prefix: &str, address: &str) -> String {
    let token: String = address
        .chars()
        .map(|c| match c {
            '.' | ':' | ' ' | '*' | '>' | '/' => '_',
            other => other,
        })
        .collect();
    format!("{prefix}.{token}")
}

/// JetStream-backed sink for one endpoint
pub struct NatsSink {
    address: String,
    subject: String,
    jetstream: JsContext,
    closed: AtomicBool,
    messages_published: AtomicU64,
    publish_failures: AtomicU64,
}

impl NatsSink {
    pub fn new(address: impl Into<String>, prefix: &str, jetstream: JsContext) -> Self {
        let address = address.into();
        let subject = subject_for(prefix, &address);
        Self {
            address,
            subject,
            jetstream,
            closed: AtomicBool::new(false),
            messages_published: AtomicU64::new(0),
            publish_failures: AtomicU64::new(0),
        }
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn messages_published(&self) -> u64 {
        self.messages_published.load(Ordering::Relaxed)
    }

    pub fn publish_failures(&self) -> u64 {
        self.publish_failures.load(Ordering::Relaxed)
    }

    fn failed(&self, source: Box<dyn std::error::Error + Send + Sync>) -> ProjectorError {
        self.publish_failures.fetch_add(1, Ordering::Relaxed);
        warn!(address = %self.address, subject = %self.subject, error = %source, "Failed to publish payload");
        ProjectorError::SinkSend {
            address: self.address.clone(),
            source,
        }
    }
}

#[async_trait]
impl Sink for NatsSink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, payload: &ShardPayload) -> Result<(), ProjectorError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProjectorError::SinkClosed {
                address: self.address.clone(),
            });
        }

        let bytes = payload.to_json()?;

        let ack = self
            .jetstream
            .publish(self.subject.clone(), bytes.into())
            .await
            .map_err(|e| self.failed(Box::new(e)))?
            .await
            .map_err(|e| self.failed(Box::new(e)))?;

        self.messages_published.fetch_add(1, Ordering::Relaxed);
        debug!(
            subject = %self.subject,
            stream = %ack.stream,
            seq = ack.sequence,
            shard_id = payload.shard_id,
            kind = payload.signal.label(),
            "Payload published"
        );
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(address = %self.address, subject = %self.subject, "NATS sink closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subject_tokens_are_sanitized() {
        assert_eq!(subject_for("projector", "indexer-1:9104"), "projector.indexer-1_9104");
        assert_eq!(subject_for("p", "10.0.0.4:9104"), "p.10_0_0_4_9104");
        assert_eq!(subject_for("p", "plain"), "p.plain");
    }

    #[test]
    fn test_stream_constant() {
        assert_eq!(STREAM_NAME, "PROJECTOR");
    }
}
