//! Sink abstraction
//!
//! A sink is a network-addressable consumer of shard payloads. A failed
//! `send` means the sink is dead; the worker evicts and closes it.

use crate::error::ProjectorError;
use crate::events::ShardPayload;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{debug, info};

#[async_trait]
pub trait Sink: Send + Sync {
    /// Address the sink is registered under
    fn address(&self) -> &str;

    /// Deliver one payload; may block if the transport backpressures
    async fn send(&self, payload: &ShardPayload) -> Result<(), ProjectorError>;

    /// Release the sink. Idempotent.
    async fn close(&self);
}

/// Local-mode sink that logs payloads instead of publishing them
#[derive(Debug)]
pub struct LogSink {
    address: String,
    closed: AtomicBool,
    delivered: AtomicU64,
}

impl LogSink {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
        }
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sink for LogSink {
    fn address(&self) -> &str {
        &self.address
    }

    async fn send(&self, payload: &ShardPayload) -> Result<(), ProjectorError> {
        if self.is_closed() {
            return Err(ProjectorError::SinkClosed {
                address: self.address.clone(),
            });
        }
        self.delivered.fetch_add(1, Ordering::Relaxed);
        debug!(
            address = %self.address,
            shard_id = payload.shard_id,
            kind = payload.signal.label(),
            seqno = ?payload.seqno(),
            "Payload"
        );
        Ok(())
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            info!(address = %self.address, "Log sink closed");
        }
    }
}
