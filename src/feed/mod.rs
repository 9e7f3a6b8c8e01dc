//! Change-feed adapter
//!
//! Reads newline-delimited JSON records, turns each into a `ChangeEvent` and
//! submits it to the worker that owns its shard. One record per line:
//!
//! ```text
//! {"op":"stream_begin","shard":3,"epoch":77,"seqno":0}
//! {"op":"mutation","shard":3,"epoch":77,"seqno":12,"collection":8,"key":"u::1","value":{"age":30}}
//! {"op":"stream_end","shard":3,"epoch":77,"seqno":12}
//! ```

use crate::error::ProjectorError;
use crate::events::{
    ChangeEvent, Opcode, SnapshotMarker, StreamStatus, SystemEventKind, ValueEncoding,
};
use crate::shard::WorkerPool;
use serde::Deserialize;
use serde_json::Value;
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, error, info, warn};

/// One line of the feed
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FeedRecord {
    pub op: Opcode,
    pub shard: u16,
    #[serde(default)]
    pub epoch: u64,
    #[serde(default)]
    pub seqno: u64,
    #[serde(default)]
    pub status: StreamStatus,
    #[serde(default)]
    pub correlation: u16,
    #[serde(default)]
    pub collection: u32,
    #[serde(default)]
    pub key: String,
    /// Structured document body
    #[serde(default)]
    pub value: Option<Value>,
    /// Opaque document body, passed through as binary
    #[serde(default)]
    pub raw: Option<String>,
    #[serde(default)]
    pub snapshot: Option<SnapshotMarker>,
    #[serde(default)]
    pub event: Option<SystemEventKind>,
}

impl FeedRecord {
    pub fn parse(line: &str, line_no: u64) -> Result<Self, ProjectorError> {
        serde_json::from_str(line).map_err(|source| ProjectorError::MalformedFeedRecord {
            line: line_no,
            source,
        })
    }

    pub fn into_event(self) -> ChangeEvent {
        let mut event = ChangeEvent::new(self.op, self.shard, self.epoch, self.seqno)
            .with_status(self.status)
            .with_correlation(self.correlation);
        event.collection_id = self.collection;
        event.key = self.key.into_bytes();
        event.snapshot = self.snapshot;
        event.system_event = self.event;
        match (self.value, self.raw) {
            (Some(value), _) => {
                event.value = value.to_string().into_bytes();
            }
            (None, Some(raw)) => {
                event.value = raw.into_bytes();
                event.encoding = ValueEncoding::Binary;
            }
            (None, None) => {}
        }
        event
    }
}

/// Line counts of one feed run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FeedSummary {
    pub lines: u64,
    pub submitted: u64,
    pub skipped: u64,
    /// Events whose worker had already terminated
    pub dropped: u64,
}

/// Pump a feed into the pool until end of input
pub async fn run_feed<R>(reader: R, pool: &WorkerPool) -> Result<FeedSummary, ProjectorError>
where
    R: AsyncBufRead + Unpin,
{
    let mut lines = reader.lines();
    let mut summary = FeedSummary::default();

    while let Some(line) = lines.next_line().await.map_err(ProjectorError::FeedRead)? {
        summary.lines += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let record = match FeedRecord::parse(line, summary.lines) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = summary.lines, error = %e, "Skipping malformed feed record");
                summary.skipped += 1;
                continue;
            }
        };

        let shard_id = record.shard;
        match pool.submit(record.into_event()).await {
            Ok(()) => summary.submitted += 1,
            Err(e) => {
                error!(line = summary.lines, shard_id, error = %e, "Feed event dropped");
                summary.dropped += 1;
            }
        }
    }

    debug!(lines = summary.lines, "Feed input exhausted");
    info!(
        submitted = summary.submitted,
        skipped = summary.skipped,
        dropped = summary.dropped,
        "Feed finished"
    );
    Ok(summary)
}

/// Pump a feed until `stop` resolves.
///
/// End of input is not a shutdown trigger: the call keeps waiting on `stop`.
/// Returns the feed's outcome if it finished first.
pub async fn run_feed_until<R, S>(
    reader: R,
    pool: &WorkerPool,
    stop: S,
) -> Option<Result<FeedSummary, ProjectorError>>
where
    R: AsyncBufRead + Unpin,
    S: Future<Output = ()>,
{
    tokio::pin!(stop);
    tokio::select! {
        result = run_feed(reader, pool) => {
            match &result {
                Ok(summary) => warn!(
                    lines = summary.lines,
                    "Change feed reached end of input, waiting for shutdown"
                ),
                Err(e) => error!(error = %e, "Change feed failed, waiting for shutdown"),
            }
            stop.await;
            Some(result)
        }
        _ = &mut stop => {
            info!("Change feed stopped before end of input");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectorConfig;
    use crate::metrics::ProjectorMetrics;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[test]
    fn test_mutation_record() {
        let record = FeedRecord::parse(
            r#"{"op":"mutation","shard":3,"epoch":77,"seqno":12,"collection":8,"key":"u::1","value":{"age":30}}"#,
            1,
        )
        .unwrap();
        let event = record.into_event();
        assert_eq!(event.opcode, Opcode::Mutation);
        assert_eq!(event.shard_id, 3);
        assert_eq!(event.collection_id, 8);
        assert_eq!(event.docid(), "u::1");
        assert_eq!(event.encoding, ValueEncoding::Json);
        assert_eq!(event.value, br#"{"age":30}"#.to_vec());
    }

    #[test]
    fn test_raw_value_is_binary() {
        let event = FeedRecord::parse(
            r#"{"op":"mutation","shard":0,"key":"k","raw":"not json"}"#,
            1,
        )
        .unwrap()
        .into_event();
        assert_eq!(event.encoding, ValueEncoding::Binary);
        assert_eq!(event.value, b"not json".to_vec());
    }

    #[test]
    fn test_stream_begin_status() {
        let event = FeedRecord::parse(
            r#"{"op":"stream_begin","shard":5,"epoch":1,"status":"rollback","correlation":4}"#,
            1,
        )
        .unwrap()
        .into_event();
        assert_eq!(event.status, StreamStatus::Rollback);
        assert_eq!(event.correlation_id, 4);
    }

    #[test]
    fn test_malformed_record() {
        let err = FeedRecord::parse(r#"{"op":"teleport","shard":1}"#, 9).unwrap_err();
        assert_eq!(err.error_type_label(), "feed_record");
        assert!(err.to_string().contains("line 9"));
    }

    #[tokio::test]
    async fn test_run_feed_skips_bad_lines() {
        let config = ProjectorConfig {
            worker_count: 2,
            ..ProjectorConfig::default()
        };
        let pool = WorkerPool::spawn_with_fatal_handler(
            &config,
            ProjectorMetrics::detached(),
            Arc::new(|_: &ProjectorError| {}),
        );

        let input = concat!(
            "{\"op\":\"stream_begin\",\"shard\":0,\"epoch\":1}\n",
            "\n",
            "garbage\n",
            "{\"op\":\"stream_begin\",\"shard\":1,\"epoch\":1,\"seqno\":5}\n",
        );
        let summary = run_feed(input.as_bytes(), &pool).await.unwrap();
        assert_eq!(
            summary,
            FeedSummary {
                lines: 4,
                submitted: 2,
                skipped: 1,
                dropped: 0
            }
        );

        pool.flush().await.unwrap();
        let merged = pool.merged_statistics().await.unwrap();
        assert_eq!(merged.len(), 2);
        pool.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_end_of_input_waits_for_stop() {
        let pool = WorkerPool::spawn_with_fatal_handler(
            &ProjectorConfig::default(),
            ProjectorMetrics::detached(),
            Arc::new(|_: &ProjectorError| {}),
        );
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let input = "{\"op\":\"stream_begin\",\"shard\":0,\"epoch\":1}\n";

        let feed = run_feed_until(input.as_bytes(), &pool, async {
            let _ = stop_rx.await;
        });
        tokio::pin!(feed);

        let still_running = tokio::time::timeout(Duration::from_millis(50), &mut feed).await;
        assert!(still_running.is_err());

        stop_tx.send(()).unwrap();
        let summary = feed.await.unwrap().unwrap();
        assert_eq!(summary.submitted, 1);
        pool.close().await.unwrap();
    }
}
