//! Projector configuration module
//!
//! Process settings come from environment variables (optionally a `.env`
//! file). The engine/sink topology is a separate file loaded with the
//! `config` crate so it can be TOML, JSON or YAML.

use crate::engine::ProjectionSpec;
use crate::error::ProjectorError;
use crate::shard::worker::{DEFAULT_DATA_QUEUE_SIZE, DEFAULT_ENCODE_BUF_SIZE};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Projector process configuration
#[derive(Debug, Clone)]
pub struct ProjectorConfig {
    /// Keyspace (bucket) whose change feed this process projects
    pub keyspace_id: String,

    /// Number of shard workers; shard `s` is owned by worker `s % worker_count`
    pub worker_count: usize,

    /// Data queue bound per worker
    pub mutation_chan_size: usize,

    /// Initial capacity of each worker's encode buffer
    pub encode_buf_size: usize,

    /// NATS server URL(s) - comma-separated for multiple servers
    pub nats_url: Option<String>,

    /// Subject prefix for sink subjects
    pub nats_subject_prefix: String,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,

    /// Topology file (engines and sink addresses)
    pub engines_file: Option<PathBuf>,

    /// Period of the sync-pulse ticker
    pub sync_interval: Duration,

    /// Period of the statistics poller
    pub stats_interval: Duration,
}

impl Default for ProjectorConfig {
    fn default() -> Self {
        Self {
            keyspace_id: "default".to_string(),
            worker_count: 4,
            mutation_chan_size: DEFAULT_DATA_QUEUE_SIZE,
            encode_buf_size: DEFAULT_ENCODE_BUF_SIZE,
            nats_url: None,
            nats_subject_prefix: "projector".to_string(),
            http_port: 9090,
            log_level: "info".to_string(),
            engines_file: None,
            sync_interval: Duration::from_millis(2000),
            stats_interval: Duration::from_secs(30),
        }
    }
}

fn parse_var<T>(name: &str, default: T) -> Result<T, ProjectorError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e| ProjectorError::Config(format!("{name} must be a valid number: {e}"))),
        Err(_) => Ok(default),
    }
}

impl ProjectorConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, ProjectorError> {
        dotenvy::dotenv().ok();
        let defaults = Self::default();

        let keyspace_id = env::var("KEYSPACE_ID").unwrap_or(defaults.keyspace_id);

        let worker_count = parse_var("WORKER_COUNT", defaults.worker_count)?;
        let mutation_chan_size = parse_var("MUTATION_CHAN_SIZE", defaults.mutation_chan_size)?;
        let encode_buf_size = parse_var("ENCODE_BUF_SIZE", defaults.encode_buf_size)?;

        let nats_url = env::var("NATS_URL").ok().filter(|url| !url.trim().is_empty());
        let nats_subject_prefix =
            env::var("NATS_SUBJECT_PREFIX").unwrap_or(defaults.nats_subject_prefix);

        let http_port = env::var("HTTP_PORT")
            .or_else(|_| env::var("METRICS_PORT"))
            .map(|raw| raw.parse())
            .unwrap_or(Ok(defaults.http_port))
            .map_err(|e| ProjectorError::Config(format!("HTTP_PORT must be a valid port number: {e}")))?;

        let log_level = env::var("LOG_LEVEL").unwrap_or(defaults.log_level);
        let engines_file = env::var("ENGINES_FILE").ok().map(PathBuf::from);

        let sync_ms = parse_var("SYNC_INTERVAL_MS", defaults.sync_interval.as_millis() as u64)?;
        let stats_secs = parse_var("STATS_INTERVAL_SECS", defaults.stats_interval.as_secs())?;

        let config = Self {
            keyspace_id,
            worker_count,
            mutation_chan_size,
            encode_buf_size,
            nats_url,
            nats_subject_prefix,
            http_port,
            log_level,
            engines_file,
            sync_interval: Duration::from_millis(sync_ms),
            stats_interval: Duration::from_secs(stats_secs),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ProjectorError> {
        if self.keyspace_id.trim().is_empty() {
            return Err(ProjectorError::Config("KEYSPACE_ID must not be empty".to_string()));
        }
        if self.worker_count == 0 {
            return Err(ProjectorError::Config("WORKER_COUNT must be at least 1".to_string()));
        }
        if self.mutation_chan_size == 0 {
            return Err(ProjectorError::Config(
                "MUTATION_CHAN_SIZE must be at least 1".to_string(),
            ));
        }
        if self.sync_interval.is_zero() || self.stats_interval.is_zero() {
            return Err(ProjectorError::Config(
                "SYNC_INTERVAL_MS and STATS_INTERVAL_SECS must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Engines to install and the sink addresses they may reach
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TopologyConfig {
    /// Correlation id stamped on the install request
    #[serde(default)]
    pub correlation: u16,

    #[serde(default)]
    pub engines: Vec<ProjectionSpec>,

    /// Candidate sink addresses; empty means every address engines reference
    #[serde(default)]
    pub sinks: Vec<String>,
}

impl TopologyConfig {
    /// Load a topology file; the format follows the file extension
    pub fn load(path: &std::path::Path) -> Result<Self, ProjectorError> {
        let topology_err = |source| ProjectorError::TopologyLoad {
            path: path.display().to_string(),
            source,
        };
        config::Config::builder()
            .add_source(config::File::from(path))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(topology_err)
    }

    /// Parse a topology document held in memory
    pub fn parse(raw: &str, format: config::FileFormat) -> Result<Self, ProjectorError> {
        config::Config::builder()
            .add_source(config::File::from_str(raw, format))
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|source| ProjectorError::TopologyLoad {
                path: "<inline>".to_string(),
                source,
            })
    }

    /// Addresses sinks must be opened for, sorted
    pub fn sink_addresses(&self) -> Vec<String> {
        if !self.sinks.is_empty() {
            let unique: BTreeSet<&String> = self.sinks.iter().collect();
            return unique.into_iter().cloned().collect();
        }
        let referenced: BTreeSet<&String> = self
            .engines
            .iter()
            .flat_map(|spec| spec.endpoints.iter())
            .collect();
        referenced.into_iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::FileFormat;

    #[test]
    fn test_default_values() {
        let config = ProjectorConfig::default();
        assert_eq!(config.worker_count, 4);
        assert_eq!(config.mutation_chan_size, DEFAULT_DATA_QUEUE_SIZE);
        assert_eq!(config.http_port, 9090);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_workers_rejected() {
        let config = ProjectorConfig {
            worker_count: 0,
            ..ProjectorConfig::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.error_type_label(), "config");
    }

    #[test]
    fn test_topology_from_toml() {
        let raw = r##"
            correlation = 3
            sinks = ["idx-a", "idx-b"]

            [[engines]]
            id = 10
            name = "by_age"
            collection_id = 8
            fields = ["age", "name"]
            endpoints = ["idx-a"]

            [[engines]]
            id = 11
            name = "#primary"
            collection_id = 8
            endpoints = ["idx-b", "idx-c"]
        "##;
        let topology = TopologyConfig::parse(raw, FileFormat::Toml).unwrap();
        assert_eq!(topology.correlation, 3);
        assert_eq!(topology.engines.len(), 2);
        assert_eq!(topology.engines[0].fields, vec!["age", "name"]);
        assert!(topology.engines[1].fields.is_empty());
        assert_eq!(topology.sink_addresses(), vec!["idx-a", "idx-b"]);
    }

    #[test]
    fn test_sink_addresses_default_to_referenced() {
        let raw = r#"{
            "engines": [
                {"id": 1, "name": "a", "collection_id": 0, "endpoints": ["x", "y"]},
                {"id": 2, "name": "b", "collection_id": 0, "endpoints": ["y"]}
            ]
        }"#;
        let topology = TopologyConfig::parse(raw, FileFormat::Json).unwrap();
        assert_eq!(topology.correlation, 0);
        assert_eq!(topology.sink_addresses(), vec!["x", "y"]);
    }

    #[test]
    fn test_malformed_topology() {
        let err = TopologyConfig::parse("{\"engines\": 5}", FileFormat::Json).unwrap_err();
        assert_eq!(err.error_type_label(), "topology");
    }
}
