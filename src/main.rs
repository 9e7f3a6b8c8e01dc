//! Shard projector process
//!
//! - Runs one pool of shard workers for a keyspace
//! - Reads the change feed as NDJSON from stdin
//! - Publishes shard payloads to NATS JetStream (or logs them in local mode)
//! - Exposes health/ready/stats endpoints and Prometheus metrics

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::signal;
use tracing::{error, info, warn};

use shard_projector::config::{ProjectorConfig, TopologyConfig};
use shard_projector::engine::{Engine, ProjectionEngine};
use shard_projector::feed::run_feed_until;
use shard_projector::health::{self, AppState};
use shard_projector::metrics::ProjectorMetrics;
use shard_projector::nats::{self, NatsSink};
use shard_projector::shard::{SinkMap, WorkerPool};
use shard_projector::sink::{LogSink, Sink};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first to get log level
    let config = ProjectorConfig::from_env()?;

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(format!("shard_projector={}", config.log_level).parse()?)
                .add_directive("async_nats=warn".parse()?),
        )
        .json()
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        keyspace = %config.keyspace_id,
        worker_count = config.worker_count,
        "Starting shard projector"
    );

    let metrics = ProjectorMetrics::install()?;
    info!("Prometheus metrics initialized");

    // Connect to NATS if configured
    let nats_client = if let Some(ref url) = config.nats_url {
        match nats::connect(url).await {
            Ok(client) => {
                metrics.set_nats_connected(true);
                Some(client)
            }
            Err(e) => {
                error!(error = %e, "Failed to connect to NATS - running in local mode");
                metrics.set_nats_connected(false);
                None
            }
        }
    } else {
        info!("No NATS_URL configured - running in local mode");
        None
    };

    let jetstream = match nats_client {
        Some(ref client) => {
            let js = nats::jetstream_context(client);
            nats::ensure_stream(&js, &config.nats_subject_prefix).await?;
            Some(js)
        }
        None => None,
    };

    let topology = match config.engines_file {
        Some(ref path) => TopologyConfig::load(path)?,
        None => {
            warn!("No ENGINES_FILE configured - every mutation becomes an update-seqno signal");
            TopologyConfig::default()
        }
    };

    let sinks: SinkMap = topology
        .sink_addresses()
        .into_iter()
        .map(|address| {
            let sink: Arc<dyn Sink> = match jetstream {
                Some(ref js) => Arc::new(NatsSink::new(
                    address.clone(),
                    &config.nats_subject_prefix,
                    js.clone(),
                )),
                None => Arc::new(LogSink::new(address.clone())),
            };
            (address, sink)
        })
        .collect();

    let pool = Arc::new(WorkerPool::spawn(&config, metrics.clone()));
    info!(
        session_id = %pool.session_id(),
        sinks = sinks.len(),
        "Worker pool created"
    );

    if !topology.engines.is_empty() {
        let engines: Vec<Arc<dyn Engine>> = topology
            .engines
            .into_iter()
            .map(|spec| Arc::new(ProjectionEngine::new(spec)) as Arc<dyn Engine>)
            .collect();
        pool.install_engines(topology.correlation, engines, Some(sinks))
            .await?;
    }

    let sync_ticker = pool.spawn_sync_ticker(config.sync_interval);
    let stats_poller = pool.spawn_stats_poller(config.stats_interval);

    // Start health server
    let app_state = AppState {
        pool: Arc::clone(&pool),
        nats: nats_client.clone(),
        metrics: metrics.clone(),
    };

    let health_router = health::router(app_state);
    let addr: SocketAddr = ([0, 0, 0, 0], config.http_port).into();

    info!(port = config.http_port, "Starting HTTP server");

    let http_server = axum::serve(tokio::net::TcpListener::bind(addr).await?, health_router);

    // A closed feed keeps the service up until a signal arrives
    let stop = async {
        tokio::select! {
            result = http_server => {
                if let Err(e) = result {
                    error!(error = %e, "HTTP server error");
                }
            }
            _ = shutdown_signal() => {
                info!("Shutdown signal received");
            }
        }
    };
    if let Some(Ok(summary)) = run_feed_until(BufReader::new(tokio::io::stdin()), &pool, stop).await {
        info!(lines = summary.lines, "Change feed closed");
    }

    // Graceful shutdown: every open shard stream gets its StreamEnd
    info!("Shutting down projector...");

    if let Err(e) = pool.close().await {
        error!(error = %e, "Worker pool did not close cleanly");
    }
    let _ = sync_ticker.await;
    let _ = stats_poller.await;

    if let Some(client) = nats_client {
        if let Err(e) = client.flush().await {
            warn!(error = %e, "Failed to flush NATS client");
        }
    }

    info!("Projector shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM or SIGINT)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
