//! # Hopper CLI - Ingestion Consumer Runner
//!
//! Runs one hopper consumer: a batched, at-least-once Kafka consumer that
//! fans records out to the configured destination storages in ClickHouse,
//! forwards replacement batches, and republishes commit progress.
//!
//! ## Usage
//!
//! ```bash
//! # Run a consumer from a YAML configuration file
//! hopper-cli --config configs/events.yml
//!
//! # Expose Prometheus metrics while running
//! hopper-cli --config configs/events.yml --metrics-addr 0.0.0.0:9184
//!
//! # Enable debug logging
//! RUST_LOG=debug hopper-cli --config configs/events.yml
//! ```
//!
//! The configuration file defines the consumed topic, the destination
//! storages, batching bounds, and the optional replacement, commit-log, and
//! dead-letter topics. Configured storages run the passthrough processor
//! (one JSON object per row) until domain processors are registered in
//! [`build_registry`].

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use hopper_core::{
    ConsumerSpec, Context, RowFormat, RuntimeConfig, StorageKey, StorageRegistry, StorageSpec,
};
use hopper_io::source_kafka::{ConsumerFactory, ConsumerRunner};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments for the hopper consumer runner
#[derive(Parser, Debug)]
#[command(name = "hopper-cli")]
#[command(about = "Multi-storage Kafka to ClickHouse ingestion consumer")]
struct Args {
    /// Path to the consumer YAML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Address to serve Prometheus metrics on (disabled when omitted)
    #[arg(long)]
    metrics_addr: Option<SocketAddr>,
}

/// Build the storage registry from the configured storages.
///
/// Every storage starts with the passthrough processor; domain-specific
/// processors and pre-filters are registered here as they are written.
fn build_registry(spec: &ConsumerSpec) -> StorageRegistry {
    let mut registry = StorageRegistry::new();
    for storage in &spec.storages {
        let mut entry = StorageSpec::new(StorageKey::new(&storage.name), storage.table.clone());
        if storage.format == RowFormat::Values {
            entry = entry.with_values_format(storage.columns.clone());
        }
        entry = entry.with_ignore_write_errors(storage.ignore_write_errors);
        registry.register(entry);
    }
    registry
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let spec: ConsumerSpec = {
        let raw = std::fs::read_to_string(&args.config)
            .with_context(|| format!("failed to read {}", args.config.display()))?;
        serde_yaml::from_str(&raw).context("failed to parse consumer configuration")?
    };
    spec.validate()?;

    if let Some(addr) = args.metrics_addr {
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install the metrics exporter")?;
        info!(%addr, "metrics exporter listening");
    }

    let registry = Arc::new(build_registry(&spec));
    let runtime = Arc::new(RuntimeConfig::from_map(spec.runtime.clone()));
    let context = Context::new(runtime);
    let factory = ConsumerFactory::new(spec, registry, context)?;

    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    // The whole data plane is thread-based; only signal handling stays async.
    let mut worker = tokio::task::spawn_blocking(move || {
        let runner = ConsumerRunner::new(&factory, worker_cancel)?;
        runner.run()
    });

    tokio::select! {
        _ = signal::ctrl_c() => {
            info!("received ctrl-c, shutting down");
            cancel.cancel();
        }
        finished = &mut worker => {
            return finished.context("consumer task panicked")?;
        }
    }

    worker.await.context("consumer task panicked")?
}
