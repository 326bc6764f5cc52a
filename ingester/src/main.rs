//! Poll a spool directory for CI result submissions and load them into the
//! relational store.
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::routing::get;
use clap::Parser;
use envconfig::Envconfig;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ingest_common::health::Heartbeat;
use ingest_common::logcache::LogCache;
use ingest_common::metrics::{prepare_multiproc_dir, serve, setup_metrics_router};
use ingest_common::spool::SpoolDir;
use ingester::batch::BatchSettings;
use ingester::config::{Args, Config};
use ingester::excerpt::{ExcerptConverter, HttpExcerptStore};
use ingester::parse::KnownTrees;
use ingester::sinks::postgres::PostgresSink;
use ingester::worker::{Coordinator, IngestWorker};

fn setup_tracing(verbose: bool) {
    let default_filter = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        _ = ctrl_c.await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::init_from_env().context("invalid configuration")?;
    setup_tracing(config.verbose);

    let spool = SpoolDir::ensure(&args.spool_dir).context("failed to prepare spool directory")?;

    let trees = match &args.trees_file {
        Some(path) => Arc::new(
            KnownTrees::load(path)
                .with_context(|| format!("failed to load trees file {}", path.display()))?,
        ),
        None => Arc::new(KnownTrees::default()),
    };

    let heartbeat = Heartbeat::new(chrono::Duration::seconds(args.interval as i64 * 3 + 15));

    match config.prometheus_multiproc_dir.as_deref() {
        Some(dir) => {
            prepare_multiproc_dir(Path::new(dir))
                .with_context(|| format!("failed to prepare metrics directory {dir}"))?;

            let liveness = heartbeat.clone();
            let router = setup_metrics_router().route(
                "/_liveness",
                get(move || std::future::ready(liveness.status())),
            );
            let bind = config.bind();
            info!("serving metrics on {}", bind);
            tokio::task::spawn(async move {
                serve(router, &bind)
                    .await
                    .expect("failed to start serving metrics");
            });
        }
        None => info!("PROMETHEUS_MULTIPROC_DIR is not set, metrics export disabled"),
    }

    let cache = Arc::new(LogCache::new(config.cache_logs_size_limit));
    let converter = if !config.convert_log_excerpt {
        None
    } else {
        match (
            config.storage_base_url.as_deref(),
            config.storage_token.as_deref(),
        ) {
            (Some(base_url), Some(token)) => Some(Arc::new(ExcerptConverter::new(
                config.logexcerpt_threshold,
                cache,
                Arc::new(HttpExcerptStore::new(base_url, token)),
            ))),
            _ => {
                warn!("no storage credential configured, log excerpt upload disabled");
                None
            }
        }
    };

    let sink = PostgresSink::new(&config.database_url, config.max_pg_connections)
        .context("failed to initialize storage sink")?;

    let worker = IngestWorker::new(
        spool.clone(),
        Arc::new(sink),
        converter,
        trees,
        BatchSettings {
            batch_size: config.ingest_batch_size,
            flush_timeout: config.ingest_flush_timeout.0,
        },
    );

    let coordinator = Coordinator::new(
        spool,
        worker,
        Duration::from_secs(args.interval),
        args.max_workers,
        config.ingest_queue_maxsize,
        config.ingest_max_retries,
        heartbeat,
    );

    info!(
        "ingesting from {} with {} workers, polling every {}s",
        args.spool_dir.display(),
        args.max_workers,
        args.interval
    );
    coordinator.run(shutdown_signal()).await?;
    info!("ingester stopped");

    Ok(())
}
