//! MetricDB Server - HTTP API for the metric store

mod api;

use clap::{Parser, ValueEnum};
use metricdb_core::compaction::CompactionConfig;
use metricdb_core::config;
use metricdb_core::memtable::MemTableConfig;
use metricdb_core::repository::LocalFileRepository;
use metricdb_core::storage::{FlushMode, MetricConfig, MetricStore, StoreConfig};
use metricdb_core::wal::{SyncPolicy, WalConfig};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// WAL sync mode selectable from the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WalSync {
    Immediate,
    EveryN,
    Interval,
    None,
}

/// Server configuration
#[derive(Debug, Parser)]
#[command(name = "metricdb", version, about = "MetricDB time-series storage server")]
struct Cli {
    /// Data directory (tables under `tables/`, WAL under `wal/`)
    #[arg(long, env = "METRICDB_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// HTTP listen address
    #[arg(long, env = "METRICDB_LISTEN", default_value = "0.0.0.0:8086")]
    listen: SocketAddr,

    /// Buffered samples per metric before a flush
    #[arg(long, env = "METRICDB_MEMTABLE_SAMPLES", default_value_t = config::MEMTABLE_MAX_SAMPLES)]
    memtable_samples: usize,

    /// Buffer byte estimate per metric before a flush
    #[arg(long, env = "METRICDB_MEMTABLE_BYTES", default_value_t = config::MEMTABLE_SIZE_LIMIT)]
    memtable_bytes: usize,

    /// Flush buffers older than this many seconds
    #[arg(long, env = "METRICDB_MEMTABLE_MAX_AGE_SECS")]
    memtable_max_age_secs: Option<u64>,

    /// Frozen buffers per metric waiting for the worker before writes stall
    #[arg(long, env = "METRICDB_MAX_FROZEN_BUFFERS", default_value_t = config::MAX_FROZEN_BUFFERS)]
    max_frozen_buffers: usize,

    /// Level-0 tables per metric before compaction
    #[arg(long, env = "METRICDB_L0_TRIGGER", default_value_t = config::L0_COMPACTION_TRIGGER)]
    l0_trigger: usize,

    /// Disable the write-ahead log (unflushed samples are lost on crash)
    #[arg(long, env = "METRICDB_NO_WAL")]
    no_wal: bool,

    /// WAL sync mode
    #[arg(long, env = "METRICDB_WAL_SYNC", value_enum, default_value_t = WalSync::Immediate)]
    wal_sync: WalSync,

    /// Writes between syncs (every-n) or milliseconds between syncs (interval)
    #[arg(long, env = "METRICDB_WAL_SYNC_PARAM", default_value_t = 100)]
    wal_sync_param: u64,
}

impl Cli {
    fn store_config(&self) -> StoreConfig {
        let sync_policy = match self.wal_sync {
            WalSync::Immediate => SyncPolicy::Immediate,
            WalSync::EveryN => SyncPolicy::EveryN(self.wal_sync_param.max(1) as usize),
            WalSync::Interval => SyncPolicy::Interval {
                millis: self.wal_sync_param,
            },
            WalSync::None => SyncPolicy::None,
        };
        let wal = (!self.no_wal).then(|| WalConfig {
            dir: self.data_dir.join("wal"),
            sync_policy,
        });

        StoreConfig {
            metric: MetricConfig {
                memtable: MemTableConfig {
                    max_samples: self.memtable_samples,
                    max_bytes: self.memtable_bytes,
                    max_age: self.memtable_max_age_secs.map(Duration::from_secs),
                },
                compaction: CompactionConfig {
                    l0_trigger: self.l0_trigger,
                    ..Default::default()
                },
                wal,
                flush_mode: FlushMode::Background,
                max_frozen_buffers: self.max_frozen_buffers,
            },
            background_worker: true,
            ..Default::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();

    info!("Starting MetricDB server...");
    info!("Data directory: {:?}", cli.data_dir);
    info!("HTTP server: http://{}", cli.listen);

    // Initialize metric store
    let repo = LocalFileRepository::new(cli.data_dir.join("tables"))?;
    let removed = repo.remove_partial_files()?;
    if removed > 0 {
        info!("Removed {} partial files", removed);
    }
    let store = Arc::new(MetricStore::open(Arc::new(repo), cli.store_config())?);

    // Create router
    let app = api::create_router(store.clone());

    // Start server
    let listener = tokio::net::TcpListener::bind(&cli.listen).await?;
    info!("MetricDB server listening on {}", cli.listen);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Shutting down, flushing buffers");
    store.close()?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}
