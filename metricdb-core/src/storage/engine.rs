//! Metric store - top-level coordinator

use super::worker::{Job, Registry, Worker};
use super::{FlushMode, Metric, MetricStats, StoreConfig, WriteOutcome};
use crate::compaction::CompactionReport;
use crate::repository::{FileRepository, MetricLayout};
use crate::{Result, Sample, Timestamp};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Registry of metrics sharing one file repository
pub struct MetricStore {
    repo: Arc<dyn FileRepository>,
    config: StoreConfig,
    metrics: Registry,
    worker: Option<Worker>,
}

impl MetricStore {
    /// Open a store, loading every metric found in the repository or WAL
    pub fn open(repo: Arc<dyn FileRepository>, mut config: StoreConfig) -> Result<Self> {
        if !config.background_worker {
            config.metric.flush_mode = FlushMode::Inline;
        }

        let metrics: Registry = Arc::new(RwLock::new(HashMap::new()));
        let mut store = Self {
            repo,
            config,
            metrics: Arc::clone(&metrics),
            worker: None,
        };

        // Load existing metrics
        store.load_metrics()?;

        if store.config.background_worker {
            let worker = Worker::spawn(metrics, store.config.tick_interval)?;
            let pending: Vec<Arc<Metric>> = store
                .metrics
                .read()
                .values()
                .filter(|m| m.has_pending_flush())
                .cloned()
                .collect();
            for metric in pending {
                worker.schedule(Job::Flush(metric))?;
            }
            store.worker = Some(worker);
        }

        Ok(store)
    }

    /// Get or open a metric
    pub fn metric(&self, key: &str) -> Result<Arc<Metric>> {
        // Check if open
        {
            let metrics = self.metrics.read();
            if let Some(metric) = metrics.get(key) {
                return Ok(metric.clone());
            }
        }

        let mut metrics = self.metrics.write();
        if let Some(metric) = metrics.get(key) {
            return Ok(metric.clone());
        }
        let metric = Arc::new(Metric::open(
            key,
            Arc::clone(&self.repo),
            self.config.metric.clone(),
        )?);
        metrics.insert(key.to_string(), metric.clone());
        Ok(metric)
    }

    /// Add one sample to a metric
    pub fn add_sample(&self, metric_key: &str, timestamp: Timestamp, value: f64) -> Result<()> {
        let metric = self.metric(metric_key)?;
        let outcome = metric.add_sample(Sample::new(timestamp, value))?;
        self.after_write(metric, outcome)
    }

    /// Add a batch of samples to a metric
    pub fn add_samples(&self, metric_key: &str, samples: &[Sample]) -> Result<()> {
        let metric = self.metric(metric_key)?;
        let outcome = metric.add_samples(samples)?;
        self.after_write(metric, outcome)
    }

    fn after_write(&self, metric: Arc<Metric>, outcome: WriteOutcome) -> Result<()> {
        match (&self.worker, outcome) {
            (Some(worker), WriteOutcome::FlushPending) => worker.schedule(Job::Flush(metric)),
            (Some(worker), WriteOutcome::Buffered) if metric.needs_compaction() => {
                worker.schedule(Job::Compact(metric))
            }
            (Some(_), WriteOutcome::Buffered) => Ok(()),
            (None, _) => metric.maybe_compact().map(|_| ()),
        }
    }

    /// Samples of a metric with `lo <= timestamp <= hi`
    pub fn query(&self, metric_key: &str, lo: Timestamp, hi: Timestamp) -> Result<Vec<Sample>> {
        self.metric(metric_key)?.query(lo, hi)
    }

    /// Cancellable variant of [`MetricStore::query`]
    pub fn query_with_cancel(
        &self,
        metric_key: &str,
        lo: Timestamp,
        hi: Timestamp,
        cancel: &CancellationToken,
    ) -> Result<Vec<Sample>> {
        self.metric(metric_key)?.query_with_cancel(lo, hi, cancel)
    }

    /// Flush one metric
    pub fn flush(&self, metric_key: &str) -> Result<usize> {
        self.metric(metric_key)?.flush()
    }

    /// Flush all open metrics
    pub fn flush_all(&self) -> Result<()> {
        for metric in self.open_metrics() {
            metric.flush()?;
        }
        Ok(())
    }

    /// Compact one metric regardless of thresholds
    pub fn compact(&self, metric_key: &str) -> Result<Option<CompactionReport>> {
        self.metric(metric_key)?.compact()
    }

    /// Keys of every stored or open metric, sorted
    pub fn list_metrics(&self) -> Result<Vec<String>> {
        let mut keys: BTreeSet<String> = self.metrics.read().keys().cloned().collect();
        for id in self.repo.list()? {
            if let Some(key) = MetricLayout::metric_key_of_manifest(&id) {
                keys.insert(key);
            }
        }
        Ok(keys.into_iter().collect())
    }

    /// Get store statistics
    pub fn stats(&self) -> StoreStats {
        let mut metrics: Vec<MetricStats> =
            self.open_metrics().iter().map(|m| m.stats()).collect();
        metrics.sort_by(|a, b| a.key.cmp(&b.key));

        StoreStats {
            metric_count: metrics.len(),
            buffered_samples: metrics.iter().map(|s| s.buffered_samples).sum(),
            tables: metrics.iter().map(|s| s.tables).sum(),
            table_samples: metrics.iter().map(|s| s.table_samples).sum(),
            metrics,
        }
    }

    /// Stop the worker and flush every metric
    pub fn close(&self) -> Result<()> {
        if let Some(worker) = &self.worker {
            worker.shutdown();
        }
        for metric in self.open_metrics() {
            metric.close()?;
        }
        info!("Closed metric store");
        Ok(())
    }

    fn open_metrics(&self) -> Vec<Arc<Metric>> {
        self.metrics.read().values().cloned().collect()
    }

    fn load_metrics(&self) -> Result<()> {
        let mut keys: BTreeSet<String> = BTreeSet::new();
        for id in self.repo.list()? {
            if let Some(key) = MetricLayout::metric_key_of_manifest(&id) {
                keys.insert(key);
            }
        }

        // Metrics that never flushed exist only as WAL directories
        if let Some(wal) = &self.config.metric.wal {
            if wal.dir.exists() {
                for entry in std::fs::read_dir(&wal.dir)? {
                    let entry = entry?;
                    if !entry.file_type()?.is_dir() {
                        continue;
                    }
                    let name = entry.file_name().to_string_lossy().to_string();
                    if let Some(key) = MetricLayout::metric_key_of_prefix(&name) {
                        keys.insert(key);
                    }
                }
            }
        }

        for key in keys {
            match Metric::open(&key, Arc::clone(&self.repo), self.config.metric.clone()) {
                Ok(metric) => {
                    self.metrics.write().insert(key.clone(), Arc::new(metric));
                    info!("Loaded metric: {}", key);
                }
                Err(e) => {
                    warn!("Failed to load metric {}: {}", key, e);
                }
            }
        }

        Ok(())
    }
}

/// Store statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreStats {
    pub metric_count: usize,
    pub buffered_samples: usize,
    pub tables: usize,
    pub table_samples: u64,
    pub metrics: Vec<MetricStats>,
}
