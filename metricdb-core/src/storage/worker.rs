//! Background flush and compaction worker

use super::Metric;
use crate::{MetricError, Result};
use crossbeam_channel::{unbounded, RecvTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info};

pub(super) type Registry = Arc<RwLock<HashMap<String, Arc<Metric>>>>;

/// Work handed to the background thread
pub(super) enum Job {
    /// Flush the frozen buffers of a metric, then compact if due
    Flush(Arc<Metric>),
    /// Compact a metric if due
    Compact(Arc<Metric>),
    /// Stop the worker
    Shutdown,
}

/// Handle to the background thread
pub(super) struct Worker {
    sender: Sender<Job>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    /// Spawn the worker thread
    pub(super) fn spawn(metrics: Registry, tick: Duration) -> Result<Self> {
        let (sender, receiver) = unbounded::<Job>();

        let handle = std::thread::Builder::new()
            .name("metricdb-worker".into())
            .spawn(move || {
                info!("Background worker started");
                loop {
                    match receiver.recv_timeout(tick) {
                        Ok(Job::Flush(metric)) => flush(&metric),
                        Ok(Job::Compact(metric)) => compact(&metric),
                        Ok(Job::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
                        Err(RecvTimeoutError::Timeout) => {
                            let open: Vec<Arc<Metric>> = metrics.read().values().cloned().collect();
                            for metric in open {
                                on_tick(&metric);
                            }
                        }
                    }
                }
                info!("Background worker stopped");
            })?;

        Ok(Self {
            sender,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Queue a job
    pub(super) fn schedule(&self, job: Job) -> Result<()> {
        self.sender
            .send(job)
            .map_err(|_| MetricError::Internal("background worker has stopped".into()))
    }

    /// Stop the thread and wait for it
    pub(super) fn shutdown(&self) {
        let Some(handle) = self.handle.lock().take() else {
            return;
        };
        let _ = self.sender.send(Job::Shutdown);
        if handle.join().is_err() {
            error!("Background worker panicked");
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn flush(metric: &Metric) {
    match metric.background_flush() {
        Ok(0) => {}
        Ok(n) => debug!(metric = metric.key(), tables = n, "Background flush complete"),
        Err(e) => error!(
            "Background flush of {} failed, refusing writes until flushed: {}",
            metric.key(),
            e
        ),
    }
    compact(metric);
}

fn compact(metric: &Metric) {
    if let Err(e) = metric.maybe_compact() {
        error!("Background compaction of {} failed: {}", metric.key(), e);
    }
}

fn on_tick(metric: &Metric) {
    if let Err(e) = metric.freeze_if_due() {
        error!("Freezing buffer of {} failed: {}", metric.key(), e);
    }
    if metric.has_pending_flush() {
        flush(metric);
    } else if metric.needs_compaction() {
        compact(metric);
    }
}
