//! End-to-end tests over the public store API

use metricdb_core::memtable::MemTableConfig;
use metricdb_core::repository::{FaultOp, FileRepository, MemoryFileRepository, MetricLayout};
use metricdb_core::storage::{Metric, MetricConfig, MetricStore, StoreConfig};
use metricdb_core::wal::{SyncPolicy, WalConfig};
use metricdb_core::{MetricError, Sample};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

fn metric_config(max_samples: usize) -> MetricConfig {
    MetricConfig {
        memtable: MemTableConfig {
            max_samples,
            ..Default::default()
        },
        ..Default::default()
    }
}

fn inline_store(repo: &MemoryFileRepository, max_samples: usize) -> MetricStore {
    let config = StoreConfig {
        metric: metric_config(max_samples),
        background_worker: false,
        ..Default::default()
    };
    MetricStore::open(Arc::new(repo.clone()), config).unwrap()
}

fn tables_of(repo: &MemoryFileRepository, key: &str) -> Vec<String> {
    let prefix = format!("{}.", MetricLayout::new(key).unwrap().prefix());
    repo.list()
        .unwrap()
        .into_iter()
        .filter(|id| id.starts_with(&prefix) && id.ends_with(".sst"))
        .collect()
}

#[test]
fn test_query_returns_samples_in_timestamp_order() {
    let repo = MemoryFileRepository::new();
    let store = inline_store(&repo, 1024);

    store.add_sample("temp", 100, 3.14).unwrap();
    store.add_sample("temp", 200, 2.71).unwrap();
    store.add_sample("temp", 50, 1.41).unwrap();

    assert_eq!(
        store.query("temp", 0, 1000).unwrap(),
        vec![
            Sample::new(50, 1.41),
            Sample::new(100, 3.14),
            Sample::new(200, 2.71)
        ]
    );
    assert_eq!(store.query("temp", 60, 150).unwrap(), vec![Sample::new(100, 3.14)]);
    // Both bounds are inclusive
    assert_eq!(
        store.query("temp", 100, 200).unwrap(),
        vec![Sample::new(100, 3.14), Sample::new(200, 2.71)]
    );
    assert!(store.query("temp", 300, 200).unwrap().is_empty());
}

#[test]
fn test_shuffled_writes_survive_flush_and_compaction() {
    let repo = MemoryFileRepository::new();
    let store = inline_store(&repo, 64);

    let mut samples: Vec<Sample> = (0..1000u64).map(|i| Sample::new(i * 10, i as f64)).collect();
    let mut shuffled = samples.clone();
    shuffled.shuffle(&mut rand::rngs::StdRng::seed_from_u64(7));

    for sample in &shuffled {
        store.add_sample("cpu", sample.timestamp, sample.value).unwrap();
    }

    let stats = store.stats();
    assert!(stats.tables > 0);
    assert_eq!(stats.table_samples as usize + stats.buffered_samples, 1000);
    assert_eq!(store.query("cpu", 0, u64::MAX).unwrap(), samples);

    store.compact("cpu").unwrap();
    store.flush("cpu").unwrap();
    assert_eq!(store.query("cpu", 0, u64::MAX).unwrap(), samples);

    samples.retain(|s| (2500..=5000).contains(&s.timestamp));
    assert_eq!(store.query("cpu", 2500, 5000).unwrap(), samples);
}

#[test]
fn test_last_write_wins_across_tables() {
    let repo = MemoryFileRepository::new();
    let store = inline_store(&repo, 1024);

    store.add_sample("temp", 10, 1.0).unwrap();
    store.add_sample("temp", 20, 1.5).unwrap();
    store.flush("temp").unwrap();

    // Buffered overwrite shadows the table
    store.add_sample("temp", 10, 2.0).unwrap();
    assert_eq!(
        store.query("temp", 0, 100).unwrap(),
        vec![Sample::new(10, 2.0), Sample::new(20, 1.5)]
    );

    // Newer table shadows the older one
    store.flush("temp").unwrap();
    assert_eq!(
        store.query("temp", 0, 100).unwrap(),
        vec![Sample::new(10, 2.0), Sample::new(20, 1.5)]
    );

    let report = store.compact("temp").unwrap().unwrap();
    assert_eq!(report.inputs, 2);
    assert_eq!(report.outputs, 1);
    assert_eq!(report.duplicates_resolved, 1);
    assert_eq!(
        store.query("temp", 0, 100).unwrap(),
        vec![Sample::new(10, 2.0), Sample::new(20, 1.5)]
    );
    assert_eq!(tables_of(&repo, "temp").len(), 1);
}

#[test]
fn test_compaction_is_invisible_to_queries() {
    let repo = MemoryFileRepository::new();
    let store = inline_store(&repo, 1024);

    for round in 0..3u64 {
        let batch: Vec<Sample> = (0..50u64)
            .map(|i| Sample::new(i * 3 + round, (round * 100 + i) as f64))
            .collect();
        store.add_samples("load", &batch).unwrap();
        store.flush("load").unwrap();
    }
    let before = store.query("load", 0, u64::MAX).unwrap();
    assert_eq!(store.stats().metrics[0].level0_tables, 3);

    store.compact("load").unwrap().unwrap();

    assert_eq!(store.query("load", 0, u64::MAX).unwrap(), before);
    assert_eq!(store.query("load", 40, 80).unwrap(), {
        let mut expected = before.clone();
        expected.retain(|s| (40..=80).contains(&s.timestamp));
        expected
    });
    assert_eq!(store.stats().metrics[0].level0_tables, 0);
    assert!(store.compact("load").unwrap().is_none());
}

#[test]
fn test_invalid_samples_rejected() {
    let repo = MemoryFileRepository::new();
    let store = inline_store(&repo, 1024);

    assert!(matches!(
        store.add_sample("temp", 1, f64::NAN),
        Err(MetricError::InvalidSample(_))
    ));
    assert!(matches!(
        store.add_sample("temp", 1, f64::INFINITY),
        Err(MetricError::InvalidSample(_))
    ));

    let batch = [Sample::new(1, 1.0), Sample::new(2, f64::NEG_INFINITY)];
    assert!(store.add_samples("temp", &batch).is_err());
    assert!(store.query("temp", 0, 10).unwrap().is_empty());

    assert!(matches!(
        store.add_sample("", 1, 1.0),
        Err(MetricError::InvalidKey(_))
    ));
}

#[test]
fn test_crash_between_table_and_manifest() {
    let repo = MemoryFileRepository::new();
    let wal_dir = TempDir::new().unwrap();
    let config = MetricConfig {
        wal: Some(WalConfig {
            dir: wal_dir.path().to_path_buf(),
            sync_policy: SyncPolicy::Immediate,
        }),
        ..metric_config(1024)
    };
    let samples: Vec<Sample> = (1..=20u64).map(|i| Sample::new(i, i as f64 / 2.0)).collect();

    {
        let metric = Metric::open("temp", Arc::new(repo.clone()), config.clone()).unwrap();
        metric.add_samples(&samples).unwrap();

        repo.fail_next(FaultOp::Commit, "manifest");
        let err = metric.flush().unwrap_err();
        assert!(matches!(err, MetricError::FlushFailed { .. }));

        // The buffer stays readable after the failed flush
        assert_eq!(metric.query(0, 100).unwrap(), samples);
        // The table reached storage but no manifest references it
        assert_eq!(tables_of(&repo, "temp").len(), 1);
        // Crash: drop without closing
    }

    let metric = Metric::open("temp", Arc::new(repo.clone()), config).unwrap();
    assert_eq!(metric.query(0, 100).unwrap(), samples);

    // The orphan is gone; the replayed buffer was flushed into a new table
    let tables = tables_of(&repo, "temp");
    assert_eq!(tables.len(), 1);
    assert_ne!(tables[0], MetricLayout::new("temp").unwrap().table_id(1));
    let stats = metric.stats();
    assert_eq!(stats.tables, 1);
    assert_eq!(stats.table_samples, 20);
    assert_eq!(stats.buffered_samples, 0);
}

#[test]
fn test_failed_flush_loses_nothing() {
    let repo = MemoryFileRepository::new();
    let metric = Metric::open("temp", Arc::new(repo.clone()), metric_config(1024)).unwrap();

    metric.add_sample(Sample::new(5, 5.0)).unwrap();
    repo.fail_next(FaultOp::Create, "temp.");
    assert!(metric.flush().is_err());
    assert!(tables_of(&repo, "temp").is_empty());

    // Writes are refused until a flush succeeds
    assert!(matches!(
        metric.add_sample(Sample::new(6, 6.0)),
        Err(MetricError::FlushFailed { .. })
    ));
    assert_eq!(metric.flush().unwrap(), 1);

    metric.add_sample(Sample::new(6, 6.0)).unwrap();
    assert_eq!(metric.flush().unwrap(), 1);
    assert_eq!(
        metric.query(0, 10).unwrap(),
        vec![Sample::new(5, 5.0), Sample::new(6, 6.0)]
    );
}

#[test]
fn test_concurrent_writers_and_readers() {
    let repo = MemoryFileRepository::new();
    let store = Arc::new(inline_store(&repo, 100));

    let writer = {
        let store = Arc::clone(&store);
        std::thread::spawn(move || {
            for i in 0..2000u64 {
                store.add_sample("net", i, i as f64).unwrap();
            }
        })
    };

    let readers: Vec<_> = (0..4)
        .map(|_| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                for _ in 0..50 {
                    let samples = store.query("net", 0, u64::MAX).unwrap();
                    assert!(samples.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
                    assert!(samples.iter().all(|s| s.value == s.timestamp as f64));
                }
            })
        })
        .collect();

    writer.join().unwrap();
    for reader in readers {
        reader.join().unwrap();
    }

    let expected: Vec<Sample> = (0..2000u64).map(|i| Sample::new(i, i as f64)).collect();
    assert_eq!(store.query("net", 0, u64::MAX).unwrap(), expected);
}

#[test]
fn test_cancelled_query() {
    let repo = MemoryFileRepository::new();
    let store = inline_store(&repo, 1024);
    store.add_sample("temp", 1, 1.0).unwrap();
    store.flush("temp").unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    assert!(matches!(
        store.query_with_cancel("temp", 0, 10, &cancel),
        Err(MetricError::Cancelled)
    ));
    assert_eq!(
        store
            .query_with_cancel("temp", 0, 10, &CancellationToken::new())
            .unwrap(),
        vec![Sample::new(1, 1.0)]
    );
}

#[test]
fn test_missing_table_reported() {
    let repo = MemoryFileRepository::new();
    let store = inline_store(&repo, 1024);
    store.add_sample("temp", 1, 1.0).unwrap();
    store.flush("temp").unwrap();

    for id in tables_of(&repo, "temp") {
        repo.delete(&id).unwrap();
    }
    assert!(matches!(
        store.query("temp", 0, 10),
        Err(MetricError::NotFound(_))
    ));
    // Ranges outside every table never open one
    assert!(store.query("temp", 5, 10).unwrap().is_empty());
}

#[test]
fn test_corrupt_table_reported() {
    let repo = MemoryFileRepository::new();
    let store = inline_store(&repo, 1024);
    store
        .add_samples("temp", &[Sample::new(1, 1.0), Sample::new(2, 2.0)])
        .unwrap();
    store.flush("temp").unwrap();

    let id = tables_of(&repo, "temp").remove(0);
    let mut data = repo.contents(&id).unwrap();
    // Flip a bit inside the first record's value
    data[24 + 8] ^= 0x01;
    repo.replace_contents(&id, data);

    assert!(matches!(
        store.query("temp", 0, 10),
        Err(MetricError::CorruptTable { .. })
    ));
}

fn overlapping_flushes(metric: &Metric, rounds: u64) {
    for round in 0..rounds {
        let batch: Vec<Sample> = (0..20u64)
            .map(|i| Sample::new(i * 2 + round, (round * 100 + i) as f64))
            .collect();
        metric.add_samples(&batch).unwrap();
        metric.flush().unwrap();
    }
}

#[test]
fn test_failed_compaction_keeps_tables() {
    let repo = MemoryFileRepository::new();
    let metric = Metric::open("temp", Arc::new(repo.clone()), metric_config(1024)).unwrap();
    overlapping_flushes(&metric, 3);

    let before = metric.query(0, u64::MAX).unwrap();
    let tables_before = tables_of(&repo, "temp");
    assert_eq!(tables_before.len(), 3);

    repo.fail_next(FaultOp::Commit, "manifest");
    let err = metric.compact().unwrap_err();
    assert!(matches!(err, MetricError::CompactionFailed { .. }));

    // Index, files and results are as they were; the new output is gone
    let stats = metric.stats();
    assert_eq!(stats.tables, 3);
    assert_eq!(stats.level0_tables, 3);
    assert_eq!(tables_of(&repo, "temp"), tables_before);
    assert_eq!(metric.query(0, u64::MAX).unwrap(), before);

    let report = metric.compact().unwrap().unwrap();
    assert_eq!(report.inputs, 3);
    assert_eq!(metric.query(0, u64::MAX).unwrap(), before);
}

#[test]
fn test_superseded_table_left_behind_by_compaction() {
    let repo = MemoryFileRepository::new();
    let metric = Metric::open("temp", Arc::new(repo.clone()), metric_config(1024)).unwrap();
    overlapping_flushes(&metric, 2);
    let before = metric.query(0, u64::MAX).unwrap();

    // Compaction commits, but releasing one input fails
    let inputs = tables_of(&repo, "temp");
    repo.fail_next(FaultOp::Delete, inputs[0].clone());
    metric.compact().unwrap().unwrap();

    assert_eq!(metric.stats().tables, 1);
    assert_eq!(tables_of(&repo, "temp").len(), 2);
    assert_eq!(metric.query(0, u64::MAX).unwrap(), before);
    drop(metric);

    let metric = Metric::open("temp", Arc::new(repo.clone()), metric_config(1024)).unwrap();
    let tables = tables_of(&repo, "temp");
    assert_eq!(tables.len(), 1);
    assert!(!tables.contains(&inputs[0]));
    assert_eq!(metric.query(0, u64::MAX).unwrap(), before);
}

#[test]
fn test_table_open_retried_once() {
    let repo = MemoryFileRepository::new();
    let store = inline_store(&repo, 1024);
    store.add_sample("temp", 1, 1.0).unwrap();
    store.flush("temp").unwrap();
    let id = tables_of(&repo, "temp").remove(0);

    repo.fail_next(FaultOp::Open, id.clone());
    assert_eq!(store.query("temp", 0, 10).unwrap(), vec![Sample::new(1, 1.0)]);

    repo.fail_next(FaultOp::Open, id.clone());
    repo.fail_next(FaultOp::Open, id);
    assert!(matches!(store.query("temp", 0, 10), Err(MetricError::Io(_))));
}

#[test]
fn test_background_flush_failure_reaches_writer() {
    let repo = MemoryFileRepository::new();
    let mut config = StoreConfig {
        tick_interval: Duration::from_millis(10),
        ..Default::default()
    };
    config.metric.memtable.max_samples = 10;
    let store = MetricStore::open(Arc::new(repo.clone()), config).unwrap();

    repo.fail_next(FaultOp::Commit, ".sst");
    let samples: Vec<Sample> = (0..10u64).map(|i| Sample::new(i, i as f64)).collect();
    store.add_samples("cpu", &samples).unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while store.stats().metrics[0].flush_error.is_none() && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(matches!(
        store.add_sample("cpu", 100, 1.0),
        Err(MetricError::FlushFailed { .. })
    ));
    assert_eq!(store.stats().metrics[0].frozen_buffers, 1);

    assert_eq!(store.flush("cpu").unwrap(), 1);
    store.add_sample("cpu", 100, 1.0).unwrap();
    let mut expected = samples;
    expected.push(Sample::new(100, 1.0));
    assert_eq!(store.query("cpu", 0, u64::MAX).unwrap(), expected);
}
