//! Behaviour every ledger backend must share.

use futures_util::future::join_all;
use log::LevelFilter;
use paraledger::{
    ConnectionRecord, ErrorDescription, FailureKind, Ledger, LedgerError, MemoryLedger,
    ProgressBuffer, ProgressThrottleConfig, SqliteLedger, TaskRecord, TaskStatus,
    TransitionController, ranges, restart_task,
};
use std::sync::Arc;

fn init_logger() {
    let _ = env_logger::Builder::from_default_env()
        .is_test(true)
        .filter_module("sqlx::query", LevelFilter::Info)
        .try_init();
}

fn task(id: u32) -> TaskRecord {
    TaskRecord::with_id(id, format!("https://x/{id}.bin"), format!("/tmp/{id}.bin"))
}

async fn connected(ledger: &dyn Ledger, id: u32, total: u64) -> TaskRecord {
    let mut t = task(id);
    ledger.insert(&t).await.unwrap();
    ledger
        .update_connected(&mut t, Some(total), Some("v1"), Some("file.bin"))
        .await
        .unwrap();
    t
}

async fn completion_removes_record(ledger: Arc<dyn Ledger>) {
    for id in [1, 2] {
        let mut t = connected(ledger.as_ref(), id, 1000).await;
        if id == 2 {
            ledger.split_connections(&mut t, 4).await.unwrap();
        }
        ledger.update_complete(&mut t, 1000).await.unwrap();

        assert_eq!(ledger.find(id).await.unwrap(), None);
        assert!(ledger.find_connections(id).await.unwrap().is_empty());
    }
}

async fn progress_is_monotonic(ledger: Arc<dyn Ledger>) {
    let mut t = connected(ledger.as_ref(), 3, 10_000).await;
    for so_far in [0, 10, 10, 512, 4096, 10_000] {
        t.so_far = so_far;
        ledger.sync_progress_from_cache(&t).await.unwrap();
        let stored = ledger.find(3).await.unwrap().unwrap();
        assert_eq!(stored.so_far, so_far);
        assert_eq!(stored.status, TaskStatus::Connected);
    }
}

async fn ranges_partition_total(ledger: Arc<dyn Ledger>) {
    for (id, total, count) in [(4, 1000, 2), (5, 1001, 3), (6, 7, 7), (7, 1 << 20, 5)] {
        let mut t = connected(ledger.as_ref(), id, total).await;
        ledger.split_connections(&mut t, count).await.unwrap();

        let stored = ledger.find_connections(id).await.unwrap();
        assert_eq!(stored.len(), count as usize);
        ranges::check_partition(&stored, Some(total)).unwrap();

        let covered: u64 = stored
            .iter()
            .map(|c| c.end_offset.unwrap() - c.start_offset)
            .sum();
        assert_eq!(covered, total);
        for pair in stored.windows(2) {
            assert_eq!(pair[0].end_offset, Some(pair[1].start_offset));
        }
    }
}

async fn stale_etag_resets_ranges(ledger: Arc<dyn Ledger>) {
    let mut t = connected(ledger.as_ref(), 8, 1000).await;
    ledger.split_connections(&mut t, 2).await.unwrap();
    ledger.update_connection(8, 0, 300).await.unwrap();

    ledger.update_old_etag_overdue(&mut t, "v2").await.unwrap();
    ledger.remove_connections(8).await.unwrap();

    assert!(ledger.find_connections(8).await.unwrap().is_empty());
    let stored = ledger.find(8).await.unwrap().unwrap();
    assert_eq!(stored.etag.as_deref(), Some("v2"));
    assert_eq!(stored.so_far, 0);
    assert_eq!(stored.connection_count, 1);
    assert_eq!(stored, t);
}

async fn removal_is_idempotent(ledger: Arc<dyn Ledger>) {
    ledger.insert(&task(9)).await.unwrap();
    assert!(ledger.remove(9).await.unwrap());
    assert!(!ledger.remove(9).await.unwrap());

    assert!(!ledger.remove(10).await.unwrap());
    assert!(!ledger.remove(10).await.unwrap());
}

async fn batch_matches_sequential(ledger: Arc<dyn Ledger>) {
    let mut a = task(11);
    let mut b = task(12);
    ledger.insert(&a).await.unwrap();
    ledger.insert(&b).await.unwrap();

    a.so_far = 100;
    a.status = TaskStatus::Progress;
    b.total = Some(50);
    b.so_far = 50;
    b.etag = Some("b".into());
    // the later record of the same id wins, as with sequential updates
    let mut a_later = a.clone();
    a_later.so_far = 150;

    assert_eq!(
        ledger
            .update_batch(&[a.clone(), b.clone(), a_later.clone()])
            .await
            .unwrap(),
        3
    );
    let batched = (ledger.find(11).await.unwrap(), ledger.find(12).await.unwrap());

    ledger.insert(&task(11)).await.unwrap();
    ledger.insert(&task(12)).await.unwrap();
    ledger.update(&a).await.unwrap();
    ledger.update(&b).await.unwrap();
    ledger.update(&a_later).await.unwrap();
    let sequential = (ledger.find(11).await.unwrap(), ledger.find(12).await.unwrap());

    assert_eq!(batched, sequential);
    assert_eq!(batched.0.unwrap().so_far, 150);
}

async fn invalid_batch_writes_nothing(ledger: Arc<dyn Ledger>) {
    let mut good = task(13);
    ledger.insert(&good).await.unwrap();
    good.so_far = 10;

    let mut bad = task(14);
    bad.total = Some(5);
    bad.so_far = 6;

    assert!(matches!(
        ledger.update_batch(&[good, bad]).await,
        Err(LedgerError::Consistency(_))
    ));
    assert_eq!(ledger.find(13).await.unwrap().unwrap().so_far, 0);
}

async fn example_scenario(ledger: Arc<dyn Ledger>) {
    let mut model = task(7_000);
    ledger.insert(&model).await.unwrap();

    ledger
        .update_connected(&mut model, Some(1000), Some("v1"), Some("file.bin"))
        .await
        .unwrap();
    let stored = ledger.find(7_000).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Connected);
    assert_eq!(stored.total, Some(1000));
    assert_eq!(stored.etag.as_deref(), Some("v1"));

    ledger
        .insert_connection(&ConnectionRecord::new(7_000, 0, 0, Some(500)))
        .await
        .unwrap();
    ledger
        .insert_connection(&ConnectionRecord::new(7_000, 1, 500, Some(1000)))
        .await
        .unwrap();
    ledger.update_connection_count(&mut model, 2).await.unwrap();

    ledger.update_connection(7_000, 0, 250).await.unwrap();
    ledger.update_connection(7_000, 1, 800).await.unwrap();

    let resumed = ledger.find(7_000).await.unwrap().unwrap();
    assert_eq!(resumed.total, Some(1000));
    assert_eq!(resumed.connection_count, 2);
    let offsets: Vec<u64> = ledger
        .find_connections(7_000)
        .await
        .unwrap()
        .iter()
        .map(|c| c.current_offset)
        .collect();
    assert_eq!(offsets, vec![250, 800]);

    ledger.update_complete(&mut model, 1000).await.unwrap();
    assert_eq!(ledger.find(7_000).await.unwrap(), None);
    assert!(ledger.find_connections(7_000).await.unwrap().is_empty());
}

async fn range_offsets_are_enforced(ledger: Arc<dyn Ledger>) {
    let mut t = connected(ledger.as_ref(), 15, 1000).await;
    ledger.split_connections(&mut t, 2).await.unwrap();

    assert!(matches!(
        ledger.update_connection(15, 1, 400).await,
        Err(LedgerError::Consistency(_))
    ));
    assert!(matches!(
        ledger.update_connection(15, 1, 1001).await,
        Err(LedgerError::Consistency(_))
    ));
    assert_eq!(
        ledger.update_connection(15, 2, 10).await,
        Err(LedgerError::MissingConnection {
            task_id: 15,
            index: 2
        })
    );
    assert!(matches!(
        ledger
            .insert_connection(&ConnectionRecord {
                task_id: 15,
                index: 3,
                start_offset: 10,
                current_offset: 5,
                end_offset: Some(20),
            })
            .await,
        Err(LedgerError::Consistency(_))
    ));
}

async fn error_paths_preserve_progress(ledger: Arc<dyn Ledger>) {
    let mut t = connected(ledger.as_ref(), 16, 1000).await;
    ledger.split_connections(&mut t, 2).await.unwrap();
    ledger.update_connection(16, 0, 200).await.unwrap();

    let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset by peer");
    let failure = ErrorDescription::from(&io).with_cause("range 0 at byte 200");
    ledger.update_error(&mut t, &failure, 200).await.unwrap();
    ledger.update_retry(&mut t, &failure).await.unwrap();
    ledger.update_pause(&mut t, 200).await.unwrap();

    let stored = ledger.find(16).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Paused);
    assert_eq!(stored.so_far, 200);
    assert_eq!(
        stored.error_message.as_deref(),
        Some("Network: reset by peer (caused by: range 0 at byte 200)")
    );
    assert_eq!(ledger.find_connections(16).await.unwrap().len(), 2);
    assert_eq!(failure.kind, FailureKind::Network);
}

fn buffer() -> ProgressBuffer {
    ProgressBuffer::new(ProgressThrottleConfig {
        interval_ms: 60_000,
        threshold_bytes: u64::MAX,
    })
}

async fn late_flush_after_etag_reset_is_dropped(ledger: Arc<dyn Ledger>) {
    let mut t = connected(ledger.as_ref(), 20, 1000).await;
    ledger.split_connections(&mut t, 2).await.unwrap();

    let buffer = buffer();
    t.so_far = 800;
    buffer.record(&t);
    restart_task(ledger.as_ref(), &mut t, "v2").await.unwrap();

    assert_eq!(buffer.flush(ledger.as_ref()).await.unwrap(), 0);
    let stored = ledger.find(20).await.unwrap().unwrap();
    assert_eq!(stored.etag.as_deref(), Some("v2"));
    assert_eq!(stored.so_far, 0);
    assert_eq!(stored.total, None);
    assert_eq!(stored.connection_count, 1);
    assert!(ledger.find_connections(20).await.unwrap().is_empty());
}

async fn late_flush_after_pause_is_dropped(ledger: Arc<dyn Ledger>) {
    let mut t = connected(ledger.as_ref(), 21, 1000).await;
    let buffer = buffer();
    t.so_far = 100;
    buffer.record(&t);
    ledger.update_pause(&mut t, 300).await.unwrap();

    assert_eq!(buffer.flush(ledger.as_ref()).await.unwrap(), 0);
    let stored = ledger.find(21).await.unwrap().unwrap();
    assert_eq!(stored.status, TaskStatus::Paused);
    assert_eq!(stored.so_far, 300);

    // progress measured against the current version still lands
    t.so_far = 450;
    buffer.record(&t);
    assert_eq!(buffer.flush(ledger.as_ref()).await.unwrap(), 1);
    let stored = ledger.find(21).await.unwrap().unwrap();
    assert_eq!(stored.so_far, 450);
    assert_eq!(stored.status, TaskStatus::Paused);
}

async fn failed_split_stores_nothing(ledger: Arc<dyn Ledger>) {
    let mut t = connected(ledger.as_ref(), 22, 1000).await;

    // gap between the second and third range
    let broken = vec![
        ConnectionRecord::new(22, 0, 0, Some(400)),
        ConnectionRecord::new(22, 1, 400, Some(700)),
        ConnectionRecord::new(22, 2, 750, Some(1000)),
    ];
    assert!(matches!(
        ledger.insert_connections(22, &broken).await,
        Err(LedgerError::Consistency(_))
    ));
    assert!(ledger.find_connections(22).await.unwrap().is_empty());
    assert_eq!(ledger.find(22).await.unwrap().unwrap().connection_count, 1);

    // a stray range blocks the split as a whole
    ledger
        .insert_connection(&ConnectionRecord::new(22, 0, 0, Some(500)))
        .await
        .unwrap();
    assert!(matches!(
        ledger.split_connections(&mut t, 3).await,
        Err(LedgerError::Consistency(_))
    ));
    assert_eq!(ledger.find_connections(22).await.unwrap().len(), 1);
    assert_eq!(ledger.find(22).await.unwrap().unwrap().connection_count, 1);
    assert_eq!(t.connection_count, 1);

    assert!(matches!(
        ledger
            .insert_connections(404, &ranges::split_ranges(404, 100, 2).unwrap())
            .await,
        Err(LedgerError::MissingTask(404))
    ));
}

async fn clear_wipes_everything(ledger: Arc<dyn Ledger>) {
    let mut t = connected(ledger.as_ref(), 17, 100).await;
    ledger.split_connections(&mut t, 2).await.unwrap();
    ledger.insert(&task(18)).await.unwrap();

    ledger.clear().await.unwrap();
    assert!(ledger.find_all().await.unwrap().is_empty());
    assert!(ledger.find_connections(17).await.unwrap().is_empty());
}

async fn independent_tasks_progress_concurrently(ledger: Arc<dyn Ledger>) {
    let ids: Vec<u32> = (100..116).collect();
    for id in &ids {
        let mut t = connected(ledger.as_ref(), *id, 64_000).await;
        ledger.split_connections(&mut t, 4).await.unwrap();
    }

    let workers = ids.iter().map(|id| {
        let ledger = Arc::clone(&ledger);
        let id = *id;
        tokio::spawn(async move {
            for step in 1..=10u64 {
                for index in 0..4u32 {
                    let offset = index as u64 * 16_000 + step * 1_000;
                    ledger.update_connection(id, index, offset).await.unwrap();
                }
            }
        })
    });
    for joined in join_all(workers).await {
        joined.unwrap();
    }

    for id in ids {
        let connections = ledger.find_connections(id).await.unwrap();
        assert_eq!(ranges::downloaded(&connections), 4 * 10_000);
    }
}

macro_rules! contract {
    ($backend:ident, $make:expr) => {
        mod $backend {
            use super::*;

            async fn ledger() -> Arc<dyn Ledger> {
                init_logger();
                $make
            }

            #[tokio::test]
            async fn completion_removes_record_test() {
                completion_removes_record(ledger().await).await;
            }

            #[tokio::test]
            async fn progress_is_monotonic_test() {
                progress_is_monotonic(ledger().await).await;
            }

            #[tokio::test]
            async fn ranges_partition_total_test() {
                ranges_partition_total(ledger().await).await;
            }

            #[tokio::test]
            async fn stale_etag_resets_ranges_test() {
                stale_etag_resets_ranges(ledger().await).await;
            }

            #[tokio::test]
            async fn removal_is_idempotent_test() {
                removal_is_idempotent(ledger().await).await;
            }

            #[tokio::test]
            async fn batch_matches_sequential_test() {
                batch_matches_sequential(ledger().await).await;
            }

            #[tokio::test]
            async fn invalid_batch_writes_nothing_test() {
                invalid_batch_writes_nothing(ledger().await).await;
            }

            #[tokio::test]
            async fn example_scenario_test() {
                example_scenario(ledger().await).await;
            }

            #[tokio::test]
            async fn range_offsets_are_enforced_test() {
                range_offsets_are_enforced(ledger().await).await;
            }

            #[tokio::test]
            async fn error_paths_preserve_progress_test() {
                error_paths_preserve_progress(ledger().await).await;
            }

            #[tokio::test]
            async fn late_flush_after_etag_reset_is_dropped_test() {
                late_flush_after_etag_reset_is_dropped(ledger().await).await;
            }

            #[tokio::test]
            async fn late_flush_after_pause_is_dropped_test() {
                late_flush_after_pause_is_dropped(ledger().await).await;
            }

            #[tokio::test]
            async fn failed_split_stores_nothing_test() {
                failed_split_stores_nothing(ledger().await).await;
            }

            #[tokio::test]
            async fn clear_wipes_everything_test() {
                clear_wipes_everything(ledger().await).await;
            }

            #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
            async fn independent_tasks_progress_concurrently_test() {
                independent_tasks_progress_concurrently(ledger().await).await;
            }
        }
    };
}

contract!(memory, Arc::new(MemoryLedger::new()));
contract!(sqlite, Arc::new(SqliteLedger::in_memory().await.unwrap()));
