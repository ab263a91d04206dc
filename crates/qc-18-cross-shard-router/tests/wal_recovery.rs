//! # WAL Recovery
//!
//! Crash/replay and corruption handling of the per-route write-ahead log.
//!
//! ## Test Categories
//!
//! 1. Kill and replay: exactly the uncommitted batches come back, in order
//! 2. Corruption: a damaged record quarantines itself and everything after
//! 3. Router recovery: replayed batches are redelivered after restart
//! 4. Re-homing: messages moved off a departed shard survive another crash

use std::fs;
use std::sync::Arc;

use qc_18_cross_shard_router::wal::record::HEADER_LEN;
use qc_18_cross_shard_router::{
    Batch, BatchProcessor, InMemoryDeadLetterSink, Message, MockTransport, Priority,
    RouterConfig, ShardRouter, WalSyncMode, WriteAheadLog,
};

// =============================================================================
// TEST HELPERS
// =============================================================================

fn make_batch(seq: u64, size: usize) -> Batch {
    let messages = (0..size)
        .map(|i| {
            Message::new(
                1,
                format!("key-{}", seq).into_bytes(),
                Priority::Normal,
                format!("batch-{}-msg-{}", seq, i).into_bytes(),
            )
        })
        .collect();
    Batch::seal(seq, 0, messages)
}

fn seqs<'a>(batches: impl Iterator<Item = &'a Batch>) -> Vec<u64> {
    batches.map(Batch::seq).collect()
}

// =============================================================================
// KILL AND REPLAY
// =============================================================================

#[test]
fn test_replay_returns_exactly_uncommitted_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let written: Vec<Batch> = (0..10).map(|seq| make_batch(seq, 3)).collect();

    {
        let wal = WriteAheadLog::open(dir.path(), 0, WalSyncMode::PerBatch).unwrap();
        for batch in &written {
            wal.append(batch).unwrap();
        }
        for seq in [0, 1, 2, 5] {
            assert!(wal.mark_committed(seq).unwrap());
        }
        // Dropped without shutdown: simulated kill
    }

    let wal = WriteAheadLog::open(dir.path(), 0, WalSyncMode::PerBatch).unwrap();
    let replay = wal.replay().unwrap();
    assert!(replay.quarantine.is_none());
    assert_eq!(seqs(replay.uncommitted()), vec![3, 4, 6, 7, 8, 9]);

    for batch in replay.uncommitted() {
        assert_eq!(batch, &written[batch.seq() as usize]);
    }
    assert_eq!(wal.next_seq(), 10);
    assert_eq!(wal.pending_count(), 6);
}

#[test]
fn test_group_commit_sync_then_kill() {
    let dir = tempfile::tempdir().unwrap();
    let mode = WalSyncMode::Group { interval_ms: 5 };
    {
        let wal = WriteAheadLog::open(dir.path(), 7, mode).unwrap();
        for seq in 0..4 {
            wal.append(&make_batch(seq, 1)).unwrap();
        }
        wal.mark_committed(0).unwrap();
        wal.sync().unwrap();
    }

    let wal = WriteAheadLog::open(dir.path(), 7, mode).unwrap();
    assert_eq!(seqs(wal.replay().unwrap().uncommitted()), vec![1, 2, 3]);
}

#[test]
fn test_committed_everything_leaves_nothing_to_replay() {
    let dir = tempfile::tempdir().unwrap();
    {
        let wal = WriteAheadLog::open(dir.path(), 0, WalSyncMode::PerBatch).unwrap();
        for seq in 0..5 {
            wal.append(&make_batch(seq, 2)).unwrap();
            wal.mark_committed(seq).unwrap();
        }
    }
    let wal = WriteAheadLog::open(dir.path(), 0, WalSyncMode::PerBatch).unwrap();
    assert_eq!(wal.replay().unwrap().uncommitted().count(), 0);
    assert_eq!(wal.next_seq(), 5);
}

// =============================================================================
// CORRUPTION
// =============================================================================

#[test]
fn test_corrupt_record_quarantines_it_and_the_tail() {
    let dir = tempfile::tempdir().unwrap();
    let mut offsets = Vec::new();
    {
        let wal = WriteAheadLog::open(dir.path(), 0, WalSyncMode::PerBatch).unwrap();
        for seq in 0..6 {
            offsets.push(wal.append(&make_batch(seq, 2)).unwrap());
        }
    }

    let path = dir.path().join(WriteAheadLog::file_name(0));
    let mut bytes = fs::read(&path).unwrap();
    let original_len = bytes.len() as u64;
    let k = 3;
    bytes[offsets[k] as usize + HEADER_LEN + 2] ^= 0xFF;
    fs::write(&path, &bytes).unwrap();

    let wal = WriteAheadLog::open(dir.path(), 0, WalSyncMode::PerBatch).unwrap();
    let replay = wal.replay().unwrap();

    assert_eq!(seqs(replay.uncommitted()), vec![0, 1, 2]);
    let report = replay.quarantine.expect("tail must be quarantined");
    assert_eq!(report.offset, offsets[k]);
    assert_eq!(report.bytes, original_len - offsets[k]);
    assert!(report.reason.contains("checksum"));

    let side = fs::read(&report.path).unwrap();
    assert_eq!(side, bytes[offsets[k] as usize..].to_vec());
    assert_eq!(fs::metadata(&path).unwrap().len(), offsets[k]);

    // The log keeps accepting batches after the truncation point
    assert_eq!(wal.next_seq(), 3);
    wal.append(&make_batch(3, 1)).unwrap();
}

#[test]
fn test_torn_tail_is_quarantined() {
    let dir = tempfile::tempdir().unwrap();
    let mut offsets = Vec::new();
    {
        let wal = WriteAheadLog::open(dir.path(), 2, WalSyncMode::PerBatch).unwrap();
        for seq in 0..3 {
            offsets.push(wal.append(&make_batch(seq, 2)).unwrap());
        }
    }

    let path = dir.path().join(WriteAheadLog::file_name(2));
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 3]).unwrap();

    let wal = WriteAheadLog::open(dir.path(), 2, WalSyncMode::PerBatch).unwrap();
    let replay = wal.replay().unwrap();
    assert_eq!(seqs(replay.uncommitted()), vec![0, 1]);

    let report = replay.quarantine.unwrap();
    assert_eq!(report.offset, offsets[2]);
    assert!(report.path.exists());
}

#[test]
fn test_quarantine_reported_once() {
    let dir = tempfile::tempdir().unwrap();
    {
        let wal = WriteAheadLog::open(dir.path(), 0, WalSyncMode::PerBatch).unwrap();
        wal.append(&make_batch(0, 1)).unwrap();
    }
    let path = dir.path().join(WriteAheadLog::file_name(0));
    let mut bytes = fs::read(&path).unwrap();
    bytes.extend_from_slice(&[0xAB; 7]);
    fs::write(&path, &bytes).unwrap();

    let wal = WriteAheadLog::open(dir.path(), 0, WalSyncMode::PerBatch).unwrap();
    assert!(wal.replay().unwrap().quarantine.is_some());
    assert!(wal.replay().unwrap().quarantine.is_none());
}

// =============================================================================
// ROUTER RECOVERY
// =============================================================================

#[tokio::test]
async fn test_sealed_but_undelivered_batch_is_redelivered_after_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = RouterConfig::for_testing(dir.path());

    let sealed_seq = {
        let router = Arc::new(ShardRouter::new(config.clone(), &[0]).unwrap());
        let processor = BatchProcessor::new(
            router.clone(),
            Arc::new(MockTransport::new()),
            Arc::new(InMemoryDeadLetterSink::new()),
        );
        for i in 0..4u32 {
            let m = Message::new(0, b"acct".to_vec(), Priority::High, i.to_le_bytes().to_vec());
            assert!(router.admit(m).await.is_accepted());
        }
        let route = router.route_for(0).unwrap();
        let inflight = processor.next_batch(&route).await.unwrap().unwrap();
        // Crash between WAL append and transport acknowledgement
        inflight.batch().seq()
    };

    let router = Arc::new(ShardRouter::new(config.clone(), &[0]).unwrap());
    let report = router.recover().await.unwrap();
    assert_eq!(report.batches, 1);
    assert_eq!(report.messages, 4);

    let transport = Arc::new(MockTransport::new());
    let processor = Arc::new(BatchProcessor::new(
        router.clone(),
        transport.clone(),
        Arc::new(InMemoryDeadLetterSink::new()),
    ));

    // Replayed payloads are already known to dedup
    let again = Message::new(0, b"acct".to_vec(), Priority::High, 0u32.to_le_bytes().to_vec());
    assert!(!router.admit(again).await.is_accepted());

    processor.shutdown().await.unwrap();
    let delivered = transport.delivered();
    assert_eq!(delivered.len(), 1);
    assert_eq!(delivered[0].seq, sealed_seq);
    assert_eq!(delivered[0].size, 4);

    // Third start has nothing left to replay
    drop(processor);
    drop(router);
    let router = ShardRouter::new(config, &[0]).unwrap();
    assert_eq!(router.recover().await.unwrap().batches, 0);
}

// =============================================================================
// RE-HOMING
// =============================================================================

#[tokio::test]
async fn test_rehomed_batches_survive_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = RouterConfig::for_testing(dir.path());
    {
        let router = ShardRouter::new(config.clone(), &[7]).unwrap();
        let route = router.route_for(7).unwrap();
        route
            .seal(vec![
                Message::new(0, b"acct".to_vec(), Priority::Normal, b"one".to_vec()),
                Message::new(0, b"other".to_vec(), Priority::Normal, b"two".to_vec()),
            ])
            .unwrap();
    }

    // Shard 7 is gone; its batch moves to 0/1, then the node dies again
    {
        let router = ShardRouter::new(config.clone(), &[0, 1]).unwrap();
        let report = router.recover().await.unwrap();
        assert_eq!(report.rehomed_messages, 2);
    }

    let router = Arc::new(ShardRouter::new(config.clone(), &[0, 1]).unwrap());
    let report = router.recover().await.unwrap();
    assert!(report.batches > 0);
    assert_eq!(report.messages, 2);
    assert_eq!(report.rehomed_messages, 0);

    let transport = Arc::new(MockTransport::new());
    let processor = BatchProcessor::new(
        router.clone(),
        transport.clone(),
        Arc::new(InMemoryDeadLetterSink::new()),
    );
    processor.shutdown().await.unwrap();
    assert_eq!(transport.delivered_messages(), 2);

    drop(processor);
    drop(router);
    let router = ShardRouter::new(config, &[0, 1]).unwrap();
    assert_eq!(router.recover().await.unwrap().batches, 0);
}

#[tokio::test]
async fn test_removed_shard_backlog_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = RouterConfig::for_testing(dir.path());

    let (victim, stranded) = {
        let router = ShardRouter::new(config.clone(), &[0, 1, 2]).unwrap();
        for n in 0..30u32 {
            let key = format!("acct-{}", n).into_bytes();
            let m = Message::new(0, key, Priority::Normal, n.to_le_bytes().to_vec());
            assert!(router.admit(m).await.is_accepted());
        }
        let victim = router.route(b"acct-0").unwrap().shard;
        let stranded = router.route_for(victim).unwrap().depth();
        router.remove_shard(victim).await.unwrap();
        // Killed before the moved messages were delivered
        (victim, stranded)
    };
    assert!(stranded > 0);

    let survivors: Vec<u16> = [0, 1, 2].into_iter().filter(|s| *s != victim).collect();
    let router = ShardRouter::new(config, &survivors).unwrap();
    let report = router.recover().await.unwrap();
    assert_eq!(report.messages, stranded);
}
