//! End-to-end store scenarios: snapshot windows, duplicate handling,
//! delete/reinsert cycles, reclamation convergence, sharded visitors, and
//! disk round-trips.

use std::alloc::Layout;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use meridian_skiplist::NodeAlloc;
use meridian_store::{Config, Error, FileFormat, Snapshot, Store};
use parking_lot::Mutex;

fn key(i: usize) -> Vec<u8> {
    format!("{i:010}").into_bytes()
}

fn count_items(store: &Store, snap: &Arc<Snapshot>) -> usize {
    let mut count = 0;
    let mut iter = store.new_iterator(snap).expect("snapshot is open");
    iter.seek_first();
    while iter.valid() {
        count += 1;
        iter.next();
    }
    count
}

fn wait_for_node_count(store: &Store, target: i64) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while store.node_count() > target {
        assert!(
            Instant::now() < deadline,
            "node count {} did not converge to {}",
            store.node_count(),
            target
        );
        thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn snapshot_sees_consistent_window() {
    // S1: the snapshot taken after a partial delete keeps observing
    // exactly the surviving window, regardless of later inserts.
    let store = Store::new();
    let mut w = store.new_writer();

    for i in 0..2000 {
        assert!(w.put(key(i)));
    }
    for i in 1750..2000 {
        assert!(w.delete(&key(i)));
    }
    let snap = w.new_snapshot();

    for i in 2000..5000 {
        assert!(w.put(key(i)));
    }
    let snap2 = store.new_snapshot();

    let mut iter = store.new_iterator(&snap).unwrap();
    iter.seek(&key(1500));
    let mut count = 0;
    while iter.valid() {
        assert_eq!(iter.get().unwrap(), key(1500 + count).as_slice());
        count += 1;
        iter.next();
    }
    assert_eq!(count, 250);

    iter.close();
    snap.close();
    snap2.close();
}

#[test]
fn duplicate_puts_and_reinsert_after_delete() {
    // S2: a live key is a duplicate even across snapshot boundaries; a
    // deleted key can be re-put, and a full scan sees each key once.
    let store = Store::new();
    let mut w = store.new_writer();

    for i in 0..2000 {
        assert!(w.put(key(i)));
    }
    let snap1 = w.new_snapshot();

    for i in 0..2000 {
        assert!(!w.put(key(i)), "expected duplicate for key {i}");
    }

    for i in 1500..2000 {
        assert!(w.delete(&key(i)));
    }
    let snap2 = w.new_snapshot();

    for i in 1500..5000 {
        assert!(w.put(key(i)), "expected successful insert for key {i}");
    }
    let snap3 = w.new_snapshot();

    let mut iter = store.new_iterator(&snap3).unwrap();
    iter.seek_first();
    let mut count = 0;
    while iter.valid() {
        assert_eq!(iter.get().unwrap(), key(count).as_slice());
        count += 1;
        iter.next();
    }
    assert_eq!(count, 5000);
    iter.close();

    snap1.close();
    snap2.close();
    snap3.close();
}

#[test]
fn delete_reinsert_across_snapshot_closes() {
    // S3: delete + reinsert with interleaved snapshot closes; after the
    // reclaimer drains, the latest snapshot sees each key exactly once.
    let expected = 10;
    let store = Store::new();
    let mut w = store.new_writer();

    for i in 0..expected {
        w.put(key(i));
    }
    let snap1 = w.new_snapshot();
    assert_eq!(count_items(&store, &snap1), expected);

    for i in 0..expected {
        assert!(w.delete(&key(i)));
    }
    for i in 0..expected {
        assert!(w.put(key(i)));
    }
    let snap2 = w.new_snapshot();
    snap1.close();
    let snap3 = w.new_snapshot();
    snap2.close();

    wait_for_node_count(&store, expected as i64);
    assert_eq!(count_items(&store, &snap3), expected);
    snap3.close();
}

#[test]
fn node_count_converges_after_replacement_churn() {
    // S4 (scaled down): concurrent delete+put churn with snapshot cycling
    // leaves exactly the live keys linked once all snapshots close.
    const WRITERS: usize = 4;
    const PER_WRITER: usize = 500;
    const ROUNDS: usize = 20;

    let store = Store::new();
    let last: Mutex<Option<Arc<Snapshot>>> = Mutex::new(None);

    thread::scope(|s| {
        for t in 0..WRITERS {
            let store = &store;
            s.spawn(move || {
                let mut w = store.new_writer();
                let base = t * PER_WRITER;
                for i in 0..PER_WRITER {
                    w.put(key(base + i));
                }
            });
        }
    });

    for _ in 0..ROUNDS {
        thread::scope(|s| {
            for t in 0..WRITERS {
                let store = &store;
                s.spawn(move || {
                    let mut w = store.new_writer();
                    let base = t * PER_WRITER;
                    for i in 0..PER_WRITER {
                        w.delete(&key(base + i));
                        w.put(key(base + i));
                    }
                });
            }
        });
        let curr = store.new_snapshot();
        if let Some(prev) = last.lock().replace(curr) {
            prev.close();
        }
    }

    // Keep a final snapshot open while the previous one closes, so the
    // watermark advances past every dead snapshot's GC list.
    let fin = store.new_snapshot();
    if let Some(prev) = last.lock().take() {
        prev.close();
    }

    assert_eq!(store.item_count() as usize, WRITERS * PER_WRITER);
    wait_for_node_count(&store, (WRITERS * PER_WRITER) as i64);
    fin.close();
}

#[test]
fn concurrent_writers_with_snapshot_churn_keep_counts() {
    // Invariant 3: the final item count equals successful puts minus
    // successful deletes across all threads.
    const WRITERS: u64 = 8;
    const PER_WRITER: u64 = 5_000;

    let store = Store::new();
    let puts = AtomicI64::new(0);

    thread::scope(|s| {
        for t in 0..WRITERS {
            let store = &store;
            let puts = &puts;
            s.spawn(move || {
                let mut w = store.new_writer();
                for i in 0..PER_WRITER {
                    if w.put(key((t * PER_WRITER + i) as usize)) {
                        puts.fetch_add(1, Ordering::Relaxed);
                    }
                    if i % 1_000 == 0 {
                        w.new_snapshot().close();
                    }
                }
            });
        }
    });

    assert_eq!(store.item_count(), puts.load(Ordering::Relaxed));
    let snap = store.new_snapshot();
    assert_eq!(count_items(&store, &snap) as i64, store.item_count());
    snap.close();
}

#[test]
fn visitor_partitions_and_orders_shards() {
    // S5 (scaled down): shard counts sum to n, keys are monotone within a
    // shard, and the aggregate key sum matches.
    const N: u64 = 100_000;
    const SHARDS: usize = 32;
    const CONCURRENCY: usize = 8;

    let store = Store::new();
    let mut w = store.new_writer();
    for i in 0..N {
        w.put(i.to_be_bytes().to_vec());
    }
    let snap = store.new_snapshot();

    let counts: Vec<AtomicU64> = (0..SHARDS + 1).map(|_| AtomicU64::new(0)).collect();
    let last_seen: Vec<Mutex<Option<u64>>> = (0..SHARDS + 1).map(|_| Mutex::new(None)).collect();
    let sum = AtomicU64::new(0);

    store
        .visit(&snap, SHARDS, CONCURRENCY, |item, shard| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(item.data());
            let v = u64::from_be_bytes(bytes);

            counts[shard].fetch_add(1, Ordering::Relaxed);
            sum.fetch_add(v, Ordering::Relaxed);
            let mut last = last_seen[shard].lock();
            if let Some(prev) = *last {
                assert!(prev < v, "shard {shard} yielded {v} after {prev}");
            }
            *last = Some(v);
            Ok(())
        })
        .unwrap();

    let total: u64 = counts.iter().map(|c| c.load(Ordering::Relaxed)).sum();
    assert_eq!(total, N);
    assert_eq!(sum.load(Ordering::Relaxed), (N - 1) * N / 2);

    snap.close();
}

#[test]
fn visitor_propagates_callback_error() {
    // S6: the visitor surfaces the callback's exact error.
    const N: usize = 50_000;
    let store = Store::new();
    let mut w = store.new_writer();
    for i in 0..N {
        w.put(key(i));
    }
    let snap = store.new_snapshot();

    let poison = key(45_000);
    let err = store
        .visit(&snap, 4, 4, |item, _| {
            if item.data() == poison.as_slice() {
                Err(Error::callback("visitor failed"))
            } else {
                Ok(())
            }
        })
        .unwrap_err();

    match err {
        Error::Callback { reason } => assert_eq!(reason, "visitor failed"),
        other => panic!("expected the callback error, got {other:?}"),
    }
    snap.close();
}

#[test]
fn empty_and_single_element_boundaries() {
    let store = Store::new();
    let snap = store.new_snapshot();
    let mut iter = store.new_iterator(&snap).unwrap();
    iter.seek_first();
    assert!(!iter.valid());
    iter.close();
    snap.close();

    let mut w = store.new_writer();
    w.put(key(7));
    let snap = store.new_snapshot();
    let mut iter = store.new_iterator(&snap).unwrap();
    iter.seek(&key(7));
    assert!(iter.valid());
    assert_eq!(iter.get().unwrap(), key(7).as_slice());
    iter.next();
    assert!(!iter.valid());
    iter.close();
    snap.close();
}

#[test]
fn delete_then_put_before_snapshot_is_not_double_counted() {
    let store = Store::new();
    let mut w = store.new_writer();

    assert!(w.put(key(1)));
    assert!(w.delete(&key(1)));
    assert!(w.put(key(1)));
    assert_eq!(store.item_count(), 1);

    let snap = store.new_snapshot();
    assert_eq!(count_items(&store, &snap), 1);
    snap.close();
}

#[test]
fn get_returns_latest_live_version() {
    let store = Store::new();
    let mut w = store.new_writer();

    assert!(w.put(key(5)));
    assert!(w.get(&key(5)).is_some());

    let snap = store.new_snapshot();
    assert!(w.delete(&key(5)));
    assert!(w.get(&key(5)).is_none(), "latest version is dead");

    assert!(w.put(key(5)));
    assert_eq!(w.get(&key(5)).unwrap(), key(5));
    snap.close();
}

#[test]
fn iterator_cannot_attach_to_dead_snapshot() {
    let store = Store::new();
    let snap = store.new_snapshot();
    snap.close();
    assert!(store.new_iterator(&snap).is_none());
}

#[test]
fn upsert_requires_snapshots_disabled() {
    let store = Store::with_config(Config::default().with_snapshots_disabled());
    let mut w = store.new_writer();

    assert!(!w.upsert(key(1)), "first upsert inserts");
    assert!(w.upsert(key(1)), "second upsert replaces");
    assert_eq!(store.item_count(), 1);

    // Duplicate puts collapse to one node per key in this mode.
    assert!(!w.put(key(1)));
    assert_eq!(store.node_count(), 1);
}

#[test]
#[should_panic(expected = "snapshots are disabled")]
fn new_snapshot_panics_when_disabled() {
    let store = Store::with_config(Config::default().with_snapshots_disabled());
    let _ = store.new_snapshot();
}

#[test]
#[should_panic(expected = "upsert requires snapshots to be disabled")]
fn upsert_panics_when_snapshots_enabled() {
    let store = Store::new();
    let mut w = store.new_writer();
    let _ = w.upsert(key(1));
}

#[test]
fn store_and_load_roundtrip() {
    const N: usize = 10_000;
    let dir = tempfile::tempdir().unwrap();

    let store = Store::new();
    let mut w = store.new_writer();
    for i in 0..N {
        w.put(key(i));
    }
    let snap = store.new_snapshot();
    store.store_to_disk(dir.path(), &snap, 4, None).unwrap();
    snap.close();

    assert!(dir.path().join("data").join("files.json").exists());

    let restored = Store::new();
    let loaded = AtomicU64::new(0);
    let callback = |_item: &meridian_store::Item| {
        loaded.fetch_add(1, Ordering::Relaxed);
    };
    let snap = restored
        .load_from_disk(dir.path(), 4, Some(&callback))
        .unwrap();

    assert_eq!(loaded.load(Ordering::Relaxed) as usize, N);
    assert_eq!(snap.count() as usize, N);
    assert_eq!(count_items(&restored, &snap), N);

    // Loaded items come back in key order.
    let mut iter = restored.new_iterator(&snap).unwrap();
    iter.seek_first();
    let mut i = 0;
    while iter.valid() {
        assert_eq!(iter.get().unwrap(), key(i).as_slice());
        i += 1;
        iter.next();
    }
    iter.close();
    snap.close();
}

#[test]
fn store_to_disk_after_close_reports_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::new();
    let mut w = store.new_writer();
    for i in 0..1_000 {
        w.put(key(i));
    }
    let snap = store.new_snapshot();

    store.close();
    let err = store
        .store_to_disk(dir.path(), &snap, 4, None)
        .unwrap_err();
    assert!(err.is_shutdown(), "expected shutdown, got {err:?}");
    // An aborted dump must not leave a completion marker behind.
    assert!(!dir.path().join("data").join("files.json").exists());
}

#[test]
fn forestdb_format_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = Store::with_config(Config::default().with_file_format(FileFormat::Forestdb));
    let mut w = store.new_writer();
    w.put(key(1));
    let snap = store.new_snapshot();

    let err = store.store_to_disk(dir.path(), &snap, 1, None).unwrap_err();
    assert!(matches!(err, Error::InvalidFileFormat { .. }));
    snap.close();
}

/// Allocator that tracks every block and poisons freed memory, so a
/// use-after-free or double-free surfaces as a test failure.
#[derive(Default)]
struct TrackingAlloc {
    live: Mutex<HashMap<usize, Layout>>,
    allocs: AtomicU64,
    frees: AtomicU64,
}

unsafe impl NodeAlloc for TrackingAlloc {
    fn alloc(&self, layout: Layout) -> *mut u8 {
        let ptr = unsafe { std::alloc::alloc(layout) };
        assert!(!ptr.is_null());
        self.allocs.fetch_add(1, Ordering::Relaxed);
        let prev = self.live.lock().insert(ptr as usize, layout);
        assert!(prev.is_none(), "allocator handed out a live block");
        ptr
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        let tracked = self.live.lock().remove(&(ptr as usize));
        let tracked = tracked.expect("freeing a block that was never allocated");
        assert_eq!(tracked.size(), layout.size(), "layout mismatch on free");
        std::ptr::write_bytes(ptr, 0xDD, layout.size());
        self.frees.fetch_add(1, Ordering::Relaxed);
        std::alloc::dealloc(ptr, layout);
    }
}

#[test]
fn reclaimed_memory_is_returned_exactly_once() {
    let alloc = Arc::new(TrackingAlloc::default());
    {
        let store =
            Store::with_config(Config::default().with_allocator(Arc::clone(&alloc) as _));
        let mut w = store.new_writer();
        for i in 0..2_000 {
            w.put(key(i));
        }
        let snap = store.new_snapshot();
        for i in 0..2_000 {
            w.delete(&key(i));
        }
        snap.close();
        // The next snapshot picks up the pending-GC chain; a further open
        // snapshot lets the watermark pass it.
        let carrier = store.new_snapshot();
        let fin = store.new_snapshot();
        carrier.close();

        wait_for_node_count(&store, 0);
        fin.close();
        store.close();
    }

    // Drain deferred destructions before comparing the counters. Other
    // tests in this binary pin epochs too, so poll instead of counting on
    // a fixed number of flushes.
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        crossbeam_epoch::pin().flush();
        let allocs = alloc.allocs.load(Ordering::Relaxed);
        let frees = alloc.frees.load(Ordering::Relaxed);
        if allocs == frees {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "leaked nodes: {allocs} allocated, {frees} freed"
        );
        thread::sleep(Duration::from_millis(1));
    }
}
