//! # meridian-store
//!
//! An in-memory, ordered key-value store built for very high concurrent
//! insert/delete/scan throughput with multi-version snapshot isolation.
//!
//! Writers mutate the store without blocking one another or concurrent
//! readers; each [`Snapshot`] presents a consistent point-in-time view
//! that survives arbitrary later mutations. A background reclaimer
//! physically removes versions that no live snapshot can observe.
//!
//! The store is a thin MVCC layer over the lock-free index in
//! [`meridian_skiplist`]:
//!
//! - [`Item`]: payload plus `born_sn`/`dead_sn` visibility tags
//! - [`Writer`]: per-thread write handle with its own RNG, search buffer,
//!   and pending-GC chain
//! - [`Snapshot`]: refcounted sequence-number capture; closing the last
//!   reference feeds the reclaimer
//! - [`SnapshotIter`]: ordered, visibility-filtered cursor
//! - Sharded parallel scans ([`Store::visit`]) and on-disk snapshot
//!   directories ([`Store::store_to_disk`] / [`Store::load_from_disk`])
//!
//! ## Example
//!
//! ```rust
//! use meridian_store::Store;
//!
//! let store = Store::new();
//! let mut writer = store.new_writer();
//!
//! writer.put(&b"alpha"[..]);
//! writer.put(&b"beta"[..]);
//! let snap = store.new_snapshot();
//! writer.delete(b"alpha");
//!
//! // The snapshot still sees both keys.
//! let mut iter = store.new_iterator(&snap).unwrap();
//! iter.seek_first();
//! assert_eq!(iter.get(), Some(&b"alpha"[..]));
//! iter.close();
//! snap.close();
//! ```

#![warn(clippy::all)]

mod config;
mod error;
mod gc;
mod item;
mod iterator;
mod persist;
mod snapshot;
mod visitor;
mod writer;

pub use config::{Config, FileFormat};
pub use error::{Error, Result};
pub use item::{Item, KeyComparator};
pub use iterator::SnapshotIter;
pub use snapshot::Snapshot;
pub use writer::Writer;

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::info;

use meridian_skiplist::SkipList;

use crate::gc::GcBatch;
use crate::writer::GcChain;

/// Shared store state; owned by the [`Store`] handle, its writers, and the
/// collection worker.
pub(crate) struct Core {
    /// The data index.
    pub(crate) store: SkipList<Item>,
    /// Live snapshots, ordered by sequence number.
    pub(crate) snapshots: SkipList<Arc<Snapshot>>,
    /// Fully released snapshots awaiting reclamation.
    pub(crate) gc_snapshots: SkipList<Arc<Snapshot>>,
    /// Store-wide monotonic sequence counter.
    pub(crate) curr_sn: AtomicU32,
    /// Watermark: `sn - 1` of the oldest live snapshot.
    pub(crate) least_unref_sn: AtomicU32,
    pub(crate) last_gc_sn: AtomicU32,
    pub(crate) gc_running: AtomicBool,
    /// Live items: successful puts minus successful deletes.
    pub(crate) count: AtomicI64,
    /// Pending-GC chains of all writers ever created on this store.
    pub(crate) writers: Mutex<Vec<Arc<Mutex<GcChain>>>>,
    pub(crate) gc_tx: Mutex<Option<crossbeam_channel::Sender<GcBatch>>>,
    pub(crate) gc_worker: Mutex<Option<JoinHandle<()>>>,
    pub(crate) closed: AtomicBool,
    /// Level RNG for the low-traffic snapshot sets.
    pub(crate) aux_rng: Mutex<SmallRng>,
    pub(crate) config: Config,
}

impl Core {
    #[inline]
    pub(crate) fn curr_sn(&self) -> u32 {
        self.curr_sn.load(AtomicOrdering::Acquire)
    }
}

/// The store handle. Dropping it closes the store.
pub struct Store {
    core: Arc<Core>,
}

impl Store {
    /// Creates a store with the default configuration.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a store with the given configuration.
    pub fn with_config(config: Config) -> Self {
        let mut data = SkipList::with_alloc(Arc::clone(&config.allocator));
        if !config.ignore_item_size {
            data.set_item_size_fn(Box::new(Item::size));
        }
        let snapshots = SkipList::with_alloc(Arc::clone(&config.allocator));
        let gc_snapshots = SkipList::with_alloc(Arc::clone(&config.allocator));

        let snapshots_enabled = config.snapshots_enabled;
        let core = Arc::new(Core {
            store: data,
            snapshots,
            gc_snapshots,
            curr_sn: AtomicU32::new(1),
            least_unref_sn: AtomicU32::new(0),
            last_gc_sn: AtomicU32::new(0),
            gc_running: AtomicBool::new(false),
            count: AtomicI64::new(0),
            writers: Mutex::new(Vec::new()),
            gc_tx: Mutex::new(None),
            gc_worker: Mutex::new(None),
            closed: AtomicBool::new(false),
            aux_rng: Mutex::new(SmallRng::from_entropy()),
            config,
        });

        if snapshots_enabled {
            let (tx, rx) = crossbeam_channel::unbounded();
            *core.gc_tx.lock() = Some(tx);
            let worker_core = Arc::clone(&core);
            let handle = std::thread::Builder::new()
                .name("meridian-reclaimer".into())
                .spawn(move || gc::collection_worker(worker_core, rx))
                .expect("failed to spawn the reclaimer thread");
            *core.gc_worker.lock() = Some(handle);
        }

        info!(snapshots = snapshots_enabled, "store opened");
        Store { core }
    }

    /// Creates a write handle. Writers are independent; create one per
    /// producing thread.
    pub fn new_writer(&self) -> Writer {
        let gc = Arc::new(Mutex::new(GcChain::default()));
        self.core.writers.lock().push(Arc::clone(&gc));
        Writer::new(Arc::clone(&self.core), SmallRng::from_entropy(), gc)
    }

    /// Captures a snapshot of the current state and advances the sequence
    /// counter.
    ///
    /// # Panics
    ///
    /// Panics when the store was configured with snapshots disabled.
    pub fn new_snapshot(&self) -> Arc<Snapshot> {
        Core::new_snapshot(&self.core)
    }

    /// Creates an iterator over the items visible to `snap`. Returns
    /// `None` when the snapshot is already fully released.
    pub fn new_iterator(&self, snap: &Arc<Snapshot>) -> Option<SnapshotIter<'_>> {
        if !snap.open() {
            return None;
        }
        Some(SnapshotIter::new(
            &self.core.store,
            &*self.core.config.iter_cmp,
            Arc::clone(snap),
        ))
    }

    /// Live item count: successful puts minus successful deletes.
    pub fn item_count(&self) -> i64 {
        self.core.count.load(AtomicOrdering::Relaxed)
    }

    /// Nodes currently linked in the data index, including versions
    /// awaiting reclamation.
    pub fn node_count(&self) -> i64 {
        self.core.store.node_count()
    }

    /// Approximate bytes held by the data index and the snapshot sets.
    pub fn memory_in_use(&self) -> i64 {
        self.core.store.memory_in_use()
            + self.core.snapshots.memory_in_use()
            + self.core.gc_snapshots.memory_in_use()
    }

    /// Human-readable index statistics.
    pub fn dump_stats(&self) -> String {
        self.core.store.stats().to_string()
    }

    /// The store configuration.
    pub fn config(&self) -> &Config {
        &self.core.config
    }

    /// Closes the store: in-flight persistence operations observe
    /// [`Error::Shutdown`] and the reclaimer drains and exits. Idempotent;
    /// also invoked on drop.
    pub fn close(&self) {
        if self.core.closed.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let tx = self.core.gc_tx.lock().take();
        drop(tx);
        let worker = self.core.gc_worker.lock().take();
        if let Some(handle) = worker {
            let _ = handle.join();
        }
        info!("store closed");
    }
}

impl Default for Store {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        self.close();
    }
}
