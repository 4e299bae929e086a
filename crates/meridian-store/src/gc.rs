//! The reclaimer.
//!
//! Soft delete under MVCC only hides a node from snapshots at or after its
//! death stamp; the node must stay physically linked until every snapshot
//! born before that stamp has closed. Once the `least_unref_sn` watermark
//! passes a dead snapshot, its GC list is handed to the collection worker,
//! which unlinks each node and lets the access barrier release the memory.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use crossbeam_channel::Receiver;
use tracing::debug;

use meridian_skiplist::{CompareFn, Node, NodeRef};

use crate::item::Item;
use crate::snapshot::{compare_snapshot, Snapshot};
use crate::Core;

/// One dead snapshot's chain of soft-deleted nodes.
pub(crate) struct GcBatch(pub(crate) *mut Node<Item>);

// The chain is exclusively owned once taken from its snapshot.
unsafe impl Send for GcBatch {}

impl Core {
    /// Starts a reclamation pass unless one is already active. A single
    /// active instance per store keeps the dead-set sweep serial.
    pub(crate) fn maybe_run_gc(&self) {
        if self
            .gc_running
            .compare_exchange(
                false,
                true,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            )
            .is_ok()
        {
            self.run_gc();
        }
    }

    fn run_gc(&self) {
        let watermark = self.least_unref_sn.load(AtomicOrdering::Acquire);
        if watermark > 0 && watermark != self.last_gc_sn.load(AtomicOrdering::Relaxed) {
            self.last_gc_sn.store(watermark, AtomicOrdering::Relaxed);
            self.collect_dead(watermark);
        }
        self.gc_running.store(false, AtomicOrdering::Release);
    }

    /// Walks the dead set in ascending sequence order and forwards every
    /// snapshot at or below the watermark to the collection worker.
    fn collect_dead(&self, watermark: u32) {
        let tx = match &*self.gc_tx.lock() {
            Some(tx) => tx.clone(),
            None => return, // store already closed
        };

        let cmp: &CompareFn<Arc<Snapshot>> = &compare_snapshot;
        let mut buf = self.gc_snapshots.make_buf();
        let mut it = self.gc_snapshots.iter(cmp);
        it.seek_first();
        let mut batches = 0u64;
        while it.valid() {
            let (sn, gclist) = match it.item() {
                Some(snap) => (snap.sn(), snap.take_gclist()),
                None => break,
            };
            if sn > watermark {
                break;
            }
            if !gclist.is_null() {
                // The worker exits only after draining the queue, so a
                // send can fail only if the store dropped mid-close.
                let _ = tx.send(GcBatch(gclist));
                batches += 1;
            }
            let node = it.node().expect("valid cursor has a node");
            self.gc_snapshots.delete_node(node, cmp, &mut buf);
            it.next();
        }
        if batches > 0 {
            debug!(watermark, batches, "handed dead snapshot GC lists to the reclaimer");
        }
    }
}

/// Background consumer: unlinks every node on each received chain. Runs on
/// a dedicated thread per store and exits when the store closes its side
/// of the channel.
pub(crate) fn collection_worker(core: Arc<Core>, rx: Receiver<GcBatch>) {
    let mut buf = core.store.make_buf();
    let ins_cmp = Arc::clone(&core.config.ins_cmp);
    for batch in rx {
        let mut node = batch.0;
        let mut reclaimed = 0u64;
        while !node.is_null() {
            // SAFETY: chain nodes are soft-deleted and still linked; the
            // chain link is read before the unlink can release the node.
            let node_ref = unsafe { NodeRef::from_raw(node) };
            let next = unsafe { node_ref.node().gc_link() };
            core.store.delete_node(node_ref, &*ins_cmp, &mut buf);
            node = next;
            reclaimed += 1;
        }
        if reclaimed > 0 {
            debug!(reclaimed, "physically removed soft-deleted nodes");
        }
    }
}
