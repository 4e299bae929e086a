//! Snapshot lifecycle.
//!
//! A snapshot captures the sequence counter and presents a consistent
//! point-in-time view that survives later mutations. Live and dead
//! snapshots are kept in auxiliary skiplists ordered by sequence number,
//! managed with the same lock-free protocols as the data index. Closing
//! the last reference moves a snapshot to the dead set, advances the
//! `least_unref_sn` watermark, and kicks the reclaimer.

use std::cmp::Ordering;
use std::io::{Read, Write};
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use tracing::debug;

use meridian_skiplist::{CompareFn, Node, NodeRef};

use crate::error::{Error, Result};
use crate::item::Item;
use crate::Core;

/// A consistent point-in-time view of a store.
pub struct Snapshot {
    sn: u32,
    refcount: AtomicU32,
    count: i64,
    /// Head of the chain of nodes logically deleted in the window
    /// `(previous snapshot, this snapshot]`, linked via intrusive GC
    /// pointers.
    gclist: AtomicPtr<Node<Item>>,
    core: Weak<Core>,
    me: Weak<Snapshot>,
}

impl Snapshot {
    pub(crate) fn new(sn: u32, count: i64, core: Weak<Core>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            sn,
            refcount: AtomicU32::new(1),
            count,
            gclist: AtomicPtr::new(ptr::null_mut()),
            core,
            me: me.clone(),
        })
    }

    /// A detached snapshot with no store backing, for tests.
    #[cfg(test)]
    pub(crate) fn probe(sn: u32) -> Arc<Self> {
        Self::new(sn, 0, Weak::new())
    }

    /// The sequence number this snapshot observes.
    pub fn sn(&self) -> u32 {
        self.sn
    }

    /// Item count at snapshot creation.
    pub fn count(&self) -> i64 {
        self.count
    }

    pub(crate) fn set_gclist(&self, head: *mut Node<Item>) {
        self.gclist.store(head, AtomicOrdering::Release);
    }

    pub(crate) fn take_gclist(&self) -> *mut Node<Item> {
        self.gclist
            .swap(ptr::null_mut(), AtomicOrdering::AcqRel)
    }

    /// Takes an additional reference. Returns false if the snapshot is
    /// already dead, which is the race-free way for an iterator factory to
    /// attach.
    pub fn open(&self) -> bool {
        let mut refs = self.refcount.load(AtomicOrdering::Acquire);
        loop {
            if refs == 0 {
                return false;
            }
            match self.refcount.compare_exchange_weak(
                refs,
                refs + 1,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            ) {
                Ok(_) => return true,
                Err(current) => refs = current,
            }
        }
    }

    /// Releases one reference. On the last release the snapshot moves from
    /// the live to the dead set and reclamation may proceed.
    pub fn close(&self) {
        let prev = self.refcount.fetch_sub(1, AtomicOrdering::AcqRel);
        debug_assert!(prev > 0, "snapshot closed more often than opened");
        if prev == 1 {
            if let (Some(core), Some(me)) = (self.core.upgrade(), self.me.upgrade()) {
                core.retire_snapshot(&me);
            }
        }
    }

    /// Writes the snapshot marker: `u32 sequence number (big-endian)`.
    pub fn encode(&self, buf: &mut [u8], w: &mut impl Write) -> Result<()> {
        if buf.len() < 4 {
            return Err(Error::not_enough_space(4, buf.len()));
        }
        buf[..4].copy_from_slice(&self.sn.to_be_bytes());
        w.write_all(&buf[..4])?;
        Ok(())
    }

    /// Reads a snapshot marker written by [`Snapshot::encode`].
    pub fn decode(buf: &mut [u8], r: &mut impl Read) -> Result<u32> {
        if buf.len() < 4 {
            return Err(Error::not_enough_space(4, buf.len()));
        }
        r.read_exact(&mut buf[..4])?;
        Ok(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
    }
}

/// Ordering of the snapshot sets.
pub(crate) fn compare_snapshot(a: &Arc<Snapshot>, b: &Arc<Snapshot>) -> Ordering {
    a.sn.cmp(&b.sn)
}

impl Core {
    /// Creates a snapshot: capture the sequence counter, bump it, and
    /// splice every writer's pending-GC chain into the snapshot's list.
    ///
    /// # Panics
    ///
    /// Panics when the store was configured with snapshots disabled; that
    /// is a programmer error, not a runtime condition.
    pub(crate) fn new_snapshot(core: &Arc<Core>) -> Arc<Snapshot> {
        assert!(
            core.config.snapshots_enabled,
            "snapshots are disabled for this store"
        );

        let snap = Snapshot::new(
            core.curr_sn(),
            core.count.load(AtomicOrdering::Relaxed),
            Arc::downgrade(core),
        );
        let cmp: &CompareFn<Arc<Snapshot>> = &compare_snapshot;
        let mut buf = core.snapshots.make_buf();
        {
            let mut rng = core.aux_rng.lock();
            core.snapshots
                .insert(Arc::clone(&snap), cmp, &mut buf, &mut || {
                    rand::Rng::gen::<f32>(&mut *rng)
                });
        }
        core.curr_sn.fetch_add(1, AtomicOrdering::SeqCst);

        let mut head: Option<NodeRef<Item>> = None;
        let mut tail: Option<NodeRef<Item>> = None;
        for writer_chain in core.writers.lock().iter() {
            let mut chain = writer_chain.lock();
            if let (Some(h), Some(t)) = (chain.head, chain.tail) {
                match tail {
                    None => head = Some(h),
                    // SAFETY: chain nodes are soft-deleted, not yet reclaimed.
                    Some(prev_tail) => unsafe { prev_tail.node().set_gc_link(h.as_raw()) },
                }
                tail = Some(t);
                chain.head = None;
                chain.tail = None;
            }
        }
        if let Some(h) = head {
            snap.set_gclist(h.as_raw());
        }

        debug!(sn = snap.sn(), items = snap.count(), "snapshot created");
        snap
    }

    /// Moves a fully released snapshot from the live set to the dead set,
    /// recomputes the watermark, and schedules reclamation.
    pub(crate) fn retire_snapshot(&self, snap: &Arc<Snapshot>) {
        let cmp: &CompareFn<Arc<Snapshot>> = &compare_snapshot;
        let mut buf = self.snapshots.make_buf();
        self.snapshots.delete(snap, cmp, &mut buf);
        {
            let mut rng = self.aux_rng.lock();
            self.gc_snapshots
                .insert(Arc::clone(snap), cmp, &mut buf, &mut || {
                    rand::Rng::gen::<f32>(&mut *rng)
                });
        }
        self.update_least_unref_sn();
        debug!(sn = snap.sn(), "snapshot retired");
        self.maybe_run_gc();
    }

    /// Recomputes `least_unref_sn` as the oldest live snapshot's sequence
    /// number minus one. Left unchanged when no live snapshot exists.
    fn update_least_unref_sn(&self) {
        let cmp: &CompareFn<Arc<Snapshot>> = &compare_snapshot;
        let mut it = self.snapshots.iter(cmp);
        it.seek_first();
        if it.valid() {
            if let Some(snap) = it.item() {
                self.least_unref_sn
                    .store(snap.sn().saturating_sub(1), AtomicOrdering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_open_close_refcounting() {
        let snap = Snapshot::probe(7);
        assert!(snap.open());
        snap.close();
        snap.close();
        // Fully released: cannot be revived.
        assert!(!snap.open());
    }

    #[test]
    fn test_codec_roundtrip() {
        let snap = Snapshot::probe(0x0102_0304);
        let mut scratch = [0u8; 8];
        let mut out = Vec::new();
        snap.encode(&mut scratch, &mut out).unwrap();
        assert_eq!(out, vec![1, 2, 3, 4]);

        let sn = Snapshot::decode(&mut scratch, &mut Cursor::new(&out)).unwrap();
        assert_eq!(sn, 0x0102_0304);
    }

    #[test]
    fn test_codec_rejects_short_buffer() {
        let snap = Snapshot::probe(1);
        let mut scratch = [0u8; 2];
        let mut out = Vec::new();
        assert!(matches!(
            snap.encode(&mut scratch, &mut out),
            Err(Error::NotEnoughSpace { needed: 4, .. })
        ));
    }

    #[test]
    fn test_compare_snapshot_orders_by_sn() {
        let a = Snapshot::probe(1);
        let b = Snapshot::probe(2);
        assert_eq!(compare_snapshot(&a, &b), Ordering::Less);
        assert_eq!(compare_snapshot(&b, &b), Ordering::Equal);
    }
}
