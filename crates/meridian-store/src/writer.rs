//! Item-producing writer handles.
//!
//! Each writer owns a level RNG (so inserts never contend on shared
//! randomness), a search buffer, and a local pending-GC chain that the
//! snapshot manager splices out at snapshot creation. Writers are cheap;
//! one per producing thread is the intended shape.

use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::Rng;

use meridian_skiplist::{ActionBuffer, NodeRef, Upsert};

use crate::item::Item;
use crate::snapshot::Snapshot;
use crate::Core;

/// Head and tail of one writer's chain of soft-deleted nodes, linked
/// through each node's intrusive GC pointer. Only the owning writer
/// appends; the snapshot manager takes the whole chain under the same
/// lock.
#[derive(Default)]
pub(crate) struct GcChain {
    pub(crate) head: Option<NodeRef<Item>>,
    pub(crate) tail: Option<NodeRef<Item>>,
}

/// A write handle onto a [`crate::Store`].
pub struct Writer {
    core: Arc<Core>,
    rng: SmallRng,
    buf: ActionBuffer<Item>,
    gc: Arc<Mutex<GcChain>>,
}

impl Writer {
    pub(crate) fn new(core: Arc<Core>, rng: SmallRng, gc: Arc<Mutex<GcChain>>) -> Self {
        let buf = core.store.make_buf();
        Self { core, rng, buf, gc }
    }

    /// Inserts a new version of a key. Returns false if an equal live key
    /// already exists (a duplicate put).
    pub fn put(&mut self, data: impl Into<Bytes>) -> bool {
        self.put_item(Item::new(data)).is_some()
    }

    /// Like [`Writer::put`], returning a handle to the inserted node.
    pub fn put_item(&mut self, mut item: Item) -> Option<NodeRef<Item>> {
        item.stamp_born(self.core.curr_sn());
        let Writer { core, rng, buf, .. } = self;
        let node = core.store.insert2(
            item,
            &*core.config.ins_cmp,
            Some(&*core.config.exist_cmp),
            buf,
            &mut || rng.gen::<f32>(),
        );
        if node.is_some() {
            core.count.fetch_add(1, AtomicOrdering::Relaxed);
        }
        node
    }

    /// Logically deletes the most recent live version of a key. Returns
    /// false when no live version exists.
    pub fn delete(&mut self, key: &[u8]) -> bool {
        match self.get_node(key) {
            Some(node) => self.delete_node(node),
            None => false,
        }
    }

    /// Deletes a specific node.
    ///
    /// A node born in the still-open sequence window was never visible to
    /// any snapshot and is unlinked physically on the spot; anything older
    /// gets its death stamp and goes onto this writer's pending-GC chain
    /// for the reclaimer.
    pub fn delete_node(&mut self, node: NodeRef<Item>) -> bool {
        let sn = self.core.curr_sn();
        // SAFETY: the handle came from a live lookup or insert; nodes stay
        // mapped while logically reachable.
        let item = unsafe { node.item() };

        if item.born_sn() == sn {
            let ok = self
                .core
                .store
                .delete_node(node, &*self.core.config.ins_cmp, &mut self.buf);
            if ok {
                self.core.count.fetch_sub(1, AtomicOrdering::Relaxed);
            }
            return ok;
        }

        if item.mark_dead(sn) {
            let mut chain = self.gc.lock();
            match chain.tail {
                // SAFETY: chain nodes are soft-deleted and not yet reclaimed.
                Some(tail) => unsafe { tail.node().set_gc_link(node.as_raw()) },
                None => chain.head = Some(node),
            }
            chain.tail = Some(node);
            self.core.count.fetch_sub(1, AtomicOrdering::Relaxed);
            true
        } else {
            false
        }
    }

    /// Reads the most recent live version of a key.
    pub fn get(&mut self, key: &[u8]) -> Option<Bytes> {
        // SAFETY: returned handles point at live nodes.
        self.get_node(key).map(|n| unsafe { n.item() }.bytes())
    }

    /// Locates the node holding the most recent version of a key, walking
    /// same-key versions up to the highest `born_sn`. Returns `None` if
    /// the key is absent or its latest version is dead.
    pub fn get_node(&mut self, key: &[u8]) -> Option<NodeRef<Item>> {
        let probe = Item::new(Bytes::copy_from_slice(key));
        let iter_cmp = &*self.core.config.iter_cmp;
        let mut it = self.core.store.iter(iter_cmp);
        if !it.seek(&probe) {
            return None;
        }

        let mut curr = it.node()?;
        loop {
            it.next();
            if !it.valid() {
                break;
            }
            let next = it.node().expect("valid cursor has a node");
            // SAFETY: both nodes are protected by the cursor's session.
            let equal = unsafe { iter_cmp(next.item(), curr.item()) };
            if equal != std::cmp::Ordering::Equal {
                break;
            }
            curr = next;
        }

        // SAFETY: as above.
        let item = unsafe { curr.item() };
        if item.dead_sn() != 0 {
            None
        } else {
            Some(curr)
        }
    }

    /// Replaces a key's payload in place, or inserts it when absent.
    /// Returns true when an existing item was updated.
    ///
    /// # Panics
    ///
    /// Panics when snapshots are enabled; in-place replacement would
    /// violate snapshot isolation.
    pub fn upsert(&mut self, data: impl Into<Bytes>) -> bool {
        assert!(
            !self.core.config.snapshots_enabled,
            "upsert requires snapshots to be disabled"
        );
        let mut item = Item::new(data);
        item.stamp_born(self.core.curr_sn());
        let Writer { core, rng, buf, .. } = self;
        match core
            .store
            .upsert(item, &*core.config.iter_cmp, buf, &mut || rng.gen::<f32>())
        {
            Upsert::Replaced(_) => true,
            Upsert::Inserted(_) => {
                core.count.fetch_add(1, AtomicOrdering::Relaxed);
                false
            }
        }
    }

    /// Creates a snapshot of the store; see [`crate::Store::new_snapshot`].
    pub fn new_snapshot(&self) -> Arc<Snapshot> {
        Core::new_snapshot(&self.core)
    }
}
