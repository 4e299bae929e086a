//! Snapshot-scoped iteration.
//!
//! A [`SnapshotIter`] wraps the index cursor with visibility filtering
//! against its snapshot's sequence number: versions born after the
//! snapshot, or dead at or before it, are skipped. The iterator keeps a
//! reference on the snapshot (released on drop) and a barrier session for
//! its lifetime; long scans can set a refresh rate so the session is
//! re-acquired periodically and reclamation is not held up.

use std::sync::Arc;

use bytes::Bytes;

use meridian_skiplist::{CompareFn, Iter, NodeRef, SkipList};

use crate::item::Item;
use crate::snapshot::Snapshot;

/// An ordered cursor over the items visible to one snapshot.
pub struct SnapshotIter<'a> {
    list: &'a SkipList<Item>,
    iter_cmp: &'a CompareFn<Item>,
    snap: Arc<Snapshot>,
    inner: Iter<'a, Item>,
    refresh_rate: usize,
    visited: usize,
}

impl<'a> SnapshotIter<'a> {
    /// Caller has already taken a reference on `snap` via
    /// [`Snapshot::open`]; this iterator releases it on drop.
    pub(crate) fn new(
        list: &'a SkipList<Item>,
        iter_cmp: &'a CompareFn<Item>,
        snap: Arc<Snapshot>,
    ) -> Self {
        let inner = list.iter(iter_cmp);
        Self {
            list,
            iter_cmp,
            snap,
            inner,
            refresh_rate: 0,
            visited: 0,
        }
    }

    /// The snapshot this iterator observes.
    pub fn snapshot(&self) -> &Arc<Snapshot> {
        &self.snap
    }

    fn skip_unwanted(&mut self) {
        loop {
            let visible = match self.inner.item() {
                None => return,
                Some(item) => item.is_visible(self.snap.sn()),
            };
            if visible {
                return;
            }
            self.inner.next();
            self.visited += 1;
        }
    }

    /// Positions at the first visible item.
    pub fn seek_first(&mut self) {
        self.inner.seek_first();
        self.skip_unwanted();
    }

    /// Positions at the first visible item with key `>= key`.
    pub fn seek(&mut self, key: &[u8]) {
        let probe = Item::new(Bytes::copy_from_slice(key));
        self.seek_item(&probe);
    }

    pub(crate) fn seek_item(&mut self, item: &Item) {
        self.inner.seek(item);
        self.skip_unwanted();
    }

    /// Whether the cursor is on a visible item.
    pub fn valid(&self) -> bool {
        self.inner.valid()
    }

    /// The current item's payload.
    pub fn get(&self) -> Option<&[u8]> {
        self.inner.item().map(Item::data)
    }

    /// The current item.
    pub fn item(&self) -> Option<&Item> {
        self.inner.item()
    }

    /// A handle to the current node.
    pub fn node(&self) -> Option<NodeRef<Item>> {
        self.inner.node()
    }

    /// Advances to the next visible item.
    pub fn next(&mut self) {
        self.inner.next();
        self.visited += 1;
        self.skip_unwanted();
        if self.refresh_rate > 0 && self.visited > self.refresh_rate {
            self.refresh();
            self.visited = 0;
        }
    }

    /// Re-acquires the barrier session after roughly `rate` visited nodes,
    /// so that a long scan does not pin reclamation. Zero disables
    /// refreshing.
    pub fn set_refresh_rate(&mut self, rate: usize) {
        self.refresh_rate = rate;
    }

    /// Drops and re-acquires the underlying cursor at the current item.
    pub fn refresh(&mut self) {
        if let Some(item) = self.inner.item().cloned() {
            self.inner = self.list.iter(self.iter_cmp);
            self.inner.seek(&item);
        }
    }

    /// Releases the iterator and its snapshot reference.
    pub fn close(self) {}
}

impl Drop for SnapshotIter<'_> {
    fn drop(&mut self) {
        self.snap.close();
    }
}
