//! The lock-free skiplist.
//!
//! All mutating operations are non-blocking: a thread that loses a CAS race
//! restarts its local retry loop, and global progress is guaranteed because
//! some thread always commits. Deletion is two-phase: a node is first
//! marked at every level (soft delete), then cooperatively unlinked by
//! whichever searches encounter it, and finally released to the allocator
//! once every level has been unlinked and the epoch grace period passed.

use std::cmp::Ordering;
use std::ptr;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering as AtomicOrdering};
use std::sync::Arc;

use crossbeam_epoch::{self as epoch, Guard, Shared};
use crossbeam_utils::CachePadded;

use crate::alloc::{GlobalNodeAlloc, NodeAlloc};
use crate::iter::Iter;
use crate::node::{Node, NodeRef, DELETED_TAG};
use crate::stats::Stats;
use crate::CompareFn;

/// Maximum tower level. Nodes have between 1 and `MAX_LEVEL + 1` forward
/// links.
pub const MAX_LEVEL: usize = 32;

/// Success probability of the geometric level draw.
const LEVEL_PROBABILITY: f32 = 0.25;

/// Per-caller scratch holding the unmarked predecessor/successor pair that
/// straddles a search key at every level. Reused across calls; never
/// shared between concurrent callers.
pub struct ActionBuffer<T> {
    pub(crate) preds: [*mut Node<T>; MAX_LEVEL + 1],
    pub(crate) succs: [*mut Node<T>; MAX_LEVEL + 1],
}

impl<T> ActionBuffer<T> {
    fn new() -> Self {
        Self {
            preds: [ptr::null_mut(); MAX_LEVEL + 1],
            succs: [ptr::null_mut(); MAX_LEVEL + 1],
        }
    }
}

impl<T> Default for ActionBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

// The buffer only caches raw positions between operations of its single
// owner; it moves with that owner (e.g. a writer handle) across threads.
unsafe impl<T: Send + Sync> Send for ActionBuffer<T> {}

/// Outcome of [`SkipList::upsert`].
pub enum Upsert<T> {
    /// An equal item was present; its payload was swapped out in place.
    Replaced(T),
    /// No equal item existed; a new node was inserted.
    Inserted(NodeRef<T>),
}

/// A lock-free, multi-level ordered index over opaque items.
pub struct SkipList<T> {
    head: *mut Node<T>,
    tail: *mut Node<T>,
    top_level: CachePadded<AtomicUsize>,
    used_bytes: CachePadded<AtomicI64>,
    stats: Stats,
    item_size: Box<dyn Fn(&T) -> usize + Send + Sync>,
    alloc: Arc<dyn NodeAlloc>,
}

unsafe impl<T: Send + Sync> Send for SkipList<T> {}
unsafe impl<T: Send + Sync> Sync for SkipList<T> {}

impl<T> SkipList<T> {
    /// Creates an empty list backed by the global allocator.
    pub fn new() -> Self {
        Self::with_alloc(Arc::new(GlobalNodeAlloc))
    }

    /// Creates an empty list with a custom node allocator.
    pub fn with_alloc(alloc: Arc<dyn NodeAlloc>) -> Self {
        let head = Node::alloc_node(&*alloc, None, MAX_LEVEL);
        let tail = Node::alloc_node(&*alloc, None, MAX_LEVEL);
        let tail_shared: Shared<'_, Node<T>> = Shared::from(tail as *const Node<T>);
        // SAFETY: sentinels are exclusively owned until `Self` is returned.
        unsafe {
            for i in 0..=MAX_LEVEL {
                (*head).store_next(i, tail_shared, false);
            }
        }
        Self {
            head,
            tail,
            top_level: CachePadded::new(AtomicUsize::new(0)),
            used_bytes: CachePadded::new(AtomicI64::new(0)),
            stats: Stats::new(),
            item_size: Box::new(|_| 0),
            alloc,
        }
    }

    /// Installs the function used to account item payload bytes in
    /// [`SkipList::memory_in_use`]. Defaults to zero per item.
    pub fn set_item_size_fn(&mut self, f: Box<dyn Fn(&T) -> usize + Send + Sync>) {
        self.item_size = f;
    }

    /// Allocates a search buffer sized for this list.
    pub fn make_buf(&self) -> ActionBuffer<T> {
        ActionBuffer::new()
    }

    /// Statistics counters.
    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    /// Number of linked nodes.
    pub fn node_count(&self) -> i64 {
        self.stats.node_count()
    }

    /// Approximate bytes held by linked nodes (headers, towers, and item
    /// payloads per the installed size function).
    pub fn memory_in_use(&self) -> i64 {
        self.used_bytes.load(AtomicOrdering::Relaxed)
    }

    /// Adjusts the byte accounting; used after in-place item replacement.
    pub fn adjust_used_bytes(&self, delta: i64) {
        self.used_bytes.fetch_add(delta, AtomicOrdering::Relaxed);
    }

    pub(crate) fn head_ptr(&self) -> *mut Node<T> {
        self.head
    }

    pub(crate) fn tail_ptr(&self) -> *mut Node<T> {
        self.tail
    }

    pub(crate) fn note_read_conflict(&self) {
        self.stats
            .read_conflicts
            .fetch_add(1, AtomicOrdering::Relaxed);
    }

    fn node_size(&self, node: &Node<T>) -> usize {
        node.size() + node.item().map_or(0, |i| (self.item_size)(i))
    }

    /// Draws an insertion level from a geometric distribution with
    /// p = 0.25, clamped to [`MAX_LEVEL`]. A draw above the current top
    /// level attempts a single CAS bump of the top level by one, so the
    /// index grows at most one level per inserter per call.
    pub fn new_level(&self, rand_fn: &mut dyn FnMut() -> f32) -> usize {
        let mut next_level = 0;
        while next_level <= MAX_LEVEL && rand_fn() < LEVEL_PROBABILITY {
            next_level += 1;
        }
        if next_level > MAX_LEVEL {
            next_level = MAX_LEVEL;
        }

        let level = self.top_level.load(AtomicOrdering::Relaxed);
        if next_level > level {
            if self
                .top_level
                .compare_exchange(level, level + 1, AtomicOrdering::Relaxed, AtomicOrdering::Relaxed)
                .is_ok()
            {
                level + 1
            } else {
                level
            }
        } else {
            next_level
        }
    }

    /// Unlinks a marked node at one level with a single CAS of the
    /// predecessor's link. Any thread that observes a marked node may help.
    /// Returns false if the predecessor moved, in which case the caller
    /// must refresh its position.
    pub(crate) fn help_delete<'g>(
        &self,
        level: usize,
        prev: &Node<T>,
        curr: &Node<T>,
        next: Shared<'g, Node<T>>,
        guard: &'g Guard,
    ) -> bool {
        let curr_shared: Shared<'_, Node<T>> = Shared::from(curr as *const Node<T>);
        let success = prev.cas_next(level, curr_shared, false, next, false, guard);
        if success {
            if level == curr.level() {
                self.stats.soft_deletes.fetch_sub(1, AtomicOrdering::Relaxed);
                self.stats.level_nodes[level].fetch_sub(1, AtomicOrdering::Relaxed);
                self.used_bytes
                    .fetch_sub(self.node_size(curr) as i64, AtomicOrdering::Relaxed);
            }
            if curr.release_level() {
                // Fully unlinked: hand the node to the barrier. No session
                // acquired before this point can observe the release.
                self.stats.node_frees.fetch_add(1, AtomicOrdering::Relaxed);
                let ptr = curr as *const Node<T> as *mut Node<T>;
                let alloc = Arc::clone(&self.alloc);
                unsafe {
                    guard.defer_unchecked(move || Node::dealloc_node(ptr, &*alloc));
                }
            }
        }
        success
    }

    /// Populates `buf` with the unmarked predecessor/successor pair
    /// straddling `item` at every level, helping to unlink any marked node
    /// encountered on the way. Returns the node equal to `item` under
    /// `cmp`, if one is indexed.
    pub(crate) fn find_path(
        &self,
        item: &T,
        cmp: &CompareFn<T>,
        buf: &mut ActionBuffer<T>,
        guard: &Guard,
    ) -> Option<NodeRef<T>> {
        'retry: loop {
            // SAFETY: sentinels live as long as the list.
            let mut prev: &Node<T> = unsafe { &*self.head };
            let mut cmp_val = Ordering::Greater;
            let top = self.top_level.load(AtomicOrdering::Relaxed);
            for i in (0..=top).rev() {
                let (mut curr, _) = prev.next(i, guard);
                loop {
                    // SAFETY: every level terminates at the tail sentinel,
                    // so `curr` is never null.
                    let curr_ref = unsafe { curr.deref() };
                    let (next, curr_marked) = curr_ref.next(i, guard);
                    if curr_marked {
                        if !self.help_delete(i, prev, curr_ref, next, guard) {
                            self.note_read_conflict();
                            continue 'retry;
                        }
                        let (c, _) = prev.next(i, guard);
                        curr = c;
                        continue;
                    }

                    cmp_val = match curr_ref.item() {
                        None => Ordering::Greater, // tail
                        Some(curr_item) => cmp(curr_item, item),
                    };
                    if cmp_val == Ordering::Less {
                        prev = curr_ref;
                        let (c, _) = prev.next(i, guard);
                        curr = c;
                    } else {
                        break;
                    }
                }
                buf.preds[i] = prev as *const Node<T> as *mut Node<T>;
                buf.succs[i] = curr.as_raw() as *mut Node<T>;
            }

            return if cmp_val == Ordering::Equal {
                Some(NodeRef::new(buf.succs[0]))
            } else {
                None
            };
        }
    }

    /// Looks up an item without retaining a position.
    pub fn find(
        &self,
        item: &T,
        cmp: &CompareFn<T>,
        buf: &mut ActionBuffer<T>,
    ) -> Option<NodeRef<T>> {
        let guard = epoch::pin();
        self.find_path(item, cmp, buf, &guard)
    }

    /// Inserts an item, rejecting equal items under `cmp`.
    pub fn insert(
        &self,
        item: T,
        cmp: &CompareFn<T>,
        buf: &mut ActionBuffer<T>,
        rand_fn: &mut dyn FnMut() -> f32,
    ) -> bool {
        self.insert2(item, cmp, None, buf, rand_fn).is_some()
    }

    /// Inserts an item at a freshly drawn level.
    ///
    /// Returns `None` (dropping the item) if an equal item is already
    /// indexed under `ins_cmp`, or if `eq_cmp` is given and the level-0
    /// predecessor compares equal under it.
    pub fn insert2(
        &self,
        item: T,
        ins_cmp: &CompareFn<T>,
        eq_cmp: Option<&CompareFn<T>>,
        buf: &mut ActionBuffer<T>,
        rand_fn: &mut dyn FnMut() -> f32,
    ) -> Option<NodeRef<T>> {
        let item_level = self.new_level(rand_fn);
        let guard = epoch::pin();
        self.insert_at(item, ins_cmp, eq_cmp, buf, item_level, false, &guard)
    }

    fn insert_at(
        &self,
        item: T,
        ins_cmp: &CompareFn<T>,
        eq_cmp: Option<&CompareFn<T>>,
        buf: &mut ActionBuffer<T>,
        item_level: usize,
        skip_find_path: bool,
        guard: &Guard,
    ) -> Option<NodeRef<T>> {
        let node_ptr = Node::alloc_node(&*self.alloc, Some(item), item_level);
        self.stats.node_allocs.fetch_add(1, AtomicOrdering::Relaxed);
        // SAFETY: the node is ours until the level-0 CAS publishes it.
        let new_node = unsafe { &*node_ptr };
        let new_shared: Shared<'_, Node<T>> = Shared::from(node_ptr as *const Node<T>);
        let mut skip = skip_find_path;

        // Publish at level 0 first: that is the point where the node
        // becomes visible to readers, and it makes linking the upper
        // levels idempotent with respect to concurrent marking.
        loop {
            if skip {
                skip = false;
            } else {
                let item_ref = new_node.item().expect("fresh node carries an item");
                if self.find_path(item_ref, ins_cmp, buf, guard).is_some() {
                    unsafe { self.discard_fresh_node(node_ptr) };
                    return None;
                }
                if let Some(eq) = eq_cmp {
                    // SAFETY: buffer entries were just refreshed under `guard`.
                    let pred = unsafe { &*buf.preds[0] };
                    if let Some(pred_item) = pred.item() {
                        if eq(item_ref, pred_item) == Ordering::Equal {
                            unsafe { self.discard_fresh_node(node_ptr) };
                            return None;
                        }
                    }
                }
            }

            let succ: Shared<'_, Node<T>> = Shared::from(buf.succs[0] as *const Node<T>);
            new_node.store_next(0, succ, false);
            let pred = unsafe { &*buf.preds[0] };
            if pred.cas_next(0, succ, false, new_shared, false, guard) {
                break;
            }
            self.stats
                .insert_conflicts
                .fetch_add(1, AtomicOrdering::Relaxed);
        }

        self.stats.level_nodes[item_level].fetch_add(1, AtomicOrdering::Relaxed);
        self.used_bytes
            .fetch_add(self.node_size(new_node) as i64, AtomicOrdering::Relaxed);

        for i in 1..=item_level {
            loop {
                let succ: Shared<'_, Node<T>> = Shared::from(buf.succs[i] as *const Node<T>);
                new_node.store_next(i, succ, false);
                let pred = unsafe { &*buf.preds[i] };
                if pred.cas_next(i, succ, false, new_shared, false, guard) {
                    break;
                }
                let item_ref = new_node.item().expect("fresh node carries an item");
                self.find_path(item_ref, ins_cmp, buf, guard);
            }
        }

        Some(NodeRef::new(node_ptr))
    }

    /// Replaces the payload of an equal item in place, or inserts a new
    /// node when no equal item exists.
    ///
    /// # Contract
    ///
    /// In-place replacement is only sound when no concurrent operation can
    /// read or delete the same item; callers serialize writers per key.
    pub fn upsert(
        &self,
        item: T,
        cmp: &CompareFn<T>,
        buf: &mut ActionBuffer<T>,
        rand_fn: &mut dyn FnMut() -> f32,
    ) -> Upsert<T> {
        let item_level = self.new_level(rand_fn);
        let guard = epoch::pin();
        if let Some(node) = self.find_path(&item, cmp, buf, &guard) {
            let new_size = (self.item_size)(&item) as i64;
            // SAFETY: the node was found under `guard` and per the method
            // contract no concurrent reader observes the item.
            let old = unsafe { Node::replace_item(node.as_raw(), item) }
                .expect("indexed node carries an item");
            let old_size = (self.item_size)(&old) as i64;
            self.adjust_used_bytes(new_size - old_size);
            Upsert::Replaced(old)
        } else {
            let node = self
                .insert_at(item, cmp, None, buf, item_level, true, &guard)
                .expect("no concurrent writer may race an upsert of the same item");
            Upsert::Inserted(node)
        }
    }

    /// Marks the node at every level, top-down, without changing any
    /// successor. Returns true iff this invocation was the one that first
    /// marked level 0 — that caller owns the subsequent unlink.
    pub(crate) fn soft_delete(&self, node: &Node<T>, guard: &Guard) -> bool {
        let mut marked = false;
        for i in (0..=node.level()).rev() {
            let old = node.link(i).fetch_or(DELETED_TAG, AtomicOrdering::SeqCst, guard);
            marked = old.tag() != DELETED_TAG;
        }
        if marked {
            self.stats.soft_deletes.fetch_add(1, AtomicOrdering::Relaxed);
        }
        marked
    }

    /// Finds and deletes an equal item. Returns false if absent or if a
    /// concurrent delete won.
    pub fn delete(&self, item: &T, cmp: &CompareFn<T>, buf: &mut ActionBuffer<T>) -> bool {
        let guard = epoch::pin();
        match self.find_path(item, cmp, buf, &guard) {
            Some(node) => {
                // SAFETY: found under `guard`.
                let node = unsafe { node.node() };
                self.delete_node_in(node, cmp, buf, &guard)
            }
            None => false,
        }
    }

    /// Soft-deletes the node, then re-runs the search to trigger the
    /// cooperative unlink at every level.
    pub fn delete_node(&self, node: NodeRef<T>, cmp: &CompareFn<T>, buf: &mut ActionBuffer<T>) -> bool {
        let guard = epoch::pin();
        // SAFETY: per NodeRef contract the node is still reachable.
        let node = unsafe { node.node() };
        self.delete_node_in(node, cmp, buf, &guard)
    }

    fn delete_node_in(
        &self,
        node: &Node<T>,
        cmp: &CompareFn<T>,
        buf: &mut ActionBuffer<T>,
        guard: &Guard,
    ) -> bool {
        if self.soft_delete(node, guard) {
            if let Some(item) = node.item() {
                self.find_path(item, cmp, buf, guard);
            }
            true
        } else {
            false
        }
    }

    /// Creates a positional cursor. The cursor holds a barrier session for
    /// its whole lifetime.
    pub fn iter<'a>(&'a self, cmp: &'a CompareFn<T>) -> Iter<'a, T> {
        Iter::new(self, cmp)
    }

    /// Samples up to `nways - 1` pivot items that split the index into
    /// roughly equal ranges, for sharding large scans. Walks the
    /// shallowest-populated level with at least `nways` nodes and samples
    /// every ⌊count/nways⌋-th node; restarts if a concurrent delete is
    /// observed mid-walk. Pivots are advisory.
    pub fn range_split_items(&self, nways: usize) -> Vec<T>
    where
        T: Clone,
    {
        if nways < 2 {
            return Vec::new();
        }
        let guard = epoch::pin();
        'repeat: loop {
            let mut items = Vec::new();
            let top = self.top_level.load(AtomicOrdering::Relaxed);
            for l in (0..=top).rev() {
                let count = self.stats.level_nodes[l].load(AtomicOrdering::Relaxed) + 1;
                if count < nways as i64 {
                    continue;
                }
                let per_split = count / nways as i64;
                // SAFETY: sentinel; subsequent nodes protected by `guard`.
                let mut node: &Node<T> = unsafe { &*self.head };
                let mut j = 0i64;
                let mut finished = false;
                while !ptr::eq(node, self.tail) && !finished {
                    if j == per_split {
                        j = -1;
                        if let Some(item) = node.item() {
                            items.push(item.clone());
                        }
                        finished = items.len() == nways - 1;
                    }
                    let (next, marked) = node.next(l, &guard);
                    if marked {
                        continue 'repeat;
                    }
                    // SAFETY: unmarked levels terminate at the tail.
                    node = unsafe { next.deref() };
                    j += 1;
                }
                break;
            }
            return items;
        }
    }
}

impl<T> SkipList<T> {
    /// Drops the item of a node that was never published.
    unsafe fn discard_fresh_node(&self, ptr: *mut Node<T>) {
        self.stats.node_frees.fetch_add(1, AtomicOrdering::Relaxed);
        Node::dealloc_node(ptr, &*self.alloc);
    }
}

impl<T> Default for SkipList<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for SkipList<T> {
    fn drop(&mut self) {
        // SAFETY: exclusive access; nodes already handed to the barrier
        // were unlinked from level 0 and are not visited by this walk.
        unsafe {
            let guard = epoch::unprotected();
            let mut node = self.head;
            while !node.is_null() {
                let next = (*node).next(0, guard).0.as_raw() as *mut Node<T>;
                Node::dealloc_node(node, &*self.alloc);
                node = next;
            }
        }
    }
}
