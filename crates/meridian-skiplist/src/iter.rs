//! Positional cursor over a skiplist.
//!
//! An iterator holds a barrier session (epoch guard) for its whole
//! lifetime, so every node it can reach stays mapped until the cursor is
//! dropped. Traversal helps unlink marked nodes it steps over, the same
//! way searches do.

use std::ptr;

use crossbeam_epoch::{self as epoch, Guard};

use crate::list::{ActionBuffer, SkipList};
use crate::node::{Node, NodeRef};
use crate::CompareFn;

/// A cursor positioned between a predecessor and the current node at
/// level 0.
pub struct Iter<'a, T> {
    list: &'a SkipList<T>,
    cmp: &'a CompareFn<T>,
    buf: ActionBuffer<T>,
    guard: Guard,
    prev: *mut Node<T>,
    curr: *mut Node<T>,
    valid: bool,
    deleted: bool,
}

impl<'a, T> Iter<'a, T> {
    pub(crate) fn new(list: &'a SkipList<T>, cmp: &'a CompareFn<T>) -> Self {
        Self {
            list,
            cmp,
            buf: list.make_buf(),
            guard: epoch::pin(),
            prev: ptr::null_mut(),
            curr: ptr::null_mut(),
            valid: false,
            deleted: false,
        }
    }

    /// Positions at the first node.
    pub fn seek_first(&mut self) {
        self.prev = self.list.head_ptr();
        // SAFETY: the head sentinel lives as long as the list.
        let (curr, _) = unsafe { (*self.prev).next(0, &self.guard) };
        self.curr = curr.as_raw() as *mut Node<T>;
        self.valid = true;
        self.deleted = false;
    }

    /// Positions at the first node `>= item`; returns whether an exact
    /// match was found.
    pub fn seek(&mut self, item: &T) -> bool {
        self.valid = true;
        self.deleted = false;
        let found = self
            .list
            .find_path(item, self.cmp, &mut self.buf, &self.guard)
            .is_some();
        self.prev = self.buf.preds[0];
        self.curr = self.buf.succs[0];
        found
    }

    /// Like [`Iter::seek`], but on a miss adopts the predecessor as the
    /// current node. Block-indexed external storage uses this to land on
    /// the block that covers the key.
    pub fn seek_prev(&mut self, item: &T) {
        if !self.seek(item) {
            self.curr = self.prev;
            self.prev = ptr::null_mut();
        }
    }

    /// Whether the cursor is on a node (not exhausted).
    pub fn valid(&self) -> bool {
        self.valid && !ptr::eq(self.curr, self.list.tail_ptr())
    }

    /// The current item.
    pub fn item(&self) -> Option<&T> {
        if self.valid() {
            // SAFETY: `curr` is protected by the iterator's guard.
            unsafe { (*self.curr).item() }
        } else {
            None
        }
    }

    /// A handle to the current node.
    pub fn node(&self) -> Option<NodeRef<T>> {
        if self.valid() {
            Some(NodeRef::new(self.curr))
        } else {
            None
        }
    }

    /// Advances to the next node at level 0.
    ///
    /// If the current node is marked, tries to unlink it and bypass;
    /// otherwise refreshes the position with a fresh search, retrying once
    /// when the search lands back on the same node so the cursor always
    /// makes progress. A call following [`Iter::delete`] is a no-op (the
    /// delete already advanced).
    pub fn next(&mut self) {
        if self.deleted {
            self.deleted = false;
            return;
        }

        loop {
            self.valid = true;
            // SAFETY: `curr` is protected by the iterator's guard; `valid`
            // callers position the cursor before advancing.
            let curr = unsafe { &*self.curr };
            let (next, curr_marked) = curr.next(0, &self.guard);
            if !curr_marked {
                self.prev = self.curr;
                self.curr = next.as_raw() as *mut Node<T>;
                return;
            }

            // Current node was soft-deleted under the cursor: splice it out
            // and step onto its successor, or refresh the whole position.
            if !self.prev.is_null() {
                let prev = unsafe { &*self.prev };
                if self.list.help_delete(0, prev, curr, next, &self.guard) {
                    self.curr = next.as_raw() as *mut Node<T>;
                    return;
                }
            }

            self.list.note_read_conflict();
            let Some(item) = curr.item() else {
                return;
            };
            let found = self
                .list
                .find_path(item, self.cmp, &mut self.buf, &self.guard)
                .is_some();
            let last = self.curr;
            self.prev = self.buf.preds[0];
            self.curr = self.buf.succs[0];
            if !(found && ptr::eq(last, self.curr)) {
                return;
            }
        }
    }

    /// Soft-deletes the current node and advances past it. The following
    /// [`Iter::next`] is a no-op.
    pub fn delete(&mut self) {
        if !self.valid() {
            return;
        }
        // SAFETY: `curr` is protected by the iterator's guard.
        let curr = unsafe { &*self.curr };
        self.list.soft_delete(curr, &self.guard);
        self.next();
        self.deleted = true;
    }
}
