//! Skiplist statistics counters.
//!
//! All counters are advisory: they are updated with relaxed atomics on the
//! hot paths and may transiently disagree with each other (e.g. between a
//! soft delete and the corresponding physical unlink).

use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use crate::list::MAX_LEVEL;

/// Counter block shared by all operations on one skiplist.
pub struct Stats {
    pub(crate) node_allocs: AtomicU64,
    pub(crate) node_frees: AtomicU64,
    pub(crate) soft_deletes: AtomicI64,
    pub(crate) read_conflicts: AtomicU64,
    pub(crate) insert_conflicts: AtomicU64,
    /// Number of linked nodes whose top level is exactly `i`.
    pub(crate) level_nodes: [AtomicI64; MAX_LEVEL + 1],
}

impl Stats {
    pub(crate) fn new() -> Self {
        Self {
            node_allocs: AtomicU64::new(0),
            node_frees: AtomicU64::new(0),
            soft_deletes: AtomicI64::new(0),
            read_conflicts: AtomicU64::new(0),
            insert_conflicts: AtomicU64::new(0),
            level_nodes: std::array::from_fn(|_| AtomicI64::new(0)),
        }
    }

    /// Total nodes allocated over the list's lifetime.
    pub fn node_allocs(&self) -> u64 {
        self.node_allocs.load(Ordering::Relaxed)
    }

    /// Total nodes handed to the reclamation barrier.
    pub fn node_frees(&self) -> u64 {
        self.node_frees.load(Ordering::Relaxed)
    }

    /// Nodes currently soft-deleted but not yet unlinked.
    pub fn soft_deletes(&self) -> i64 {
        self.soft_deletes.load(Ordering::Relaxed)
    }

    /// Searches restarted because a cooperative unlink lost its CAS.
    pub fn read_conflicts(&self) -> u64 {
        self.read_conflicts.load(Ordering::Relaxed)
    }

    /// Level-0 insert CAS failures.
    pub fn insert_conflicts(&self) -> u64 {
        self.insert_conflicts.load(Ordering::Relaxed)
    }

    /// Linked nodes whose top level is exactly `level`.
    pub fn level_node_count(&self, level: usize) -> i64 {
        self.level_nodes[level].load(Ordering::Relaxed)
    }

    /// Total linked nodes across all levels.
    pub fn node_count(&self) -> i64 {
        self.level_nodes
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "node_count       = {}", self.node_count())?;
        writeln!(f, "node_allocs      = {}", self.node_allocs())?;
        writeln!(f, "node_frees       = {}", self.node_frees())?;
        writeln!(f, "soft_deletes     = {}", self.soft_deletes())?;
        writeln!(f, "read_conflicts   = {}", self.read_conflicts())?;
        writeln!(f, "insert_conflicts = {}", self.insert_conflicts())?;
        write!(f, "level_node_count = [")?;
        for (i, c) in self.level_nodes.iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", c.load(Ordering::Relaxed))?;
        }
        write!(f, "]")
    }
}

impl fmt::Debug for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stats")
            .field("node_count", &self.node_count())
            .field("node_allocs", &self.node_allocs())
            .field("node_frees", &self.node_frees())
            .field("soft_deletes", &self.soft_deletes())
            .field("read_conflicts", &self.read_conflicts())
            .field("insert_conflicts", &self.insert_conflicts())
            .finish()
    }
}
